//! Packet filter capability
//!
//! The live filter is an external resource. The synchronizer only needs
//! three operations on it, so it talks to this trait; [`NftFilter`] drives
//! the real nftables and [`MemoryFilter`] keeps sets in memory for tests
//! and `--dry-run`.
//!
//! [`NftFilter`]: crate::core::nft::NftFilter

use crate::core::error::{Error, Result};
use crate::core::policy::{Element, Elements, SetName};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Current elements of `set`.
    async fn list_elements(&self, set: SetName) -> Result<Elements>;

    /// Adds `value` to `set` with optional timeout metadata.
    async fn add_element(&self, set: SetName, value: &str, element: &Element) -> Result<()>;

    /// Removes `value` from `set`.
    async fn remove_element(&self, set: SetName, value: &str) -> Result<()>;
}

/// Counters of mutations performed against a [`MemoryFilter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationCount {
    pub adds: usize,
    pub removes: usize,
}

impl MutationCount {
    pub fn total(self) -> usize {
        self.adds + self.removes
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sets: BTreeMap<SetName, Elements>,
    mutations: MutationCount,
    rejected: BTreeSet<String>,
}

/// In-memory packet filter.
///
/// Elements listed in `reject` make `add_element` fail, which mimics nft
/// refusing a single element.
#[derive(Debug, Default)]
pub struct MemoryFilter {
    state: Mutex<MemoryState>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Makes every later `add_element` of `value` fail.
    pub fn reject(&self, value: &str) {
        self.state().rejected.insert(value.to_string());
    }

    pub fn mutations(&self) -> MutationCount {
        self.state().mutations
    }

    pub fn reset_mutations(&self) {
        self.state().mutations = MutationCount::default();
    }

    /// Snapshot of one set, empty if it was never touched.
    pub fn snapshot(&self, set: SetName) -> Elements {
        self.state().sets.get(&set).cloned().unwrap_or_default()
    }

    pub fn contains(&self, set: SetName, value: &str) -> bool {
        self.state().sets.get(&set).is_some_and(|e| e.contains_key(value))
    }
}

#[async_trait]
impl PacketFilter for MemoryFilter {
    async fn list_elements(&self, set: SetName) -> Result<Elements> {
        Ok(self.snapshot(set))
    }

    async fn add_element(&self, set: SetName, value: &str, element: &Element) -> Result<()> {
        let mut state = self.state();
        if state.rejected.contains(value) {
            return Err(Error::FilterApply {
                set: set.to_string(),
                element: value.to_string(),
                op: "add",
                message: "element rejected".to_string(),
            });
        }

        let elements = state.sets.entry(set).or_default();
        if elements.contains_key(value) {
            return Err(Error::FilterApply {
                set: set.to_string(),
                element: value.to_string(),
                op: "add",
                message: "element already exists".to_string(),
            });
        }
        elements.insert(value.to_string(), element.clone());
        state.mutations.adds += 1;
        Ok(())
    }

    async fn remove_element(&self, set: SetName, value: &str) -> Result<()> {
        let mut state = self.state();
        let removed = state.sets.get_mut(&set).and_then(|e| e.remove(value));
        if removed.is_none() {
            return Err(Error::FilterApply {
                set: set.to_string(),
                element: value.to_string(),
                op: "delete",
                message: "element does not exist".to_string(),
            });
        }
        state.mutations.removes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::Family;
    use crate::core::policy::SetKind;

    const ALLOW_V4: SetName = SetName::new(SetKind::Allow, Family::Ipv4);

    #[tokio::test]
    async fn test_memory_filter_add_list_remove() {
        let filter = MemoryFilter::new();
        filter.add_element(ALLOW_V4, "10.0.0.1", &Element::permanent()).await.unwrap();

        let listed = filter.list_elements(ALLOW_V4).await.unwrap();
        assert_eq!(listed.len(), 1);

        filter.remove_element(ALLOW_V4, "10.0.0.1").await.unwrap();
        assert!(filter.list_elements(ALLOW_V4).await.unwrap().is_empty());
        assert_eq!(filter.mutations(), MutationCount { adds: 1, removes: 1 });
    }

    #[tokio::test]
    async fn test_memory_filter_rejects_like_nft() {
        let filter = MemoryFilter::new();
        filter.reject("10.0.0.66");

        let err = filter
            .add_element(ALLOW_V4, "10.0.0.66", &Element::permanent())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FilterApply { op: "add", .. }));

        assert!(filter.remove_element(ALLOW_V4, "10.0.0.1").await.is_err());
        assert_eq!(filter.mutations().total(), 0);
    }
}
