//! Set synchronizer
//!
//! Brings the live filter sets in line with compiled contents by applying
//! only the difference. Sets are never flushed and reloaded, so there is no
//! moment in which every client is denied, and applying the same contents
//! twice performs no mutations the second time.
//!
//! Failures are per element: a rejected element is reported and skipped,
//! the rest of the diff is still applied. Block sets are applied before
//! allow sets so new blocklist entries take effect first.

use crate::core::error::{Error, Result};
use crate::core::filter::PacketFilter;
use crate::core::policy::{CompiledSets, Element, Elements, SetKind, SetName};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Allowed difference between live and computed `expires` before an
/// element is re-added. The kernel counts `expires` down on its own.
pub const EXPIRY_DRIFT_SECS: u64 = 5;

/// Changes needed to turn one live set into its desired contents.
///
/// An element whose metadata changed appears in both lists: it is removed
/// and added back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDiff {
    pub remove: Vec<String>,
    pub add: Vec<(String, Element)>,
}

impl SetDiff {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

fn needs_replace(live: &Element, desired: &Element) -> bool {
    if live.timeout != desired.timeout || live.comment != desired.comment {
        return true;
    }
    match (live.expires, desired.expires) {
        (Some(a), Some(b)) => a.abs_diff(b) > EXPIRY_DRIFT_SECS,
        (None, None) => false,
        _ => true,
    }
}

/// Computes the difference between `live` and `desired`, in value order.
pub fn diff_set(live: &Elements, desired: &Elements) -> SetDiff {
    let mut diff = SetDiff::default();

    for (value, live_element) in live {
        match desired.get(value) {
            None => diff.remove.push(value.clone()),
            Some(wanted) if needs_replace(live_element, wanted) => {
                diff.remove.push(value.clone());
                diff.add.push((value.clone(), wanted.clone()));
            }
            Some(_) => {}
        }
    }

    for (value, wanted) in desired {
        if !live.contains_key(value) {
            diff.add.push((value.clone(), wanted.clone()));
        }
    }
    diff.add.sort_by(|a, b| a.0.cmp(&b.0));

    diff
}

/// Outcome of one [`SetSynchronizer::apply`] call
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub added: usize,
    pub removed: usize,
    pub failures: Vec<Error>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn mutations(&self) -> usize {
        self.added + self.removed
    }

    pub fn failure_messages(&self) -> Vec<String> {
        self.failures.iter().map(ToString::to_string).collect()
    }
}

/// Applies compiled sets to a [`PacketFilter`].
///
/// Each set has its own lock, so at most one apply per set is in flight.
pub struct SetSynchronizer {
    filter: Arc<dyn PacketFilter>,
    timeout: Duration,
    locks: HashMap<SetName, Mutex<()>>,
}

impl SetSynchronizer {
    pub fn new(filter: Arc<dyn PacketFilter>, timeout: Duration) -> Self {
        Self {
            filter,
            timeout,
            locks: SetName::all().map(|name| (name, Mutex::new(()))).collect(),
        }
    }

    async fn bounded<T>(
        &self,
        set: SetName,
        element: &str,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::FilterApply {
                set: set.to_string(),
                element: element.to_string(),
                op,
                message: format!("timed out after {}s", self.timeout.as_secs()),
            })?
    }

    async fn list(&self, set: SetName) -> Result<Elements> {
        self.bounded(set, "*", "list", self.filter.list_elements(set)).await
    }

    /// Reads every managed set from the live filter.
    pub async fn live_sets(&self) -> Result<CompiledSets> {
        let mut live = CompiledSets::default();
        for name in SetName::all() {
            live.sets.insert(name, self.list(name).await?);
        }
        Ok(live)
    }

    /// Applies `computed` set by set.
    pub async fn apply(&self, computed: &CompiledSets) -> ApplyReport {
        let mut report = ApplyReport::default();

        let ordered = computed
            .sets
            .iter()
            .filter(|(name, _)| name.kind == SetKind::Block)
            .chain(computed.sets.iter().filter(|(name, _)| name.kind != SetKind::Block));

        for (&name, desired) in ordered {
            let Some(lock) = self.locks.get(&name) else {
                warn!("Skipping unmanaged set {name}");
                continue;
            };
            let _guard = lock.lock().await;
            self.apply_set(name, desired, &mut report).await;
        }

        if report.mutations() > 0 || !report.is_clean() {
            info!(
                "Applied sets: {} added, {} removed, {} failed",
                report.added,
                report.removed,
                report.failures.len()
            );
        }
        report
    }

    async fn apply_set(&self, name: SetName, desired: &Elements, report: &mut ApplyReport) {
        let live = match self.list(name).await {
            Ok(live) => live,
            Err(e) => {
                warn!("Cannot list set {name}: {e}");
                report.failures.push(e);
                return;
            }
        };

        let diff = diff_set(&live, desired);
        if diff.is_empty() {
            return;
        }
        debug!(
            "Set {name}: removing {}, adding {}",
            diff.remove.len(),
            diff.add.len()
        );

        for value in &diff.remove {
            match self
                .bounded(name, value, "delete", self.filter.remove_element(name, value))
                .await
            {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("{e}");
                    report.failures.push(e);
                }
            }
        }

        for (value, element) in &diff.add {
            match self
                .bounded(name, value, "add", self.filter.add_element(name, value, element))
                .await
            {
                Ok(()) => report.added += 1,
                Err(e) => {
                    warn!("{e}");
                    report.failures.push(e);
                }
            }
        }
    }
}
