//! Config list storage
//!
//! Three plain-text lists live under the config root, one file per list at
//! `<root>/<name>.conf`. Each line holds one entry; `#` starts a comment
//! that runs to the end of the line and blank lines are ignored.
//!
//! | List                      | Entries           | Precedence                 |
//! |---------------------------|-------------------|----------------------------|
//! | `local_blocklist_ether`   | addresses         | highest, overrides all     |
//! | `local_allowlist_ether`   | addresses         | below the blocklist        |
//! | `remote_allowlist_domain` | domain names / IP | below both local lists     |

use crate::core::error::{Error, Result};
use crate::core::state;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::IntoEnumIterator;
use tokio::sync::RwLock;
use tracing::info;

/// Identifier of one of the three managed lists
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum ListName {
    #[strum(serialize = "local_blocklist_ether")]
    LocalBlocklist,
    #[strum(serialize = "local_allowlist_ether")]
    LocalAllowlist,
    #[strum(serialize = "remote_allowlist_domain")]
    RemoteAllowlist,
}

impl ListName {
    /// Parses an RPC list identifier.
    pub fn parse(name: &str) -> Result<Self> {
        Self::from_str(name).map_err(|_| Error::InvalidListName(name.to_string()))
    }

    pub fn file_name(self) -> String {
        format!("{}.conf", self.as_ref())
    }
}

/// Normalizes list text for storage: `\r\n` becomes `\n` and the content
/// always ends with a newline.
pub fn normalize(text: &str) -> String {
    let mut out = text.replace("\r\n", "\n");
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Extracts entries from list text.
///
/// Strips comments, trims whitespace, drops empty lines and collapses
/// duplicates while keeping first-seen order for display.
pub fn parse_entries(text: &str) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();

    for line in text.lines() {
        let content = match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        };
        let entry = content.trim();
        if entry.is_empty() || entries.iter().any(|e| e == entry) {
            continue;
        }
        entries.push(entry.to_string());
    }

    entries
}

/// Reads and writes the config lists. Each list has its own
/// readers-writer lock.
#[derive(Debug)]
pub struct ConfigStore {
    root: PathBuf,
    locks: HashMap<ListName, RwLock<()>>,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: ListName::iter().map(|name| (name, RwLock::new(()))).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: ListName) -> PathBuf {
        self.root.join(name.file_name())
    }

    fn lock(&self, name: ListName) -> &RwLock<()> {
        // Every ListName variant is inserted in `new`.
        &self.locks[&name]
    }

    /// Raw persisted content, or an empty string if never written.
    pub async fn read(&self, name: ListName) -> Result<String> {
        let _guard = self.lock(name).read().await;
        match tokio::fs::read_to_string(self.path(name)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Normalizes and atomically stores `text`.
    ///
    /// On failure the previous content stays in place.
    pub async fn write(&self, name: ListName, text: &str) -> Result<()> {
        let normalized = normalize(text);
        let _guard = self.lock(name).write().await;
        state::write_atomic(&self.path(name), normalized.as_bytes()).await?;
        info!("Saved {} ({} bytes)", name, normalized.len());
        Ok(())
    }

    /// Entries of the stored list.
    pub async fn parse(&self, name: ListName) -> Result<Vec<String>> {
        Ok(parse_entries(&self.read(name).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_name_roundtrip() {
        for name in ListName::iter() {
            assert_eq!(ListName::parse(name.as_ref()).unwrap(), name);
        }
        assert!(matches!(ListName::parse("etc_passwd"), Err(Error::InvalidListName(_))));
        assert!(ListName::parse("../local_blocklist_ether").is_err());
    }

    #[test]
    fn test_file_name() {
        assert_eq!(ListName::LocalBlocklist.file_name(), "local_blocklist_ether.conf");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a\r\nb"), "a\nb\n");
        assert_eq!(normalize("a\n"), "a\n");
        assert_eq!(normalize(""), "\n");
    }

    #[test]
    fn test_parse_entries_strips_comments_and_blanks() {
        let text = "# devices\n\naa:bb:cc:dd:ee:ff  # tv\n   \n10.0.0.1\n#10.0.0.2\n";
        assert_eq!(parse_entries(text), vec!["aa:bb:cc:dd:ee:ff", "10.0.0.1"]);
    }

    #[test]
    fn test_parse_entries_collapses_duplicates_keeping_order() {
        let text = "b\na\nb # again\na\n";
        assert_eq!(parse_entries(text), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_read_unwritten_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.read(ListName::LocalAllowlist).await.unwrap(), "");
        assert!(store.parse(ListName::LocalAllowlist).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_read_roundtrip_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        store
            .write(ListName::RemoteAllowlist, "example.com\r\n# portal\r\nlogin.example.org")
            .await
            .unwrap();

        let text = store.read(ListName::RemoteAllowlist).await.unwrap();
        assert_eq!(text, "example.com\n# portal\nlogin.example.org\n");
        assert_eq!(
            store.parse(ListName::RemoteAllowlist).await.unwrap(),
            vec!["example.com", "login.example.org"]
        );
        assert!(dir.path().join("remote_allowlist_domain.conf").exists());
    }

    #[tokio::test]
    async fn test_lists_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        store.write(ListName::LocalBlocklist, "10.0.0.1").await.unwrap();
        store.write(ListName::LocalAllowlist, "10.0.0.2").await.unwrap();

        assert_eq!(store.parse(ListName::LocalBlocklist).await.unwrap(), vec!["10.0.0.1"]);
        assert_eq!(store.parse(ListName::LocalAllowlist).await.unwrap(), vec!["10.0.0.2"]);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_parsed_entries_are_clean(text in "[a-z0-9:#. \\r\\n]{0,200}") {
            for entry in parse_entries(&text) {
                prop_assert!(!entry.is_empty());
                prop_assert!(!entry.contains('#'));
                prop_assert_eq!(entry.trim(), entry.as_str());
            }
        }

        #[test]
        fn test_normalize_is_idempotent(text in "\\PC*") {
            let once = normalize(&text);
            prop_assert_eq!(normalize(&once), once.clone());
            prop_assert!(once.ends_with('\n'));
            prop_assert!(!once.contains("\r\n"));
        }
    }
}
