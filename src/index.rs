//! Pack index document
//!
//! The index is a small JSON document published next to the packs:
//!
//! ```json
//! {
//!   "name": "stable",
//!   "updated": "2024-05-01T12:00:00Z",
//!   "packs": {
//!     "v5": { "enabled": true, "hash": "deadbeef", "url": "http://u/v5.pack" }
//!   }
//! }
//! ```
//!
//! Entries are parsed leniently: a missing `enabled` means disabled and a
//! missing `hash` or `url` is left empty so the resolver can reject the entry
//! on its own instead of failing the whole document. An entry of the wrong
//! shape (not an object, or a field of the wrong type) is logged and dropped;
//! only unparseable JSON or a `packs` value that is not an object fails the
//! document.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::io::BufReader;
use std::path::Path;
use tracing::warn;

use crate::error::Result;

/// One pack listed in the index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackEntry {
    /// Pack name (e.g. "v5"); filled in from the map key
    #[serde(skip)]
    pub name: String,

    /// Content hash; part of the install directory name
    #[serde(default)]
    pub hash: String,

    /// Where the pack archive is downloaded from
    #[serde(default)]
    pub url: String,

    /// Whether this pack should be run
    #[serde(default)]
    pub enabled: bool,
}

impl PackEntry {
    /// Install directory name, `<name>.<hash>`
    pub fn install_dir(&self) -> String {
        format!("{}.{}", self.name, self.hash)
    }
}

/// Parsed pack index
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackIndex {
    /// Index (channel) name
    #[serde(default, rename = "name")]
    pub index_name: String,

    /// When the index was last published, as written by the publisher
    #[serde(default, rename = "updated")]
    pub updated_at: String,

    /// Packs keyed by name
    #[serde(default, rename = "packs", deserialize_with = "lenient_entries")]
    pub entries: BTreeMap<String, PackEntry>,
}

/// Keep every entry that has the expected shape, drop the rest
fn lenient_entries<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, PackEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    let mut entries = BTreeMap::new();
    for (name, value) in raw {
        match serde_json::from_value::<PackEntry>(value) {
            Ok(entry) => {
                entries.insert(name, entry);
            }
            Err(e) => warn!(pack = %name, error = %e, "dropping malformed pack entry"),
        }
    }
    Ok(entries)
}

impl PackIndex {
    /// Parse an index from raw JSON bytes
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let index: PackIndex = serde_json::from_slice(data)?;
        Ok(index.with_entry_names())
    }

    /// Parse an index file without loading it into memory first
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let index: PackIndex = serde_json::from_reader(BufReader::new(file))?;
        Ok(index.with_entry_names())
    }

    fn with_entry_names(mut self) -> Self {
        for (name, entry) in self.entries.iter_mut() {
            entry.name = name.clone();
        }
        self
    }
}

/// The pack selected for installation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedVersion {
    /// Numeric part of the pack name (`v12` -> 12)
    pub numeric_version: u64,
    /// Archive URL
    pub url: String,
    /// Install directory name, `<name>.<hash>`
    pub install_dir: String,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_document() {
        let index = PackIndex::from_slice(
            br#"{
                "name": "stable",
                "updated": "2024-05-01T12:00:00Z",
                "packs": {
                    "v4": { "enabled": false, "hash": "cafe", "url": "http://u/v4.pack" },
                    "v5": { "enabled": true, "hash": "deadbeef", "url": "http://u/v5.pack" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(index.index_name, "stable");
        assert_eq!(index.updated_at, "2024-05-01T12:00:00Z");
        assert_eq!(index.entries.len(), 2);
        let v5 = &index.entries["v5"];
        assert_eq!(v5.name, "v5");
        assert!(v5.enabled);
        assert_eq!(v5.install_dir(), "v5.deadbeef");
        assert!(!index.entries["v4"].enabled);
    }

    #[test]
    fn test_missing_fields_default() {
        let index = PackIndex::from_slice(br#"{"packs": {"v1": {"url": "http://u/v1"}}}"#).unwrap();
        assert_eq!(index.index_name, "");
        let v1 = &index.entries["v1"];
        assert_eq!(v1.hash, "");
        assert!(!v1.enabled);
    }

    #[test]
    fn test_malformed_document_is_error() {
        assert!(PackIndex::from_slice(b"{\"packs\": [").is_err());
        assert!(PackIndex::from_slice(br#"{"packs": [1, 2]}"#).is_err());
        assert!(PackIndex::from_slice(br#"{"packs": 7}"#).is_err());
    }

    #[test]
    fn test_malformed_entries_are_dropped() {
        let index = PackIndex::from_slice(
            br#"{"packs": {
                "v1": 7,
                "v5": {"enabled": true, "hash": "deadbeef", "url": "http://u/v5.zip"},
                "v6": {"enabled": "yes", "hash": 6, "url": "http://u/v6.zip"},
                "v7": {"enabled": true, "hash": "abc", "url": null}
            }}"#,
        )
        .unwrap();

        let names: Vec<&str> = index.entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["v5"]);
        assert_eq!(index.entries["v5"].name, "v5");
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("packs.json");
        std::fs::write(
            &path,
            r#"{"packs": {"v2": {"enabled": true, "hash": "abc", "url": "http://y"}}}"#,
        )
        .unwrap();

        let index = PackIndex::load(&path).unwrap();
        assert_eq!(index.entries["v2"].name, "v2");
    }
}
