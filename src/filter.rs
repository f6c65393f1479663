//! The persisted exclusion set.
//!
//! Tests known to fail are recorded in a JSON filter file that is checked
//! in next to the test binary. Every entry is a gtest filter pattern and is
//! passed to the binary as a negative filter.
//!
//! ```json
//! {
//!   "comment": "Tests excluded by gtest-sieve. ...",
//!   "failing_tests": [
//!     "FlakySuite.*",
//!     "NetTest.TimesOut"
//!   ],
//!   "owner": "net-team"
//! }
//! ```
//!
//! Any field besides `failing_tests` is carried through rewrites untouched
//! and keeps its position in the document. Files are replaced atomically (write to a temporary sibling, then
//! rename), so a crash mid-write leaves the previous contents intact.
//!
//! # Condensing
//!
//! When every leaf of a suite is excluded the suite is written as one
//! `Suite.*` entry; see [`condense`].

use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::framework::{TestId, TestListing};

/// Comment written into freshly generated filter files.
pub const DEFAULT_COMMENT: &str = "Tests excluded by gtest-sieve. Each entry is a gtest filter \
pattern; delete an entry to run that test again.";

/// Errors raised while reading or writing a filter file.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Failed to read filter file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed filter file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write filter file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How [`update`] combines new failures with the file's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Keep existing entries and metadata, add the new ones.
    Append,
    /// Store exactly the new entries and regenerate metadata.
    Replace,
}

/// On-disk representation of a filter file.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterFile {
    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    pub failing_tests: Vec<String>,

    /// Every other top-level field, preserved verbatim.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,

    /// Top-level keys in the order they were read.
    #[serde(skip)]
    key_order: Vec<String>,
}

impl Default for FilterFile {
    fn default() -> Self {
        Self {
            comment: Some(DEFAULT_COMMENT.to_string()),
            failing_tests: Vec::new(),
            metadata: Map::new(),
            key_order: Vec::new(),
        }
    }
}

impl PartialEq for FilterFile {
    fn eq(&self, other: &Self) -> bool {
        self.comment == other.comment
            && self.failing_tests == other.failing_tests
            && self.metadata == other.metadata
    }
}

impl FilterFile {
    /// Reads a filter file. Returns `Ok(None)` if it does not exist.
    pub fn read(path: &Path) -> Result<Option<Self>, FilterError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(FilterError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let parse_err = |source| FilterError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let document: Map<String, Value> = serde_json::from_str(&content).map_err(parse_err)?;
        let key_order = document.keys().cloned().collect();
        let mut file: Self =
            serde_json::from_value(Value::Object(document)).map_err(parse_err)?;
        file.key_order = key_order;
        Ok(Some(file))
    }

    /// The entries as a set.
    pub fn entries(&self) -> BTreeSet<String> {
        self.failing_tests.iter().cloned().collect()
    }

    /// Replaces the entries, sorted and deduplicated.
    pub fn set_entries(&mut self, entries: &BTreeSet<String>) {
        self.failing_tests = entries.iter().cloned().collect();
    }

    /// The JSON document, keeping the key order of the file it was read from.
    /// Keys the file did not have follow in `comment`, `failing_tests`,
    /// metadata order.
    pub fn to_document(&self) -> Map<String, Value> {
        let keys = self
            .key_order
            .iter()
            .map(String::as_str)
            .chain(["comment", "failing_tests"])
            .chain(self.metadata.keys().map(String::as_str));

        let mut document = Map::new();
        for key in keys {
            if document.contains_key(key) {
                continue;
            }
            let value = match key {
                "comment" => self.comment.clone().map(Value::String),
                "failing_tests" => Some(Value::from(self.failing_tests.clone())),
                _ => self.metadata.get(key).cloned(),
            };
            if let Some(value) = value {
                document.insert(key.to_string(), value);
            }
        }
        document
    }

    /// Pretty-printed JSON with a trailing newline.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string_pretty(&self.to_document())?;
        json.push('\n');
        Ok(json)
    }

    /// Writes the file atomically, creating parent directories as needed.
    pub fn write_atomic(&self, path: &Path) -> Result<(), FilterError> {
        let write_err = |source: std::io::Error| FilterError::Write {
            path: path.to_path_buf(),
            source,
        };

        let json = self
            .to_json()
            .map_err(|e| write_err(std::io::Error::other(e)))?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

/// Loads the persisted exclusion set. A missing file is an empty set.
pub fn load(path: &Path) -> Result<BTreeSet<String>, FilterError> {
    Ok(FilterFile::read(path)?
        .map(|file| file.entries())
        .unwrap_or_default())
}

/// Merges `new` entries into the filter file.
///
/// Returns whether the file was rewritten. Nothing is written when the
/// stored list already equals the sorted, deduplicated result (and, in
/// replace mode, the metadata is already the generated default).
pub fn update(path: &Path, new: &BTreeSet<String>, mode: UpdateMode) -> Result<bool, FilterError> {
    let existing = FilterFile::read(path)?;
    let current = existing.as_ref().map(FilterFile::entries).unwrap_or_default();

    let target = match mode {
        UpdateMode::Append => current.union(new).cloned().collect(),
        UpdateMode::Replace => new.clone(),
    };

    write_if_changed(path, existing, &target, mode)
}

/// Records `new_failures`, collapsing fully excluded suites.
///
/// `known` must be an unfiltered enumeration of the binary. In append mode
/// the file's existing entries take part in condensing; in replace mode
/// only the new failures do.
pub fn update_condensed(
    path: &Path,
    known: &TestListing,
    new_failures: &BTreeSet<TestId>,
    mode: UpdateMode,
) -> Result<bool, FilterError> {
    let existing = FilterFile::read(path)?;
    let current = existing.as_ref().map(FilterFile::entries).unwrap_or_default();

    let base = match mode {
        UpdateMode::Append => current,
        UpdateMode::Replace => BTreeSet::new(),
    };
    let target = condense(known, &base, new_failures);

    write_if_changed(path, existing, &target, mode)
}

fn write_if_changed(
    path: &Path,
    existing: Option<FilterFile>,
    target: &BTreeSet<String>,
    mode: UpdateMode,
) -> Result<bool, FilterError> {
    let previous = existing.clone();
    let stored = previous.as_ref().map_or(0, |file| file.failing_tests.len());

    let mut file = match (mode, existing) {
        (UpdateMode::Append, Some(file)) => file,
        _ => FilterFile::default(),
    };
    file.set_entries(target);

    let unchanged = match &previous {
        Some(previous) => previous == &file,
        None => target.is_empty(),
    };
    if unchanged {
        debug!("Filter file {} unchanged", path.display());
        return Ok(false);
    }
    file.write_atomic(path)?;

    info!(
        "Updated filter file {} ({} -> {} entries)",
        path.display(),
        stored,
        target.len()
    );
    Ok(true)
}

/// Computes the minimal entry set covering `existing` plus `new_failures`.
///
/// - A suite whose every known leaf is a new failure, an existing exact
///   entry, or covered by an existing `Suite.*` becomes `Suite.*`.
/// - Exact entries for known tests of a collapsed suite are dropped.
/// - Entries that match no known test (tests that no longer exist, other
///   patterns) are kept verbatim.
/// - Remaining new failures are listed individually.
///
/// Applying the result again with the same `new_failures` returns it
/// unchanged.
///
/// ```
/// use std::collections::BTreeSet;
/// use gtest_sieve::filter::condense;
/// use gtest_sieve::framework::{SuiteGroup, TestId, TestListing};
///
/// let known = TestListing::new(vec![SuiteGroup::new("S", ["A", "B", "C"])]);
/// let new: BTreeSet<_> = ["S.A", "S.B", "S.C"]
///     .iter()
///     .map(|s| TestId::parse(s).unwrap())
///     .collect();
///
/// let entries = condense(&known, &BTreeSet::new(), &new);
/// assert_eq!(entries.into_iter().collect::<Vec<_>>(), vec!["S.*"]);
/// ```
pub fn condense(
    known: &TestListing,
    existing: &BTreeSet<String>,
    new_failures: &BTreeSet<TestId>,
) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut collapsed: HashSet<&str> = HashSet::new();

    for group in known.suites() {
        if group.is_empty() {
            continue;
        }
        let wildcard = format!("{}*", group.suite);
        let suite_excluded = existing.contains(&wildcard);

        let all_covered = group.tests().all(|test| {
            suite_excluded || new_failures.contains(&test) || existing.contains(&test.to_string())
        });
        if all_covered {
            out.insert(wildcard);
            collapsed.insert(group.suite.as_str());
        }
    }

    for entry in existing {
        let subsumed = TestId::parse(entry)
            .is_some_and(|id| collapsed.contains(id.suite()) && known.contains(&id));
        if !subsumed {
            out.insert(entry.clone());
        }
    }

    for test in new_failures {
        if !collapsed.contains(test.suite()) {
            out.insert(test.to_string());
        }
    }

    out
}
