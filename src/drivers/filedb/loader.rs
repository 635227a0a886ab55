use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::utils::has_prefix;
use crate::ChangeEvent;
use crate::Error;
use crate::Result;

/// `{ "data": [ {"key": .., "value": ..} ] }`
#[derive(Debug, Deserialize)]
struct FileDoc {
    #[serde(default)]
    data: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    key: String,
    value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileValue {
    pub(crate) value: Vec<u8>,
    pub(crate) revision: u64,
}

/// Editor backups (`name~`), vim swap files (`.swp`, `.swx`, ...) and
/// purely numeric names (atomic-save temporaries) are never loaded.
pub(crate) fn is_ignored(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    if name.is_empty() || name.ends_with('~') {
        return true;
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.len() == 3 && ext.starts_with("sw"),
        None => false,
    }
}

/// Files named by `paths`: files as given, directories expanded one level.
pub(crate) fn expand_paths(paths: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        let path = PathBuf::from(path);
        if path.is_dir() {
            let mut found: Vec<PathBuf> = fs::read_dir(&path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && !is_ignored(p))
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path);
        } else {
            return Err(Error::invalid(format!("{} is neither a file nor a directory", path.display())));
        }
    }
    Ok(files)
}

/// Values of one file, each re-serialised as JSON bytes
pub(crate) fn load_file(path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let raw = fs::read(path)?;
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }
    let doc: FileDoc = serde_json::from_slice(&raw)?;
    let mut values = BTreeMap::new();
    for entry in doc.data {
        values.insert(entry.key, serde_json::to_vec(&entry.value)?);
    }
    Ok(values)
}

/// Merged, revisioned view over every loaded file.
///
/// Revisions are kept per key and never go backwards: a key that
/// disappears leaves its last revision behind, and a later re-add
/// continues above it.
#[derive(Debug, Default)]
pub(crate) struct RevisionedView {
    entries: BTreeMap<String, FileValue>,
    retired: HashMap<String, u64>,
}

impl RevisionedView {
    /// First load: every entry starts at revision 0.
    pub(crate) fn initial(values: BTreeMap<String, Vec<u8>>) -> Self {
        let entries = values
            .into_iter()
            .map(|(key, value)| (key, FileValue { value, revision: 0 }))
            .collect();
        Self {
            entries,
            retired: HashMap::new(),
        }
    }

    pub(crate) fn get(
        &self,
        key: &str,
    ) -> Option<&FileValue> {
        self.entries.get(key)
    }

    /// Entries under `prefix`, sorted by key
    pub(crate) fn scan<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a FileValue)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(key, _)| has_prefix(key, prefix))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Replaces the view with `fresh` and returns what changed.
    ///
    /// Unknown keys start at revision 0. Changed and removed keys move one
    /// past their previous revision, re-added keys one past the revision
    /// they were removed at.
    pub(crate) fn apply(
        &mut self,
        fresh: BTreeMap<String, Vec<u8>>,
    ) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        let removed: Vec<String> = self.entries.keys().filter(|k| !fresh.contains_key(*k)).cloned().collect();
        for key in removed {
            if let Some(old) = self.entries.remove(&key) {
                let revision = old.revision + 1;
                self.retired.insert(key.clone(), revision);
                events.push(ChangeEvent::delete(key, Some(old.value), revision));
            }
        }
        for (key, value) in fresh {
            match self.entries.get_mut(&key) {
                Some(current) if current.value == value => {}
                Some(current) => {
                    let prev = std::mem::replace(&mut current.value, value.clone());
                    current.revision += 1;
                    events.push(ChangeEvent::put(key, value, Some(prev), current.revision));
                }
                None => {
                    let revision = self.retired.remove(&key).map_or(0, |last| last + 1);
                    self.entries.insert(
                        key.clone(),
                        FileValue {
                            value: value.clone(),
                            revision,
                        },
                    );
                    events.push(ChangeEvent::put(key, value, None, revision));
                }
            }
        }
        events
    }
}

/// First-file-wins union of the files named in `order`
pub(crate) fn merge_files(
    order: &[PathBuf],
    files: &BTreeMap<PathBuf, BTreeMap<String, Vec<u8>>>,
) -> BTreeMap<String, Vec<u8>> {
    let mut merged = BTreeMap::new();
    for values in order.iter().filter_map(|path| files.get(path)) {
        for (key, value) in values {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    merged
}
