use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use log::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClassIndexError {
    #[error("Invalid index mapping: {0}")]
    InvalidIndexMapping(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Malformed class index JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Immutable mapping from model output position to class label.
///
/// Built once when the model is loaded. Lookups never fail: an index with no
/// entry resolves to its decimal string, so a model that is wider than its
/// index file still produces labelled output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassIndexTable {
    labels: BTreeMap<usize, String>,
}

impl ClassIndexTable {
    /// Inverts a `label -> index` mapping.
    ///
    /// Negative indices and two labels sharing an index are rejected.
    pub fn from_mapping<I, S>(mapping: I) -> Result<Self, ClassIndexError>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mut labels = BTreeMap::new();
        for (label, index) in mapping {
            let label = label.into();
            let index = usize::try_from(index).map_err(|_| {
                ClassIndexError::InvalidIndexMapping(format!(
                    "label '{}' has negative index {}",
                    label, index
                ))
            })?;
            if let Some(existing) = labels.insert(index, label.clone()) {
                return Err(ClassIndexError::InvalidIndexMapping(format!(
                    "index {} is assigned to both '{}' and '{}'",
                    index, existing, label
                )));
            }
        }
        Ok(Self { labels })
    }

    /// Parses a JSON object of `{"label": index, ...}`.
    pub fn from_json_str(json: &str) -> Result<Self, ClassIndexError> {
        let mapping: HashMap<String, i64> = serde_json::from_str(json)?;
        Self::from_mapping(mapping)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ClassIndexError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let table = Self::from_json_str(&contents)?;
        info!("Loaded {} class labels from {:?}", table.len(), path);
        Ok(table)
    }

    /// Derives the table from the immediate subdirectories of `root`.
    ///
    /// Directory names are sorted by byte value (the same order as sorting
    /// Unicode code points) and numbered from zero. This must be the order the
    /// training data loader used, or every label will be shifted.
    pub fn from_directory<P: AsRef<Path>>(root: P) -> Result<Self, ClassIndexError> {
        let root = root.as_ref();
        let mut classes = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().into_string().map_err(|raw| {
                ClassIndexError::InvalidIndexMapping(format!(
                    "class directory name {:?} is not valid UTF-8",
                    raw
                ))
            })?;
            classes.push(name);
        }
        classes.sort();

        if classes.is_empty() {
            warn!("No class subdirectories found under {:?}", root);
        } else {
            info!("Derived {} classes from {:?}", classes.len(), root);
        }

        Ok(Self {
            labels: classes.into_iter().enumerate().collect(),
        })
    }

    /// Label for `index`, or the stringified index when the table has no entry.
    pub fn label(&self, index: usize) -> Cow<'_, str> {
        match self.labels.get(&index) {
            Some(label) => Cow::Borrowed(label.as_str()),
            None => Cow::Owned(index.to_string()),
        }
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels
            .iter()
            .find(|(_, l)| l.as_str() == label)
            .map(|(index, _)| *index)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.labels.iter().map(|(index, label)| (*index, label.as_str()))
    }

    /// The `label -> index` form used on disk.
    pub fn to_mapping(&self) -> BTreeMap<String, usize> {
        self.labels
            .iter()
            .map(|(index, label)| (label.clone(), *index))
            .collect()
    }

    /// Writes the `label -> index` JSON through a sibling temp file and a
    /// rename, so an interrupted write never leaves a truncated index behind.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ClassIndexError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(&self.to_mapping())?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| ClassIndexError::IoError(e.error))?;
        info!("Wrote class index with {} entries to {:?}", self.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_inverted() {
        let table = ClassIndexTable::from_json_str(r#"{"a": 0, "b": 1}"#).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.label(0), "a");
        assert_eq!(table.label(1), "b");
        assert_eq!(table.index_of("b"), Some(1));
    }

    #[test]
    fn test_unknown_index_gets_placeholder() {
        let table = ClassIndexTable::from_json_str(r#"{"a": 0, "b": 1}"#).unwrap();
        assert_eq!(table.label(5), "5");
        assert_eq!(ClassIndexTable::default().label(0), "0");
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let result = ClassIndexTable::from_mapping(vec![("a", 0), ("b", 0)]);
        assert!(matches!(result, Err(ClassIndexError::InvalidIndexMapping(_))));
    }

    #[test]
    fn test_negative_index_rejected() {
        let result = ClassIndexTable::from_json_str(r#"{"a": -1}"#);
        assert!(matches!(result, Err(ClassIndexError::InvalidIndexMapping(_))));
    }

    #[test]
    fn test_non_object_json_rejected() {
        let result = ClassIndexTable::from_json_str(r#"["a", "b"]"#);
        assert!(matches!(result, Err(ClassIndexError::JsonError(_))));
    }

    #[test]
    fn test_mapping_round_trips_through_disk_form() {
        let table = ClassIndexTable::from_mapping(vec![("x", 1), ("y", 0)]).unwrap();
        let mapping = table.to_mapping();
        assert_eq!(mapping.get("x"), Some(&1));
        assert_eq!(mapping.get("y"), Some(&0));
    }

    #[test]
    fn test_write_json_replaces_existing_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("class_indices.json");
        fs::write(&path, "{\"stale\": 0, \"trunc").unwrap();

        let table = ClassIndexTable::from_mapping(vec![("healthy", 0), ("scab", 1)]).unwrap();
        table.write_json(&path).unwrap();

        assert_eq!(ClassIndexTable::from_file(&path).unwrap(), table);
        // Only the target remains; the temp file was renamed over it
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
