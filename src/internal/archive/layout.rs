//! On-disk dataset index for the archive facade.
//!
//! A `Layout` is a snapshot of the BIDS files under a dataset root with
//! their filename-encoded entities. It is a cache over the filesystem (the
//! disk is the source of truth): every archive mutation re-derives it, and
//! re-indexing is idempotent — indexing the same tree twice yields equal
//! layouts.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use serde_json::Value;
use tracing::debug;

use crate::{
    errors::BidsError,
    internal::{entity, metadata::MetadataMap},
    utils::{bids_extension, bids_stem},
};

/// Handle to one indexed file: its path relative to the dataset root and
/// the entities encoded in its name and directory.
#[derive(Clone, Debug, PartialEq)]
pub struct BidsFileHandle {
    rel_path: String,
    entities: MetadataMap,
}

impl BidsFileHandle {
    /// Path relative to the dataset root, `/`-separated.
    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    /// Filename-encoded entities plus `suffix`, `datatype`, `extension`.
    pub fn entities(&self) -> &MetadataMap {
        &self.entities
    }
}

/// Index of every BIDS file under a dataset root.
#[derive(Clone, Debug, PartialEq)]
pub struct Layout {
    root: PathBuf,
    files: Vec<BidsFileHandle>,
}

impl Layout {
    /// Index the dataset under `root`. Returns `None` when the root does
    /// not exist or holds no indexable dataset (no dataset description and
    /// no parseable BIDS file).
    pub fn index(root: &Path) -> Result<Option<Layout>, BidsError> {
        if !root.is_dir() {
            return Ok(None);
        }
        let mut files = Vec::new();
        walk(root, root, &mut files)?;
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        if files.is_empty() && !root.join("dataset_description.json").is_file() {
            debug!("no indexable dataset at {}", root.display());
            return Ok(None);
        }
        debug!("indexed {} file(s) under {}", files.len(), root.display());
        Ok(Some(Layout {
            root: root.to_path_buf(),
            files,
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[BidsFileHandle] {
        &self.files
    }

    /// The file at the exact relative path, if indexed.
    pub fn get_file(&self, rel_path: &str) -> Option<&BidsFileHandle> {
        self.files.iter().find(|f| f.rel_path == rel_path)
    }

    /// Files whose entity set includes (`exact`: equals) the query.
    ///
    /// Values compare by their path token rendering, so a `run` queried as
    /// the integer `1` matches a file carrying `run-1`. In exact mode the
    /// file-side `datatype` and `extension` are ignored unless the query
    /// names them.
    pub fn files_matching(&self, query: &MetadataMap, exact: bool) -> Vec<&BidsFileHandle> {
        self.files
            .iter()
            .filter(|file| {
                let includes = query.iter().all(|(key, _)| {
                    file.entities.get_str(key).is_some()
                        && file.entities.get_str(key) == query.get_str(key)
                });
                if !includes {
                    return false;
                }
                if exact {
                    file.entities.iter().all(|(key, _)| {
                        if !query.contains_key(key)
                            && (key == "datatype" || key == "extension")
                        {
                            return true;
                        }
                        query.get_str(key) == file.entities.get_str(key)
                    })
                } else {
                    true
                }
            })
            .collect()
    }

    /// Sidecar metadata for the indexed file at `rel_path`, merged with its
    /// filename-encoded entities when `include_entities` is set.
    pub fn metadata_for(
        &self,
        rel_path: &str,
        include_entities: bool,
    ) -> Result<MetadataMap, BidsError> {
        let file = self.get_file(rel_path).ok_or_else(|| {
            BidsError::NoMatch(format!("no indexed file at path `{rel_path}`"))
        })?;

        let sidecar_rel = sidecar_path(rel_path);
        let sidecar_abs = self.root.join(&sidecar_rel);
        let mut metadata = if sidecar_abs.is_file() {
            let raw = fs::read_to_string(&sidecar_abs)?;
            serde_json::from_str::<MetadataMap>(&raw)?
        } else {
            debug!("no sidecar at {}, returning entities only", sidecar_abs.display());
            MetadataMap::new()
        };

        if include_entities {
            metadata.merge_under(file.entities());
        }
        Ok(metadata)
    }

    fn entity_values(&self, long_name: &str) -> Vec<String> {
        let values: BTreeSet<String> = self
            .files
            .iter()
            .filter_map(|f| f.entities.get_str(long_name))
            .collect();
        values.into_iter().collect()
    }

    /// Distinct subject labels in the dataset, sorted.
    pub fn subjects(&self) -> Vec<String> {
        self.entity_values("subject")
    }

    /// Distinct session labels, sorted.
    pub fn sessions(&self) -> Vec<String> {
        self.entity_values("session")
    }

    /// Distinct task labels, sorted.
    pub fn tasks(&self) -> Vec<String> {
        self.entity_values("task")
    }

    /// Distinct run indices (path tokens), sorted.
    pub fn runs(&self) -> Vec<String> {
        self.entity_values("run")
    }
}

/// Sidecar JSON path for an image or events path (`.../x_bold.nii` →
/// `.../x_bold.json`).
pub fn sidecar_path(rel_path: &str) -> String {
    let (dir, name) = match rel_path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, rel_path),
    };
    let stem = bids_stem(name);
    match dir {
        Some(dir) => format!("{dir}/{stem}.json"),
        None => format!("{stem}.json"),
    }
}

fn walk(root: &Path, dir: &Path, files: &mut Vec<BidsFileHandle>) -> Result<(), BidsError> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            walk(root, &path, files)?;
        } else if let Some(entities) = parse_entities(root, &path) {
            let rel_path = path
                .strip_prefix(root)
                .expect("walked path is under root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            files.push(BidsFileHandle { rel_path, entities });
        }
    }
    Ok(())
}

/// Parse the entities a file's name and directory encode; `None` when the
/// name does not follow the BIDS grammar (such files are not indexed).
fn parse_entities(root: &Path, path: &Path) -> Option<MetadataMap> {
    let name = path.file_name()?.to_str()?;
    let stem = bids_stem(name);
    let extension = bids_extension(name)?;

    let segments: Vec<&str> = stem.split('_').collect();
    if segments.len() < 2 {
        return None;
    }
    let suffix = *segments.last()?;
    if suffix.contains('-') || suffix.is_empty() {
        return None;
    }

    let mut entities = MetadataMap::new();
    for segment in &segments[..segments.len() - 1] {
        let (short, value) = segment.split_once('-')?;
        if value.is_empty() {
            return None;
        }
        let descriptor = entity::lookup_short(short)?;
        entities.insert(descriptor.long_name, Value::String(value.to_string()));
    }
    if !entities.contains_key("subject") {
        return None;
    }

    entities.insert("suffix", Value::String(suffix.to_string()));
    entities.insert("extension", Value::String(extension.to_string()));

    // datatype comes from the innermost directory (sub-01[/ses-02]/func)
    if let Some(parent) = path.parent().and_then(|p| p.strip_prefix(root).ok()) {
        if let Some(datatype) = parent
            .components()
            .next_back()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .filter(|c| !c.starts_with("sub-") && !c.starts_with("ses-"))
        {
            entities.insert("datatype", Value::String(datatype));
        }
    }
    Some(entities)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn seed_dataset(root: &Path) {
        let func = root.join("sub-01/func");
        fs::create_dir_all(&func).unwrap();
        fs::write(root.join("dataset_description.json"), "{}").unwrap();
        fs::write(func.join("sub-01_task-rest_bold.nii"), b"stub").unwrap();
        fs::write(
            func.join("sub-01_task-rest_bold.json"),
            r#"{"RepetitionTime": 1.5}"#,
        )
        .unwrap();
        fs::write(func.join("sub-01_task-rest_events.tsv"), "onset\n").unwrap();

        let ses = root.join("sub-02/ses-01/func");
        fs::create_dir_all(&ses).unwrap();
        fs::write(ses.join("sub-02_ses-01_task-rest_run-1_bold.nii"), b"stub").unwrap();

        // not BIDS-parseable, must be skipped
        fs::write(root.join("sub-01/notes.txt"), b"scratch").unwrap();
    }

    #[test]
    fn test_index_missing_root_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::index(&dir.path().join("nothing-here")).unwrap();
        assert!(layout.is_none());
    }

    #[test]
    fn test_index_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Layout::index(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_index_parses_entities() {
        let dir = tempfile::tempdir().unwrap();
        seed_dataset(dir.path());
        let layout = Layout::index(dir.path()).unwrap().unwrap();

        assert_eq!(layout.files().len(), 4);
        let file = layout
            .get_file("sub-02/ses-01/func/sub-02_ses-01_task-rest_run-1_bold.nii")
            .unwrap();
        assert_eq!(file.entities().get_str("subject").unwrap(), "02");
        assert_eq!(file.entities().get_str("session").unwrap(), "01");
        assert_eq!(file.entities().get_str("run").unwrap(), "1");
        assert_eq!(file.entities().get_str("suffix").unwrap(), "bold");
        assert_eq!(file.entities().get_str("datatype").unwrap(), "func");
        assert_eq!(file.entities().get_str("extension").unwrap(), ".nii");
    }

    #[test]
    fn test_reindex_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        seed_dataset(dir.path());
        let first = Layout::index(dir.path()).unwrap().unwrap();
        let second = Layout::index(dir.path()).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_files_matching_subset_and_exact() {
        let dir = tempfile::tempdir().unwrap();
        seed_dataset(dir.path());
        let layout = Layout::index(dir.path()).unwrap().unwrap();

        let query: MetadataMap =
            [("subject".to_string(), json!("01"))].into_iter().collect();
        assert_eq!(layout.files_matching(&query, false).len(), 3);

        // integer run values match their path token
        let query: MetadataMap = [
            ("subject".to_string(), json!("02")),
            ("run".to_string(), json!(1)),
        ]
        .into_iter()
        .collect();
        assert_eq!(layout.files_matching(&query, false).len(), 1);

        // exact: the file carries task + suffix the query lacks
        let query: MetadataMap =
            [("subject".to_string(), json!("01"))].into_iter().collect();
        assert!(layout.files_matching(&query, true).is_empty());

        let query: MetadataMap = [
            ("subject".to_string(), json!("01")),
            ("task".to_string(), json!("rest")),
            ("suffix".to_string(), json!("bold")),
            ("extension".to_string(), json!(".nii")),
        ]
        .into_iter()
        .collect();
        assert_eq!(layout.files_matching(&query, true).len(), 1);
    }

    #[test]
    fn test_metadata_for_merges_entities() {
        let dir = tempfile::tempdir().unwrap();
        seed_dataset(dir.path());
        let layout = Layout::index(dir.path()).unwrap().unwrap();

        let rel = "sub-01/func/sub-01_task-rest_bold.nii";
        let metadata = layout.metadata_for(rel, true).unwrap();
        assert_eq!(metadata.get_f64("RepetitionTime").unwrap(), 1.5);
        assert_eq!(metadata.get_str("subject").unwrap(), "01");

        let bare = layout.metadata_for(rel, false).unwrap();
        assert!(!bare.contains_key("subject"));

        assert!(layout.metadata_for("sub-09/func/missing.nii", true).is_err());
    }

    #[test]
    fn test_inventories() {
        let dir = tempfile::tempdir().unwrap();
        seed_dataset(dir.path());
        let layout = Layout::index(dir.path()).unwrap().unwrap();

        assert_eq!(layout.subjects(), vec!["01", "02"]);
        assert_eq!(layout.sessions(), vec!["01"]);
        assert_eq!(layout.tasks(), vec!["rest"]);
        assert_eq!(layout.runs(), vec!["1"]);
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path("sub-01/func/sub-01_bold.nii"),
            "sub-01/func/sub-01_bold.json"
        );
        assert_eq!(sidecar_path("sub-01_bold.nii.gz"), "sub-01_bold.json");
    }
}
