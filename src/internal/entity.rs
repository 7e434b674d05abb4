//! BIDS entity model: the static table of recognized entities, protocol
//! name parsing, and file/directory path composition.
//!
//! An entity is a named key whose value appears in both directory names and
//! file names (`sub-01/func/sub-01_task-rest_bold.nii`). The recognized set
//! is fixed and loaded once; `suffix`, `datatype`, and `extension` are
//! members of the table but never appear as `key-value` tokens.

use std::{collections::BTreeMap, sync::OnceLock};

use dashmap::DashMap;
use serde_json::Value;

use crate::{errors::BidsError, internal::metadata::MetadataMap};

/// How an entity value is formatted in paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityFormat {
    /// Free-form alphanumeric token.
    Label,
    /// Nonnegative integer, stored as an integer in metadata maps.
    Index,
}

/// Where the entity lives in a file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    /// `<short>-<value>` segment in the file name.
    KeyValue,
    /// Final `_<value>` segment before the extension.
    Suffix,
    /// Directory component (`func`, `anat`, ...).
    Datatype,
    /// Trailing `.nii` / `.json` / ... component.
    Extension,
}

/// One row of the static entity table.
#[derive(Clone, Copy, Debug)]
pub struct EntityDescriptor {
    pub long_name: &'static str,
    pub short_name: &'static str,
    pub format: EntityFormat,
    pub kind: EntityKind,
    pub description: &'static str,
}

const fn key_value(
    long_name: &'static str,
    short_name: &'static str,
    format: EntityFormat,
    description: &'static str,
) -> EntityDescriptor {
    EntityDescriptor {
        long_name,
        short_name,
        format,
        kind: EntityKind::KeyValue,
        description,
    }
}

/// The recognized entity set, in file-name composition order.
static ENTITY_TABLE: [EntityDescriptor; 22] = [
    key_value("subject", "sub", EntityFormat::Label, "participant identifier"),
    key_value("session", "ses", EntityFormat::Label, "acquisition session"),
    key_value("task", "task", EntityFormat::Label, "task performed during acquisition"),
    key_value("acquisition", "acq", EntityFormat::Label, "acquisition parameter set"),
    key_value("ceagent", "ce", EntityFormat::Label, "contrast enhancing agent"),
    key_value("tracer", "trc", EntityFormat::Label, "injected tracer"),
    key_value("direction", "dir", EntityFormat::Label, "phase encoding direction"),
    key_value("reconstruction", "rec", EntityFormat::Label, "reconstruction algorithm"),
    key_value("run", "run", EntityFormat::Index, "repetition index of the same acquisition"),
    key_value("modality", "mod", EntityFormat::Label, "modality of the corresponding image"),
    key_value("echo", "echo", EntityFormat::Index, "echo index in multi-echo data"),
    key_value("recording", "recording", EntityFormat::Label, "continuous recording label"),
    key_value("flip", "flip", EntityFormat::Index, "flip angle index"),
    key_value("inversion", "inv", EntityFormat::Index, "inversion time index"),
    key_value("mtransfer", "mt", EntityFormat::Label, "magnetization transfer state"),
    key_value("part", "part", EntityFormat::Label, "complex-value part (mag/phase/real/imag)"),
    key_value("processing", "proc", EntityFormat::Label, "processing label applied to the data"),
    key_value("space", "space", EntityFormat::Label, "coordinate space of the data"),
    key_value("split", "split", EntityFormat::Index, "split index of a divided file"),
    EntityDescriptor {
        long_name: "suffix",
        short_name: "suffix",
        format: EntityFormat::Label,
        kind: EntityKind::Suffix,
        description: "image contrast or file-type suffix",
    },
    EntityDescriptor {
        long_name: "datatype",
        short_name: "datatype",
        format: EntityFormat::Label,
        kind: EntityKind::Datatype,
        description: "BIDS data type directory",
    },
    EntityDescriptor {
        long_name: "extension",
        short_name: "extension",
        format: EntityFormat::Label,
        kind: EntityKind::Extension,
        description: "file extension including the leading dot",
    },
];

/// Suffixes the functional path grammar permits.
pub const FUNCTIONAL_SUFFIXES: [&str; 4] = ["bold", "cbv", "sbref", "events"];

/// The `datatype` used when none is given and the suffix is functional.
pub const DEFAULT_DATATYPE: &str = "func";

fn long_name_index() -> &'static BTreeMap<&'static str, &'static EntityDescriptor> {
    static INDEX: OnceLock<BTreeMap<&'static str, &'static EntityDescriptor>> = OnceLock::new();
    INDEX.get_or_init(|| ENTITY_TABLE.iter().map(|e| (e.long_name, e)).collect())
}

fn short_name_index() -> &'static BTreeMap<&'static str, &'static EntityDescriptor> {
    static INDEX: OnceLock<BTreeMap<&'static str, &'static EntityDescriptor>> = OnceLock::new();
    INDEX.get_or_init(|| {
        ENTITY_TABLE
            .iter()
            .filter(|e| e.kind == EntityKind::KeyValue)
            .map(|e| (e.short_name, e))
            .collect()
    })
}

/// Descriptor for a recognized entity long name.
pub fn lookup(long_name: &str) -> Option<&'static EntityDescriptor> {
    long_name_index().get(long_name).copied()
}

/// Descriptor for a recognized `key-value` short name.
pub fn lookup_short(short_name: &str) -> Option<&'static EntityDescriptor> {
    short_name_index().get(short_name).copied()
}

/// True when `name` is a recognized entity long name.
pub fn is_entity(name: &str) -> bool {
    long_name_index().contains_key(name)
}

/// All recognized entity descriptors in file-name order.
pub fn descriptors() -> &'static [EntityDescriptor] {
    &ENTITY_TABLE
}

/// Extract `short-value` tokens embedded in a free-form protocol string.
/// A token matches `(^|_)<short>-<value>(?=_|$)`; unknown short names are
/// ignored. Values are returned under entity long names.
pub fn parse_protocol_name(protocol_name: &str) -> MetadataMap {
    let mut parsed = MetadataMap::new();
    for segment in protocol_name.split('_') {
        let Some((short, value)) = segment.split_once('-') else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        if let Some(descriptor) = lookup_short(short) {
            parsed.insert(descriptor.long_name, Value::String(value.to_string()));
        }
    }
    parsed
}

fn entity_token(metadata: &MetadataMap, long_name: &str) -> Option<String> {
    metadata.get_str(long_name)
}

/// The suffix for path composition, validated against the functional
/// grammar when the data is functional.
fn validated_suffix(metadata: &MetadataMap) -> Result<String, BidsError> {
    let suffix = entity_token(metadata, "suffix")
        .ok_or_else(|| BidsError::Validation("cannot compose a file name without a suffix".to_string()))?;
    let datatype = entity_token(metadata, "datatype");
    let functional = match datatype.as_deref() {
        Some(DEFAULT_DATATYPE) => true,
        Some(_) => false,
        None => true,
    };
    if functional && !FUNCTIONAL_SUFFIXES.contains(&suffix.as_str()) {
        return Err(BidsError::Validation(format!(
            "suffix `{suffix}` is not a functional suffix ({})",
            FUNCTIONAL_SUFFIXES.join(", ")
        )));
    }
    Ok(suffix)
}

/// Compose a BIDS file name from an entity map:
/// `sub-<v>[_ses-<v>]_task-<v>[...]_<suffix>[.<extension>]`, optional
/// segments omitted when absent. `subject`, `task`, and `suffix` are
/// required. `extension` overrides any `extension` key in the map.
pub fn build_file_name(
    metadata: &MetadataMap,
    extension: Option<&str>,
) -> Result<String, BidsError> {
    for required in ["subject", "task"] {
        if entity_token(metadata, required).is_none() {
            return Err(BidsError::Validation(format!(
                "cannot compose a file name without the `{required}` entity"
            )));
        }
    }

    let mut segments = Vec::new();
    for descriptor in ENTITY_TABLE.iter().filter(|e| e.kind == EntityKind::KeyValue) {
        if let Some(value) = entity_token(metadata, descriptor.long_name) {
            segments.push(format!("{}-{value}", descriptor.short_name));
        }
    }
    segments.push(validated_suffix(metadata)?);

    let extension = match extension {
        Some(ext) => Some(ext.to_string()),
        None => entity_token(metadata, "extension"),
    };
    let mut name = segments.join("_");
    if let Some(ext) = extension {
        name.push_str(&ext);
    }
    Ok(name)
}

/// Compose the data directory path `sub-<v>[/ses-<v>]/<datatype>` for an
/// entity map. `datatype` defaults to `func` when the suffix is one of the
/// functional suffixes.
pub fn build_dir_path(metadata: &MetadataMap) -> Result<String, BidsError> {
    let subject = entity_token(metadata, "subject").ok_or_else(|| {
        BidsError::Validation("cannot compose a directory path without the `subject` entity".to_string())
    })?;

    let datatype = match entity_token(metadata, "datatype") {
        Some(datatype) => datatype,
        None => {
            let suffix = entity_token(metadata, "suffix").unwrap_or_default();
            if FUNCTIONAL_SUFFIXES.contains(&suffix.as_str()) {
                DEFAULT_DATATYPE.to_string()
            } else {
                return Err(BidsError::Validation(format!(
                    "cannot infer a datatype for suffix `{suffix}`"
                )));
            }
        }
    };

    let mut path = format!("sub-{subject}");
    if let Some(session) = entity_token(metadata, "session") {
        path.push_str(&format!("/ses-{session}"));
    }
    path.push('/');
    path.push_str(&datatype);
    Ok(path)
}

/// Strip every non-alphabetic character so a DICOM field name becomes a
/// BIDS-compatible CamelCase key (`Frame of Reference UID` →
/// `FrameofReferenceUID`). Results are cached by input.
pub fn dicom_field_to_bids(field: &str) -> String {
    static CACHE: OnceLock<DashMap<String, String>> = OnceLock::new();
    let cache = CACHE.get_or_init(DashMap::new);
    if let Some(hit) = cache.get(field) {
        return hit.clone();
    }
    let cleaned: String = field.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    cache.insert(field.to_string(), cleaned.clone());
    cleaned
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> MetadataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_table_is_complete() {
        assert_eq!(descriptors().len(), 22);
        assert_eq!(lookup("subject").unwrap().short_name, "sub");
        assert_eq!(lookup("run").unwrap().format, EntityFormat::Index);
        assert!(lookup_short("suffix").is_none());
        assert!(is_entity("datatype"));
        assert!(!is_entity("RepetitionTime"));
    }

    #[test]
    fn test_parse_protocol_name() {
        let parsed = parse_protocol_name("func_ses-01_task-story_run-01");
        assert_eq!(parsed.get_str("session").unwrap(), "01");
        assert_eq!(parsed.get_str("task").unwrap(), "story");
        assert_eq!(parsed.get_str("run").unwrap(), "01");
        assert!(!parsed.contains_key("subject"));
    }

    #[test]
    fn test_parse_protocol_name_ignores_unknown_tokens() {
        let parsed = parse_protocol_name("cmrr_mbep2d-xyz_task-rest_bogus-9");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get_str("task").unwrap(), "rest");
    }

    #[test]
    fn test_build_file_name_ordering() {
        let m = metadata(&[
            ("subject", "01"),
            ("session", "02"),
            ("task", "faces"),
            ("run", "1"),
            ("echo", "2"),
            ("suffix", "bold"),
        ]);
        let name = build_file_name(&m, Some(".nii")).unwrap();
        assert_eq!(name, "sub-01_ses-02_task-faces_run-1_echo-2_bold.nii");
    }

    #[test]
    fn test_build_file_name_requires_core_entities() {
        let m = metadata(&[("task", "faces"), ("suffix", "bold")]);
        assert!(build_file_name(&m, None).is_err());

        let m = metadata(&[("subject", "01"), ("task", "faces")]);
        assert!(build_file_name(&m, None).is_err());
    }

    #[test]
    fn test_build_file_name_rejects_nonfunctional_suffix() {
        let m = metadata(&[("subject", "01"), ("task", "x"), ("suffix", "T1w")]);
        assert!(build_file_name(&m, None).is_err());

        // explicit non-functional datatype passes through
        let m = metadata(&[
            ("subject", "01"),
            ("task", "x"),
            ("suffix", "T1w"),
            ("datatype", "anat"),
        ]);
        assert_eq!(build_file_name(&m, None).unwrap(), "sub-01_task-x_T1w");
    }

    #[test]
    fn test_build_dir_path() {
        let m = metadata(&[("subject", "01"), ("suffix", "bold")]);
        assert_eq!(build_dir_path(&m).unwrap(), "sub-01/func");

        let m = metadata(&[("subject", "01"), ("session", "02"), ("suffix", "bold")]);
        assert_eq!(build_dir_path(&m).unwrap(), "sub-01/ses-02/func");

        let m = metadata(&[("subject", "01"), ("datatype", "anat"), ("suffix", "T1w")]);
        assert_eq!(build_dir_path(&m).unwrap(), "sub-01/anat");
    }

    #[test]
    fn test_dicom_field_to_bids() {
        assert_eq!(dicom_field_to_bids("Frame of Reference UID"), "FrameofReferenceUID");
        assert_eq!(dicom_field_to_bids("RepetitionTime"), "RepetitionTime");
        assert_eq!(dicom_field_to_bids("Echo Time (ms)"), "EchoTimems");
        // cached second call returns the same value
        assert_eq!(dicom_field_to_bids("Frame of Reference UID"), "FrameofReferenceUID");
    }
}
