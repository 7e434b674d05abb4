//! The BIDS-Incremental: a self-describing single-volume packet carrying
//! one image plus enough metadata to locate it inside a BIDS dataset.
//!
//! An incremental owns a 4-D image (3-D inputs are promoted on
//! construction), the merged image metadata satisfying the required-field
//! contract, a dataset description, and a fixed README. It can compose its
//! own archive paths, write itself into a dataset root, and round-trip
//! losslessly through a binary wire envelope for the producer/consumer
//! transport.

use std::path::Path;

use bincode::{Decode, Encode};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    config::stream_config,
    errors::BidsError,
    internal::{
        entity,
        metadata::MetadataMap,
        nifti::{NiftiHeader, NiftiImage, codec},
    },
    utils::atomic_write,
};

/// Version tag carried by every serialized incremental.
pub const INCREMENTAL_VERSION: u32 = 1;

/// Image-metadata fields every incremental must carry.
pub const REQUIRED_METADATA: [&str; 5] =
    ["subject", "task", "suffix", "RepetitionTime", "EchoTime"];

/// Fields every dataset description must carry.
pub const DATASET_DESC_REQ_FIELDS: [&str; 2] = ["Name", "BIDSVersion"];

/// Upper bound on a plausible repetition time, in seconds. Values above it
/// are interpreted as milliseconds.
pub const MAX_REPETITION_TIME_S: f64 = 100.0;

/// Upper bound on a plausible echo time, in seconds.
pub const MAX_ECHO_TIME_S: f64 = 1.0;

/// README written next to every streamed dataset.
pub const DEFAULT_README: &str =
    "Dataset generated from a real-time BIDS-Incremental stream.\n";

/// Extension the writer emits; declared in the dataset description under
/// the non-standard `writerExtension` key.
pub const WRITER_EXTENSION: &str = ".nii";

/// Header line of every events TSV.
pub const EVENTS_HEADER: &str = "onset\tduration\tresponse_time\n";

/// The dataset description used when the producer does not supply one.
pub fn default_dataset_description() -> MetadataMap {
    let mut description = MetadataMap::new();
    description.insert("Name", json!("bids_incremental_dataset"));
    description.insert("BIDSVersion", json!(stream_config().bids_version));
    description.insert("Authors", json!(["The BIDS-Incremental Streaming Authors"]));
    description.insert("writerExtension", json!(WRITER_EXTENSION));
    description
}

/// Single-volume BIDS packet: one 4-D image, merged metadata, dataset
/// description, and README. Value-like; safe to move between threads.
#[derive(Clone, Debug)]
pub struct BidsIncremental {
    image: NiftiImage,
    metadata: MetadataMap,
    dataset_description: MetadataMap,
    readme: String,
    version: u32,
}

impl PartialEq for BidsIncremental {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image
            && self.metadata == other.metadata
            && self.dataset_description == other.dataset_description
    }
}

impl BidsIncremental {
    /// Build an incremental from an image and its metadata, validating the
    /// construction contract and normalizing the result:
    ///
    /// 1. entity tokens parsed from `ProtocolName` merge under the caller's
    ///    metadata (explicit values win),
    /// 2. `run` is coerced to an integer, `TaskName` mirrors `task`, and
    ///    `datatype` defaults to `func`,
    /// 3. `RepetitionTime`/`EchoTime` are normalized to seconds,
    /// 4. singleton axes are squeezed and a 3-D result is promoted to 4-D,
    /// 5. `pixdim[4]` is set to the repetition time.
    pub fn new(
        image: NiftiImage,
        image_metadata: MetadataMap,
        dataset_description: Option<MetadataMap>,
    ) -> Result<BidsIncremental, BidsError> {
        if image.ndim() < 3 {
            return Err(BidsError::Validation(format!(
                "image must have at least 3 dimensions, got {}",
                image.ndim()
            )));
        }
        let dataset_description = match dataset_description {
            Some(description) => {
                let missing: Vec<&str> = DATASET_DESC_REQ_FIELDS
                    .iter()
                    .copied()
                    .filter(|field| !description.contains_key(field))
                    .collect();
                if !missing.is_empty() {
                    return Err(BidsError::Validation(format!(
                        "dataset description missing required field(s): {}",
                        missing.join(", ")
                    )));
                }
                description
            }
            None => default_dataset_description(),
        };

        let mut metadata = image_metadata;
        if let Some(protocol_name) = metadata.get_str("ProtocolName") {
            metadata.merge_under(&entity::parse_protocol_name(&protocol_name));
        }

        let missing: Vec<&str> = REQUIRED_METADATA
            .iter()
            .copied()
            .filter(|field| !metadata.contains_key(field))
            .collect();
        if !missing.is_empty() {
            return Err(BidsError::MissingMetadata(missing.join(", ")));
        }

        if metadata.contains_key("run") {
            let run = metadata.get_i64("run").ok_or_else(|| {
                BidsError::Validation(format!(
                    "run value {:?} cannot be coerced to an integer",
                    metadata.get("run")
                ))
            })?;
            metadata.insert("run", json!(run));
        }
        let task = metadata
            .get("task")
            .cloned()
            .expect("task presence checked above");
        metadata.insert("TaskName", task);
        if !metadata.contains_key("datatype") {
            metadata.insert("datatype", json!(entity::DEFAULT_DATATYPE));
        }

        normalize_to_seconds(&mut metadata, "RepetitionTime", MAX_REPETITION_TIME_S)?;
        normalize_to_seconds(&mut metadata, "EchoTime", MAX_ECHO_TIME_S)?;

        let mut image = image.squeezed()?;
        match image.ndim() {
            3 => image = image.promoted_to_4d()?,
            4 => {}
            n => {
                return Err(BidsError::Validation(format!(
                    "image has {n} non-singleton dimensions, expected 3 or 4"
                )));
            }
        }
        let repetition_time = metadata
            .get_f64("RepetitionTime")
            .expect("RepetitionTime normalized above");
        image.header_mut().pixdim[4] = repetition_time;

        Ok(BidsIncremental {
            image,
            metadata,
            dataset_description,
            readme: DEFAULT_README.to_string(),
            version: INCREMENTAL_VERSION,
        })
    }

    /// A metadata value by key. With `strict`, only recognized entity
    /// long names may be queried.
    pub fn get_field(&self, key: &str, strict: bool) -> Result<Option<&Value>, BidsError> {
        if strict && !entity::is_entity(key) {
            return Err(BidsError::Validation(format!(
                "`{key}` is not a recognized BIDS entity"
            )));
        }
        Ok(self.metadata.get(key))
    }

    /// Set a metadata value. With `strict`, only recognized entity long
    /// names may be written.
    pub fn set_field(
        &mut self,
        key: &str,
        value: Value,
        strict: bool,
    ) -> Result<(), BidsError> {
        if strict && !entity::is_entity(key) {
            return Err(BidsError::Validation(format!(
                "`{key}` is not a recognized BIDS entity"
            )));
        }
        self.metadata.insert(key, value);
        Ok(())
    }

    /// Remove a metadata value. Required fields cannot be removed; with
    /// `strict`, only recognized entity long names may be named.
    pub fn remove_field(&mut self, key: &str, strict: bool) -> Result<(), BidsError> {
        if strict && !entity::is_entity(key) {
            return Err(BidsError::Validation(format!(
                "`{key}` is not a recognized BIDS entity"
            )));
        }
        if REQUIRED_METADATA.contains(&key) {
            return Err(BidsError::Validation(format!(
                "cannot remove required metadata field `{key}`"
            )));
        }
        self.metadata.remove(key);
        Ok(())
    }

    /// The entity subset of the metadata.
    pub fn entities(&self) -> MetadataMap {
        self.metadata.filter_entities()
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn dataset_description(&self) -> &MetadataMap {
        &self.dataset_description
    }

    pub fn readme(&self) -> &str {
        &self.readme
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn image(&self) -> &NiftiImage {
        &self.image
    }

    /// Raw little-endian voxel bytes.
    pub fn image_data(&self) -> &bytes::Bytes {
        self.image.data()
    }

    pub fn image_header(&self) -> &NiftiHeader {
        self.image.header()
    }

    /// Axis extents; always 4 entries for a constructed incremental.
    pub fn image_dimensions(&self) -> Vec<i64> {
        self.image.dims()
    }

    /// The sidecar view of the metadata: every non-entity field (entity
    /// values live in the file name instead).
    pub fn sidecar_metadata(&self) -> MetadataMap {
        self.metadata
            .iter()
            .filter(|(key, _)| !entity::is_entity(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// BIDS file name for this incremental with the given extension.
    pub fn make_bids_file_name(&self, extension: &str) -> Result<String, BidsError> {
        entity::build_file_name(&self.metadata, Some(extension))
    }

    /// Data directory relative to a dataset root (`sub-01[/ses-..]/func`).
    pub fn data_dir_path(&self) -> Result<String, BidsError> {
        entity::build_dir_path(&self.metadata)
    }

    /// Image path relative to a dataset root.
    pub fn image_file_path(&self) -> Result<String, BidsError> {
        Ok(format!(
            "{}/{}",
            self.data_dir_path()?,
            self.make_bids_file_name(WRITER_EXTENSION)?
        ))
    }

    /// Sidecar JSON path relative to a dataset root.
    pub fn metadata_file_path(&self) -> Result<String, BidsError> {
        Ok(format!(
            "{}/{}",
            self.data_dir_path()?,
            self.make_bids_file_name(".json")?
        ))
    }

    /// Events TSV file name (same entities, `events` suffix).
    pub fn events_file_name(&self) -> Result<String, BidsError> {
        let mut entities = self.metadata.clone();
        entities.insert("suffix", json!("events"));
        entity::build_file_name(&entities, Some(".tsv"))
    }

    /// Write this incremental as a complete single-volume BIDS dataset
    /// under `root`: image, sidecar, events skeleton, dataset description,
    /// and README, creating intermediate directories.
    pub fn write_to_archive(&self, root: &Path) -> Result<(), BidsError> {
        let data_dir = root.join(self.data_dir_path()?);

        let image_path = data_dir.join(self.make_bids_file_name(WRITER_EXTENSION)?);
        debug!("writing incremental image to {}", image_path.display());
        atomic_write(&image_path, &codec::serialize(&self.image)?)?;

        let sidecar_path = data_dir.join(self.make_bids_file_name(".json")?);
        atomic_write(
            &sidecar_path,
            self.sidecar_metadata().to_json_pretty()?.as_bytes(),
        )?;

        let events_path = data_dir.join(self.events_file_name()?);
        atomic_write(&events_path, EVENTS_HEADER.as_bytes())?;

        let mut description = self.dataset_description.clone();
        if !description.contains_key("writerExtension") {
            description.insert("writerExtension", json!(WRITER_EXTENSION));
        }
        atomic_write(
            &root.join("dataset_description.json"),
            description.to_json_pretty()?.as_bytes(),
        )?;
        atomic_write(&root.join("README"), self.readme.as_bytes())?;
        Ok(())
    }

    /// Encode into the self-describing binary wire envelope.
    pub fn serialize(&self) -> Result<Vec<u8>, BidsError> {
        let header = self.image.header();
        let affine = header.affine();
        let mut affine_flat = [0f64; 16];
        for (row, chunk) in affine.iter().zip(affine_flat.chunks_exact_mut(4)) {
            chunk.copy_from_slice(row);
        }
        let envelope = IncrementalEnvelope {
            version: self.version,
            datatype_code: header.datatype.code(),
            shape: header.shape(),
            image_bytes: self.image.data().to_vec(),
            affine: affine_flat,
            header: header.clone(),
            metadata_json: serde_json::to_string(&self.metadata)?,
            dataset_description_json: serde_json::to_string(&self.dataset_description)?,
            readme: self.readme.clone(),
        };
        bincode::encode_to_vec(&envelope, bincode::config::standard())
            .map_err(|e| BidsError::EnvelopeError(e.to_string()))
    }

    /// Decode a wire envelope, re-validating every construction invariant.
    pub fn deserialize(bytes: &[u8]) -> Result<BidsIncremental, BidsError> {
        let (envelope, _): (IncrementalEnvelope, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| BidsError::EnvelopeError(e.to_string()))?;

        if envelope.version != INCREMENTAL_VERSION {
            return Err(BidsError::EnvelopeError(format!(
                "unsupported incremental version {}",
                envelope.version
            )));
        }
        if envelope.datatype_code != envelope.header.datatype.code()
            || envelope.shape != envelope.header.shape()
        {
            return Err(BidsError::EnvelopeError(
                "envelope shape/datatype disagree with the embedded header".to_string(),
            ));
        }

        let image = NiftiImage::new(envelope.header, bytes::Bytes::from(envelope.image_bytes))?;
        let metadata: MetadataMap = serde_json::from_str(&envelope.metadata_json)?;
        let dataset_description: MetadataMap =
            serde_json::from_str(&envelope.dataset_description_json)?;

        let mut incremental =
            BidsIncremental::new(image, metadata, Some(dataset_description))?;
        incremental.readme = envelope.readme;
        Ok(incremental)
    }
}

/// Binary wire form of an incremental: voxel payload with its own dtype and
/// shape, the affine, the full typed header, and the metadata maps as
/// canonical JSON.
#[derive(Encode, Decode)]
struct IncrementalEnvelope {
    version: u32,
    datatype_code: i16,
    shape: Vec<i64>,
    image_bytes: Vec<u8>,
    affine: [f64; 16],
    header: NiftiHeader,
    metadata_json: String,
    dataset_description_json: String,
    readme: String,
}

/// Normalize a time field to seconds: values above `cap` are reinterpreted
/// as milliseconds when dividing by 1000 brings them under the cap;
/// anything else is rejected.
fn normalize_to_seconds(
    metadata: &mut MetadataMap,
    field: &str,
    cap: f64,
) -> Result<(), BidsError> {
    let value = metadata.get_f64(field).ok_or_else(|| {
        BidsError::Validation(format!(
            "{field} value {:?} is not numeric",
            metadata.get(field)
        ))
    })?;

    let seconds = if value <= cap {
        value
    } else if value / 1000.0 <= cap {
        debug!("normalizing {field} from {value} ms to {} s", value / 1000.0);
        value / 1000.0
    } else {
        return Err(BidsError::Validation(format!(
            "{field} value {value} is implausible in both seconds and milliseconds \
             (cap: {cap} s)"
        )));
    };
    metadata.insert(field, json!(seconds));
    Ok(())
}
