//! The BIDS Archive: a read/write facade over an on-disk BIDS dataset that
//! can ingest incrementals or whole runs, query existing images, and emit
//! incrementals/runs for downstream analysis.
//!
//! The on-disk tree is the source of truth; the layout handle is a cache
//! re-derived after every mutation. Queries take `&self` and mutations
//! `&mut self`, so within one archive instance Rust's aliasing rules give
//! many concurrent readers or one writer, never both. Every write lands via
//! a temp file and rename, making each append all-or-nothing.

pub mod layout;

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde_json::json;
use tracing::debug;

use crate::{
    errors::BidsError,
    internal::{
        compat::{images_append_compatible, metadata_append_compatible},
        incremental::{BidsIncremental, EVENTS_HEADER},
        metadata::MetadataMap,
        nifti::{NiftiImage, codec},
        run::BidsRun,
    },
    utils::{EVENTS_EXTENSIONS, IMAGE_EXTENSIONS, atomic_write},
};

use layout::{BidsFileHandle, Layout, sidecar_path};

/// Read/write facade over one on-disk BIDS dataset.
#[derive(Debug)]
pub struct BidsArchive {
    root: PathBuf,
    layout: Option<Layout>,
}

impl BidsArchive {
    /// Open the dataset under `root`. A missing or non-indexable root
    /// produces an archive in the empty state, which becomes non-empty on
    /// the first append.
    pub fn open(root: impl Into<PathBuf>) -> Result<BidsArchive, BidsError> {
        let root = root.into();
        let layout = Layout::index(&root)?;
        debug!(
            "opened archive at {} ({})",
            root.display(),
            if layout.is_some() { "indexed" } else { "empty" }
        );
        Ok(BidsArchive { root, layout })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True until the first successful append into a fresh root.
    pub fn is_empty(&self) -> bool {
        self.layout.is_none()
    }

    /// Re-derive the layout from disk. Called after every mutation;
    /// idempotent.
    fn update_layout(&mut self) -> Result<(), BidsError> {
        self.layout = Layout::index(&self.root)?;
        Ok(())
    }

    fn require_layout(&self) -> Result<&Layout, BidsError> {
        self.layout
            .as_ref()
            .ok_or_else(|| BidsError::State(format!("archive at {} is empty", self.root.display())))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Image files whose entity set includes (`match_exact`: equals) the
    /// query. An `extension` in the query must be an image extension. An
    /// empty result is not an error.
    pub fn get_images(
        &self,
        query: &MetadataMap,
        match_exact: bool,
    ) -> Result<Vec<BidsFileHandle>, BidsError> {
        self.query_files(query, match_exact, &IMAGE_EXTENSIONS, None)
    }

    /// Events files (`events` suffix, `.tsv`/`.tsv.gz`) matching the query.
    pub fn get_events(
        &self,
        query: &MetadataMap,
        match_exact: bool,
    ) -> Result<Vec<BidsFileHandle>, BidsError> {
        self.query_files(query, match_exact, &EVENTS_EXTENSIONS, Some("events"))
    }

    fn query_files(
        &self,
        query: &MetadataMap,
        match_exact: bool,
        extensions: &[&str],
        forced_suffix: Option<&str>,
    ) -> Result<Vec<BidsFileHandle>, BidsError> {
        let layout = self.require_layout()?;

        let mut query = query.clone();
        if let Some(suffix) = forced_suffix {
            query.insert("suffix", json!(suffix));
        }
        if let Some(extension) = query.get_str("extension") {
            if !extensions.contains(&extension.as_str()) {
                return Err(BidsError::Validation(format!(
                    "extension `{extension}` is not one of {}",
                    extensions.join(", ")
                )));
            }
        }

        let matches: Vec<BidsFileHandle> = layout
            .files_matching(&query, match_exact)
            .into_iter()
            .filter(|file| {
                file.entities()
                    .get_str("extension")
                    .is_some_and(|ext| extensions.contains(&ext.as_str()))
            })
            .cloned()
            .collect();
        if matches.is_empty() {
            debug!("query matched no files in {}", self.root.display());
        }
        Ok(matches)
    }

    /// Sidecar metadata for the file at `path` (relative to the root),
    /// merged with its filename-encoded entities when `include_entities`.
    pub fn get_metadata(
        &self,
        path: &str,
        include_entities: bool,
    ) -> Result<MetadataMap, BidsError> {
        let layout = self.require_layout()?;
        layout.metadata_for(path.trim_start_matches('/'), include_entities)
    }

    /// Whether `path` names an indexed file or an existing directory.
    pub fn path_exists(&self, path: &str) -> Result<bool, BidsError> {
        Ok(self.try_get_file(path)?.is_some() || self.dir_exists(path)?)
    }

    /// Whether `path` names an existing directory below the root.
    pub fn dir_exists(&self, path: &str) -> Result<bool, BidsError> {
        self.require_layout()?;
        Ok(self.root.join(path.trim_start_matches('/')).is_dir())
    }

    /// The indexed file at `path`, trying the path as given and then with a
    /// leading slash stripped.
    pub fn try_get_file(&self, path: &str) -> Result<Option<BidsFileHandle>, BidsError> {
        let layout = self.require_layout()?;
        let found = layout
            .get_file(path)
            .or_else(|| layout.get_file(path.trim_start_matches('/')));
        Ok(found.cloned())
    }

    /// Distinct subject labels, sorted.
    pub fn get_subjects(&self) -> Result<Vec<String>, BidsError> {
        Ok(self.require_layout()?.subjects())
    }

    /// Distinct session labels, sorted.
    pub fn get_sessions(&self) -> Result<Vec<String>, BidsError> {
        Ok(self.require_layout()?.sessions())
    }

    /// Distinct task labels, sorted.
    pub fn get_tasks(&self) -> Result<Vec<String>, BidsError> {
        Ok(self.require_layout()?.tasks())
    }

    /// Distinct run path tokens, sorted.
    pub fn get_runs(&self) -> Result<Vec<String>, BidsError> {
        Ok(self.require_layout()?.runs())
    }

    /// The dataset description at the root, if present.
    pub fn dataset_description(&self) -> Result<Option<MetadataMap>, BidsError> {
        let path = self.root.join("dataset_description.json");
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Read the image at `rel_path`, accepting a `.nii.gz` twin when the
    /// uncompressed file is absent.
    pub fn read_image(&self, rel_path: &str) -> Result<NiftiImage, BidsError> {
        let abs = self
            .resolve_image_path(rel_path)
            .ok_or_else(|| BidsError::NoMatch(format!("no image file at `{rel_path}`")))?;
        codec::read_image(&abs)
    }

    fn resolve_image_path(&self, rel_path: &str) -> Option<PathBuf> {
        let rel_path = rel_path.trim_start_matches('/');
        let abs = self.root.join(rel_path);
        if abs.is_file() {
            return Some(abs);
        }
        if rel_path.ends_with(".nii") {
            let gz = self.root.join(format!("{rel_path}.gz"));
            if gz.is_file() {
                return Some(gz);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Append one incremental.
    ///
    /// Three cases, in order: an empty archive bootstraps a whole dataset
    /// (`make_path` required); an existing image for the incremental's
    /// entities is extended along the time axis after both compatibility
    /// checks; otherwise new image/sidecar/events files are written when
    /// `make_path` is set or the data directory already exists. Returns
    /// whether anything was appended.
    pub fn append_incremental(
        &mut self,
        incremental: &BidsIncremental,
        make_path: bool,
    ) -> Result<bool, BidsError> {
        if self.is_empty() {
            if !make_path {
                return Ok(false);
            }
            debug!("bootstrapping empty archive at {}", self.root.display());
            incremental.write_to_archive(&self.root)?;
            self.update_layout()?;
            return Ok(true);
        }

        let image_rel = incremental.image_file_path()?;
        if self.resolve_image_path(&image_rel).is_some() {
            self.extend_existing_image(incremental, &image_rel)?;
            return Ok(true);
        }

        let dir_rel = incremental.data_dir_path()?;
        if make_path || self.root.join(&dir_rel).is_dir() {
            self.write_new_image(incremental)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn extend_existing_image(
        &mut self,
        incremental: &BidsIncremental,
        image_rel: &str,
    ) -> Result<(), BidsError> {
        let disk_image = self.read_image(image_rel)?;

        images_append_compatible(incremental.image_header(), disk_image.header())
            .map_err(BidsError::Validation)?;
        let archive_sidecar = self.get_metadata(image_rel, true)?;
        metadata_append_compatible(incremental.metadata(), &archive_sidecar)
            .map_err(BidsError::Validation)?;

        let disk_image = match disk_image.ndim() {
            3 => {
                let mut promoted = disk_image.promoted_to_4d()?;
                let repetition_time = incremental
                    .metadata()
                    .get_f64("RepetitionTime")
                    .ok_or_else(|| {
                        BidsError::Runtime("incremental lost its RepetitionTime".to_string())
                    })?;
                promoted.header_mut().pixdim[4] = repetition_time;
                promoted
            }
            4 => disk_image,
            n => {
                return Err(BidsError::Runtime(format!(
                    "on-disk image at `{image_rel}` is {n}-D; only 3-D and 4-D images \
                     can be extended"
                )));
            }
        };

        let merged = disk_image.concat_frames(incremental.image())?;
        debug!(
            "extending `{image_rel}` to {} frame(s)",
            merged.num_frames()
        );
        atomic_write(&self.root.join(image_rel), &codec::serialize(&merged)?)?;
        // sidecar tracks the newest volume's acquisition parameters
        atomic_write(
            &self.root.join(sidecar_path(image_rel)),
            incremental.sidecar_metadata().to_json_pretty()?.as_bytes(),
        )?;
        self.update_layout()
    }

    fn write_new_image(&mut self, incremental: &BidsIncremental) -> Result<(), BidsError> {
        let image_rel = incremental.image_file_path()?;
        debug!("writing new image at `{image_rel}`");
        atomic_write(
            &self.root.join(&image_rel),
            &codec::serialize(incremental.image())?,
        )?;
        atomic_write(
            &self.root.join(incremental.metadata_file_path()?),
            incremental.sidecar_metadata().to_json_pretty()?.as_bytes(),
        )?;
        let events_rel = format!(
            "{}/{}",
            incremental.data_dir_path()?,
            incremental.events_file_name()?
        );
        atomic_write(&self.root.join(events_rel), EVENTS_HEADER.as_bytes())?;
        self.update_layout()
    }

    /// Append every incremental of a run, in order, creating paths as
    /// needed.
    pub fn append_run(&mut self, run: &BidsRun) -> Result<(), BidsError> {
        for incremental in run.iter() {
            self.append_incremental(incremental, true)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Extraction
    // ------------------------------------------------------------------

    fn unique_image(&self, query: &MetadataMap) -> Result<BidsFileHandle, BidsError> {
        let mut images = self.get_images(query, false)?;
        match images.len() {
            0 => Err(BidsError::NoMatch(format!(
                "no image in the archive matches entities {query:?}"
            ))),
            1 => Ok(images.remove(0)),
            n => Err(BidsError::Ambiguous(format!(
                "{n} images match entities {query:?}; expected exactly one"
            ))),
        }
    }

    fn incremental_from_file(
        &self,
        handle: &BidsFileHandle,
        image: NiftiImage,
    ) -> Result<BidsIncremental, BidsError> {
        let mut metadata = self.get_metadata(handle.rel_path(), true)?;
        // the extension entity only exists inside the layout index
        metadata.remove("extension");
        BidsIncremental::new(image, metadata, self.dataset_description()?)
    }

    /// Extract the volume at `slice_index` of the unique image matching the
    /// entities as a fresh incremental.
    pub fn get_incremental(
        &self,
        slice_index: i64,
        query: &MetadataMap,
    ) -> Result<BidsIncremental, BidsError> {
        if slice_index < 0 {
            return Err(BidsError::IndexOutOfBounds(format!(
                "slice index {slice_index} is negative"
            )));
        }
        let handle = self.unique_image(query)?;
        let image = self.read_image(handle.rel_path())?;

        let volume = match image.ndim() {
            3 => {
                if slice_index != 0 {
                    return Err(BidsError::IndexOutOfBounds(format!(
                        "slice index {slice_index} out of bounds for a 3-D image"
                    )));
                }
                image
            }
            4 => {
                let frames = image.num_frames();
                if slice_index as usize >= frames {
                    return Err(BidsError::IndexOutOfBounds(format!(
                        "slice index {slice_index} out of bounds for an image with \
                         {frames} frame(s)"
                    )));
                }
                image.slice_frame(slice_index as usize)?
            }
            n => {
                return Err(BidsError::Runtime(format!(
                    "image at `{}` is {n}-D; expected 3-D or 4-D",
                    handle.rel_path()
                )));
            }
        };
        self.incremental_from_file(&handle, volume)
    }

    /// Extract the unique image matching the entities as a run, one
    /// incremental per frame. Frames of one file are known-consistent, so
    /// the per-append validation is skipped.
    pub fn get_run(&self, query: &MetadataMap) -> Result<BidsRun, BidsError> {
        let handle = self.unique_image(query)?;
        let image = self.read_image(handle.rel_path())?;

        let mut run = BidsRun::with_entities(query.clone());
        match image.ndim() {
            3 => {
                let incremental = self.incremental_from_file(&handle, image)?;
                run.append(incremental, false)?;
            }
            4 => {
                for frame in 0..image.num_frames() {
                    let volume = image.slice_frame(frame)?;
                    let incremental = self.incremental_from_file(&handle, volume)?;
                    run.append(incremental, false)?;
                }
            }
            n => {
                return Err(BidsError::Runtime(format!(
                    "image at `{}` is {n}-D; expected 3-D or 4-D",
                    handle.rel_path()
                )));
            }
        }
        Ok(run)
    }
}
