//! The BIDS Run: an ordered in-memory buffer of incrementals that share one
//! acquisition, used as a staging area for arriving data and as a view onto
//! an archive.

use tracing::debug;

use crate::{
    errors::BidsError,
    internal::{
        compat::images_append_compatible, incremental::BidsIncremental, metadata::MetadataMap,
    },
};

/// Ordered sequence of incrementals sharing a common entity tuple. The
/// entity map is fixed by the first append when not given at creation.
#[derive(Clone, Debug, Default)]
pub struct BidsRun {
    incrementals: Vec<BidsIncremental>,
    entities: MetadataMap,
}

impl PartialEq for BidsRun {
    fn eq(&self, other: &Self) -> bool {
        self.entities == other.entities && self.incrementals == other.incrementals
    }
}

impl BidsRun {
    /// An empty run with no entity constraint yet.
    pub fn new() -> BidsRun {
        BidsRun::default()
    }

    /// An empty run constrained to the given entities.
    pub fn with_entities(entities: MetadataMap) -> BidsRun {
        BidsRun {
            incrementals: Vec::new(),
            entities,
        }
    }

    /// Number of incrementals in this run.
    pub fn len(&self) -> usize {
        self.incrementals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incrementals.is_empty()
    }

    /// The entity tuple every member shares.
    pub fn entities(&self) -> &MetadataMap {
        &self.entities
    }

    /// The incremental at `index` (0-indexed).
    pub fn get(&self, index: usize) -> Result<&BidsIncremental, BidsError> {
        self.incrementals.get(index).ok_or_else(|| {
            BidsError::IndexOutOfBounds(format!(
                "index {index} out of bounds for run with {} incremental(s)",
                self.incrementals.len()
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &BidsIncremental> {
        self.incrementals.iter()
    }

    /// Append an incremental, fixing the run's entities on first append.
    ///
    /// With `validate` set and a non-empty run, the incremental's entities
    /// must equal the run's and its image must be append-compatible with
    /// the last member's; a multi-frame image is split into one incremental
    /// per frame sharing the same metadata and header. Passing `validate =
    /// false` skips the checks, for data already known to be consistent
    /// (e.g. frames read back from a single archive file).
    pub fn append(
        &mut self,
        incremental: BidsIncremental,
        validate: bool,
    ) -> Result<(), BidsError> {
        if self.entities.is_empty() {
            self.entities = incremental.entities();
        } else if validate && !self.is_empty() {
            let entities = incremental.entities();
            if entities != self.entities {
                let difference = self.entities.symmetric_difference(&entities);
                return Err(BidsError::MetadataMismatch {
                    message: "incremental's BIDS entities do not match this run's entities"
                        .to_string(),
                    difference,
                });
            }

            let last = self
                .incrementals
                .last()
                .expect("non-empty run has a last incremental");
            if let Err(reason) =
                images_append_compatible(incremental.image_header(), last.image_header())
            {
                return Err(BidsError::MetadataMismatch {
                    message: format!(
                        "incremental's NIfTI header isn't append-compatible with this \
                         run's images ({reason})"
                    ),
                    difference: Default::default(),
                });
            }
        }

        let frames = incremental.image().num_frames();
        if frames > 1 {
            debug!("splitting a {frames}-frame incremental into single volumes");
            for frame in 0..frames {
                let image = incremental.image().slice_frame(frame)?;
                let split = BidsIncremental::new(
                    image,
                    incremental.metadata().clone(),
                    Some(incremental.dataset_description().clone()),
                )?;
                self.incrementals.push(split);
            }
        } else {
            self.incrementals.push(incremental);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::internal::{
        incremental::tests::{test_image_3d, test_metadata, valid_incremental},
        nifti::{DataType, NiftiHeader, NiftiImage},
    };

    #[test]
    fn test_first_append_fixes_entities() {
        let mut run = BidsRun::new();
        assert_eq!(run.len(), 0);

        let incremental = valid_incremental();
        run.append(incremental.clone(), true).unwrap();
        assert_eq!(run.len(), 1);
        assert_eq!(run.entities(), &incremental.entities());
    }

    #[test]
    fn test_repeated_appends_accumulate() {
        let mut run = BidsRun::new();
        for count in 1..=20 {
            run.append(valid_incremental(), true).unwrap();
            assert_eq!(run.len(), count);
        }
        for index in 0..20 {
            assert_eq!(run.get(index).unwrap().entities(), run.entities().clone());
        }
    }

    #[test]
    fn test_get_out_of_bounds() {
        let mut run = BidsRun::new();
        run.append(valid_incremental(), true).unwrap();
        let err = run.get(1).unwrap_err();
        assert!(matches!(err, BidsError::IndexOutOfBounds(_)));
    }

    #[test]
    fn test_entity_mismatch_rejected_with_difference() {
        let mut run = BidsRun::new();
        run.append(valid_incremental(), true).unwrap();

        let mut other = valid_incremental();
        other.set_field("subject", json!("02"), true).unwrap();
        match run.append(other, true).unwrap_err() {
            BidsError::MetadataMismatch { difference, .. } => {
                let keys: Vec<&String> = difference.keys().collect();
                assert_eq!(keys, ["subject"]);
            }
            other => panic!("expected MetadataMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_header_mismatch_rejected() {
        let mut run = BidsRun::new();
        run.append(valid_incremental(), true).unwrap();

        let header = NiftiHeader::for_shape(&[4, 4, 3], DataType::Float32).unwrap();
        let data = vec![0u8; header.total_voxels() * 4];
        let image = NiftiImage::new(header, bytes::Bytes::from(data)).unwrap();
        let other = BidsIncremental::new(image, test_metadata(), None).unwrap();

        let err = run.append(other, true).unwrap_err();
        assert!(matches!(err, BidsError::MetadataMismatch { .. }));
    }

    #[test]
    fn test_unvalidated_append_skips_checks() {
        let mut run = BidsRun::new();
        run.append(valid_incremental(), true).unwrap();

        let mut other = valid_incremental();
        other.set_field("subject", json!("02"), true).unwrap();
        run.append(other, false).unwrap();
        assert_eq!(run.len(), 2);
    }

    #[test]
    fn test_multiframe_incremental_splits() {
        let single = test_image_3d();
        let promoted = single.promoted_to_4d().unwrap();
        let stacked = promoted.concat_frames(&promoted).unwrap();
        let multi = BidsIncremental::new(stacked, test_metadata(), None).unwrap();
        assert_eq!(multi.image().num_frames(), 2);

        let mut run = BidsRun::new();
        run.append(multi, true).unwrap();
        assert_eq!(run.len(), 2);
        for index in 0..2 {
            let member = run.get(index).unwrap();
            assert_eq!(member.image_dimensions(), vec![4, 4, 3, 1]);
            assert_eq!(member.image_data(), single.data());
        }
    }

    #[test]
    fn test_run_equality() {
        let mut a = BidsRun::new();
        let mut b = BidsRun::new();
        a.append(valid_incremental(), true).unwrap();
        assert_ne!(a, b);
        b.append(valid_incremental(), true).unwrap();
        assert_eq!(a, b);
    }
}
