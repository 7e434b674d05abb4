//! End-to-end streaming tests: build incrementals from synthetic volumes,
//! stream them into on-disk archives, and read them back through the query
//! and extraction APIs.

use std::sync::Once;

use bytes::Bytes;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::json;

use bids_stream::{
    errors::BidsError,
    internal::{
        archive::BidsArchive,
        incremental::BidsIncremental,
        metadata::MetadataMap,
        nifti::{DataType, NiftiHeader, NiftiImage},
        run::BidsRun,
    },
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

const SHAPE: [i64; 3] = [8, 8, 6];

fn random_volume(seed: u64) -> NiftiImage {
    let mut header = NiftiHeader::for_shape(&SHAPE, DataType::Int16).unwrap();
    // spacings chosen exactly representable in the NIfTI-1 f32 fields
    header.pixdim[1] = 3.0;
    header.pixdim[2] = 3.0;
    header.pixdim[3] = 3.5;
    header.srow_x = [3.0, 0.0, 0.0, -96.0];
    header.srow_y = [0.0, 3.0, 0.0, -96.0];
    header.srow_z = [0.0, 0.0, 3.5, -60.0];

    let mut rng = StdRng::seed_from_u64(seed);
    let voxels = header.total_voxels();
    let mut data = Vec::with_capacity(voxels * 2);
    for _ in 0..voxels {
        data.extend_from_slice(&rng.r#gen::<i16>().to_le_bytes());
    }
    NiftiImage::new(header, Bytes::from(data)).unwrap()
}

fn scanner_metadata() -> MetadataMap {
    [
        ("subject", json!("01")),
        ("task", json!("faces")),
        ("suffix", json!("bold")),
        ("run", json!("01")),
        ("RepetitionTime", json!(1500)),
        ("EchoTime", json!(500)),
        ("Manufacturer", json!("Siemens")),
        ("MagneticFieldStrength", json!(3)),
        ("FlipAngle", json!(77)),
        ("PhaseEncodingDirection", json!("j-")),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn incremental(seed: u64, acquisition_time: f64) -> BidsIncremental {
    let mut metadata = scanner_metadata();
    metadata.insert("AcquisitionTime".to_string(), json!(acquisition_time));
    BidsIncremental::new(random_volume(seed), metadata, None).unwrap()
}

/// Volume without an acquisition clock; frames read back from one archive
/// file share a sidecar, so re-streaming them must not trip the
/// must-differ rule.
fn clockless_incremental(seed: u64) -> BidsIncremental {
    BidsIncremental::new(random_volume(seed), scanner_metadata(), None).unwrap()
}

#[test]
fn streamed_incremental_survives_transport_and_archive() {
    init_tracing();
    let producer_side = incremental(7, 1.5);

    // producer -> consumer transport
    let wire = producer_side.serialize().unwrap();
    let consumer_side = BidsIncremental::deserialize(&wire).unwrap();
    assert_eq!(consumer_side, producer_side);

    // consumer -> archive -> analysis
    let root = tempfile::tempdir().unwrap();
    let mut archive = BidsArchive::open(root.path()).unwrap();
    assert!(archive.append_incremental(&consumer_side, true).unwrap());

    let restored = archive
        .get_incremental(0, &consumer_side.entities())
        .unwrap();
    assert_eq!(restored, producer_side);
}

#[test]
fn successive_appends_extend_one_series() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let mut archive = BidsArchive::open(root.path()).unwrap();

    let volumes: Vec<BidsIncremental> = (0..5)
        .map(|i| incremental(100 + i as u64, 1.5 * (i + 1) as f64))
        .collect();
    for volume in &volumes {
        archive.append_incremental(volume, true).unwrap();
    }

    let entities = volumes[0].entities();
    let images = archive.get_images(&entities, false).unwrap();
    assert_eq!(images.len(), 1);

    let image = archive.read_image(images[0].rel_path()).unwrap();
    assert_eq!(image.num_frames(), 5);
    for (index, volume) in volumes.iter().enumerate() {
        assert_eq!(
            image.frame_bytes(index).unwrap(),
            volume.image_data().clone(),
            "frame {index} must equal append {index}"
        );
    }
}

#[test]
fn appending_new_subject_grows_subject_list() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let mut archive = BidsArchive::open(root.path()).unwrap();

    archive.append_incremental(&incremental(1, 1.5), true).unwrap();
    let before = archive.get_subjects().unwrap();

    let mut newcomer = incremental(2, 1.5);
    newcomer.set_field("subject", json!("02"), true).unwrap();
    archive.append_incremental(&newcomer, true).unwrap();

    let after = archive.get_subjects().unwrap();
    assert_eq!(after.len(), before.len() + 1);
    assert!(root.path().join("sub-02/func").is_dir());

    let restored = archive.get_incremental(0, &newcomer.entities()).unwrap();
    assert_eq!(restored, newcomer);
}

#[test]
fn whole_run_streams_between_archives() {
    init_tracing();
    let source_root = tempfile::tempdir().unwrap();
    let mut source = BidsArchive::open(source_root.path()).unwrap();
    for i in 0..4 {
        source
            .append_incremental(&clockless_incremental(200 + i), true)
            .unwrap();
    }

    let entities = clockless_incremental(0).entities();
    let run = source.get_run(&entities).unwrap();
    assert_eq!(run.len(), 4);

    // serialize every incremental, stream it, rebuild a fresh archive
    let target_root = tempfile::tempdir().unwrap();
    let mut target =
        BidsArchive::open(target_root.path()).unwrap();
    for index in 0..run.len() {
        let wire = run.get(index).unwrap().serialize().unwrap();
        let received = BidsIncremental::deserialize(&wire).unwrap();
        target.append_incremental(&received, true).unwrap();
    }

    let source_run = source.get_run(&entities).unwrap();
    let target_run = target.get_run(&entities).unwrap();
    assert_eq!(source_run, target_run);
}

#[test]
fn consumer_run_buffer_validates_the_stream() {
    init_tracing();
    let mut buffer = BidsRun::new();
    for i in 0..3 {
        buffer
            .append(incremental(300 + i, 1.5 * (i + 1) as f64), true)
            .unwrap();
    }
    assert_eq!(buffer.len(), 3);

    // a stray volume from another subject must be rejected with a diff
    let mut stray = incremental(999, 9.0);
    stray.set_field("subject", json!("05"), true).unwrap();
    match buffer.append(stray, true).unwrap_err() {
        BidsError::MetadataMismatch { difference, .. } => {
            assert!(difference.keys().any(|k| k == "subject"));
        }
        other => panic!("expected MetadataMismatch, got {other:?}"),
    }

    // buffered run persists as one 4-D series
    let root = tempfile::tempdir().unwrap();
    let mut archive = BidsArchive::open(root.path()).unwrap();
    archive.append_run(&buffer).unwrap();

    let image = archive
        .read_image("sub-01/func/sub-01_task-faces_run-1_bold.nii")
        .unwrap();
    assert_eq!(image.num_frames(), 3);
}

#[test]
fn sidecar_and_events_files_accompany_every_image() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let mut archive = BidsArchive::open(root.path()).unwrap();
    archive.append_incremental(&incremental(42, 1.5), true).unwrap();

    let func = root.path().join("sub-01/func");
    assert!(func.join("sub-01_task-faces_run-1_bold.nii").is_file());
    assert!(func.join("sub-01_task-faces_run-1_bold.json").is_file());
    assert!(func.join("sub-01_task-faces_run-1_events.tsv").is_file());

    let events =
        std::fs::read_to_string(func.join("sub-01_task-faces_run-1_events.tsv")).unwrap();
    assert!(events.starts_with("onset\tduration\tresponse_time\n"));

    let metadata = archive
        .get_metadata("sub-01/func/sub-01_task-faces_run-1_bold.nii", true)
        .unwrap();
    assert_eq!(metadata.get_f64("RepetitionTime").unwrap(), 1.5);
    assert_eq!(metadata.get_str("subject").unwrap(), "01");
    assert_eq!(metadata.get_str("Manufacturer").unwrap(), "Siemens");
}

#[test]
fn acquisition_clock_must_advance_within_one_series() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let mut archive = BidsArchive::open(root.path()).unwrap();

    archive.append_incremental(&incremental(1, 1.5), true).unwrap();
    // identical AcquisitionTime: the must-differ rule rejects the append
    let err = archive
        .append_incremental(&incremental(2, 1.5), true)
        .unwrap_err();
    assert!(matches!(err, BidsError::Validation(_)));
}
