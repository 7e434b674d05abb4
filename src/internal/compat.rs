//! Append-compatibility predicates.
//!
//! Two pure, non-blocking checks drive every append decision: whether two
//! NIfTI headers may be concatenated along the time axis, and whether two
//! sidecar metadata maps describe the same continuous acquisition. Both
//! fail fast with a human-readable reason naming the first offending field;
//! the process-wide configuration can downgrade either check to a debug log.

use serde_json::Value;
use tracing::debug;

use crate::{
    config::stream_config,
    internal::{
        metadata::MetadataMap,
        nifti::{NiftiHeader, f64_close},
    },
};

/// Sidecar fields that must agree for two images to belong to one series.
pub const MUST_MATCH_METADATA: [&str; 30] = [
    "Modality",
    "MagneticFieldStrength",
    "ImagingFrequency",
    "Manufacturer",
    "ManufacturersModelName",
    "InstitutionName",
    "InstitutionAddress",
    "DeviceSerialNumber",
    "StationName",
    "BodyPartExamined",
    "PatientPosition",
    "EchoTime",
    "ProcedureStepDescription",
    "SoftwareVersions",
    "MRAcquisitionType",
    "SeriesDescription",
    "ProtocolName",
    "ScanningSequence",
    "SequenceVariant",
    "ScanOptions",
    "SequenceName",
    "SpacingBetweenSlices",
    "SliceThickness",
    "ImageType",
    "RepetitionTime",
    "PhaseEncodingDirection",
    "FlipAngle",
    "InPlanePhaseEncodingDirectionDICOM",
    "ImageOrientationPatientDICOM",
    "PartialFourier",
];

/// Sidecar fields that must differ between two appended volumes.
pub const MUST_DIFFER_METADATA: [&str; 2] = ["AcquisitionTime", "AcquisitionNumber"];

fn row_close(a: &[f64; 4], b: &[f64; 4]) -> bool {
    a.iter().zip(b).all(|(x, y)| f64_close(*x, *y))
}

/// Pixel dimensions treat 0 and 1 as equivalent: slots past `dim[0]` are
/// ignored by consumers and a 0 in a meaningful slot means "unset".
fn pixdim_close(a: f64, b: f64) -> bool {
    let norm = |v: f64| if v == 0.0 { 1.0 } else { v };
    f64_close(norm(a), norm(b))
}

/// Decide whether the image described by `a` may be concatenated onto the
/// image described by `b` along the time axis. Returns the first mismatch
/// as a human-readable reason.
///
/// Disabled header checks (`disable_nifti_header_check`) log the reason at
/// debug and report success.
pub fn images_append_compatible(a: &NiftiHeader, b: &NiftiHeader) -> Result<(), String> {
    match header_fields_compatible(a, b).and_then(|_| dimensions_compatible(a, b)) {
        Ok(()) => Ok(()),
        Err(reason) if stream_config().disable_nifti_header_check => {
            debug!("NIfTI header check disabled, ignoring: {reason}");
            Ok(())
        }
        Err(reason) => Err(reason),
    }
}

fn header_fields_compatible(a: &NiftiHeader, b: &NiftiHeader) -> Result<(), String> {
    let fail = |field: &str, left: String, right: String| {
        Err(format!(
            "NIfTI headers don't match on field: {field} (v1: {left}, v2: {right})"
        ))
    };

    let scalar_checks: [(&str, f64, f64); 12] = [
        ("intent_p1", a.intent_p1, b.intent_p1),
        ("intent_p2", a.intent_p2, b.intent_p2),
        ("intent_p3", a.intent_p3, b.intent_p3),
        ("slice_duration", a.slice_duration, b.slice_duration),
        ("toffset", a.toffset, b.toffset),
        ("scl_slope", a.scl_slope, b.scl_slope),
        ("scl_inter", a.scl_inter, b.scl_inter),
        ("quatern_b", a.quatern_b, b.quatern_b),
        ("quatern_c", a.quatern_c, b.quatern_c),
        ("quatern_d", a.quatern_d, b.quatern_d),
        ("qoffset_x", a.qoffset_x, b.qoffset_x),
        ("qoffset_y", a.qoffset_y, b.qoffset_y),
    ];
    for (field, left, right) in scalar_checks {
        if !f64_close(left, right) {
            return fail(field, left.to_string(), right.to_string());
        }
    }
    if !f64_close(a.qoffset_z, b.qoffset_z) {
        return fail("qoffset_z", a.qoffset_z.to_string(), b.qoffset_z.to_string());
    }

    if a.intent_code != b.intent_code {
        return fail("intent_code", a.intent_code.to_string(), b.intent_code.to_string());
    }
    if a.dim_info != b.dim_info {
        return fail("dim_info", a.dim_info.to_string(), b.dim_info.to_string());
    }
    if a.datatype != b.datatype {
        return fail(
            "datatype",
            a.datatype.code().to_string(),
            b.datatype.code().to_string(),
        );
    }
    if a.bitpix != b.bitpix {
        return fail("bitpix", a.bitpix.to_string(), b.bitpix.to_string());
    }
    if a.xyzt_units != b.xyzt_units {
        return fail("xyzt_units", a.xyzt_units.to_string(), b.xyzt_units.to_string());
    }
    if a.qform_code != b.qform_code {
        return fail("qform_code", a.qform_code.to_string(), b.qform_code.to_string());
    }
    if a.sform_code != b.sform_code {
        return fail("sform_code", a.sform_code.to_string(), b.sform_code.to_string());
    }
    for (field, left, right) in [
        ("srow_x", &a.srow_x, &b.srow_x),
        ("srow_y", &a.srow_y, &b.srow_y),
        ("srow_z", &a.srow_z, &b.srow_z),
    ] {
        if !row_close(left, right) {
            return fail(field, format!("{left:?}"), format!("{right:?}"));
        }
    }
    Ok(())
}

fn dimensions_compatible(a: &NiftiHeader, b: &NiftiHeader) -> Result<(), String> {
    let n_a = a.ndim();
    let n_b = b.ndim();

    if n_a == n_b {
        for axis in 1..=n_a {
            if !pixdim_close(a.pixdim[axis], b.pixdim[axis]) {
                return Err(format!(
                    "NIfTI pixel dimensions don't match on axis {axis} \
                     (v1: {}, v2: {})",
                    a.pixdim[axis], b.pixdim[axis]
                ));
            }
        }
        for axis in 1..n_a {
            if a.dim[axis] != b.dim[axis] {
                return Err(format!(
                    "NIfTI image dimensions don't match on axis {axis} \
                     (v1: {}, v2: {})",
                    a.dim[axis], b.dim[axis]
                ));
            }
        }
        return Ok(());
    }

    if n_a.abs_diff(n_b) == 1 {
        let shared = n_a.min(n_b);
        for axis in 1..=shared {
            if a.dim[axis] != b.dim[axis] {
                return Err(format!(
                    "NIfTI shared-prefix dimensions don't match on axis {axis} \
                     (v1: {}, v2: {})",
                    a.dim[axis], b.dim[axis]
                ));
            }
            if !pixdim_close(a.pixdim[axis], b.pixdim[axis]) {
                return Err(format!(
                    "NIfTI shared-prefix pixel dimensions don't match on axis {axis} \
                     (v1: {}, v2: {})",
                    a.pixdim[axis], b.pixdim[axis]
                ));
            }
        }
        return Ok(());
    }

    Err(format!(
        "NIfTI dimension counts are irreconcilable (v1: {n_a}-D, v2: {n_b}-D)"
    ))
}

/// JSON scalar equality with numeric widening, so a scanner export holding
/// `"1500"` matches a sidecar holding `1500`.
fn values_agree(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    let as_f64 = |v: &Value| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    matches!((as_f64(a), as_f64(b)), (Some(x), Some(y)) if x == y)
}

/// Decide whether two sidecar metadata maps may describe consecutive
/// volumes of one series. Keys present in only one map are ignored.
///
/// Disabled metadata checks (`disable_metadata_check`) log the reason at
/// debug and report success.
pub fn metadata_append_compatible(a: &MetadataMap, b: &MetadataMap) -> Result<(), String> {
    match metadata_fields_compatible(a, b) {
        Ok(()) => Ok(()),
        Err(reason) if stream_config().disable_metadata_check => {
            debug!("metadata check disabled, ignoring: {reason}");
            Ok(())
        }
        Err(reason) => Err(reason),
    }
}

fn metadata_fields_compatible(a: &MetadataMap, b: &MetadataMap) -> Result<(), String> {
    for field in MUST_MATCH_METADATA {
        let (Some(left), Some(right)) = (a.get(field), b.get(field)) else {
            continue;
        };
        if !values_agree(left, right) {
            return Err(format!(
                "metadata doesn't match on field: {field} (v1: {left}, v2: {right})"
            ));
        }
    }
    for field in MUST_DIFFER_METADATA {
        let (Some(left), Some(right)) = (a.get(field), b.get(field)) else {
            continue;
        };
        if values_agree(left, right) {
            return Err(format!(
                "metadata matches (shouldn't) on field: {field} (v1: {left}, v2: {right})"
            ));
        }
    }
    Ok(())
}
