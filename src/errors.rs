//! Error types for the bids-stream crate.
//!
//! This module defines a unified error enumeration used across NIfTI codec
//! work, incremental construction, run buffering, and archive queries and
//! mutations. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - `MetadataMismatch` additionally carries the difference map between the
//!   two metadata sets so callers can surface the offending fields.
//! - `exit_code` maps each variant onto the process exit codes a CLI driver
//!   is expected to report.

use thiserror::Error;

use crate::internal::metadata::MetadataDifference;

#[derive(Error, Debug)]
/// Unified error enumeration for the bids-stream library.
///
/// - Used across the NIfTI codec, entity composition, incremental/run
///   construction, and archive reads and writes.
/// - Implements `std::error::Error` via `thiserror`.
pub enum BidsError {
    /// Input violates a construction or append contract.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A required metadata field is absent.
    #[error("Image metadata missing required field(s): {0}")]
    MissingMetadata(String),

    /// A query that promised exactly one result found none.
    #[error("No match found: {0}")]
    NoMatch(String),

    /// A query that promised exactly one result found several.
    #[error("Ambiguous query: {0}")]
    Ambiguous(String),

    /// Operation is invalid for the current object state (e.g. empty archive).
    #[error("Invalid state: {0}")]
    State(String),

    /// Out-of-bounds slice or index.
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    /// Two metadata or entity sets that must agree do not.
    #[error("Metadata mismatch: {message} (difference: {difference})")]
    MetadataMismatch {
        message: String,
        difference: MetadataDifference,
    },

    /// Malformed or unsupported NIfTI byte stream.
    #[error("The `{0}` is not a valid NIfTI-1/2 stream.")]
    InvalidNifti(String),

    /// Failed to encode or decode an incremental wire envelope.
    #[error("Incremental envelope error: {0}")]
    EnvelopeError(String),

    /// I/O error from the underlying filesystem.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Sidecar or dataset-description JSON error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Internal inconsistency that should not occur in a well-formed archive.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl BidsError {
    /// Process exit code a CLI driver reports for this error.
    ///
    /// `0` is success and is never produced here; anything without a
    /// dedicated code maps to `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            BidsError::Validation(_) => 2,
            BidsError::MissingMetadata(_) => 3,
            BidsError::NoMatch(_) => 4,
            BidsError::State(_) => 5,
            BidsError::IndexOutOfBounds(_) => 6,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BidsError;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(BidsError::Validation("x".into()).exit_code(), 2);
        assert_eq!(BidsError::MissingMetadata("x".into()).exit_code(), 3);
        assert_eq!(BidsError::NoMatch("x".into()).exit_code(), 4);
        assert_eq!(BidsError::State("x".into()).exit_code(), 5);
        assert_eq!(BidsError::IndexOutOfBounds("x".into()).exit_code(), 6);
        assert_eq!(BidsError::Runtime("x".into()).exit_code(), 1);
        assert_eq!(BidsError::Ambiguous("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BidsError = io.into();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("gone"));
    }
}
