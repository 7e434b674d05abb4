//! Process-wide configuration for the streaming core.
//! Read once at startup; later writes are rejected so every archive in the
//! process observes the same compatibility-check policy.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Version of the BIDS standard the on-disk layout targets.
pub const BIDS_VERSION: &str = "1.4.1";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StreamConfig {
    /// Treat NIfTI header mismatches in append-compatibility checks as
    /// success, logging the offending field at debug.
    pub disable_nifti_header_check: bool,
    /// Same for sidecar metadata mismatches.
    pub disable_metadata_check: bool,
    /// Overrides the `BIDSVersion` written into dataset descriptions.
    pub bids_version: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            disable_nifti_header_check: false,
            disable_metadata_check: false,
            bids_version: BIDS_VERSION.to_string(),
        }
    }
}

static STREAM_CONFIG: OnceLock<StreamConfig> = OnceLock::new();

/// Install the process-wide configuration. Returns `Err` with the rejected
/// value if a configuration has already been installed.
pub fn set_stream_config(config: StreamConfig) -> Result<(), StreamConfig> {
    STREAM_CONFIG.set(config)
}

/// The active configuration; defaults apply when none was installed.
pub fn stream_config() -> &'static StreamConfig {
    STREAM_CONFIG.get_or_init(StreamConfig::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert!(!config.disable_nifti_header_check);
        assert!(!config.disable_metadata_check);
        assert_eq!(config.bids_version, BIDS_VERSION);
    }

    #[test]
    fn test_config_roundtrip_json() {
        let config = StreamConfig {
            disable_nifti_header_check: true,
            disable_metadata_check: false,
            bids_version: "1.6.0".to_string(),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: StreamConfig = serde_json::from_str(&json).unwrap();
        assert!(back.disable_nifti_header_check);
        assert_eq!(back.bids_version, "1.6.0");
    }
}
