//! Shared path and I/O utilities: extension classification for BIDS files
//! and the scoped atomic write used by every on-disk mutation.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use tempfile::NamedTempFile;

/// Image file extensions accepted by readers.
pub const IMAGE_EXTENSIONS: [&str; 2] = [".nii", ".nii.gz"];

/// Events file extensions accepted by readers.
pub const EVENTS_EXTENSIONS: [&str; 2] = [".tsv", ".tsv.gz"];

/// Returns true if the provided path points to a NIfTI file, compressed or
/// not.
pub fn is_nifti_path(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    name.ends_with(".nii") || name.ends_with(".nii.gz")
}

/// Returns true if the provided path points to a sidecar JSON file.
pub fn is_json_path(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

/// Returns true if the file name carries a `.gz` suffix.
pub fn is_gzip_path(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

/// The BIDS extension of a file name: everything from the first `.` after
/// the last path segment's stem, so `bold.nii.gz` yields `.nii.gz`.
pub fn bids_extension(file_name: &str) -> Option<&str> {
    file_name.find('.').map(|idx| &file_name[idx..])
}

/// File name with the BIDS extension removed (`sub-01_bold.nii.gz` →
/// `sub-01_bold`).
pub fn bids_stem(file_name: &str) -> &str {
    match file_name.find('.') {
        Some(idx) => &file_name[..idx],
        None => file_name,
    }
}

/// Write `contents` to `target` atomically: temp file in the same directory,
/// fsync, rename over the target. Intermediate directories are created.
///
/// Readers outside the process observe either the old bytes or the new
/// bytes, never a partial file; an abandoned write leaves the target
/// untouched and the temp file is removed on drop.
pub fn atomic_write(target: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target path has no parent"))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}
