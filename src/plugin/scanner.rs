//! Archive scanner.
//!
//! Lists candidate archives in a plugin directory without opening them.

use std::fs;
use std::path::Path;

use super::{ArchiveRecord, PluginError, PluginResult};

/// List every archive in `directory` whose extension equals `extension`.
///
/// The scan is flat: sub-directories are ignored. Entries that vanish while
/// the directory is being read are skipped. Results are sorted by path.
pub fn scan(directory: &Path, extension: &str) -> PluginResult<Vec<ArchiveRecord>> {
    if !directory.is_dir() {
        return Err(PluginError::NotADirectory(directory.to_path_buf()));
    }

    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PluginError::NotADirectory(directory.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let extension = extension.trim_start_matches('.');
    let mut records = Vec::new();

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();

        if !has_extension(&path, extension) {
            continue;
        }

        // File may have been removed between read_dir and metadata.
        let Ok(metadata) = fs::metadata(&path) else {
            tracing::debug!(archive = %path.display(), "Archive vanished during scan");
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        records.push(ArchiveRecord::new(path, metadata.modified().ok()));
    }

    records.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(records)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}
