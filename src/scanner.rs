//! Enumerates a store directory into the segment and hint files it contains.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};

const DATA_SUFFIX: &str = ".keychain.data";
const HINT_SUFFIX: &str = ".keychain.hint";

/// The result of scanning a store directory: every data and hint file found,
/// each sorted ascending by segment id.
#[derive(Debug, Default)]
pub struct DirEntries {
    pub data_files: Vec<(u64, PathBuf)>,
    pub hint_files: Vec<(u64, PathBuf)>,
}

/// Enumerates `dir`'s immediate children (no recursion) and partitions them
/// into data/hint files by suffix. Entries whose segment-id prefix doesn't
/// parse as a decimal `u64` are logged and skipped rather than failing the
/// whole scan.
pub fn scan(dir: &Path) -> Result<DirEntries> {
    let metadata = fs::metadata(dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(dir.to_path_buf())
        } else {
            Error::Io(e)
        }
    })?;
    if !metadata.is_dir() {
        return Err(Error::NotADirectory(dir.to_path_buf()));
    }

    let mut entries = DirEntries::default();
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let path = dir_entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if let Some(prefix) = name.strip_suffix(DATA_SUFFIX) {
            match prefix.parse::<u64>() {
                Ok(id) => entries.data_files.push((id, path)),
                Err(_) => warn!(file = name, "ignoring data file with malformed segment id"),
            }
        } else if let Some(prefix) = name.strip_suffix(HINT_SUFFIX) {
            match prefix.parse::<u64>() {
                Ok(id) => entries.hint_files.push((id, path)),
                Err(_) => warn!(file = name, "ignoring hint file with malformed segment id"),
            }
        }
    }

    entries.data_files.sort_unstable_by_key(|(id, _)| *id);
    entries.hint_files.sort_unstable_by_key(|(id, _)| *id);
    Ok(entries)
}
