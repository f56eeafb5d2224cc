//! The `job_success` file. Downstream stages must not read any partition of
//! an output root that lacks it.

use crate::{Error, Result};
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use tracing::debug;
use uuid::Uuid;

pub const MARKER_FILENAME: &str = "job_success";

pub fn marker_path(root: &Path) -> PathBuf {
    root.join(MARKER_FILENAME)
}

pub fn is_complete(root: &Path) -> bool {
    marker_path(root).is_file()
}

/// Writes an empty marker via a temp file and a rename, so readers never
/// see a half-written marker.
pub fn mark_success(root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(root)
        .map_err(|e| Error::io(format!("creating {}", root.display()), e))?;
    let marker = marker_path(root);
    let tmp = root.join(format!(".{MARKER_FILENAME}.{}.tmp", Uuid::new_v4()));

    let written = File::create(&tmp)
        .and_then(|file| file.sync_all())
        .and_then(|_| fs::rename(&tmp, &marker));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(format!("writing {}", marker.display()), e));
    }
    if let Ok(dir) = File::open(root) {
        let _ = dir.sync_all();
    }

    debug!(marker = %marker.display(), "completion marker written");
    Ok(marker)
}

/// Returns whether a marker was removed.
pub fn clear_marker(root: &Path) -> Result<bool> {
    let marker = marker_path(root);
    match fs::remove_file(&marker) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(format!("removing {}", marker.display()), e)),
    }
}
