use crate::{Error, Result};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.') || name.starts_with('_'))
        .unwrap_or(false)
}

/// Every regular file under `root`, sorted. Names starting with `.` or `_`
/// (`_SUCCESS`, `.crc` sidecars) are skipped.
pub fn path_set(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(Error::Config(format!(
            "input root {} does not exist",
            root.display()
        )));
    }

    let mut paths = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
    for entry in walker {
        let entry =
            entry.map_err(|e| Error::io(format!("listing {}", root.display()), e.into()))?;
        if entry.file_type().is_file() {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    Ok(paths)
}
