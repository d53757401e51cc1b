use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::constants::GCODE_EXTENSION;

/// Replaces `path` with `contents` by writing a sibling temporary file and
/// renaming it over the target. Missing parent directories are created.
pub fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }

    let mut file = NamedTempFile::new_in(&dir)?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Output path suggested for a model: same directory, file name cut at its
/// first `.`, with the G-code extension.
pub fn default_output_path(source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match name.split('.').next() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => name.trim_start_matches('.').to_string(),
    };
    let file_name = format!("{}.{}", stem, GCODE_EXTENSION);
    match source.parent() {
        Some(parent) => parent.join(file_name),
        None => PathBuf::from(file_name),
    }
}
