use super::manifest::SourceFile;
use crate::error::{PieceError, Result};
use std::fs;
use std::path::Path;

/// Walk `root` recursively and list every regular file with its size,
/// sorted by path.
pub fn index_directory(root: &Path) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        return Err(PieceError::InvalidRequest(format!(
            "source directory does not exist: {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(SourceFile {
                    path: entry.path(),
                    size: entry.metadata()?.len(),
                });
            }
        }
    }

    files.sort_by(|left, right| left.path.cmp(&right.path));
    tracing::info!("Indexed {} files under {}", files.len(), root.display());
    Ok(files)
}
