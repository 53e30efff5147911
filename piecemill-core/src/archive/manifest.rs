use crate::error::{PieceError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// One candidate file of the universe an archive is drawn from.
///
/// Serialized as `{"Path": ..., "Size": ...}`, the format written by the
/// directory indexer; lowercase keys are accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    #[serde(rename = "Path", alias = "path")]
    pub path: PathBuf,
    #[serde(rename = "Size", alias = "size")]
    pub size: u64,
}

/// Manifest entry persisted with a content record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    pub relative_path: String,
}

/// Draw files with replacement until their sizes add up to `target_size`.
///
/// The result may overshoot the target and may contain the same file more
/// than once.
pub fn select_files<R>(
    universe: &[SourceFile],
    target_size: u64,
    rng: &mut R,
) -> Result<Vec<SourceFile>>
where
    R: Rng + ?Sized,
{
    if target_size == 0 {
        return Err(PieceError::InvalidRequest(
            "target archive size must be positive".to_string(),
        ));
    }

    if universe.is_empty() || universe.iter().all(|file| file.size == 0) {
        return Err(PieceError::EmptyUniverse);
    }

    let mut selected = Vec::new();
    let mut total: u64 = 0;
    while total < target_size {
        let choice = &universe[rng.gen_range(0..universe.len())];
        total = total.saturating_add(choice.size);
        selected.push(choice.clone());
    }

    Ok(selected)
}

/// Rewrite selected paths relative to `parent_root`.
pub fn build_manifest(selection: &[SourceFile], parent_root: &Path) -> Result<Vec<ManifestEntry>> {
    selection
        .iter()
        .map(|file| {
            let relative = file.path.strip_prefix(parent_root).map_err(|_| {
                PieceError::InvalidRequest(format!(
                    "{} is not under parent root {}",
                    file.path.display(),
                    parent_root.display()
                ))
            })?;

            let relative_path = normalize_relative_path(relative)?;
            let name = file
                .path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| relative_path.clone());

            Ok(ManifestEntry {
                name,
                size: file.size,
                relative_path,
            })
        })
        .collect()
}

/// Resolve every manifest entry against `parent_root`, failing on the first
/// entry whose file is absent.
pub fn resolve_manifest(manifest: &[ManifestEntry], parent_root: &Path) -> Result<Vec<PathBuf>> {
    manifest
        .iter()
        .map(|entry| {
            let path = parent_root.join(entry.relative_path.trim_start_matches('/'));
            if !path.is_file() {
                return Err(PieceError::MissingSourceFile(path));
            }
            Ok(path)
        })
        .collect()
}

fn normalize_relative_path(relative: &Path) -> Result<String> {
    let mut components = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => components.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => {
                return Err(PieceError::InvalidRequest(format!(
                    "invalid relative path: {}",
                    relative.display()
                )));
            }
        }
    }

    if components.is_empty() {
        return Err(PieceError::InvalidRequest(
            "relative path cannot be empty".to_string(),
        ));
    }

    Ok(components.join("/"))
}
