//! Deterministic packing of a source tree into artifact bytes.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use super::BuildBackend;
use crate::artifact::SourceRef;

/// Packs every regular file under a directory, sorted by relative path.
///
/// The output only depends on file paths and contents, so rebuilding the same
/// tree always yields the same digest.
#[derive(Debug, Clone)]
pub struct DirectoryBuilder {
  default_root: Option<PathBuf>,
}

impl DirectoryBuilder {
  /// Build from the directory carried by each `SourceRef`.
  pub fn new() -> Self {
    Self { default_root: None }
  }

  /// Build from `root` when a `SourceRef` carries no path.
  pub fn with_root(root: impl Into<PathBuf>) -> Self {
    Self {
      default_root: Some(root.into()),
    }
  }

  fn pack(root: &Path) -> Result<Vec<u8>, String> {
    if !root.is_dir() {
      return Err(format!("source directory {} does not exist", root.display()));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
      .sort_by_file_name()
      .into_iter()
      .filter_entry(|entry| entry.file_name() != ".git");
    for entry in walker {
      let entry = entry.map_err(|e| format!("failed to walk {}: {}", root.display(), e))?;
      if !entry.file_type().is_file() {
        continue;
      }
      let relative = entry
        .path()
        .strip_prefix(root)
        .map_err(|e| format!("failed to relativize {}: {}", entry.path().display(), e))?;
      let name = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
      files.push((name, entry.path().to_path_buf()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    for (name, path) in files {
      let content = fs::read(&path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
      out.extend_from_slice(format!("F {} {}\n", name, content.len()).as_bytes());
      out.extend_from_slice(&content);
    }
    Ok(out)
  }
}

impl Default for DirectoryBuilder {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl BuildBackend for DirectoryBuilder {
  async fn build(&self, source: &SourceRef) -> Result<Vec<u8>, String> {
    let root = source
      .path
      .clone()
      .or_else(|| self.default_root.clone())
      .ok_or_else(|| format!("revision {} has no source directory", source.revision))?;

    tokio::task::spawn_blocking(move || Self::pack(&root))
      .await
      .map_err(|e| format!("build task failed: {}", e))?
  }
}
