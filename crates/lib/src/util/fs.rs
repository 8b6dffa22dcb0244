//! Atomic JSON file helpers shared by the on-disk stores.

use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors from reading or writing a JSON document.
#[derive(Debug, thiserror::Error)]
pub enum JsonFileError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize {path}: {source}")]
  Serialize {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Load a JSON document, returning `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, JsonFileError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(source) => {
      return Err(JsonFileError::Read {
        path: path.display().to_string(),
        source,
      });
    }
  };

  serde_json::from_str(&content)
    .map(Some)
    .map_err(|source| JsonFileError::Parse {
      path: path.display().to_string(),
      source,
    })
}

/// Write a JSON document atomically: write to a sibling temp file, then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), JsonFileError> {
  let write_err = |source| JsonFileError::Write {
    path: path.display().to_string(),
    source,
  };

  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(write_err)?;
  }

  let content = serde_json::to_string_pretty(value).map_err(|source| JsonFileError::Serialize {
    path: path.display().to_string(),
    source,
  })?;

  let mut temp_name = path.as_os_str().to_owned();
  temp_name.push(".tmp");
  let temp_path = Path::new(&temp_name);

  fs::write(temp_path, &content).map_err(write_err)?;
  fs::rename(temp_path, path).map_err(write_err)?;
  Ok(())
}

/// Create a JSON document only if no file exists at `path`.
///
/// Returns `Ok(false)` without touching the file when it already exists.
pub fn create_json_exclusive<T: Serialize>(path: &Path, value: &T) -> Result<bool, JsonFileError> {
  use std::io::Write;

  let write_err = |source| JsonFileError::Write {
    path: path.display().to_string(),
    source,
  };

  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(write_err)?;
  }

  let content = serde_json::to_string_pretty(value).map_err(|source| JsonFileError::Serialize {
    path: path.display().to_string(),
    source,
  })?;

  let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
    Ok(file) => file,
    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
    Err(source) => return Err(write_err(source)),
  };

  file.write_all(content.as_bytes()).map_err(write_err)?;
  file.sync_all().map_err(write_err)?;
  Ok(true)
}
