//! Atomic JSON stores
//!
//! Stores are written to `<path>.tmp`, flushed, then renamed over `<path>`.
//! A reader therefore sees either the previous file or the complete new one,
//! never a partial write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading or saving a store
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
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

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename {from} -> {to}: {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
}

/// Temporary sibling used while writing `path`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Load a JSON store; a missing file is an empty store
pub fn load_json<T>(path: &Path) -> Result<T, PersistError>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let bytes = fs::read(path).map_err(|source| PersistError::Read {
        path: path.display().to_string(),
        source,
    })?;

    serde_json::from_slice(&bytes).map_err(|source| PersistError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Load a JSON store, falling back to an empty one on any error
///
/// Used for caches where a cold start is safe.
pub fn load_json_or_default<T>(path: &Path, what: &str) -> T
where
    T: DeserializeOwned + Default,
{
    match load_json(path) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Couldn't load {}, starting empty: {}", what, e);
            T::default()
        }
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`
pub fn save_json_atomic<T>(path: &Path, value: &T) -> Result<(), PersistError>
where
    T: Serialize + ?Sized,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| PersistError::Write {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Serialize {
        path: path.display().to_string(),
        source,
    })?;

    let tmp = temp_path(path);
    write_synced(&tmp, &bytes).map_err(|source| PersistError::Write {
        path: tmp.display().to_string(),
        source,
    })?;

    fs::rename(&tmp, path).map_err(|source| PersistError::Rename {
        from: tmp.display().to_string(),
        to: path.display().to_string(),
        source,
    })
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
