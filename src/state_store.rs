//! Durable lifecycle state persistence.
//!
//! The only field that survives a controller restart is the task ARN;
//! status and addressing are always re-read live from the control plane.
//! The [`StateStore`] trait lets a host supply its own store (a hub
//! database, for instance); [`FileStateStore`] keeps the projection in a
//! TOML file on local disk.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Durable projection of a spawner's lifecycle state.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SpawnerState {
    /// Opaque identifier of the launched task; empty when no task exists.
    pub task_arn: String,
}

impl SpawnerState {
    /// Wraps a task identifier.
    #[must_use]
    pub fn new(task_arn: impl Into<String>) -> Self {
        Self {
            task_arn: task_arn.into(),
        }
    }
}

/// Errors raised by state stores.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when persisted state cannot be parsed.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Abstraction over durable stores for dependency injection.
pub trait StateStore {
    /// Loads the saved state, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the store cannot be read or parsed.
    fn load(&self) -> Result<Option<SpawnerState>, StateStoreError>;

    /// Saves the state, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the store cannot be written.
    fn save(&self, state: &SpawnerState) -> Result<(), StateStoreError>;

    /// Removes the saved state. Removing absent state is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the store cannot be modified.
    fn clear(&self) -> Result<(), StateStoreError>;
}

/// TOML-file store keeping the projection on local disk.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    path: Utf8PathBuf,
}

impl FileStateStore {
    /// Creates a store backed by the given file path.
    #[must_use]
    pub const fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    fn split(&self) -> Result<(&Utf8Path, &str), StateStoreError> {
        let parent = self.path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| StateStoreError::Io {
                path: self.path.clone(),
                message: String::from("state file path is missing a filename"),
            })?;
        Ok((parent, file_name))
    }

    fn io_error(&self, err: &io::Error) -> StateStoreError {
        StateStoreError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<SpawnerState>, StateStoreError> {
        let (parent, file_name) = self.split()?;
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(&err)),
        };
        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(&err)),
        };
        toml::from_str(&contents)
            .map(Some)
            .map_err(|err| StateStoreError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }

    fn save(&self, state: &SpawnerState) -> Result<(), StateStoreError> {
        let (parent, file_name) = self.split()?;
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| self.io_error(&err))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| self.io_error(&err))?;
        let rendered = toml::to_string_pretty(state).map_err(|err| StateStoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        dir.write(file_name, rendered)
            .map_err(|err| self.io_error(&err))
    }

    fn clear(&self) -> Result<(), StateStoreError> {
        let (parent, file_name) = self.split()?;
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(self.io_error(&err)),
        };
        match dir.remove_file(file_name) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(&err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn temp_state_path(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join("spawner-state.toml"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()))
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = FileStateStore::new(temp_state_path(&tmp));
        let state = SpawnerState::new("arn:aws:ecs:task/abc123");

        store
            .save(&state)
            .unwrap_or_else(|err| panic!("save state: {err}"));
        let loaded = store
            .load()
            .unwrap_or_else(|err| panic!("load state: {err}"));

        assert_eq!(loaded, Some(state));
    }

    #[test]
    fn loading_absent_state_yields_none() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = FileStateStore::new(temp_state_path(&tmp));
        let loaded = store
            .load()
            .unwrap_or_else(|err| panic!("load state: {err}"));
        assert_eq!(loaded, None);
    }

    #[test]
    fn save_replaces_the_previous_value() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = FileStateStore::new(temp_state_path(&tmp));

        store
            .save(&SpawnerState::new("arn:first"))
            .unwrap_or_else(|err| panic!("seed state: {err}"));
        store
            .save(&SpawnerState::new("arn:second"))
            .unwrap_or_else(|err| panic!("overwrite state: {err}"));

        let loaded = store
            .load()
            .unwrap_or_else(|err| panic!("load state: {err}"));
        assert_eq!(loaded, Some(SpawnerState::new("arn:second")));
    }

    #[test]
    fn clear_removes_state_and_is_idempotent() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = FileStateStore::new(temp_state_path(&tmp));

        store
            .save(&SpawnerState::new("arn:doomed"))
            .unwrap_or_else(|err| panic!("seed state: {err}"));
        store.clear().unwrap_or_else(|err| panic!("clear: {err}"));
        store
            .clear()
            .unwrap_or_else(|err| panic!("second clear: {err}"));

        let loaded = store
            .load()
            .unwrap_or_else(|err| panic!("load state: {err}"));
        assert_eq!(loaded, None);
    }
}
