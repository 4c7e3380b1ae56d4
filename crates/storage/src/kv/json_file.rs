use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use snafu::ResultExt;

use super::{BoxFuture, StateStore, validate_key};
use crate::error::{
    CreateStateDirectorySnafu, ReadStateFileSnafu, RemoveStateFileSnafu, RenameStateFileSnafu,
    StorageError, StorageResult, WriteStateFileSnafu,
};

/// Stores each key as `<directory>/<key>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    directory: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.json"))
    }

    async fn read(&self, key: &str) -> StorageResult<Option<String>> {
        validate_key(key, "json-file-load")?;
        let path = self.path_for(key);

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::ReadStateFile {
                stage: "json-file-read",
                path: display_path(&path),
                source,
            }),
        }
    }

    async fn write(&self, key: &str, value: String) -> StorageResult<()> {
        validate_key(key, "json-file-save")?;

        tokio::fs::create_dir_all(&self.directory)
            .await
            .context(CreateStateDirectorySnafu {
                stage: "json-file-create-directory",
                path: display_path(&self.directory),
            })?;

        // Write-then-rename so a crash never leaves a half-written log behind.
        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, value)
            .await
            .context(WriteStateFileSnafu {
                stage: "json-file-write-temporary",
                path: display_path(&temp_path),
            })?;

        tokio::fs::rename(&temp_path, &path)
            .await
            .context(RenameStateFileSnafu {
                stage: "json-file-rename-temporary",
                from: display_path(&temp_path),
                to: display_path(&path),
            })?;

        tracing::debug!(path = %path.display(), "saved state file");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key, "json-file-remove")?;
        let path = self.path_for(key);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(RemoveStateFileSnafu {
                stage: "json-file-remove",
                path: display_path(&path),
            }),
        }
    }
}

impl StateStore for JsonFileStateStore {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(self.read(key))
    }

    fn save<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.write(key, value))
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.delete(key))
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
