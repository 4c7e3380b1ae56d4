use std::future::Future;
use std::pin::Pin;

use snafu::ensure;

use super::error::{InvalidStateKeySnafu, StorageResult};

mod json_file;
mod memory;
mod sqlite;

pub use json_file::JsonFileStateStore;
pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Key-value substrate for small pieces of client-local state.
pub trait StateStore: Send + Sync {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>>;
    fn save<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>>;
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>>;
}

/// Keys double as file names, so they are restricted to a portable character set.
pub(crate) fn validate_key(key: &str, stage: &'static str) -> StorageResult<()> {
    ensure!(
        !key.is_empty(),
        InvalidStateKeySnafu {
            stage,
            key,
            details: "key is empty",
        }
    );
    ensure!(
        key.chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '_' | '-')),
        InvalidStateKeySnafu {
            stage,
            key,
            details: "only ASCII letters, digits, '_' and '-' are allowed",
        }
    );
    Ok(())
}
