pub mod error;
pub mod ids;
pub mod kv;
pub mod log;
pub mod persist;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::TurnId;
pub use kv::{BoxFuture, JsonFileStateStore, MemoryStateStore, SqliteStateStore, StateStore};
pub use log::{MergeReport, MessageLog};
pub use persist::{
    MESSAGES_KEY, clear_message_log, decode_turns, encode_turns, load_message_log,
    save_message_log,
};
pub use types::{Role, Turn};
