use snafu::ResultExt;

use super::error::{MalformedPersistedStateSnafu, SerializeStateSnafu, StorageResult};
use super::kv::StateStore;
use super::log::MessageLog;
use super::types::Turn;

/// Well-known key the turn log is persisted under.
pub const MESSAGES_KEY: &str = "chat_messages";

pub fn encode_turns(turns: &[Turn]) -> StorageResult<String> {
    serde_json::to_string(turns).context(SerializeStateSnafu {
        stage: "encode-turn-log",
        key: MESSAGES_KEY,
    })
}

pub fn decode_turns(raw: &str) -> StorageResult<Vec<Turn>> {
    serde_json::from_str(raw).context(MalformedPersistedStateSnafu {
        stage: "decode-turn-log",
        key: MESSAGES_KEY,
    })
}

/// Loads the persisted log. Missing or unreadable state yields an empty log.
pub async fn load_message_log(store: &dyn StateStore) -> MessageLog {
    let raw = match store.load(MESSAGES_KEY).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return MessageLog::new(),
        Err(error) => {
            tracing::warn!(error = %error, "failed to read persisted turn log; starting empty");
            return MessageLog::new();
        }
    };

    match decode_turns(&raw) {
        Ok(turns) => {
            let log = MessageLog::from_turns(turns);
            tracing::debug!(turn_count = log.len(), "restored persisted turn log");
            log
        }
        Err(error) => {
            tracing::warn!(error = %error, "discarding malformed persisted turn log");
            MessageLog::new()
        }
    }
}

pub async fn save_message_log(store: &dyn StateStore, turns: &[Turn]) -> StorageResult<()> {
    let encoded = encode_turns(turns)?;
    store.save(MESSAGES_KEY, encoded).await
}

pub async fn clear_message_log(store: &dyn StateStore) -> StorageResult<()> {
    store.remove(MESSAGES_KEY).await
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::ids::TurnId;
    use crate::kv::MemoryStateStore;
    use crate::types::Role;

    #[tokio::test]
    async fn persisted_log_reloads_in_identical_order() {
        let store = MemoryStateStore::new();
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut log = MessageLog::new();
        log.append(Turn::new(TurnId::parse("1").unwrap(), Role::User, "hi", base));
        log.append(Turn::new(
            TurnId::parse("2").unwrap(),
            Role::Assistant,
            "hello",
            base,
        ));
        log.append(Turn::error_marker("responder unavailable", base));

        save_message_log(&store, log.turns()).await.unwrap();
        let restored = load_message_log(&store).await;

        assert_eq!(restored.turns(), log.turns());
    }

    #[tokio::test]
    async fn malformed_state_is_discarded() {
        let store = MemoryStateStore::new();
        store
            .save(MESSAGES_KEY, "{not json".to_string())
            .await
            .unwrap();

        assert!(load_message_log(&store).await.is_empty());
        assert!(decode_turns("{not json").is_err());
    }

    #[tokio::test]
    async fn missing_state_is_empty_and_clear_removes_key() {
        let store = MemoryStateStore::new();
        assert!(load_message_log(&store).await.is_empty());

        save_message_log(&store, &[]).await.unwrap();
        clear_message_log(&store).await.unwrap();
        assert_eq!(store.load(MESSAGES_KEY).await.unwrap(), None);
    }
}
