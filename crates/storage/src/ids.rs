use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ensure;
use uuid::Uuid;

use super::error::{EmptyTurnIdSnafu, StorageError, StorageResult};

/// Opaque turn identifier.
///
/// Locally minted ids are UUIDv7 strings, so they sort by creation time. Ids received from
/// the responder or the history endpoint are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TurnId(String);

impl TurnId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let trimmed = raw.trim();
        ensure!(
            !trimmed.is_empty(),
            EmptyTurnIdSnafu {
                stage: "parse-turn-id",
            }
        );
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for TurnId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for TurnId {
    type Error = StorageError;

    fn try_from(raw: String) -> StorageResult<Self> {
        Self::parse(&raw)
    }
}

impl From<TurnId> for String {
    fn from(value: TurnId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let first = TurnId::generate();
        let second = TurnId::generate();

        assert_ne!(first, second);
    }

    #[test]
    fn parse_rejects_blank_ids() {
        assert!(TurnId::parse("   ").is_err());
        assert_eq!(TurnId::parse(" 1700000000000 ").unwrap().as_str(), "1700000000000");
    }

    #[test]
    fn wire_ids_go_through_parse() {
        assert!(serde_json::from_str::<TurnId>(r#""  ""#).is_err());

        let id: TurnId = serde_json::from_str(r#""42""#).unwrap();
        assert_eq!(id.as_str(), "42");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""42""#);
    }
}
