use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("turn id must not be empty"))]
    EmptyTurnId { stage: &'static str },
    #[snafu(display("state key '{key}' is invalid: {details}"))]
    InvalidStateKey {
        stage: &'static str,
        key: String,
        details: &'static str,
    },
    #[snafu(display("persisted state under '{key}' is malformed: {source}"))]
    MalformedPersistedState {
        stage: &'static str,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to serialize state for '{key}': {source}"))]
    SerializeState {
        stage: &'static str,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create state directory at {path}"))]
    CreateStateDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read state file {path}"))]
    ReadStateFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write state file {path}"))]
    WriteStateFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace state file from {from} to {to}"))]
    RenameStateFile {
        stage: &'static str,
        from: String,
        to: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove state file {path}"))]
    RemoveStateFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
