pub mod state;

pub use state::{
    BotKind, ClientSettings, ConnectionSettings, SessionSettings, SettingsError, SettingsResult,
    SettingsStore, StateBackend, StorageSettings,
};
