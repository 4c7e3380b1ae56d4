use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_transport::ConnectionConfig;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::{DEFAULT_PAGE_SIZE, SessionConfig};

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3000/api/socket";
pub const DEFAULT_HISTORY_URL: &str = "http://localhost:3000/api/history";
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "PARLEY_";
const MAX_PAGE_SIZE: u32 = 100;

/// Responder persona selected on connect, sent as the `botType` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BotKind {
    #[default]
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "KNOWLEDGE", alias = "knowledge")]
    Knowledge,
    #[serde(rename = "CUSTOMER_SERVICE", alias = "customer_service")]
    CustomerService,
}

impl BotKind {
    pub const ALL: [Self; 5] = [
        Self::Chat,
        Self::Code,
        Self::Assistant,
        Self::Knowledge,
        Self::CustomerService,
    ];

    /// Case-insensitive lookup by query value.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_query_value().eq_ignore_ascii_case(name))
    }

    pub fn as_query_value(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
            Self::Assistant => "assistant",
            Self::Knowledge => "KNOWLEDGE",
            Self::CustomerService => "CUSTOMER_SERVICE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub heartbeat_interval_ms: u64,
    pub watchdog_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            heartbeat_interval_ms: millis(defaults.heartbeat_interval),
            watchdog_interval_ms: millis(defaults.watchdog_interval),
            heartbeat_timeout_ms: millis(defaults.heartbeat_timeout),
            connect_timeout_ms: millis(defaults.connect_timeout),
            reconnect_attempts: defaults.reconnect_attempts,
            reconnect_delay_ms: millis(defaults.reconnect_delay),
        }
    }
}

impl ConnectionSettings {
    fn normalized(self) -> Self {
        let defaults = Self::default();
        let positive = |value: u64, fallback: u64| if value == 0 { fallback } else { value };

        let heartbeat_interval_ms =
            positive(self.heartbeat_interval_ms, defaults.heartbeat_interval_ms);
        let mut heartbeat_timeout_ms =
            positive(self.heartbeat_timeout_ms, defaults.heartbeat_timeout_ms);
        // A timeout shorter than one probe period would close healthy channels.
        if heartbeat_timeout_ms < heartbeat_interval_ms {
            heartbeat_timeout_ms = heartbeat_interval_ms * 2;
        }

        Self {
            heartbeat_interval_ms,
            watchdog_interval_ms: positive(self.watchdog_interval_ms, defaults.watchdog_interval_ms),
            heartbeat_timeout_ms,
            connect_timeout_ms: positive(self.connect_timeout_ms, defaults.connect_timeout_ms),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay_ms: self.reconnect_delay_ms,
        }
    }

    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            watchdog_interval: Duration::from_millis(self.watchdog_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Zero disables the reply timeout.
    pub reply_timeout_ms: u64,
    pub page_size: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            reply_timeout_ms: defaults.reply_timeout.map_or(0, millis),
            page_size: defaults.page_size,
        }
    }
}

impl SessionSettings {
    fn normalized(mut self) -> Self {
        if self.page_size == 0 {
            self.page_size = DEFAULT_PAGE_SIZE;
        }
        self.page_size = self.page_size.min(MAX_PAGE_SIZE);
        self
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            reply_timeout: (self.reply_timeout_ms > 0)
                .then(|| Duration::from_millis(self.reply_timeout_ms)),
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Json,
    Sqlite,
}

/// Where the local turn log lives between runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StateBackend,
    /// Directory for the json backend, database file for sqlite. Empty means the default.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageSettings {
    fn normalized(mut self) -> Self {
        self.path = self
            .path
            .filter(|path| !path.as_os_str().is_empty());
        self
    }

    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }

        let data_dir = dirs::data_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"));
        match self.backend {
            StateBackend::Json => data_dir.join("state"),
            StateBackend::Sqlite => data_dir.join("state.sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_history_url")]
    pub history_url: String,
    #[serde(default)]
    pub bot: BotKind,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            history_url: default_history_url(),
            bot: BotKind::default(),
            connection: ConnectionSettings::default(),
            session: SessionSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.server_url = normalize_url(&self.server_url, DEFAULT_SERVER_URL);
        self.history_url = normalize_url(&self.history_url, DEFAULT_HISTORY_URL);
        self.connection = self.connection.normalized();
        self.session = self.session.normalized();
        self.storage = self.storage.normalized();
        self
    }

    /// Server URL with the selected bot appended as `botType`.
    pub fn websocket_url(&self) -> SettingsResult<String> {
        let mut url = reqwest::Url::parse(&self.server_url).map_err(|error| {
            SettingsError::InvalidUrl {
                stage: "parse-server-url",
                url: self.server_url.clone(),
                details: error.to_string(),
            }
        })?;
        url.query_pairs_mut()
            .append_pair("botType", self.bot.as_query_value());
        Ok(url.to_string())
    }
}

fn normalize_url(value: &str, fallback: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return fallback.to_string();
    }
    if let Err(error) = reqwest::Url::parse(value) {
        tracing::warn!(url = %value, error = %error, "ignoring invalid url setting");
        return fallback.to_string();
    }
    value.to_string()
}

/// Layered settings: defaults, then the JSON file, then `PARLEY_*` environment overrides.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let settings = Self::extract(figment, &config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    /// Reads only the file layer. Environment overrides are ignored.
    pub fn from_file(config_path: PathBuf) -> Self {
        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(&config_path));
        let settings = Self::extract(figment, &config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ClientSettings) -> SettingsResult<()> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn extract(figment: Figment, path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> SettingsResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("invalid url {url:?} on `{stage}`: {details}"))]
    InvalidUrl {
        stage: &'static str,
        url: String,
        details: String,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_history_url() -> String {
    DEFAULT_HISTORY_URL.to_string()
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
