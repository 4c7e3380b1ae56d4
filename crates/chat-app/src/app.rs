use std::sync::Arc;

use parley_storage::{JsonFileStateStore, SqliteStateStore, StateStore, StorageError};
use parley_transport::{
    ConnectionManager, ConnectionStatus, ReconnectOutcome, WebSocketConnector,
};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::chat::{
    ChatSession, Delivery, IgnoredSend, LoadOutcome, SendOutcome, SessionSnapshot, SessionUpdate,
    TurnView,
};
use crate::history::{HistoryError, HttpHistoryClient};
use crate::settings::{
    BotKind, ClientSettings, SettingsError, SettingsStore, StateBackend, StorageSettings,
};

const HELP: &str = "commands: /more /resend /reconnect /clear /status /bot [name] /quit";

/// Failures that stop the terminal front end before or while it runs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("invalid settings on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to open local state on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to build history client on `{stage}`: {source}"))]
    History {
        stage: &'static str,
        source: HistoryError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    More,
    Resend,
    Reconnect,
    Clear,
    Status,
    /// Shows the selected bot, or selects another one for the next start.
    Bot(Option<String>),
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    /// Returns `None` for blank lines. Anything not starting with `/` is a message.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let Some(input) = trimmed.strip_prefix('/') else {
            return Some(Self::Send(line.to_string()));
        };
        let (name, argument) = input
            .split_once(char::is_whitespace)
            .map_or((input, ""), |(name, argument)| (name, argument.trim()));

        let command = match name.to_ascii_lowercase().as_str() {
            "more" => Self::More,
            "resend" => Self::Resend,
            "reconnect" => Self::Reconnect,
            "clear" => Self::Clear,
            "status" => Self::Status,
            "bot" => Self::Bot(Some(argument.to_string()).filter(|name| !name.is_empty())),
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(trimmed.to_string()),
        };
        Some(command)
    }
}

pub async fn open_state_store(settings: &StorageSettings) -> AppResult<Arc<dyn StateStore>> {
    let path = settings.resolved_path();
    match settings.backend {
        StateBackend::Json => {
            tracing::info!(path = %path.display(), "using json state store");
            Ok(Arc::new(JsonFileStateStore::new(path)))
        }
        StateBackend::Sqlite => {
            let location = path.to_string_lossy();
            let store = SqliteStateStore::open(&location)
                .await
                .context(OpenStoreSnafu {
                    stage: "open-sqlite-store",
                })?;
            tracing::info!(database_url = %store.database_url(), "using sqlite state store");
            Ok(Arc::new(store))
        }
    }
}

/// Persists a new bot selection. Returns `None` when `name` is not a known bot.
pub fn select_bot(store: &SettingsStore, name: &str) -> AppResult<Option<BotKind>> {
    let Some(bot) = BotKind::from_name(name) else {
        return Ok(None);
    };

    let settings = ClientSettings {
        bot,
        ..store.settings().as_ref().clone()
    };
    store.update(settings).context(SettingsSnafu {
        stage: "persist-bot-selection",
    })?;
    tracing::info!(bot = bot.as_query_value(), "bot selection saved");
    Ok(Some(bot))
}

/// Builds the session from settings and drives it from stdin until `/quit` or end of input.
pub async fn run(store: &SettingsStore) -> AppResult<()> {
    let settings = store.settings();
    let url = settings.websocket_url().context(SettingsSnafu {
        stage: "resolve-websocket-url",
    })?;
    let state_store = open_state_store(&settings.storage).await?;
    let history = HttpHistoryClient::new(settings.history_url.clone()).context(HistorySnafu {
        stage: "build-history-client",
    })?;

    let (connection, events) = ConnectionManager::new(
        Arc::new(WebSocketConnector::new(url)),
        settings.connection.to_connection_config(),
    );
    let (session, mut updates) = ChatSession::restore(
        connection,
        events,
        Arc::new(history),
        state_store,
        settings.session.to_session_config(),
    )
    .await;

    let snapshot = session.snapshot();
    for view in &snapshot.turns {
        println!("{}", render_turn(view));
    }
    println!("{HELP}");

    if let Err(error) = session.connect().await {
        tracing::warn!(error = %error, "initial connect failed");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                for line in render_update(&session.snapshot(), &update) {
                    println!("{line}");
                }
            }
            line = lines.next_line() => {
                let line = line.context(ReadInputSnafu { stage: "read-stdin-line" })?;
                let Some(line) = line else { break };
                let Some(command) = Command::parse(&line) else { continue };
                if command == Command::Quit {
                    break;
                }
                execute(&session, store, command).await;
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

async fn execute(session: &ChatSession, store: &SettingsStore, command: Command) {
    match command {
        Command::Send(content) => match session.send_message(&content) {
            Ok(SendOutcome::Sent(_)) => {}
            Ok(SendOutcome::Ignored(IgnoredSend::AwaitingReply)) => {
                println!("still waiting for the previous reply");
            }
            Ok(SendOutcome::Ignored(IgnoredSend::BlankContent)) => {}
            // Already surfaced through the update stream.
            Err(error) => tracing::debug!(error = %error, "send failed"),
        },
        Command::More => match session.load_more().await {
            Ok(LoadOutcome::Skipped) => {
                if session.snapshot().has_more {
                    println!("history is already loading");
                } else {
                    println!("no older history");
                }
            }
            Ok(LoadOutcome::Loaded { .. }) | Ok(LoadOutcome::Stale) => {}
            Err(error) => tracing::debug!(error = %error, "history load failed"),
        },
        Command::Resend => {
            let Some(turn_id) = session.last_failed_turn() else {
                println!("nothing to resend");
                return;
            };
            if let Err(error) = session.resend(&turn_id) {
                tracing::debug!(turn_id = %turn_id, error = %error, "resend failed");
            }
        }
        Command::Reconnect => match session.reconnect().await {
            Ok(ReconnectOutcome::Established) => {}
            Ok(ReconnectOutcome::AlreadyInFlight) => {
                println!("a reconnection attempt is already running");
            }
            Err(error) => tracing::debug!(error = %error, "manual reconnect failed"),
        },
        Command::Clear => session.clear_messages(),
        Command::Status => println!("{}", render_status(&session.snapshot())),
        Command::Bot(None) => println!(
            "bot: {} (available: {})",
            store.settings().bot.as_query_value(),
            bot_names()
        ),
        Command::Bot(Some(name)) => match select_bot(store, &name) {
            Ok(Some(bot)) => println!(
                "bot set to {}; it applies from the next start",
                bot.as_query_value()
            ),
            Ok(None) => println!("unknown bot {name}; available: {}", bot_names()),
            Err(error) => println!("could not save bot selection: {error}"),
        },
        Command::Help => println!("{HELP}"),
        Command::Unknown(input) => println!("unknown command {input}; {HELP}"),
        Command::Quit => {}
    }
}

fn bot_names() -> String {
    BotKind::ALL
        .iter()
        .map(|bot| bot.as_query_value())
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_turn(view: &TurnView) -> String {
    let turn = view.turn();
    let mut line = format!(
        "[{} {}] {}",
        turn.timestamp.format("%H:%M:%S"),
        view.label(),
        turn.content
    );
    if view.actions().resend {
        line.push_str("  (not delivered, /resend)");
    }
    line
}

fn status_label(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Disconnected => "disconnected",
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::Connected => "connected",
        ConnectionStatus::Reconnecting => "reconnecting",
    }
}

fn render_status(snapshot: &SessionSnapshot) -> String {
    let mut line = format!(
        "{} | {} turns | {}",
        status_label(snapshot.status),
        snapshot.turns.len(),
        if snapshot.has_more {
            "older history available"
        } else {
            "history exhausted"
        }
    );
    if snapshot.is_awaiting_reply() {
        line.push_str(" | awaiting reply");
    }
    if let Some(error) = &snapshot.last_error {
        line.push_str(&format!(" | last error: {}", error.message));
    }
    line
}

/// Lines to print for one update, looked up against the snapshot taken after it.
fn render_update(snapshot: &SessionSnapshot, update: &SessionUpdate) -> Vec<String> {
    match update {
        SessionUpdate::TurnAppended { turn_id, .. } => snapshot
            .turns
            .iter()
            .rev()
            .find(|view| view.id() == turn_id)
            .map(render_turn)
            .into_iter()
            .collect(),
        // A terminal cannot insert above its scrollback, so older turns are listed in place.
        SessionUpdate::HistoryPrepended { count, has_more } => {
            let mut lines = vec![format!("-- {count} older turns --")];
            lines.extend(snapshot.turns.iter().take(*count).map(render_turn));
            if !has_more {
                lines.push("-- start of history --".to_string());
            }
            lines
        }
        SessionUpdate::Cleared => vec!["-- transcript cleared --".to_string()],
        SessionUpdate::StatusChanged(status) => vec![format!("-- {} --", status_label(*status))],
        SessionUpdate::PendingChanged {
            awaiting_reply: true,
        } => vec!["...".to_string()],
        SessionUpdate::PendingChanged { .. } => Vec::new(),
        SessionUpdate::DeliveryChanged {
            turn_id,
            delivery: Delivery::Failed,
        } => vec![format!("turn {turn_id} was not delivered; /resend to retry")],
        SessionUpdate::DeliveryChanged { .. } => Vec::new(),
        SessionUpdate::Error(error) => vec![format!("error: {}", error.message)],
    }
}
