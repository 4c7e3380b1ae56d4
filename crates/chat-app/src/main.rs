use std::process::ExitCode;

use parley::settings::SettingsStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let store = SettingsStore::load();
    tracing::info!(config_path = %store.config_path().display(), "loaded settings");

    match parley::app::run(&store).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "parley exited with an error");
            ExitCode::FAILURE
        }
    }
}
