//! # Arena Server - Main Entry Point
//!
//! Parses the command line, loads configuration, installs logging and runs
//! the [`app::Application`] until a shutdown signal.
//!
//! ```bash
//! # Run with default configuration (creates config.toml if missing)
//! arena
//!
//! # Custom configuration with overrides
//! arena --config production.toml --bind 0.0.0.0:8080 --log-level debug --json-logs
//! ```

use tracing::error;

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

pub use config::{LoggingSettings, ServerSettings};

/// Runs the server.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Logging comes first so configuration problems are reported through it.
    let mut logging = AppConfig::load_from_file(&args.config_path)
        .await
        .map(|config| config.logging)
        .unwrap_or_default();
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }

    if let Err(e) = logging::setup_logging(&logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn args(config_path: PathBuf) -> CliArgs {
        CliArgs {
            config_path,
            bind_address: Some("127.0.0.1:0".to_string()),
            log_level: Some("debug".to_string()),
            json_logs: false,
        }
    }

    #[tokio::test]
    async fn application_builds_from_a_fresh_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arena.toml");

        let app = Application::new(args(path.clone())).await;
        assert!(app.is_ok());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn invalid_overrides_are_refused() {
        let dir = TempDir::new().unwrap();
        let mut bad = args(dir.path().join("arena.toml"));
        bad.log_level = Some("shouting".to_string());
        assert!(Application::new(bad).await.is_err());

        let mut bad = args(dir.path().join("arena.toml"));
        bad.bind_address = Some("nowhere".to_string());
        assert!(Application::new(bad).await.is_err());
    }
}
