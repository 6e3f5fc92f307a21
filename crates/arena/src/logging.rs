//! Logging setup: `tracing-subscriber` with an env filter and either
//! human-readable or JSON output.

use crate::config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG`, when set, wins over the
/// configured level.
///
/// # Arguments
///
/// * `config` - Logging configuration from the config file
/// * `json_format` - Whether to force JSON output format (CLI override)
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_target(false),
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

pub fn display_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("╔══════════════════════════════════════════╗");
    info!("║              ⚔️  ARENA SERVER             ║");
    info!("║                 v{:<24}║", version);
    info!("║                                          ║");
    info!("║  Rated matchmaking · Lobbies · Turns     ║");
    info!("╚══════════════════════════════════════════╝");
}
