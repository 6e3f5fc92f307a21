//! Application lifecycle: builds the arena and server from configuration,
//! runs them alongside the sweep scheduler, and shuts everything down in
//! order on a signal.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    signals::{wait_for_shutdown_signal, wait_for_signal},
};
use arena_core::{Arena, MemoryStorage, Scheduler, ShutdownState, SystemClock};
use arena_server::ArenaServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long the server task gets to close connections after shutdown.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(8);

pub struct Application {
    config: AppConfig,
    arena: Arc<Arena>,
    server: ArenaServer,
}

impl Application {
    /// Loads configuration, applies CLI overrides, validates, and builds the
    /// arena and server.
    ///
    /// # Process
    ///
    /// 1. Load configuration from file (creating default if missing)
    /// 2. Apply command-line argument overrides
    /// 3. Validate merged configuration
    /// 4. Build the arena over in-memory storage and the system clock
    /// 5. Build the WebSocket server around it
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config
            .validate()
            .map_err(|e| format!("Configuration validation failed: {e}"))?;
        info!("✅ Configuration loaded and validated successfully");

        display_banner();

        let arena = Arc::new(Arena::new(
            config.arena.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(SystemClock),
        ));
        let server = ArenaServer::new(config.to_server_config()?, arena.clone());

        Ok(Self {
            config,
            arena,
            server,
        })
    }

    /// Runs until a termination signal arrives or the server fails.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.log_configuration_summary();

        let shutdown = ShutdownState::new();
        let scheduler = Scheduler::start(self.arena.clone(), shutdown.clone());

        let mut server_handle = {
            let server = self.server;
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.start_with_shutdown_state(shutdown).await })
        };

        let monitoring_handle = {
            let arena = self.arena.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.tick().await;
                let mut last_emitted = 0u64;
                loop {
                    interval.tick().await;
                    let emitted = arena.events().emitted_count();
                    info!(
                        "📊 Arena Health - {} online | {} queued | {} active games | {} notifications/min",
                        arena.presence().connected_players().len(),
                        arena.queue().status(None).await.waiting,
                        arena.games().active_count().await,
                        emitted - last_emitted
                    );
                    last_emitted = emitted;
                }
            })
        };

        info!("✅ Arena Server is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let server_failed = tokio::select! {
            signal = wait_for_shutdown_signal(&shutdown) => {
                signal?;
                false
            }
            finished = &mut server_handle => {
                match finished {
                    Ok(Ok(())) => warn!("Server stopped before a shutdown signal"),
                    Ok(Err(e)) => error!("❌ Server error: {}", e),
                    Err(e) => error!("❌ Server task failed: {}", e),
                }
                true
            }
        };

        // A second signal skips the graceful path.
        tokio::spawn(async {
            if wait_for_signal().await.is_ok() {
                warn!("Shutdown signal received again - exiting immediately");
                std::process::exit(1);
            }
        });

        info!("🛑 Beginning graceful shutdown...");
        monitoring_handle.abort();

        info!("⏳ Stopping background sweeps...");
        scheduler.stop().await;

        if !server_failed {
            info!("⏳ Waiting for the server to close connections...");
            match tokio::time::timeout(SERVER_STOP_TIMEOUT, server_handle).await {
                Ok(Ok(Ok(()))) => info!("✅ Server stopped"),
                Ok(Ok(Err(e))) => error!("❌ Server error during shutdown: {}", e),
                Ok(Err(e)) => error!("❌ Server task failed: {}", e),
                Err(_) => warn!("⏰ Server did not stop within {:?}", SERVER_STOP_TIMEOUT),
            }
        }

        Self::log_final_statistics(&self.arena).await;
        info!("✅ Arena Server shutdown complete");

        if server_failed {
            return Err("server stopped unexpectedly".into());
        }
        Ok(())
    }

    fn log_configuration_summary(&self) {
        let arena = &self.config.arena;
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!(
            "  🎯 Match range: ±{} widening {}x per {}s",
            arena.matchmaking.base_range,
            arena.matchmaking.expansion_rate,
            arena.matchmaking.expand_interval_secs
        );
        info!(
            "  🎲 Default ruleset: {} | turn limit {}s",
            arena.game.default_ruleset, arena.game.max_turn_secs
        );
        info!(
            "  🔁 Reconnect window: {}s",
            arena.presence.reconnect_window_secs
        );
    }

    async fn log_final_statistics(arena: &Arena) {
        let queue = arena.queue().status(None).await;
        info!("📊 Final Statistics:");
        info!("  - Matches made: {}", queue.matches_made);
        info!("  - Games still active: {}", arena.games().active_count().await);
        info!("  - Notifications emitted: {}", arena.events().emitted_count());
    }
}
