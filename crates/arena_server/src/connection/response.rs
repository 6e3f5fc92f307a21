//! Notification fan-out from the arena to client sockets.

use super::ConnectionManager;
use crate::messaging::types::notification_frame;
use arena_core::{EventBus, ShutdownState};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Forwards every [`arena_core::Envelope`] on the event bus to the
/// connections of the players in its audience.
#[derive(Debug, Clone)]
pub struct NotificationRelay {
    connection_manager: Arc<ConnectionManager>,
}

impl NotificationRelay {
    pub fn new(connection_manager: Arc<ConnectionManager>) -> Self {
        Self { connection_manager }
    }

    /// Subscribes to `events` and relays until shutdown or until the bus is
    /// dropped.
    pub fn spawn(self, events: &EventBus, shutdown: ShutdownState) -> JoinHandle<()> {
        let mut receiver = events.subscribe();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    received = receiver.recv() => received,
                    _ = shutdown.wait() => break,
                };
                match envelope {
                    Ok(envelope) => {
                        if envelope.audience.is_empty() {
                            continue;
                        }
                        match notification_frame(&envelope) {
                            Ok(frame) => {
                                self.connection_manager
                                    .send_to_players(&envelope.audience, &frame)
                                    .await;
                            }
                            Err(e) => error!(
                                "Failed to encode {} notification: {}",
                                envelope.notification.name(),
                                e
                            ),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("⚠️ Notification relay lagged, {} notification(s) dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Notification relay stopped");
        })
    }
}
