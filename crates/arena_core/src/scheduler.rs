//! Recurring background sweeps and the shutdown state that stops them.
//!
//! Each sweep runs on its own interval task. A tick calls into the [`Arena`]
//! and finishes before the next tick of that sweep is taken; sweeps and
//! command handlers interleave only at the coordinators' lock boundaries.

use crate::arena::Arena;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Shared shutdown state for coordinating graceful shutdown across tasks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownState {
    /// Set once shutdown starts. Sweeps stop taking new ticks.
    shutdown_initiated: Arc<AtomicBool>,
    /// Set once the in-flight work has drained.
    shutdown_complete: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    /// Stops the sweeps and wakes everything waiting on [`Self::wait`].
    pub fn initiate_shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::AcqRel) {
            info!("🛑 Shutdown initiated - sweeps stopping");
        }
        self.notify.notify_waiters();
    }

    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::Release);
        info!("✅ Background work drained - ready for final cleanup");
    }

    /// Resolves once shutdown has been initiated.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown_initiated() {
                return;
            }
            notified.await;
        }
    }
}

/// Spawns and tracks the sweep tasks.
#[derive(Debug)]
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
    shutdown: ShutdownState,
}

impl Scheduler {
    /// Starts every sweep with the intervals from the arena's configuration.
    /// An interval of zero disables that sweep.
    pub fn start(arena: Arc<Arena>, shutdown: ShutdownState) -> Self {
        let config = arena.config().clone();
        let mut scheduler = Self {
            handles: Vec::new(),
            shutdown,
        };

        scheduler.every("queue sweep", config.matchmaking.sweep_interval_secs, &arena, |a| async move {
            let matches = a.sweep_queue().await;
            if matches > 0 {
                debug!("🤝 Queue sweep made {} match(es)", matches);
            }
        });
        scheduler.every("queue expansion", config.matchmaking.expand_interval_secs, &arena, |a| async move {
            a.expand_queue().await;
        });
        scheduler.every("turn deadlines", config.game.deadline_sweep_interval_secs, &arena, |a| async move {
            let expired = a.sweep_deadlines().await;
            if expired > 0 {
                debug!("⏰ {} turn(s) forced forward", expired);
            }
        });
        scheduler.every("invitation expiry", config.invitations.sweep_interval_secs, &arena, |a| async move {
            a.sweep_invitations().await;
        });
        scheduler.every("presence eviction", config.presence.eviction_sweep_interval_secs, &arena, |a| async move {
            a.sweep_presence().await;
        });

        info!("🕒 Scheduler running {} sweep(s)", scheduler.handles.len());
        scheduler
    }

    fn every<F, Fut>(&mut self, name: &'static str, period_secs: u64, arena: &Arc<Arena>, tick: F)
    where
        F: Fn(Arc<Arena>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period_secs == 0 {
            info!("⏸️ {} disabled (interval: 0s)", name);
            return;
        }
        let arena = arena.clone();
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(period_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if shutdown.is_shutdown_initiated() {
                            break;
                        }
                        tick(arena.clone()).await;
                    }
                    _ = shutdown.wait() => break,
                }
            }
            debug!("{} stopped", name);
        }));
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Initiates shutdown and waits for every sweep task to finish.
    pub async fn stop(self) {
        self.shutdown.initiate_shutdown();
        for handle in self.handles {
            let _ = handle.await;
        }
        self.shutdown.complete_shutdown();
    }
}
