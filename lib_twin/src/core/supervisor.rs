//! Periodic health line for the realtime sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::session_manager::RealtimeSessionManager;

pub struct RealtimeSupervisor {
    manager: Arc<RealtimeSessionManager>,
    interval: Duration,
}

/// Counts reported by one supervisor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorReport {
    pub sessions: usize,
    pub active: usize,
    pub capacity: usize,
    pub paused: usize,
}

impl RealtimeSupervisor {
    pub fn new(manager: Arc<RealtimeSessionManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    pub fn report(&self) -> SupervisorReport {
        let sessions = self.manager.sessions();
        SupervisorReport {
            sessions: sessions.len(),
            active: self.manager.active_sessions(),
            capacity: self.manager.max_active_sessions(),
            paused: sessions.iter().filter(|s| s.paused).count(),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let r = self.report();
                    if r.active > r.capacity {
                        warn!(active = r.active, capacity = r.capacity, "active sessions above capacity");
                    }
                    info!(
                        sessions = r.sessions,
                        active = r.active,
                        capacity = r.capacity,
                        paused = r.paused,
                        "realtime supervisor"
                    );
                }
            }
        }
    }
}
