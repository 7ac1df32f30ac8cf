//! # Realtime Session Manager
//!
//! Owns one polling session per watched device and keeps at most
//! `max_active_sessions` of them live at once.
//!
//! ## Lifecycle
//!
//! - `subscribe` bumps the session's reference count (creating the session on
//!   first use) and makes sure exactly one polling task runs for the device.
//! - `unsubscribe` drops the count. Reaching zero cancels the task; calls
//!   beyond zero are clamped and additionally mark the shadow not-live.
//!
//! ## Polling loop
//!
//! Each iteration (re)starts the upstream session when it is not live or is
//! about to expire, then fetches a snapshot, merges it into the shadow and
//! publishes the resulting diff. Every upstream call is gated by the rate
//! governor. 429s back off, 404/410 drop back to the start branch, and a run
//! of failed starts degrades the session for a cool-down period.
//!
//! ## Admission
//!
//! Going live happens inside one mutex shared by all devices. When the live
//! population is at capacity, the least recently touched live session (never
//! the requester) is paused for `eviction_cooldown` and its shadow is flagged
//! not-live. The mutex is never held across an `.await`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configs::config_twin::RealtimeOptions;
use crate::core::event_bus::ShadowEventBus;
use crate::core::rate_governor::{RateBucket, RateGovernor};
use crate::core::reconciler::{compute_diff, from_meta, live_patch, merge_realtime};
use crate::core::upstream::UpstreamApi;
use crate::error::{validate_device_id, StoreError, TwinError};
use crate::model::{DeviceMeta, DiffPatch, RawPoll, Shadow};
use crate::store::ShadowGateway;

#[derive(Default)]
struct SessionStats {
    expires_in_secs: Option<i64>,
    message_count: Option<i64>,
    last_start_at: Option<DateTime<Utc>>,
    paused_until: Option<Instant>,
}

/// In-memory record of one device's polling activity.
struct Session {
    device_id: String,
    subscribers: AtomicI64,
    loop_running: AtomicBool,
    live: AtomicBool,
    /// Admission order; the smallest value is the eviction candidate.
    last_touched: AtomicU64,
    cancel: Mutex<CancellationToken>,
    stats: Mutex<SessionStats>,
}

impl Session {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            subscribers: AtomicI64::new(0),
            loop_running: AtomicBool::new(false),
            live: AtomicBool::new(false),
            last_touched: AtomicU64::new(0),
            cancel: Mutex::new(CancellationToken::new()),
            stats: Mutex::new(SessionStats::default()),
        }
    }

    fn subscribers(&self) -> i64 {
        self.subscribers.load(Ordering::SeqCst)
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Releasing a slot is always safe; claiming one goes through `admit`.
    fn release(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }

    fn expires_in(&self) -> Option<i64> {
        self.stats.lock().expires_in_secs
    }

    fn pause_remaining(&self) -> Option<Duration> {
        let mut stats = self.stats.lock();
        let until = stats.paused_until?;
        let now = Instant::now();
        if now >= until {
            stats.paused_until = None;
            return None;
        }
        Some(until - now)
    }

    /// Hands out the loop's token, replacing it if a previous loop cancelled it.
    fn fresh_token(&self) -> CancellationToken {
        let mut token = self.cancel.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn cancel_loop(&self) {
        self.cancel.lock().cancel();
    }

    fn snapshot(&self) -> SessionSnapshot {
        let stats = self.stats.lock();
        SessionSnapshot {
            device_id: self.device_id.clone(),
            subscribers: self.subscribers(),
            live: self.is_live(),
            loop_running: self.loop_running.load(Ordering::SeqCst),
            paused: stats.paused_until.is_some_and(|at| Instant::now() < at),
            expires_in_secs: stats.expires_in_secs,
            message_count: stats.message_count,
            last_start_at: stats.last_start_at,
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub device_id: String,
    pub subscribers: i64,
    pub live: bool,
    pub loop_running: bool,
    pub paused: bool,
    pub expires_in_secs: Option<i64>,
    pub message_count: Option<i64>,
    pub last_start_at: Option<DateTime<Utc>>,
}

enum Admission {
    Admitted { victim: Option<Arc<Session>> },
    Full,
}

pub struct RealtimeSessionManager {
    upstream: Arc<dyn UpstreamApi>,
    gateway: ShadowGateway,
    governor: Arc<RateGovernor>,
    bus: Arc<ShadowEventBus>,
    options: RealtimeOptions,
    sessions: DashMap<String, Arc<Session>>,
    admission: Mutex<()>,
    touch_seq: AtomicU64,
    shutting_down: AtomicBool,
}

impl RealtimeSessionManager {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        gateway: ShadowGateway,
        governor: Arc<RateGovernor>,
        bus: Arc<ShadowEventBus>,
        options: RealtimeOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            gateway,
            governor,
            bus,
            options,
            sessions: DashMap::new(),
            admission: Mutex::new(()),
            touch_seq: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Registers interest in `device_id` and ensures its polling task runs.
    pub fn subscribe(self: &Arc<Self>, device_id: &str) -> Result<(), TwinError> {
        validate_device_id(device_id)?;

        let session = self
            .sessions
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Session::new(device_id)))
            .value()
            .clone();

        let count = session.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
        self.touch(&session);
        debug!(device_id, subscribers = count, "subscribe");

        self.ensure_loop(&session);
        Ok(())
    }

    /// Drops interest in `device_id`. Unknown devices are a no-op.
    pub async fn unsubscribe(&self, device_id: &str) -> Result<(), TwinError> {
        validate_device_id(device_id)?;

        let Some(session) = self.sessions.get(device_id).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };

        let prev = session
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v - 1).max(0)))
            .unwrap_or_else(|v| v);
        debug!(device_id, subscribers = (prev - 1).max(0), "unsubscribe");

        if prev <= 1 {
            session.cancel_loop();
        }
        if prev <= 0 {
            session.release();
            self.set_live_flag(device_id, false).await;
        }
        Ok(())
    }

    /// Number of sessions currently holding a live slot.
    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|e| e.value().is_live()).count()
    }

    pub fn max_active_sessions(&self) -> usize {
        self.options.max_active_sessions()
    }

    pub fn session_snapshot(&self, device_id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(device_id).map(|e| e.value().snapshot())
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Stops every loop and refuses to start new ones.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for entry in self.sessions.iter() {
            entry.value().cancel_loop();
        }
        info!(sessions = self.sessions.len(), "realtime session manager shutting down");
    }

    /// Merges `poll` into the stored shadow and publishes the diff, if any.
    pub async fn apply_snapshot(
        &self,
        device_id: &str,
        poll: &RawPoll,
    ) -> Result<Option<DiffPatch>, StoreError> {
        if poll.age_seconds > self.options.max_snapshot_age_seconds {
            debug!(device_id, age = poll.age_seconds, "ignoring stale snapshot");
            return Ok(None);
        }

        let before = match self.gateway.get_shadow(device_id).await? {
            Some(shadow) => shadow,
            None => {
                let meta = self
                    .gateway
                    .get_meta(device_id)
                    .await?
                    .unwrap_or_else(|| DeviceMeta::placeholder(device_id));
                from_meta(&meta)
            }
        };

        let after = merge_realtime(&before, poll);
        let diff = compute_diff(&before, &after);
        self.gateway.set_shadow(&after).await?;

        if diff.is_empty() {
            return Ok(None);
        }
        self.bus.publish(diff.clone());
        Ok(Some(diff))
    }

    fn touch(&self, session: &Session) {
        let seq = self.touch_seq.fetch_add(1, Ordering::SeqCst);
        session.last_touched.store(seq, Ordering::SeqCst);
    }

    fn ensure_loop(self: &Arc<Self>, session: &Arc<Session>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if session
            .loop_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let token = session.fresh_token();
        let this = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            this.run_session(session, token).await;
        });
    }

    /// Claims a live slot for `session`, pausing a victim when at capacity.
    fn admit(&self, session: &Arc<Session>) -> Admission {
        let _gate = self.admission.lock();

        if session.is_live() {
            return Admission::Admitted { victim: None };
        }

        let live: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|e| e.value().is_live())
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut victim = None;
        if live.len() >= self.options.max_active_sessions() {
            let candidate = live
                .into_iter()
                .filter(|v| v.device_id != session.device_id)
                .min_by_key(|v| v.last_touched.load(Ordering::SeqCst));
            let Some(candidate) = candidate else {
                return Admission::Full;
            };
            candidate.release();
            candidate.stats.lock().paused_until =
                Some(Instant::now() + self.options.eviction_cooldown());
            victim = Some(candidate);
        }

        session.live.store(true, Ordering::SeqCst);
        self.touch(session);
        Admission::Admitted { victim }
    }

    async fn run_session(self: Arc<Self>, session: Arc<Session>, token: CancellationToken) {
        let id = session.device_id.clone();
        info!(device_id = %id, "realtime loop started");

        let opts = &self.options;
        let mut restart_errors: u32 = 0;

        while !token.is_cancelled() && session.subscribers() > 0 {
            if let Some(wait) = session.pause_remaining() {
                debug!(device_id = %id, wait_ms = wait.as_millis() as u64, "session paused");
                if !sleep_or_cancel(&token, wait).await {
                    break;
                }
                continue;
            }

            let expiring = session
                .expires_in()
                .is_some_and(|secs| secs < opts.extend_threshold_seconds);

            if !session.is_live() || expiring {
                if !self.governor.try_acquire(RateBucket::SessionStart) {
                    if !sleep_or_cancel(&token, Duration::from_millis(opts.start_retry_delay_ms)).await {
                        break;
                    }
                    continue;
                }

                let mut admitted_now = false;
                if !session.is_live() {
                    match self.admit(&session) {
                        Admission::Admitted { victim } => {
                            admitted_now = true;
                            if let Some(victim) = victim {
                                info!(victim = %victim.device_id, device_id = %id, "pausing live session to admit");
                                self.set_live_flag(&victim.device_id, false).await;
                            }
                        }
                        Admission::Full => {
                            if !sleep_or_cancel(&token, Duration::from_millis(opts.start_retry_delay_ms)).await {
                                break;
                            }
                            continue;
                        }
                    }
                }

                let Some(started) = cancellable(&token, self.upstream.start_session(&id)).await else {
                    break;
                };
                match started {
                    Ok(ok) => {
                        if !ok {
                            debug!(device_id = %id, "start_session returned false");
                        }
                        session.stats.lock().last_start_at = Some(Utc::now());
                        restart_errors = 0;
                    }
                    Err(e) if e.is_rate_limited() => {
                        warn!(device_id = %id, backoff_s = opts.backoff_on_429_seconds, "429 on session start, backing off");
                        if admitted_now {
                            session.release();
                        }
                        if !sleep_or_cancel(&token, opts.backoff()).await {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(device_id = %id, error = %e, "failed to start realtime session");
                        if admitted_now {
                            session.release();
                        }
                        restart_errors += 1;
                        if restart_errors >= opts.max_restart_attempts() {
                            warn!(device_id = %id, attempts = restart_errors, "max restart attempts reached, degrading");
                            session.release();
                            self.set_live_flag(&id, false).await;
                            if !sleep_or_cancel(&token, opts.backoff()).await {
                                break;
                            }
                            restart_errors = 0;
                        } else if !sleep_or_cancel(&token, Duration::from_millis(opts.failure_retry_delay_ms)).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            // Evicted while the start call was in flight.
            if !session.is_live() {
                continue;
            }

            if !self.governor.try_acquire(RateBucket::SessionPoll) {
                if !sleep_or_cancel(&token, Duration::from_millis(opts.poll_retry_delay_ms)).await {
                    break;
                }
                continue;
            }

            let Some(polled) = cancellable(&token, self.upstream.get_snapshot(&id)).await else {
                break;
            };
            let delay = match polled {
                Ok(poll) => {
                    {
                        let mut stats = session.stats.lock();
                        stats.expires_in_secs = poll.expires_in_secs.or(stats.expires_in_secs);
                        stats.message_count = poll.message_count.or(stats.message_count);
                    }
                    if session.is_live() {
                        if let Err(e) = self.apply_snapshot(&id, &poll).await {
                            warn!(device_id = %id, error = %e, "failed to merge snapshot into shadow");
                        }
                    }
                    opts.poll_interval()
                }
                Err(e) if e.is_rate_limited() => {
                    warn!(device_id = %id, backoff_s = opts.backoff_on_429_seconds, "429 on realtime poll, backing off");
                    opts.backoff()
                }
                Err(e) if e.is_session_expired() => {
                    info!(device_id = %id, "realtime session expired, restarting");
                    session.release();
                    restart_errors += 1;
                    Duration::from_millis(opts.expired_retry_delay_ms)
                }
                Err(e) => {
                    warn!(device_id = %id, error = %e, "realtime poll failed");
                    Duration::from_millis(opts.failure_retry_delay_ms)
                }
            };

            if !sleep_or_cancel(&token, delay).await {
                break;
            }
        }

        session.release();
        self.set_live_flag(&id, false).await;
        session.loop_running.store(false, Ordering::SeqCst);
        info!(device_id = %id, "realtime loop stopped");

        // A subscribe that raced with the shutdown of this loop saw it still running.
        if session.subscribers() > 0 {
            self.ensure_loop(&session);
        }
    }

    /// Writes `live` into the stored shadow and publishes the change. No-op when
    /// the shadow is missing or already has that value.
    async fn set_live_flag(&self, device_id: &str, live: bool) {
        let shadow = match self.gateway.get_shadow(device_id).await {
            Ok(Some(shadow)) if shadow.live != live => shadow,
            Ok(_) => return,
            Err(e) => {
                warn!(device_id, error = %e, "failed to read shadow for live flag");
                return;
            }
        };

        let now = Utc::now();
        let mutated = Shadow {
            live,
            updated_at: now,
            ..shadow
        };
        if let Err(e) = self.gateway.set_shadow(&mutated).await {
            warn!(device_id, error = %e, "failed to persist live flag");
            return;
        }
        self.bus.publish(live_patch(device_id, live, now));
    }
}

/// Sleeps for `duration`; returns `false` if cancelled first.
async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Runs `fut` unless `token` fires first.
async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}
