//! End-to-end behaviour of the realtime session manager against a scripted
//! upstream and the in-memory store. Time is paused so backoffs and cool-downs
//! run instantly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use lib_twin::configs::{RateLimitOptions, RealtimeOptions};
use lib_twin::core::{RateGovernor, RealtimeSessionManager, RealtimeSupervisor, ShadowEventBus, UpstreamApi};
use lib_twin::model::{DeviceListing, RawPoll, FIELD_LIVE};
use lib_twin::store::{MemoryShadowStore, ShadowGateway};
use lib_twin::UpstreamError;

#[derive(Default)]
struct ScriptedUpstream {
    starts: Mutex<HashMap<String, usize>>,
    polls: AtomicUsize,
    start_script: Mutex<VecDeque<Result<bool, UpstreamError>>>,
    poll_script: Mutex<VecDeque<Result<RawPoll, UpstreamError>>>,
}

impl ScriptedUpstream {
    fn starts_for(&self, device_id: &str) -> usize {
        self.starts.lock().get(device_id).copied().unwrap_or(0)
    }

    fn script_start(&self, outcome: Result<bool, UpstreamError>) {
        self.start_script.lock().push_back(outcome);
    }

    fn script_poll(&self, outcome: Result<RawPoll, UpstreamError>) {
        self.poll_script.lock().push_back(outcome);
    }
}

fn healthy_poll() -> RawPoll {
    RawPoll {
        state: Some("RUNNING".into()),
        progress_pct: 12.0,
        nozzle_c: 215.0,
        age_seconds: 1.0,
        expires_in_secs: Some(120),
        message_count: Some(1),
        ..Default::default()
    }
}

#[async_trait]
impl UpstreamApi for ScriptedUpstream {
    async fn list_devices(&self) -> Result<Vec<DeviceListing>, UpstreamError> {
        Ok(Vec::new())
    }

    async fn start_session(&self, device_id: &str) -> Result<bool, UpstreamError> {
        *self.starts.lock().entry(device_id.to_string()).or_default() += 1;
        self.start_script.lock().pop_front().unwrap_or(Ok(true))
    }

    async fn get_snapshot(&self, _device_id: &str) -> Result<RawPoll, UpstreamError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.poll_script.lock().pop_front().unwrap_or_else(|| Ok(healthy_poll()))
    }
}

struct Harness {
    upstream: Arc<ScriptedUpstream>,
    gateway: ShadowGateway,
    bus: Arc<ShadowEventBus>,
    manager: Arc<RealtimeSessionManager>,
}

fn harness(options: RealtimeOptions) -> Harness {
    let upstream = Arc::new(ScriptedUpstream::default());
    let gateway = ShadowGateway::new(Arc::new(MemoryShadowStore::new()));
    let bus = Arc::new(ShadowEventBus::new());
    let manager = RealtimeSessionManager::new(
        upstream.clone(),
        gateway.clone(),
        Arc::new(RateGovernor::new(&RateLimitOptions::default())),
        bus.clone(),
        options,
    );
    Harness {
        upstream,
        gateway,
        bus,
        manager,
    }
}

fn capped(max: usize) -> RealtimeOptions {
    RealtimeOptions {
        max_active_sessions: max,
        ..Default::default()
    }
}

async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[tokio::test(start_paused = true)]
async fn test_single_subscriber_goes_live_and_publishes() {
    let h = harness(RealtimeOptions::default());
    let mut diffs = h.bus.subscribe_device("P1");

    h.manager.subscribe("P1").unwrap();
    settle(Duration::from_secs(3)).await;

    assert_eq!(h.upstream.starts_for("P1"), 1);
    assert!(h.upstream.polls.load(Ordering::SeqCst) >= 2);
    assert_eq!(h.manager.active_sessions(), 1);

    let shadow = h.gateway.get_shadow("P1").await.unwrap().unwrap();
    assert!(shadow.live);
    assert_eq!(shadow.reported.state, "RUNNING");

    // Repeated identical polls only produce the first diff.
    let first = diffs.try_recv().unwrap();
    assert_eq!(first.get(FIELD_LIVE), Some(&json!(true)));
    assert!(diffs.try_recv().is_none());

    let snap = h.manager.session_snapshot("P1").unwrap();
    assert_eq!(snap.subscribers, 1);
    assert_eq!(snap.expires_in_secs, Some(120));
    assert!(snap.last_start_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_active_sessions_never_exceed_capacity() {
    let h = harness(capped(2));
    for id in ["A", "B", "C", "D", "E"] {
        h.manager.subscribe(id).unwrap();
    }

    let mut peak = 0;
    for _ in 0..240 {
        settle(Duration::from_millis(500)).await;
        let active = h.manager.active_sessions();
        assert!(active <= 2, "active sessions {active} above capacity");
        peak = peak.max(active);
    }
    assert_eq!(peak, 2);
    assert_eq!(
        RealtimeSupervisor::new(h.manager.clone(), Duration::from_secs(15)).report().capacity,
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_admission_pauses_one_existing_session() {
    let h = harness(capped(2));
    let mut diffs = h.bus.subscribe_devices(["A", "B"]);

    h.manager.subscribe("A").unwrap();
    h.manager.subscribe("B").unwrap();
    settle(Duration::from_secs(3)).await;
    assert_eq!(h.manager.active_sessions(), 2);
    while diffs.try_recv().is_some() {}

    h.manager.subscribe("C").unwrap();
    settle(Duration::from_secs(3)).await;

    assert!(h.manager.session_snapshot("C").unwrap().live);
    assert_eq!(h.manager.active_sessions(), 2);

    let paused: Vec<String> = ["A", "B"]
        .into_iter()
        .filter_map(|id| h.manager.session_snapshot(id))
        .filter(|s| s.paused && !s.live)
        .map(|s| s.device_id)
        .collect();
    assert_eq!(paused.len(), 1);

    let victim = &paused[0];
    assert!(!h.gateway.get_shadow(victim).await.unwrap().unwrap().live);

    let mut saw_offline = false;
    while let Some(diff) = diffs.try_recv() {
        if &diff.device_id == victim && diff.get(FIELD_LIVE) == Some(&json!(false)) {
            saw_offline = true;
        }
    }
    assert!(saw_offline);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_subscribes_share_one_session() {
    let h = harness(RealtimeOptions::default());

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.subscribe("P1") })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    settle(Duration::from_millis(300)).await;

    let sessions = h.manager.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].subscribers, 32);
    assert!(sessions[0].loop_running);
    assert_eq!(h.upstream.starts_for("P1"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscribe_burst_respects_capacity() {
    let h = harness(capped(3));
    let ids: Vec<String> = (0..10).map(|i| format!("D{i}")).collect();

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let manager = h.manager.clone();
            let id = ids[i % ids.len()].clone();
            tokio::spawn(async move { manager.subscribe(&id) })
        })
        .collect();

    let mut peak = 0;
    for _ in 0..50 {
        let active = h.manager.active_sessions();
        assert!(active <= 3, "active sessions {active} above capacity");
        peak = peak.max(active);
        settle(Duration::from_millis(10)).await;
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert!(peak <= 3);

    let sessions = h.manager.sessions();
    assert_eq!(sessions.len(), 10);
    assert!(sessions.iter().all(|s| s.subscribers == 4));
    assert!(sessions.iter().all(|s| s.loop_running));
    assert!(h.manager.active_sessions() <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_excess_unsubscribe_clamps_and_marks_offline() {
    let h = harness(RealtimeOptions::default());
    let mut diffs = h.bus.subscribe_device("P1");
    h.manager.subscribe("P1").unwrap();
    settle(Duration::from_secs(2)).await;
    assert!(h.gateway.get_shadow("P1").await.unwrap().unwrap().live);
    while diffs.try_recv().is_some() {}

    h.manager.unsubscribe("P1").await.unwrap();
    h.manager.unsubscribe("P1").await.unwrap();
    settle(Duration::from_millis(100)).await;

    let snap = h.manager.session_snapshot("P1").unwrap();
    assert_eq!(snap.subscribers, 0);
    assert!(!snap.live);
    assert!(!snap.loop_running);
    assert!(!h.gateway.get_shadow("P1").await.unwrap().unwrap().live);

    let offline = diffs.try_recv().unwrap();
    assert_eq!(offline.get(FIELD_LIVE), Some(&json!(false)));
    assert!(diffs.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shared_session_survives_one_unsubscribe() {
    let h = harness(RealtimeOptions::default());
    h.manager.subscribe("P1").unwrap();
    h.manager.subscribe("P1").unwrap();
    settle(Duration::from_secs(2)).await;

    h.manager.unsubscribe("P1").await.unwrap();
    settle(Duration::from_secs(2)).await;

    let snap = h.manager.session_snapshot("P1").unwrap();
    assert_eq!(snap.subscribers, 1);
    assert!(snap.loop_running);
    assert!(snap.live);
    assert_eq!(h.upstream.starts_for("P1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_restarts_the_loop() {
    let h = harness(RealtimeOptions::default());
    h.manager.subscribe("P1").unwrap();
    settle(Duration::from_secs(2)).await;
    h.manager.unsubscribe("P1").await.unwrap();
    settle(Duration::from_millis(100)).await;
    assert!(!h.manager.session_snapshot("P1").unwrap().loop_running);

    h.manager.subscribe("P1").unwrap();
    settle(Duration::from_secs(2)).await;
    let snap = h.manager.session_snapshot("P1").unwrap();
    assert!(snap.loop_running);
    assert!(snap.live);
    assert_eq!(h.upstream.starts_for("P1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_start_backs_off() {
    let h = harness(RealtimeOptions::default());
    h.upstream.script_start(Err(UpstreamError::RateLimited("start".into())));

    h.manager.subscribe("P1").unwrap();
    settle(Duration::from_secs(10)).await;
    assert_eq!(h.upstream.starts_for("P1"), 1);
    assert_eq!(h.manager.active_sessions(), 0);

    settle(Duration::from_secs(25)).await;
    assert_eq!(h.upstream.starts_for("P1"), 2);
    assert_eq!(h.manager.active_sessions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_is_restarted() {
    let h = harness(RealtimeOptions::default());
    h.upstream.script_poll(Err(UpstreamError::SessionExpired { status: 410 }));

    h.manager.subscribe("P1").unwrap();
    settle(Duration::from_secs(3)).await;

    assert_eq!(h.upstream.starts_for("P1"), 2);
    assert!(h.manager.session_snapshot("P1").unwrap().live);
}

#[tokio::test(start_paused = true)]
async fn test_expiring_session_is_extended() {
    let h = harness(RealtimeOptions::default());
    h.upstream.script_poll(Ok(RawPoll {
        expires_in_secs: Some(5),
        ..healthy_poll()
    }));

    h.manager.subscribe("P1").unwrap();
    settle(Duration::from_secs(3)).await;

    // One start to go live, one to extend; later polls report 120s again.
    assert_eq!(h.upstream.starts_for("P1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_start_failures_degrade() {
    let h = harness(RealtimeOptions::default());
    for _ in 0..3 {
        h.upstream.script_start(Err(UpstreamError::Transport("connection refused".into())));
    }

    h.manager.subscribe("P1").unwrap();
    settle(Duration::from_secs(5)).await;
    assert_eq!(h.upstream.starts_for("P1"), 3);
    assert_eq!(h.manager.active_sessions(), 0);

    // Degraded for the 429 backoff, then retried successfully.
    settle(Duration::from_secs(20)).await;
    assert_eq!(h.upstream.starts_for("P1"), 3);
    settle(Duration::from_secs(10)).await;
    assert_eq!(h.upstream.starts_for("P1"), 4);
    assert!(h.manager.session_snapshot("P1").unwrap().live);
}

#[tokio::test(start_paused = true)]
async fn test_device_filter_isolates_subscribers() {
    let h = harness(RealtimeOptions::default());
    let mut only_a = h.bus.subscribe_device("A");

    h.manager.subscribe("A").unwrap();
    h.manager.subscribe("B").unwrap();
    settle(Duration::from_secs(3)).await;

    let mut count = 0;
    while let Some(diff) = only_a.try_recv() {
        assert_eq!(diff.device_id, "A");
        count += 1;
    }
    assert!(count >= 1);
    assert!(h.gateway.get_shadow("B").await.unwrap().is_some());
}
