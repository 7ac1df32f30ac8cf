//! # Fleet Admission Job
//!
//! Periodically lists the account's devices and brings the store in line:
//! metadata is rewritten, a default shadow is seeded for devices that have
//! none, the relational row is upserted on a best-effort basis, and finally
//! the fleet index is replaced in a single write.
//!
//! `bootstrap_shadows` is the startup companion: it makes sure every indexed
//! device has both documents without touching ones that already exist.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::rate_governor::{RateBucket, RateGovernor};
use crate::core::reconciler::from_meta;
use crate::core::upstream::UpstreamApi;
use crate::error::TwinError;
use crate::model::DeviceMeta;
use crate::store::{DeviceRepository, ShadowGateway};

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetRefreshReport {
    /// Device ids written to the index, in upstream order.
    pub devices: Vec<String>,
    /// Shadows created because none existed.
    pub seeded: usize,
    /// Relational upserts that failed and were skipped.
    pub persist_failures: usize,
    /// The cycle did nothing because the fleet-list bucket was empty.
    pub throttled: bool,
}

pub struct FleetAdmissionJob {
    upstream: Arc<dyn UpstreamApi>,
    gateway: ShadowGateway,
    repository: Arc<dyn DeviceRepository>,
    governor: Arc<RateGovernor>,
    interval: std::time::Duration,
}

impl FleetAdmissionJob {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        gateway: ShadowGateway,
        repository: Arc<dyn DeviceRepository>,
        governor: Arc<RateGovernor>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            upstream,
            gateway,
            repository,
            governor,
            interval,
        }
    }

    /// One listing and reconciliation pass.
    pub async fn refresh_once(&self) -> Result<FleetRefreshReport, TwinError> {
        if !self.governor.try_acquire(RateBucket::FleetList) {
            debug!("fleet list bucket empty, skipping refresh");
            return Ok(FleetRefreshReport {
                throttled: true,
                ..Default::default()
            });
        }

        let listings = self.upstream.list_devices().await?;
        if listings.is_empty() {
            warn!("upstream returned no devices, keeping the current fleet index");
            return Ok(FleetRefreshReport::default());
        }

        let mut report = FleetRefreshReport::default();
        let mut seen = HashSet::new();

        for listing in &listings {
            let id = listing.device_id.trim();
            if id.is_empty() || !seen.insert(id.to_string()) {
                continue;
            }

            let mut meta = listing.to_meta();
            meta.device_id = id.to_string();

            self.gateway.set_meta(&meta).await?;
            if !self.gateway.shadow_exists(id).await? {
                self.gateway.set_shadow(&from_meta(&meta)).await?;
                report.seeded += 1;
            }

            if let Err(e) = self.repository.upsert_device(&meta).await {
                warn!(device_id = id, error = %e, "failed to persist device row");
                report.persist_failures += 1;
            }

            report.devices.push(id.to_string());
        }

        self.gateway.set_fleet_index(&report.devices).await?;
        info!(
            devices = report.devices.len(),
            seeded = report.seeded,
            persist_failures = report.persist_failures,
            "fleet refreshed"
        );
        Ok(report)
    }

    /// Refreshes immediately, then every `interval` until cancelled. Failed
    /// cycles are logged and retried on the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_s = self.interval.as_secs(), "fleet admission job started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!(error = %e, "fleet refresh failed");
                    }
                }
            }
        }
        info!("fleet admission job stopped");
    }
}

/// Seeds missing metadata and shadows for every device in the fleet index.
/// Returns the number of documents created.
pub async fn bootstrap_shadows(gateway: &ShadowGateway) -> Result<usize, TwinError> {
    let ids = gateway.fleet_index().await?;
    let mut created = 0;

    for id in ids.iter().filter(|id| !id.trim().is_empty()) {
        let meta = match gateway.get_meta(id).await? {
            Some(meta) => meta,
            None => {
                let meta = DeviceMeta::placeholder(id);
                gateway.set_meta(&meta).await?;
                created += 1;
                meta
            }
        };

        if !gateway.shadow_exists(id).await? {
            gateway.set_shadow(&from_meta(&meta)).await?;
            created += 1;
        }
    }

    info!(indexed = ids.len(), created, "shadow bootstrap complete");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::config_twin::RateLimitOptions;
    use crate::error::{StoreError, UpstreamError};
    use crate::model::{DeviceListing, RawPoll};
    use crate::store::MemoryShadowStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct StaticFleet(Mutex<Vec<DeviceListing>>);

    #[async_trait]
    impl UpstreamApi for StaticFleet {
        async fn list_devices(&self) -> Result<Vec<DeviceListing>, UpstreamError> {
            Ok(self.0.lock().clone())
        }
        async fn start_session(&self, _: &str) -> Result<bool, UpstreamError> {
            Ok(true)
        }
        async fn get_snapshot(&self, _: &str) -> Result<RawPoll, UpstreamError> {
            Ok(RawPoll::default())
        }
    }

    struct FailingRepo;

    #[async_trait]
    impl DeviceRepository for FailingRepo {
        async fn upsert_device(&self, _: &DeviceMeta) -> Result<(), StoreError> {
            Err(StoreError::Backend("db down".into()))
        }
    }

    fn listing(id: &str, name: &str) -> DeviceListing {
        DeviceListing {
            device_id: id.to_string(),
            name: Some(name.to_string()),
            online: Some(true),
            ..Default::default()
        }
    }

    fn job(fleet: Vec<DeviceListing>, repo: Arc<dyn DeviceRepository>) -> (FleetAdmissionJob, ShadowGateway) {
        let gateway = ShadowGateway::new(Arc::new(MemoryShadowStore::new()));
        let job = FleetAdmissionJob::new(
            Arc::new(StaticFleet(Mutex::new(fleet))),
            gateway.clone(),
            repo,
            Arc::new(RateGovernor::new(&RateLimitOptions::default())),
            Duration::from_secs(60),
        );
        (job, gateway)
    }

    #[tokio::test]
    async fn test_refresh_seeds_and_indexes() {
        let fleet = vec![
            listing("A", "Alpha"),
            listing(" ", "blank"),
            listing("B", "Beta"),
            listing("A", "Alpha again"),
        ];
        let (job, gw) = job(fleet, Arc::new(crate::store::NullDeviceRepository));

        let report = job.refresh_once().await.unwrap();
        assert_eq!(report.devices, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(report.seeded, 2);
        assert_eq!(gw.fleet_index().await.unwrap(), report.devices);
        assert_eq!(gw.get_meta("A").await.unwrap().unwrap().name, "Alpha");

        let shadow = gw.get_shadow("B").await.unwrap().unwrap();
        assert!(!shadow.live);
        assert_eq!(shadow.age_seconds, -1.0);

        // Second pass keeps existing shadows.
        let report = job.refresh_once().await.unwrap();
        assert_eq!(report.seeded, 0);
    }

    #[tokio::test]
    async fn test_refresh_does_not_overwrite_live_shadow() {
        let (job, gw) = job(vec![listing("A", "Alpha")], Arc::new(crate::store::NullDeviceRepository));
        let mut shadow = from_meta(&DeviceMeta::placeholder("A"));
        shadow.live = true;
        shadow.reported.state = "RUNNING".into();
        gw.set_shadow(&shadow).await.unwrap();

        job.refresh_once().await.unwrap();
        let stored = gw.get_shadow("A").await.unwrap().unwrap();
        assert_eq!(stored.reported.state, "RUNNING");
        assert!(stored.live);
    }

    #[tokio::test]
    async fn test_empty_listing_keeps_index() {
        let (job, gw) = job(Vec::new(), Arc::new(crate::store::NullDeviceRepository));
        gw.set_fleet_index(&["OLD".to_string()]).await.unwrap();

        let report = job.refresh_once().await.unwrap();
        assert!(report.devices.is_empty());
        assert_eq!(gw.fleet_index().await.unwrap(), vec!["OLD".to_string()]);
    }

    #[tokio::test]
    async fn test_repository_failures_are_counted_not_fatal() {
        let (job, gw) = job(vec![listing("A", "Alpha"), listing("B", "Beta")], Arc::new(FailingRepo));
        let report = job.refresh_once().await.unwrap();
        assert_eq!(report.persist_failures, 2);
        assert_eq!(gw.fleet_index().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_fills_gaps_only() {
        let gw = ShadowGateway::new(Arc::new(MemoryShadowStore::new()));
        gw.set_fleet_index(&["A".to_string(), "B".to_string()]).await.unwrap();

        let mut meta = DeviceMeta::placeholder("A");
        meta.name = "Alpha".into();
        gw.set_meta(&meta).await.unwrap();

        // A: shadow only; B: meta and shadow.
        assert_eq!(bootstrap_shadows(&gw).await.unwrap(), 3);
        assert_eq!(gw.get_shadow("A").await.unwrap().unwrap().meta.name, "Alpha");
        assert!(gw.get_meta("B").await.unwrap().is_some());

        assert_eq!(bootstrap_shadows(&gw).await.unwrap(), 0);
    }
}
