use std::sync::Arc;

use lib_twin::configs::TwinConfig;
use lib_twin::connections::{Database, PgDeviceRepository, RedisShadowStore};
use lib_twin::core::{
    FleetAdmissionJob, FleetReadService, RateGovernor, RealtimeSessionManager, RealtimeSupervisor,
    ShadowEventBus, Subscription,
};
use lib_twin::retrieve::ProxyClient;
use lib_twin::store::{DeviceRepository, MemoryShadowStore, NullDeviceRepository, ShadowGateway, ShadowStore};
use tracing::{info, warn};

/// Everything the binary runs, wired from one config.
pub struct TwinRuntime {
    pub gateway: ShadowGateway,
    pub bus: Arc<ShadowEventBus>,
    pub manager: Arc<RealtimeSessionManager>,
    pub fleet_job: FleetAdmissionJob,
    pub supervisor: RealtimeSupervisor,
    pub reads: FleetReadService,
}

async fn build_store(config: &TwinConfig) -> anyhow::Result<Arc<dyn ShadowStore>> {
    if config.redis.url.trim().is_empty() {
        warn!("No Redis URL configured, shadows are kept in memory only");
        return Ok(Arc::new(MemoryShadowStore::new()));
    }
    let store = RedisShadowStore::connect(&config.redis.url).await?;
    store.ping().await?;
    Ok(Arc::new(store))
}

/// Relational persistence is best-effort: a broken database logs and falls
/// back to the null repository.
async fn build_repository(config: &TwinConfig) -> Arc<dyn DeviceRepository> {
    if !config.postgres.enabled {
        info!("PostgreSQL persistence disabled");
        return Arc::new(NullDeviceRepository);
    }

    let db = match Database::new(&config.postgres.url, config.postgres.max_connections) {
        Ok(db) => db,
        Err(e) => {
            warn!(error = %e, "PostgreSQL pool unavailable, device rows will not be persisted");
            return Arc::new(NullDeviceRepository);
        }
    };
    if let Err(e) = db.ping().await {
        warn!(error = %e, "PostgreSQL unreachable, device rows will not be persisted");
        return Arc::new(NullDeviceRepository);
    }
    let repo = PgDeviceRepository::new(db);
    if let Err(e) = repo.ensure_schema().await {
        warn!(error = %e, "Cannot prepare printers table, device rows will not be persisted");
        return Arc::new(NullDeviceRepository);
    }
    Arc::new(repo)
}

impl TwinRuntime {
    pub async fn build(config: &TwinConfig) -> anyhow::Result<Self> {
        let store = build_store(config).await?;
        let gateway = ShadowGateway::with_prefix(store, config.redis.key_prefix.clone());
        let repository = build_repository(config).await;

        let upstream = Arc::new(ProxyClient::new(&config.proxy)?);
        let governor = Arc::new(RateGovernor::new(&config.rate_limit));
        let bus = Arc::new(ShadowEventBus::new());

        let manager = RealtimeSessionManager::new(
            upstream.clone(),
            gateway.clone(),
            governor.clone(),
            bus.clone(),
            config.realtime.clone(),
        );
        let fleet_job = FleetAdmissionJob::new(
            upstream,
            gateway.clone(),
            repository,
            governor,
            config.state_sync.refresh_interval(),
        );
        let supervisor = RealtimeSupervisor::new(manager.clone(), config.realtime.supervisor_interval());
        let reads = FleetReadService::new(gateway.clone());

        Ok(Self {
            gateway,
            bus,
            manager,
            fleet_job,
            supervisor,
            reads,
        })
    }

    /// Subscribes to every id in `watch`, returning the bus subscription that
    /// receives their diffs. Invalid ids are logged and skipped.
    pub fn watch(&self, watch: &[String]) -> Subscription {
        let diffs = self.bus.subscribe_devices(watch.iter().cloned());
        for id in watch {
            if let Err(e) = self.manager.subscribe(id) {
                warn!(device_id = %id, error = %e, "cannot watch device");
            }
        }
        diffs
    }
}
