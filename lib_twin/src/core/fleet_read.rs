//! Read path over the stored fleet: index, metadata and shadows.

use crate::error::TwinError;
use crate::model::{DeviceMeta, FleetEntry, Shadow};
use crate::store::ShadowGateway;

#[derive(Clone)]
pub struct FleetReadService {
    gateway: ShadowGateway,
}

impl FleetReadService {
    pub fn new(gateway: ShadowGateway) -> Self {
        Self { gateway }
    }

    /// One entry per indexed device with stored metadata, in index order.
    /// `freshness_seconds` is the shadow's age, absent without a shadow.
    pub async fn fleet(&self) -> Result<Vec<FleetEntry>, TwinError> {
        let ids = self.gateway.fleet_index().await?;
        let mut entries = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(meta) = self.gateway.get_meta(&id).await? else {
                continue;
            };
            let shadow = self.gateway.get_shadow(&id).await?;
            entries.push(FleetEntry {
                device_id: id,
                name: meta.name,
                product: meta.product,
                model: meta.model,
                online: meta.online,
                print_status: meta.print_status,
                freshness_seconds: shadow.map(|s| s.age_seconds),
            });
        }
        Ok(entries)
    }

    pub async fn meta(&self, device_id: &str) -> Result<Option<DeviceMeta>, TwinError> {
        Ok(self.gateway.get_meta(device_id).await?)
    }

    pub async fn shadow(&self, device_id: &str) -> Result<Option<Shadow>, TwinError> {
        Ok(self.gateway.get_shadow(device_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reconciler::from_meta;
    use crate::store::MemoryShadowStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fleet_skips_devices_without_meta() {
        let gw = ShadowGateway::new(Arc::new(MemoryShadowStore::new()));
        let a = DeviceMeta::placeholder("A");
        let c = DeviceMeta::placeholder("C");
        gw.set_meta(&a).await.unwrap();
        gw.set_shadow(&from_meta(&a)).await.unwrap();
        gw.set_meta(&c).await.unwrap();
        gw.set_fleet_index(&["A".to_string(), "B".to_string(), "C".to_string()])
            .await
            .unwrap();

        let fleet = FleetReadService::new(gw).fleet().await.unwrap();
        let ids: Vec<_> = fleet.iter().map(|e| e.device_id.as_str()).collect();
        assert_eq!(ids, ["A", "C"]);
        assert_eq!(fleet[0].freshness_seconds, Some(-1.0));
        assert_eq!(fleet[1].freshness_seconds, None);
    }

    #[tokio::test]
    async fn test_point_reads() {
        let gw = ShadowGateway::new(Arc::new(MemoryShadowStore::new()));
        let svc = FleetReadService::new(gw.clone());
        assert!(svc.shadow("A").await.unwrap().is_none());

        let a = DeviceMeta::placeholder("A");
        gw.set_meta(&a).await.unwrap();
        assert_eq!(svc.meta("A").await.unwrap(), Some(a));
    }
}
