//! The upstream device API as the core sees it. `retrieve::proxy_client`
//! provides the HTTP implementation.

use async_trait::async_trait;

use crate::error::UpstreamError;
use crate::model::{DeviceListing, RawPoll};

#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// All devices bound to the account.
    async fn list_devices(&self) -> Result<Vec<DeviceListing>, UpstreamError>;

    /// Opens or extends the realtime session. `Ok(false)` means upstream did
    /// not start one, which is not an error.
    async fn start_session(&self, device_id: &str) -> Result<bool, UpstreamError>;

    /// Latest realtime snapshot. 404/410 surface as `SessionExpired`.
    async fn get_snapshot(&self, device_id: &str) -> Result<RawPoll, UpstreamError>;
}
