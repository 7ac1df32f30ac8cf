//! # Error Types
//!
//! Failures are split by the collaborator that produced them. Upstream and
//! storage errors are caught and logged where they happen inside the session
//! loops; only `TwinError::InvalidDeviceId` is returned synchronously to
//! callers of `subscribe` / `unsubscribe`.

use thiserror::Error;

/// Failures reported by the upstream device API.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// HTTP 429 from upstream.
    #[error("Rate limited by upstream ({0})")]
    RateLimited(String),

    /// HTTP 404/410: the realtime session expired or never existed.
    #[error("Realtime session expired or missing (HTTP {status})")]
    SessionExpired { status: u16 },

    /// Any other non-2xx response.
    #[error("Upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Connection, timeout or middleware failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, UpstreamError::RateLimited(_))
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, UpstreamError::SessionExpired { .. })
    }
}

/// Failures of the shadow store or the relational repository.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level error of the crate.
#[derive(Debug, Error)]
pub enum TwinError {
    #[error("Invalid device id: {0:?}")]
    InvalidDeviceId(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Longest device id accepted by the orchestrator.
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// Rejects ids that are blank, oversized, or would break the `kind:{id}` key layout.
pub fn validate_device_id(device_id: &str) -> Result<(), TwinError> {
    let malformed = device_id.is_empty()
        || device_id.len() > MAX_DEVICE_ID_LEN
        || device_id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == ':');

    if malformed {
        return Err(TwinError::InvalidDeviceId(device_id.to_string()));
    }
    Ok(())
}
