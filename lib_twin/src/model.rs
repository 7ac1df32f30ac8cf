//! # Shadow Data Model
//!
//! Plain serde records shared by the reconciler, the session manager, the
//! fleet job and the store adapters. Field names are the serialized names.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Data-source tag written into every shadow.
pub const SHADOW_SOURCE: &str = "bambu-proxy";

/// State label of a shadow that has never received telemetry.
pub const UNKNOWN_STATE: &str = "UNKNOWN";

/// Static device metadata, rebuilt in full on every fleet refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub device_id: String,
    pub name: String,
    pub product: String,
    pub model: String,
    pub online: bool,
    pub print_status: Option<String>,
}

impl DeviceMeta {
    /// Placeholder used when a device id is known but its metadata is not.
    pub fn placeholder(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: device_id.to_string(),
            product: String::new(),
            model: String::new(),
            online: false,
            print_status: None,
        }
    }
}

/// One AMS tray slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrayEntry {
    pub slot: i64,
    pub material: Option<String>,
    pub color: Option<String>,
    pub remaining: Option<f64>,
}

/// The "reported" half of a shadow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowReported {
    pub state: String,
    pub progress_pct: f64,
    pub eta_s: Option<i64>,
    pub nozzle_c: f64,
    pub nozzle_target_c: f64,
    pub bed_c: f64,
    pub bed_target_c: f64,
    pub layer_current: Option<i64>,
    pub layer_total: Option<i64>,
    pub wifi_signal_dbm: Option<i64>,
    #[serde(default)]
    pub trays: Vec<TrayEntry>,
}

impl Default for ShadowReported {
    fn default() -> Self {
        Self {
            state: UNKNOWN_STATE.to_string(),
            progress_pct: 0.0,
            eta_s: None,
            nozzle_c: 0.0,
            nozzle_target_c: 0.0,
            bed_c: 0.0,
            bed_target_c: 0.0,
            layer_current: None,
            layer_total: None,
            wifi_signal_dbm: None,
            trays: Vec::new(),
        }
    }
}

/// Best-known state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shadow {
    pub device_id: String,
    pub meta: DeviceMeta,
    pub reported: ShadowReported,
    pub updated_at: DateTime<Utc>,
    /// Age of the upstream data at the last merge; `-1` before any merge.
    pub age_seconds: f64,
    pub source: String,
    /// True while a realtime session is feeding this shadow.
    pub live: bool,
}

/// One upstream realtime snapshot. Consumed immediately, never stored.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawPoll {
    /// `None` when upstream did not report a state; the merge keeps the old one.
    pub state: Option<String>,
    pub progress_pct: f64,
    pub eta_s: Option<i64>,
    pub nozzle_c: f64,
    pub nozzle_target_c: f64,
    pub bed_c: f64,
    pub bed_target_c: f64,
    pub layer_current: Option<i64>,
    pub layer_total: Option<i64>,
    pub wifi_signal_dbm: Option<i64>,
    pub trays: Vec<TrayEntry>,
    pub message_count: Option<i64>,
    pub age_seconds: f64,
    pub expires_in_secs: Option<i64>,
}

/// One entry of the upstream device list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceListing {
    pub device_id: String,
    pub name: Option<String>,
    pub product: Option<String>,
    pub model: Option<String>,
    pub online: Option<bool>,
    pub print_status: Option<String>,
}

impl DeviceListing {
    /// Builds the metadata record, defaulting missing fields.
    pub fn to_meta(&self) -> DeviceMeta {
        DeviceMeta {
            device_id: self.device_id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.device_id.clone()),
            product: self.product.clone().unwrap_or_default(),
            model: self.model.clone().unwrap_or_default(),
            online: self.online.unwrap_or(false),
            print_status: self.print_status.clone(),
        }
    }
}

/// The fields that changed in one reconciliation step, keyed by dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffPatch {
    pub device_id: String,
    pub updated_at: DateTime<Utc>,
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl DiffPatch {
    pub fn new(device_id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            updated_at,
            fields: BTreeMap::new(),
        }
    }

    /// True when no field other than `updated_at` is present.
    pub fn is_empty(&self) -> bool {
        self.fields.keys().all(|k| k == FIELD_UPDATED_AT)
    }

    pub fn get(&self, path: &str) -> Option<&serde_json::Value> {
        self.fields.get(path)
    }
}

// Dotted paths used in diffs.
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_LIVE: &str = "live";
pub const FIELD_STATE: &str = "reported.state";
pub const FIELD_PROGRESS: &str = "reported.progress_pct";
pub const FIELD_ETA: &str = "reported.eta_s";
pub const FIELD_NOZZLE: &str = "reported.nozzle_c";
pub const FIELD_NOZZLE_TARGET: &str = "reported.nozzle_target_c";
pub const FIELD_BED: &str = "reported.bed_c";
pub const FIELD_BED_TARGET: &str = "reported.bed_target_c";
pub const FIELD_LAYER_CURRENT: &str = "reported.layer_current";
pub const FIELD_LAYER_TOTAL: &str = "reported.layer_total";
pub const FIELD_WIFI: &str = "reported.wifi_signal_dbm";
pub const FIELD_TRAYS: &str = "reported.trays";

/// Row of the fleet listing served by the read path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEntry {
    pub device_id: String,
    pub name: String,
    pub product: String,
    pub model: String,
    pub online: bool,
    pub print_status: Option<String>,
    pub freshness_seconds: Option<f64>,
}
