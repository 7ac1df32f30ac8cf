//! # Shadow Reconciler
//!
//! Pure transforms between device metadata, realtime polls and shadows, plus
//! the field-level diff published after every merge. Nothing here touches the
//! store or the clock except through explicit arguments.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::model::{
    DeviceMeta, DiffPatch, RawPoll, Shadow, ShadowReported, TrayEntry, FIELD_BED,
    FIELD_BED_TARGET, FIELD_ETA, FIELD_LAYER_CURRENT, FIELD_LAYER_TOTAL, FIELD_LIVE,
    FIELD_NOZZLE, FIELD_NOZZLE_TARGET, FIELD_PROGRESS, FIELD_STATE, FIELD_TRAYS,
    FIELD_UPDATED_AT, FIELD_WIFI, SHADOW_SOURCE,
};

/// Float fields must move at least this much to count as changed.
pub const FLOAT_DEADBAND: f64 = 0.1;

// Absorbs binary rounding so a 0.1 step such as 10.0 -> 10.1 still counts.
const DEADBAND_EPSILON: f64 = 1e-9;

/// Default shadow for a device that has not reported yet.
pub fn from_meta(meta: &DeviceMeta) -> Shadow {
    from_meta_at(meta, Utc::now())
}

pub fn from_meta_at(meta: &DeviceMeta, now: DateTime<Utc>) -> Shadow {
    Shadow {
        device_id: meta.device_id.clone(),
        meta: meta.clone(),
        reported: ShadowReported::default(),
        updated_at: now,
        age_seconds: -1.0,
        source: SHADOW_SOURCE.to_string(),
        live: false,
    }
}

/// Overlays a realtime poll on `current`, returning a new live shadow.
pub fn merge_realtime(current: &Shadow, poll: &RawPoll) -> Shadow {
    merge_realtime_at(current, poll, Utc::now())
}

pub fn merge_realtime_at(current: &Shadow, poll: &RawPoll, now: DateTime<Utc>) -> Shadow {
    let state = match poll.state.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => current.reported.state.clone(),
    };

    Shadow {
        reported: ShadowReported {
            state,
            progress_pct: poll.progress_pct,
            eta_s: poll.eta_s,
            nozzle_c: poll.nozzle_c,
            nozzle_target_c: poll.nozzle_target_c,
            bed_c: poll.bed_c,
            bed_target_c: poll.bed_target_c,
            layer_current: poll.layer_current,
            layer_total: poll.layer_total,
            wifi_signal_dbm: poll.wifi_signal_dbm,
            trays: poll.trays.clone(),
        },
        updated_at: now,
        age_seconds: poll.age_seconds,
        source: SHADOW_SOURCE.to_string(),
        live: true,
        ..current.clone()
    }
}

/// Fields of `after` that differ from `before`. `updated_at` is only added
/// when something else changed, so an unchanged merge yields an empty patch.
pub fn compute_diff(before: &Shadow, after: &Shadow) -> DiffPatch {
    let mut diff = DiffPatch::new(after.device_id.clone(), after.updated_at);
    let (b, a) = (&before.reported, &after.reported);

    let mut set_if = |changed: bool, path: &str, value: Value| {
        if changed {
            diff.fields.insert(path.to_string(), value);
        }
    };

    set_if(a.state != b.state, FIELD_STATE, to_value(&a.state));
    set_if(float_changed(a.progress_pct, b.progress_pct), FIELD_PROGRESS, to_value(&a.progress_pct));
    set_if(a.eta_s != b.eta_s, FIELD_ETA, to_value(&a.eta_s));
    set_if(float_changed(a.nozzle_c, b.nozzle_c), FIELD_NOZZLE, to_value(&a.nozzle_c));
    set_if(
        float_changed(a.nozzle_target_c, b.nozzle_target_c),
        FIELD_NOZZLE_TARGET,
        to_value(&a.nozzle_target_c),
    );
    set_if(float_changed(a.bed_c, b.bed_c), FIELD_BED, to_value(&a.bed_c));
    set_if(
        float_changed(a.bed_target_c, b.bed_target_c),
        FIELD_BED_TARGET,
        to_value(&a.bed_target_c),
    );
    set_if(a.layer_current != b.layer_current, FIELD_LAYER_CURRENT, to_value(&a.layer_current));
    set_if(a.layer_total != b.layer_total, FIELD_LAYER_TOTAL, to_value(&a.layer_total));
    set_if(a.wifi_signal_dbm != b.wifi_signal_dbm, FIELD_WIFI, to_value(&a.wifi_signal_dbm));
    set_if(trays_changed(&b.trays, &a.trays), FIELD_TRAYS, to_value(&a.trays));
    set_if(after.live != before.live, FIELD_LIVE, Value::Bool(after.live));

    if !diff.fields.is_empty() {
        diff.fields
            .insert(FIELD_UPDATED_AT.to_string(), to_value(&after.updated_at));
    }
    diff
}

/// Builds the patch published when only the liveness of a shadow changes.
pub fn live_patch(device_id: &str, live: bool, updated_at: DateTime<Utc>) -> DiffPatch {
    let mut diff = DiffPatch::new(device_id, updated_at);
    diff.fields.insert(FIELD_LIVE.to_string(), Value::Bool(live));
    diff.fields
        .insert(FIELD_UPDATED_AT.to_string(), to_value(&updated_at));
    diff
}

fn float_changed(a: f64, b: f64) -> bool {
    (a - b).abs() >= FLOAT_DEADBAND - DEADBAND_EPSILON
}

// Only the count and the first tray are compared.
fn trays_changed(before: &[TrayEntry], after: &[TrayEntry]) -> bool {
    if before.len() != after.len() {
        return true;
    }
    match (before.first(), after.first()) {
        (Some(b), Some(a)) => {
            a.material != b.material || a.color != b.color || a.remaining != b.remaining
        }
        _ => false,
    }
}

fn to_value<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}
