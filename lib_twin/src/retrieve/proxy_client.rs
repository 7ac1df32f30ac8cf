//! # Printer Proxy Client
//!
//! `UpstreamApi` over the printer cloud proxy. Wire DTOs mirror the proxy's
//! JSON; `map_snapshot` turns a realtime response into a `RawPoll`.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::ky_http::{ApiClient, ApiResponse};
use crate::configs::config_twin::ProxyOptions;
use crate::core::upstream::UpstreamApi;
use crate::error::UpstreamError;
use crate::model::{DeviceListing, RawPoll, TrayEntry};

const BIND_PATH: &str = "v1/iot-service/api/user/bind";
const REALTIME_START_PATH: &str = "v1/iot-service/api/user/device/realtime/start";
const REALTIME_PATH: &str = "v1/iot-service/api/user/device/realtime";

#[derive(Debug, Default, Deserialize)]
pub struct BindResponse {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub devices: Vec<BindDevice>,
}

#[derive(Debug, Deserialize)]
pub struct BindDevice {
    pub dev_id: String,
    pub name: Option<String>,
    #[serde(rename = "dev_product_name")]
    pub product: Option<String>,
    #[serde(rename = "dev_model_name")]
    pub model: Option<String>,
    pub online: Option<bool>,
    pub print_status: Option<String>,
}

impl From<BindDevice> for DeviceListing {
    fn from(d: BindDevice) -> Self {
        DeviceListing {
            device_id: d.dev_id,
            name: d.name,
            product: d.product,
            model: d.model,
            online: d.online,
            print_status: d.print_status,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RealtimeResponse {
    pub message_count: Option<i64>,
    pub age_seconds: Option<f64>,
    pub expires_in: Option<i64>,
    pub data: Option<RealtimeData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RealtimeData {
    pub gcode_state: Option<String>,
    pub mc_percent: Option<f64>,
    pub mc_remaining_time: Option<i64>,
    pub layer_num: Option<i64>,
    pub total_layer_num: Option<i64>,
    pub nozzle_temper: Option<f64>,
    pub nozzle_target_temper: Option<f64>,
    pub bed_temper: Option<f64>,
    pub bed_target_temper: Option<f64>,
    /// Either a number or a string such as `"-45dBm"`.
    pub wifi_signal: Option<Value>,
    pub ams: Option<AmsRoot>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AmsRoot {
    #[serde(default)]
    pub ams: Vec<AmsUnit>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AmsUnit {
    #[serde(default)]
    pub tray: Vec<AmsTrayItem>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AmsTrayItem {
    pub slot: Option<i64>,
    pub tray_type: Option<String>,
    pub tray_color: Option<String>,
    pub remain: Option<f64>,
}

#[derive(Serialize)]
struct StartRequest<'a> {
    device_id: &'a str,
}

fn parse_wifi(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let digits = s.trim().trim_end_matches(|c: char| c.is_ascii_alphabetic()).trim();
            digits.parse::<i64>().ok()
        }
        _ => None,
    }
}

/// Flattens the nested response into a `RawPoll`. Missing state stays absent,
/// missing numbers become 0 and a missing age becomes -1.
pub fn map_snapshot(rt: RealtimeResponse) -> RawPoll {
    let d = rt.data.unwrap_or_default();

    let mut trays = Vec::new();
    for unit in d.ams.map(|a| a.ams).unwrap_or_default() {
        for t in unit.tray {
            let slot = t.slot.unwrap_or(trays.len() as i64);
            trays.push(TrayEntry {
                slot,
                material: t.tray_type,
                color: t.tray_color,
                remaining: t.remain,
            });
        }
    }

    RawPoll {
        state: d.gcode_state,
        progress_pct: d.mc_percent.unwrap_or(0.0),
        eta_s: d.mc_remaining_time,
        nozzle_c: d.nozzle_temper.unwrap_or(0.0),
        nozzle_target_c: d.nozzle_target_temper.unwrap_or(0.0),
        bed_c: d.bed_temper.unwrap_or(0.0),
        bed_target_c: d.bed_target_temper.unwrap_or(0.0),
        layer_current: d.layer_num,
        layer_total: d.total_layer_num,
        wifi_signal_dbm: d.wifi_signal.as_ref().and_then(parse_wifi),
        trays,
        message_count: rt.message_count,
        age_seconds: rt.age_seconds.unwrap_or(-1.0),
        expires_in_secs: rt.expires_in,
    }
}

fn failure<T>(context: &str, resp: ApiResponse<T>) -> UpstreamError {
    let body = resp.error_body.unwrap_or_default();
    match resp.status {
        429 => UpstreamError::RateLimited(context.to_string()),
        404 | 410 => UpstreamError::SessionExpired { status: resp.status },
        status => UpstreamError::Status { status, body },
    }
}

pub struct ProxyClient {
    api: ApiClient,
}

impl ProxyClient {
    pub fn new(options: &ProxyOptions) -> Result<Self, UpstreamError> {
        let token = (!options.api_key.is_empty()).then(|| options.api_key.clone());
        let api = ApiClient::new(&options.base_url, token, options.timeout(), options.max_retries)?;
        Ok(Self { api })
    }
}

#[async_trait]
impl UpstreamApi for ProxyClient {
    async fn list_devices(&self) -> Result<Vec<DeviceListing>, UpstreamError> {
        let resp = self
            .api
            .request::<BindResponse, ()>(Method::GET, BIND_PATH, &[], None)
            .await?;
        if !resp.success {
            warn!(status = resp.status, "GET bind failed");
            return Err(failure("GET bind", resp));
        }
        let bind = resp.data.unwrap_or_default();
        debug!(devices = bind.devices.len(), code = ?bind.code, "bind listing");
        Ok(bind.devices.into_iter().map(DeviceListing::from).collect())
    }

    async fn start_session(&self, device_id: &str) -> Result<bool, UpstreamError> {
        let resp = self
            .api
            .request::<Value, _>(
                Method::POST,
                REALTIME_START_PATH,
                &[],
                Some(&StartRequest { device_id }),
            )
            .await?;
        match resp.status {
            s if (200..300).contains(&s) => Ok(true),
            404 | 410 => Ok(false),
            _ => Err(failure("POST realtime/start", resp)),
        }
    }

    async fn get_snapshot(&self, device_id: &str) -> Result<RawPoll, UpstreamError> {
        let resp = self
            .api
            .request::<RealtimeResponse, ()>(Method::GET, REALTIME_PATH, &[("device_id", device_id)], None)
            .await?;
        if !resp.success {
            return Err(failure("GET realtime", resp));
        }
        Ok(map_snapshot(resp.data.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(v: Value) -> RealtimeResponse {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_map_full_snapshot() {
        let rt = decode(json!({
            "message_count": 12,
            "age_seconds": 1.5,
            "expires_in": 90,
            "data": {
                "gcode_state": "RUNNING",
                "mc_percent": 42,
                "mc_remaining_time": 600,
                "layer_num": 10,
                "total_layer_num": 200,
                "nozzle_temper": 219.6,
                "nozzle_target_temper": 220,
                "bed_temper": 59.9,
                "bed_target_temper": 60,
                "wifi_signal": "-45dBm",
                "ams": { "ams": [
                    { "tray": [
                        { "slot": 0, "tray_type": "PLA", "tray_color": "FFFFFFFF", "remain": 80 },
                        { "tray_type": "PETG" }
                    ]},
                    { "tray": [ { "tray_type": "ABS", "remain": 5.5 } ] }
                ]}
            }
        }));

        let poll = map_snapshot(rt);
        assert_eq!(poll.state.as_deref(), Some("RUNNING"));
        assert_eq!(poll.progress_pct, 42.0);
        assert_eq!(poll.eta_s, Some(600));
        assert_eq!(poll.layer_current, Some(10));
        assert_eq!(poll.layer_total, Some(200));
        assert_eq!(poll.nozzle_target_c, 220.0);
        assert_eq!(poll.wifi_signal_dbm, Some(-45));
        assert_eq!(poll.message_count, Some(12));
        assert_eq!(poll.expires_in_secs, Some(90));
        assert_eq!(poll.age_seconds, 1.5);

        let slots: Vec<i64> = poll.trays.iter().map(|t| t.slot).collect();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(poll.trays[1].material.as_deref(), Some("PETG"));
        assert_eq!(poll.trays[2].remaining, Some(5.5));
    }

    #[test]
    fn test_map_empty_snapshot_defaults() {
        let poll = map_snapshot(decode(json!({})));
        assert!(poll.state.is_none());
        assert_eq!(poll.progress_pct, 0.0);
        assert_eq!(poll.bed_c, 0.0);
        assert_eq!(poll.age_seconds, -1.0);
        assert!(poll.eta_s.is_none());
        assert!(poll.trays.is_empty());
        assert!(poll.expires_in_secs.is_none());
    }

    #[test]
    fn test_wifi_forms() {
        assert_eq!(parse_wifi(&json!(-61)), Some(-61));
        assert_eq!(parse_wifi(&json!(-61.6)), Some(-62));
        assert_eq!(parse_wifi(&json!(" -70 dBm ")), Some(-70));
        assert_eq!(parse_wifi(&json!("weak")), None);
        assert_eq!(parse_wifi(&json!(null)), None);
    }

    #[test]
    fn test_bind_device_listing() {
        let bind: BindResponse = serde_json::from_value(json!({
            "code": "ok",
            "devices": [{
                "dev_id": "01P00A",
                "name": "Lab X1",
                "dev_product_name": "X1 Carbon",
                "dev_model_name": "BL-P001",
                "nozzle_diameter": 0.4,
                "online": true,
                "print_status": "ACTIVE"
            }]
        }))
        .unwrap();

        let listing: Vec<DeviceListing> = bind.devices.into_iter().map(Into::into).collect();
        assert_eq!(listing[0].device_id, "01P00A");
        assert_eq!(listing[0].product.as_deref(), Some("X1 Carbon"));
        assert_eq!(listing[0].online, Some(true));
    }

    #[test]
    fn test_status_classification() {
        let resp = |status| ApiResponse::<()> {
            data: None,
            error_body: Some("nope".into()),
            status,
            success: false,
            headers: Default::default(),
        };
        assert!(failure("x", resp(429)).is_rate_limited());
        assert!(failure("x", resp(410)).is_session_expired());
        assert!(matches!(
            failure("x", resp(502)),
            UpstreamError::Status { status: 502, .. }
        ));
    }
}
