//! OpenDTU gateway driver
//!
//! Talks to the OpenDTU REST API. Limits are sent as a percentage of the
//! inverter's rated power; the device reports them back the same way.

use super::retry::RetryPolicy;
use super::{InverterDriver, InverterInfo};
use crate::error::{Result, ZeroFeedError};
use crate::logging::{StructuredLogger, get_logger};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Oldest firmware whose limit API behaves as expected
pub const MIN_VERSION: (u32, u32, u32) = (24, 2, 12);

/// Panel readings at or below this are treated as a disconnected input
const PANEL_PRESENT_VOLTAGE: f64 = 5.0;

/// Number of per-call minima kept for the panel voltage peak hold
const PANEL_HISTORY_LEN: usize = 5;

#[derive(Debug, Deserialize)]
struct Measurement {
    v: f64,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelValues {
    #[serde(rename = "Power")]
    power: Option<Measurement>,
    #[serde(rename = "Voltage")]
    voltage: Option<Measurement>,
    #[serde(rename = "Temperature")]
    temperature: Option<Measurement>,
}

#[derive(Debug, Deserialize)]
struct LiveInverter {
    #[serde(default)]
    serial: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    reachable: bool,
    #[serde(rename = "AC", default)]
    ac: BTreeMap<String, ChannelValues>,
    #[serde(rename = "DC", default)]
    dc: BTreeMap<String, ChannelValues>,
    #[serde(rename = "INV", default)]
    inv: BTreeMap<String, ChannelValues>,
}

#[derive(Debug, Deserialize)]
struct LiveData {
    inverters: Vec<LiveInverter>,
}

#[derive(Debug, Deserialize)]
struct LimitStatus {
    limit_relative: f64,
    limit_set_status: String,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SystemStatus {
    git_hash: String,
}

/// Static data the driver needs per inverter
#[derive(Debug, Clone)]
pub struct InverterSlot {
    serial: String,
    rated_watt: i64,
    voltage_history: VecDeque<f64>,
}

impl InverterSlot {
    pub fn new(serial: &str, rated_watt: i64) -> Self {
        Self {
            serial: serial.to_string(),
            rated_watt,
            voltage_history: VecDeque::with_capacity(PANEL_HISTORY_LEN),
        }
    }
}

/// Parse an OpenDTU `git_hash` such as `v24.5.27` or `v24.5.27-Database`
pub fn parse_version(git_hash: &str) -> Option<(u32, u32, u32)> {
    let trimmed = git_hash.trim().trim_start_matches('v');
    let core = trimmed.split('-').next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next()??;
    let patch = parts.next()??;
    Some((major, minor, patch))
}

/// Convert watts into the integer percentage OpenDTU expects
pub fn relative_limit(watts: i64, rated_watt: i64) -> i64 {
    if rated_watt <= 0 {
        return 0;
    }
    (watts as f64 / rated_watt as f64 * 100.0) as i64
}

/// Lowest DC voltage above the presence threshold, ignoring excluded inputs.
/// Returns 0 when no input qualifies.
fn panel_min_voltage(inverter: &LiveInverter, excluded: &[usize]) -> f64 {
    inverter
        .dc
        .iter()
        .filter(|(key, _)| {
            key.parse::<usize>()
                .map(|idx| !excluded.contains(&idx))
                .unwrap_or(true)
        })
        .filter_map(|(_, ch)| ch.voltage.as_ref().map(|m| m.v))
        .filter(|v| *v > PANEL_PRESENT_VOLTAGE)
        .fold(None, |min: Option<f64>, v| Some(min.map_or(v, |m| m.min(v))))
        .unwrap_or(0.0)
}

pub struct OpenDtuDriver {
    base_url: String,
    user: String,
    password: String,
    http: reqwest::Client,
    slots: Mutex<Vec<InverterSlot>>,
    retry: RetryPolicy,
    logger: StructuredLogger,
}

impl OpenDtuDriver {
    pub fn new(ip: &str, user: &str, password: &str, slots: Vec<InverterSlot>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ZeroFeedError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: format!("http://{}", ip),
            user: user.to_string(),
            password: password.to_string(),
            http,
            slots: Mutex::new(slots),
            retry: RetryPolicy::default(),
            logger: get_logger("opendtu"),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn slot<T>(&self, idx: usize, f: impl FnOnce(&mut InverterSlot) -> T) -> Result<T> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| ZeroFeedError::generic("OpenDTU slot table poisoned"))?;
        slots
            .get_mut(idx)
            .map(f)
            .ok_or_else(|| ZeroFeedError::config(format!("Unknown inverter index {}", idx)))
    }

    fn serial(&self, idx: usize) -> Result<String> {
        self.slot(idx, |s| s.serial.clone())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.as_str();
        self.retry
            .execute(&self.logger, &format!("OpenDTU GET {}", path), move || async move {
                let body = self
                    .http
                    .get(url)
                    .basic_auth(&self.user, Some(&self.password))
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<T>()
                    .await?;
                Ok::<T, ZeroFeedError>(body)
            })
            .await
    }

    async fn post_command(&self, path: &str, data: serde_json::Value) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let payload = data.to_string();
        let (url, payload) = (url.as_str(), payload.as_str());
        let response: CommandResponse = self
            .retry
            .execute(&self.logger, &format!("OpenDTU POST {}", path), move || async move {
                let response = self
                    .http
                    .post(url)
                    .basic_auth(&self.user, Some(&self.password))
                    .form(&[("data", payload)])
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok::<CommandResponse, ZeroFeedError>(response)
            })
            .await?;
        if response.kind != "success" {
            return Err(ZeroFeedError::command(format!(
                "{} rejected: {}",
                path, response.message
            )));
        }
        Ok(())
    }

    async fn live_inverter(&self, idx: usize) -> Result<LiveInverter> {
        let serial = self.serial(idx)?;
        let data: LiveData = self
            .get_json(&format!("/api/livedata/status?inv={}", serial))
            .await?;
        data.inverters.into_iter().next().ok_or_else(|| {
            ZeroFeedError::communication(format!("No live data for inverter {}", serial))
        })
    }

    async fn limit_status(&self, idx: usize) -> Result<LimitStatus> {
        let serial = self.serial(idx)?;
        let mut all: HashMap<String, LimitStatus> = self.get_json("/api/limit/status").await?;
        all.remove(&serial).ok_or_else(|| {
            ZeroFeedError::communication(format!("No limit status for inverter {}", serial))
        })
    }
}

#[async_trait]
impl InverterDriver for OpenDtuDriver {
    async fn check_min_version(&self) -> Result<()> {
        let status: SystemStatus = self.get_json("/api/system/status").await?;
        self.logger
            .info(&format!("OpenDTU: Current Version: {}", status.git_hash));
        let version = parse_version(&status.git_hash).ok_or_else(|| {
            ZeroFeedError::communication(format!("Unrecognized OpenDTU version {}", status.git_hash))
        })?;
        if version < MIN_VERSION {
            return Err(ZeroFeedError::config(format!(
                "OpenDTU version {} is too old, at least v{}.{}.{} is required",
                status.git_hash, MIN_VERSION.0, MIN_VERSION.1, MIN_VERSION.2
            )));
        }
        Ok(())
    }

    async fn get_available(&self, idx: usize) -> Result<bool> {
        let inverter = self.live_inverter(idx).await?;
        self.logger.info(&format!(
            "OpenDTU: Inverter \"{}\" reachable: {}",
            inverter.name, inverter.reachable
        ));
        Ok(inverter.reachable)
    }

    async fn get_actual_limit_w(&self, idx: usize) -> Result<f64> {
        let status = self.limit_status(idx).await?;
        let rated = self.slot(idx, |s| s.rated_watt)?;
        Ok(rated as f64 * status.limit_relative / 100.0)
    }

    async fn get_ac_power(&self, idx: usize) -> Result<i64> {
        let inverter = self.live_inverter(idx).await?;
        inverter
            .ac
            .get("0")
            .and_then(|ch| ch.power.as_ref())
            .map(|m| m.v as i64)
            .ok_or_else(|| ZeroFeedError::communication("Live data has no AC power"))
    }

    async fn get_info(&self, idx: usize) -> Result<InverterInfo> {
        if self.serial(idx)?.is_empty() {
            let data: LiveData = self.get_json("/api/livedata/status").await?;
            let serial = data
                .inverters
                .get(idx)
                .map(|inv| inv.serial.clone())
                .ok_or_else(|| {
                    ZeroFeedError::communication(format!("OpenDTU lists no inverter at {}", idx))
                })?;
            self.slot(idx, |s| s.serial = serial.clone())?;
        }

        let inverter = self.live_inverter(idx).await?;
        let temperature = inverter
            .inv
            .get("0")
            .and_then(|ch| ch.temperature.as_ref())
            .map(|m| (m.v * 10.0).round() / 10.0);
        let info = InverterInfo {
            serial: self.serial(idx)?,
            name: inverter.name,
            temperature,
        };
        self.logger.info(&format!(
            "OpenDTU: Inverter \"{}\" / serial number \"{}\"",
            info.name, info.serial
        ));
        Ok(info)
    }

    async fn get_temperature(&self, idx: usize) -> Result<f64> {
        let inverter = self.live_inverter(idx).await?;
        inverter
            .inv
            .get("0")
            .and_then(|ch| ch.temperature.as_ref())
            .map(|m| (m.v * 10.0).round() / 10.0)
            .ok_or_else(|| ZeroFeedError::communication("Live data has no temperature"))
    }

    async fn get_panel_min_voltage(&self, idx: usize, excluded: &[usize]) -> Result<f64> {
        let inverter = self.live_inverter(idx).await?;
        let min_vdc = panel_min_voltage(&inverter, excluded);
        // Peak-hold over the last few minima smooths MPPT dips.
        self.slot(idx, |s| {
            s.voltage_history.push_back(min_vdc);
            while s.voltage_history.len() > PANEL_HISTORY_LEN {
                s.voltage_history.pop_front();
            }
            s.voltage_history.iter().copied().fold(f64::MIN, f64::max)
        })
    }

    async fn set_limit(&self, idx: usize, watts: i64) -> Result<()> {
        let (serial, rated) = self.slot(idx, |s| (s.serial.clone(), s.rated_watt))?;
        let relative = relative_limit(watts, rated);
        self.logger.info(&format!(
            "OpenDTU: Inverter \"{}\": setting limit to {} Watt ({} %)",
            serial, watts, relative
        ));
        self.post_command(
            "/api/limit/config",
            serde_json::json!({"serial": serial, "limit_type": 1, "limit_value": relative}),
        )
        .await
    }

    async fn limit_acknowledged(&self, idx: usize) -> Result<bool> {
        let status = self.limit_status(idx).await?;
        Ok(status.limit_set_status == "Ok")
    }

    async fn set_power_status(&self, idx: usize, on: bool) -> Result<()> {
        let serial = self.serial(idx)?;
        self.logger.info(&format!(
            "OpenDTU: Inverter \"{}\": Turn {}",
            serial,
            if on { "on" } else { "off" }
        ));
        self.post_command(
            "/api/power/config",
            serde_json::json!({"serial": serial, "power": on}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("v24.2.12"), Some((24, 2, 12)));
        assert_eq!(parse_version("v24.5.27-Database"), Some((24, 5, 27)));
        assert_eq!(parse_version("abc123"), None);
        assert!(parse_version("v24.1.30").unwrap() < MIN_VERSION);
        assert!(parse_version("v24.10.1").unwrap() > MIN_VERSION);
    }

    #[test]
    fn relative_limit_truncates() {
        assert_eq!(relative_limit(300, 800), 37);
        assert_eq!(relative_limit(800, 800), 100);
        assert_eq!(relative_limit(10, 0), 0);
    }

    #[test]
    fn panel_minimum_skips_excluded_and_dark_inputs() {
        let live: LiveData = serde_json::from_value(serde_json::json!({
            "inverters": [{
                "serial": "1141",
                "name": "garage",
                "reachable": true,
                "DC": {
                    "0": {"Voltage": {"v": 48.2}},
                    "1": {"Voltage": {"v": 46.9}},
                    "2": {"Voltage": {"v": 2.0}},
                    "3": {"Voltage": {"v": 30.0}}
                }
            }]
        }))
        .unwrap();
        let inv = &live.inverters[0];
        assert!((panel_min_voltage(inv, &[3]) - 46.9).abs() < 1e-9);
        assert!((panel_min_voltage(inv, &[1, 3]) - 48.2).abs() < 1e-9);
        assert_eq!(panel_min_voltage(inv, &[0, 1, 3]), 0.0);
    }

    #[test]
    fn limit_status_document() {
        let all: HashMap<String, LimitStatus> = serde_json::from_value(serde_json::json!({
            "1141": {"limit_relative": 37.5, "max_power": 800, "limit_set_status": "Ok"}
        }))
        .unwrap();
        assert_eq!(all["1141"].limit_set_status, "Ok");
        assert!((all["1141"].limit_relative - 37.5).abs() < 1e-9);
    }
}
