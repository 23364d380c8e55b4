//! AhoyDTU gateway driver
//!
//! Inverters are addressed by their Ahoy id, which is the index in control
//! order. Live values come as positional arrays: `/api/live` names the
//! fields, `/api/inverter/id/{id}` carries one value row per channel, with
//! channel 0 being AC and 1.. the panel inputs.

use super::opendtu::parse_version;
use super::retry::RetryPolicy;
use super::{InverterDriver, InverterInfo};
use crate::error::{Result, ZeroFeedError};
use crate::logging::{StructuredLogger, get_logger};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Oldest firmware with the non-persistent absolute limit command
pub const MIN_VERSION: (u32, u32, u32) = (0, 8, 80);

const PANEL_PRESENT_VOLTAGE: f64 = 5.0;
const PANEL_HISTORY_LEN: usize = 5;

/// Returned by `/api/ctrl` when a password is set and the token is stale
const ERR_PROTECTED: &str = "ERR_PROTECTED";

#[derive(Debug, Deserialize)]
struct FieldNames {
    #[serde(default)]
    ch0_fld_names: Vec<String>,
    #[serde(default)]
    fld_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InverterDetail {
    #[serde(default)]
    serial: Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    power_limit_read: f64,
    #[serde(default)]
    power_limit_ack: bool,
    #[serde(default)]
    ch: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(default)]
    is_avail: bool,
}

#[derive(Debug, Deserialize)]
struct IndexData {
    #[serde(default)]
    inverter: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct CtrlResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: String,
    #[serde(default)]
    token: Option<String>,
}

/// `version` moved under `generic` in later firmware
fn system_version(system: &Value) -> Option<String> {
    system
        .get("version")
        .or_else(|| system.pointer("/generic/version"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn field_index(names: &[String], field: &str) -> Result<usize> {
    names.iter().position(|n| n == field).ok_or_else(|| {
        ZeroFeedError::communication(format!("Ahoy live data has no {} field", field))
    })
}

fn channel_value(detail: &InverterDetail, channel: usize, field: usize) -> Result<f64> {
    detail
        .ch
        .get(channel)
        .and_then(|row| row.get(field))
        .copied()
        .ok_or_else(|| {
            ZeroFeedError::communication(format!(
                "Ahoy channel {} has no value at position {}",
                channel, field
            ))
        })
}

/// Lowest panel voltage above the presence threshold. `excluded` holds Ahoy
/// channel numbers (1 is the first panel). Returns 0 when no input qualifies.
fn panel_min_voltage(detail: &InverterDetail, u_dc: usize, excluded: &[usize]) -> f64 {
    detail
        .ch
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(channel, _)| !excluded.contains(channel))
        .filter_map(|(_, row)| row.get(u_dc).copied())
        .filter(|v| *v > PANEL_PRESENT_VOLTAGE)
        .fold(None, |min: Option<f64>, v| Some(min.map_or(v, |m| m.min(v))))
        .unwrap_or(0.0)
}

fn serial_string(serial: &Value) -> String {
    match serial {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
struct Slot {
    rated_watt: i64,
    voltage_history: VecDeque<f64>,
}

pub struct AhoyDtuDriver {
    base_url: String,
    password: String,
    token: Mutex<String>,
    http: reqwest::Client,
    slots: Mutex<Vec<Slot>>,
    retry: RetryPolicy,
    logger: StructuredLogger,
}

impl AhoyDtuDriver {
    /// `rated_watts` gives the physical rating per inverter in control order
    pub fn new(ip: &str, password: &str, rated_watts: &[i64]) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ZeroFeedError::config(format!("Failed to build HTTP client: {}", e)))?;
        let slots = rated_watts
            .iter()
            .map(|&rated_watt| Slot {
                rated_watt,
                voltage_history: VecDeque::with_capacity(PANEL_HISTORY_LEN),
            })
            .collect();
        Ok(Self {
            base_url: format!("http://{}", ip),
            password: password.to_string(),
            token: Mutex::new(String::new()),
            http,
            slots: Mutex::new(slots),
            retry: RetryPolicy::default(),
            logger: get_logger("ahoy"),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn slot<T>(&self, idx: usize, f: impl FnOnce(&mut Slot) -> T) -> Result<T> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| ZeroFeedError::generic("Ahoy slot table poisoned"))?;
        slots
            .get_mut(idx)
            .map(f)
            .ok_or_else(|| ZeroFeedError::config(format!("Unknown inverter index {}", idx)))
    }

    fn token(&self) -> Result<String> {
        self.token
            .lock()
            .map(|t| t.clone())
            .map_err(|_| ZeroFeedError::generic("Ahoy token poisoned"))
    }

    /// GET a document. Ahoy occasionally answers with a literal `null`,
    /// which is treated as a transient failure.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.as_str();
        let doc = self
            .retry
            .execute(&self.logger, &format!("Ahoy GET {}", path), move || async move {
                let doc: Value = self
                    .http
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                if doc.is_null() {
                    return Err(ZeroFeedError::communication(format!(
                        "Ahoy returned null for {}",
                        url
                    )));
                }
                Ok::<Value, ZeroFeedError>(doc)
            })
            .await?;
        Ok(serde_json::from_value(doc)?)
    }

    async fn post_ctrl(&self, body: &Value) -> Result<CtrlResponse> {
        let url = format!("{}/api/ctrl", self.base_url);
        let url = url.as_str();
        self.retry
            .execute(&self.logger, "Ahoy POST /api/ctrl", move || async move {
                let response = self
                    .http
                    .post(url)
                    .json(body)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok::<CtrlResponse, ZeroFeedError>(response)
            })
            .await
    }

    async fn authenticate(&self) -> Result<()> {
        self.logger.info("Ahoy: Authenticating...");
        let response = self.post_ctrl(&json!({"auth": self.password})).await?;
        if !response.success {
            return Err(ZeroFeedError::command("Ahoy authentication rejected"));
        }
        let token = response.token.unwrap_or_default();
        self.logger.info("Ahoy: Authentication successful");
        let mut guard = self
            .token
            .lock()
            .map_err(|_| ZeroFeedError::generic("Ahoy token poisoned"))?;
        *guard = token;
        Ok(())
    }

    /// Send a control command, authenticating once if the DTU asks for it
    async fn command(&self, idx: usize, cmd: &str, val: Value) -> Result<()> {
        let mut authenticated = false;
        loop {
            let token = self.token()?;
            let body = json!({"cmd": cmd, "val": val, "id": idx, "token": token});
            let response = self.post_ctrl(&body).await?;
            if response.success {
                return Ok(());
            }
            if response.error == ERR_PROTECTED && !authenticated {
                self.authenticate().await?;
                authenticated = true;
                continue;
            }
            return Err(ZeroFeedError::command(format!(
                "Ahoy {} rejected: {}",
                cmd, response.error
            )));
        }
    }

    async fn detail(&self, idx: usize) -> Result<InverterDetail> {
        self.get_json(&format!("/api/inverter/id/{}", idx)).await
    }

    async fn live_value(&self, idx: usize, field: &str) -> Result<f64> {
        let names: FieldNames = self.get_json("/api/live").await?;
        let pos = field_index(&names.ch0_fld_names, field)?;
        let detail = self.detail(idx).await?;
        channel_value(&detail, 0, pos)
    }
}

#[async_trait]
impl InverterDriver for AhoyDtuDriver {
    async fn check_min_version(&self) -> Result<()> {
        let system: Value = self.get_json("/api/system").await?;
        let version = system_version(&system)
            .ok_or_else(|| ZeroFeedError::communication("Ahoy system info has no version"))?;
        self.logger
            .info(&format!("Ahoy: Current Version: {}", version));
        let parsed = parse_version(&version).ok_or_else(|| {
            ZeroFeedError::communication(format!("Unrecognized Ahoy version {}", version))
        })?;
        if parsed < MIN_VERSION {
            return Err(ZeroFeedError::config(format!(
                "Ahoy version {} is too old, at least {}.{}.{} is required",
                version, MIN_VERSION.0, MIN_VERSION.1, MIN_VERSION.2
            )));
        }
        Ok(())
    }

    async fn get_available(&self, idx: usize) -> Result<bool> {
        let index: IndexData = self.get_json("/api/index").await?;
        let available = index
            .inverter
            .get(idx)
            .map(|e| e.is_avail)
            .ok_or_else(|| ZeroFeedError::communication(format!("Ahoy lists no inverter {}", idx)))?;
        self.logger
            .info(&format!("Ahoy: Inverter {} Available: {}", idx, available));
        Ok(available)
    }

    async fn get_actual_limit_w(&self, idx: usize) -> Result<f64> {
        let rated = self.slot(idx, |s| s.rated_watt)?;
        let detail = self.detail(idx).await?;
        Ok(rated as f64 * detail.power_limit_read / 100.0)
    }

    async fn get_ac_power(&self, idx: usize) -> Result<i64> {
        Ok(self.live_value(idx, "P_AC").await? as i64)
    }

    async fn get_info(&self, idx: usize) -> Result<InverterInfo> {
        let names: FieldNames = self.get_json("/api/live").await?;
        let detail = self.detail(idx).await?;
        let temperature = field_index(&names.ch0_fld_names, "Temp")
            .and_then(|pos| channel_value(&detail, 0, pos))
            .ok();
        let info = InverterInfo {
            serial: serial_string(&detail.serial),
            name: detail.name.clone(),
            temperature,
        };
        self.logger.info(&format!(
            "Ahoy: Inverter \"{}\" / serial number \"{}\" / temperature {:?}",
            info.name, info.serial, info.temperature
        ));
        Ok(info)
    }

    async fn get_temperature(&self, idx: usize) -> Result<f64> {
        self.live_value(idx, "Temp").await
    }

    async fn get_panel_min_voltage(&self, idx: usize, excluded: &[usize]) -> Result<f64> {
        let names: FieldNames = self.get_json("/api/live").await?;
        let u_dc = field_index(&names.fld_names, "U_DC")?;
        let detail = self.detail(idx).await?;
        let min_vdc = panel_min_voltage(&detail, u_dc, excluded);
        self.slot(idx, |s| {
            s.voltage_history.push_back(min_vdc);
            while s.voltage_history.len() > PANEL_HISTORY_LEN {
                s.voltage_history.pop_front();
            }
            s.voltage_history.iter().copied().fold(f64::MIN, f64::max)
        })
    }

    async fn set_limit(&self, idx: usize, watts: i64) -> Result<()> {
        self.logger.info(&format!(
            "Ahoy: Inverter {}: setting limit to {} Watt",
            idx, watts
        ));
        self.command(idx, "limit_nonpersistent_absolute", json!(watts))
            .await
    }

    async fn limit_acknowledged(&self, idx: usize) -> Result<bool> {
        Ok(self.detail(idx).await?.power_limit_ack)
    }

    async fn set_power_status(&self, idx: usize, on: bool) -> Result<()> {
        self.logger.info(&format!(
            "Ahoy: Inverter {}: Turn {}",
            idx,
            if on { "on" } else { "off" }
        ));
        self.command(idx, "power", json!(u8::from(on))).await
    }
}
