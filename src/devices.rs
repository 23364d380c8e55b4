//! Device collaborators: grid meters and the inverter gateway
//!
//! The controller only sees [`PowerMeterReader`] and [`InverterDriver`]. The
//! concrete implementation is selected from configuration by
//! [`build_collaborators`].

use crate::clock::Clock;
use crate::config::{Config, DtuConfig, PowermeterConfig};
use crate::error::{Result, ZeroFeedError};
use crate::logging::StructuredLogger;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod ahoy;
pub mod http_meter;
pub mod modbus_meter;
pub mod opendtu;
pub mod retry;
pub mod simulated;

pub use ahoy::AhoyDtuDriver;
pub use http_meter::HttpJsonMeter;
pub use modbus_meter::ModbusTcpMeter;
pub use opendtu::OpenDtuDriver;
pub use retry::RetryPolicy;
pub use simulated::{MeterRole, SimulatedDtu, SimulatedMeter, SimulatedPlant};

/// Granularity of acknowledgment polling
pub const ACK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Grid power source. Positive values mean import from the grid.
#[async_trait]
pub trait PowerMeterReader: Send + Sync {
    async fn get_watts(&self) -> Result<i64>;
}

/// Identity reported by the gateway for one inverter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InverterInfo {
    pub serial: String,
    pub name: String,
    pub temperature: Option<f64>,
}

/// Inverter gateway, addressed by inverter index in control order
#[async_trait]
pub trait InverterDriver: Send + Sync {
    /// Fails when the gateway firmware is too old to be driven
    async fn check_min_version(&self) -> Result<()>;

    async fn get_available(&self, idx: usize) -> Result<bool>;

    /// Limit currently applied by the device, in watts
    async fn get_actual_limit_w(&self, idx: usize) -> Result<f64>;

    /// Live AC output in watts
    async fn get_ac_power(&self, idx: usize) -> Result<i64>;

    async fn get_info(&self, idx: usize) -> Result<InverterInfo>;

    async fn get_temperature(&self, idx: usize) -> Result<f64>;

    /// Lowest DC input voltage, ignoring the `excluded` input indices
    async fn get_panel_min_voltage(&self, idx: usize, excluded: &[usize]) -> Result<f64>;

    async fn set_limit(&self, idx: usize, watts: i64) -> Result<()>;

    /// Whether the last limit command has been confirmed by the device
    async fn limit_acknowledged(&self, idx: usize) -> Result<bool>;

    async fn set_power_status(&self, idx: usize, on: bool) -> Result<()>;
}

/// Poll `limit_acknowledged` every [`ACK_POLL_INTERVAL`] until it reports
/// true or `timeout` has elapsed on `clock`.
///
/// Returns [`ZeroFeedError::AcknowledgmentTimeout`] when the deadline passes
/// and the driver's error when polling itself fails.
pub async fn wait_for_ack(
    driver: &dyn InverterDriver,
    clock: &dyn Clock,
    idx: usize,
    timeout: Duration,
    logger: &StructuredLogger,
) -> Result<()> {
    let deadline = clock.now() + timeout;
    while clock.now() < deadline {
        clock.sleep(ACK_POLL_INTERVAL).await;
        match driver.limit_acknowledged(idx).await {
            Ok(true) => {
                logger.info("Limit acknowledged");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                logger.error(&format!("Acknowledgment polling failed: {}", e));
                return Err(e);
            }
        }
    }
    logger.info("Limit timeout!");
    Err(ZeroFeedError::ack_timeout(format!(
        "inverter {} did not confirm within {:?}",
        idx, timeout
    )))
}

/// Meters and gateway selected by configuration
pub struct Collaborators {
    pub meter: Box<dyn PowerMeterReader>,
    pub intermediate: Option<Box<dyn PowerMeterReader>>,
    pub driver: Arc<dyn InverterDriver>,
    /// Shared in-memory plant, present when any collaborator is simulated
    pub plant: Option<SimulatedPlant>,
}

/// Build one meter. Simulated meters read from `plant`; network meters
/// retry failed reads according to `retry`.
pub fn build_power_meter(
    config: &PowermeterConfig,
    role: MeterRole,
    plant: &SimulatedPlant,
    retry: &RetryPolicy,
) -> Result<Box<dyn PowerMeterReader>> {
    Ok(match config {
        PowermeterConfig::ModbusTcp {
            ip,
            port,
            unit_id,
            register,
            register_type,
            register_scale,
        } => Box::new(
            ModbusTcpMeter::new(
                ip,
                *port,
                *unit_id,
                *register,
                (*register_type).into(),
                *register_scale,
            )
            .with_retry(retry.clone()),
        ),
        PowermeterConfig::HttpJson {
            url,
            user,
            password,
            power_pointer,
            import_pointer,
            export_pointer,
        } => Box::new(
            HttpJsonMeter::new(
                url,
                user.clone(),
                password.clone(),
                http_meter::ValueSource::from_pointers(
                    power_pointer.as_deref(),
                    import_pointer.as_deref(),
                    export_pointer.as_deref(),
                )?,
            )?
            .with_retry(retry.clone()),
        ),
        PowermeterConfig::Simulated { house_load_w } => {
            if role == MeterRole::Grid {
                plant.set_house_load(*house_load_w);
            }
            Box::new(SimulatedMeter::new(plant.clone(), role))
        }
    })
}

/// Build the gateway driver for all configured inverters
pub fn build_inverter_driver(
    config: &Config,
    plant: &SimulatedPlant,
) -> Result<Arc<dyn InverterDriver>> {
    let retry = RetryPolicy::from_control(&config.control);
    Ok(match &config.dtu {
        DtuConfig::OpenDtu { ip, user, password } => {
            let slots = config
                .inverters
                .iter()
                .map(|inv| opendtu::InverterSlot::new(&inv.serial_number, inv.rated_watt()))
                .collect();
            Arc::new(OpenDtuDriver::new(ip, user, password, slots)?.with_retry(retry))
        }
        DtuConfig::Ahoy { ip, password } => {
            let rated: Vec<i64> = config.inverters.iter().map(|inv| inv.rated_watt()).collect();
            Arc::new(AhoyDtuDriver::new(ip, password, &rated)?.with_retry(retry))
        }
        DtuConfig::Simulated { .. } => Arc::new(SimulatedDtu::new(plant.clone())),
    })
}

/// Build every collaborator named in `config`
pub fn build_collaborators(config: &Config) -> Result<Collaborators> {
    let plant = SimulatedPlant::from_config(config);
    let retry = RetryPolicy::from_control(&config.control);
    let driver = build_inverter_driver(config, &plant)?;
    let meter = build_power_meter(&config.powermeter, MeterRole::Grid, &plant, &retry)?;
    let intermediate = config
        .intermediate_meter
        .as_ref()
        .map(|m| build_power_meter(m, MeterRole::Production, &plant, &retry))
        .transpose()?;

    let simulated = matches!(config.dtu, DtuConfig::Simulated { .. })
        || matches!(config.powermeter, PowermeterConfig::Simulated { .. })
        || matches!(
            config.intermediate_meter,
            Some(PowermeterConfig::Simulated { .. })
        );

    Ok(Collaborators {
        meter,
        intermediate,
        driver,
        plant: simulated.then_some(plant),
    })
}
