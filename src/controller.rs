//! Zero-export control loop
//!
//! [`ZeroExportController`] owns the inverter registry, the aggregate control
//! state and every collaborator. Its behaviour is split across sub-modules:
//!
//! - `availability`: reachability polling and reconnect reset
//! - `battery`: panel-voltage hysteresis and power switching
//! - `allocator`: splitting the aggregate budget across inverters
//! - `consistency`: resending limits the devices lost
//! - `feedback`: the per-iteration grid feedback loop

use crate::clock::{Clock, TokioClock};
use crate::config::{Config, ConfigProvider, ControlConfig, StaticConfigProvider};
use crate::devices::{Collaborators, InverterDriver, PowerMeterReader};
use crate::error::{Result, ZeroFeedError};
use crate::inverter::{AggregateControlState, InverterRegistry};
use crate::logging::{StructuredLogger, get_logger};
use crate::telemetry::{NullPublisher, TelemetryPublisher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub mod allocator;
mod availability;
mod battery;
mod consistency;
pub mod feedback;

pub use allocator::{AllocationPlan, PlannedLimit, plan_allocation};
pub use feedback::{BandInputs, jump_candidate};

/// The controller; see the module documentation
pub struct ZeroExportController {
    registry: InverterRegistry,
    aggregate: AggregateControlState,
    meter: Box<dyn PowerMeterReader>,
    intermediate: Option<Box<dyn PowerMeterReader>>,
    driver: Arc<dyn InverterDriver>,
    provider: Box<dyn ConfigProvider>,
    telemetry: Arc<dyn TelemetryPublisher>,
    clock: Arc<dyn Clock>,
    control: ControlConfig,
    /// Aggregate budget carried between iterations
    setpoint: i64,
    logger: StructuredLogger,
}

/// Assembles a [`ZeroExportController`]
pub struct ControllerBuilder {
    config: Config,
    meter: Option<Box<dyn PowerMeterReader>>,
    intermediate: Option<Box<dyn PowerMeterReader>>,
    driver: Option<Arc<dyn InverterDriver>>,
    provider: Option<Box<dyn ConfigProvider>>,
    telemetry: Option<Arc<dyn TelemetryPublisher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ControllerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            meter: None,
            intermediate: None,
            driver: None,
            provider: None,
            telemetry: None,
            clock: None,
        }
    }

    pub fn meter(mut self, meter: Box<dyn PowerMeterReader>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn intermediate_meter(mut self, meter: Box<dyn PowerMeterReader>) -> Self {
        self.intermediate = Some(meter);
        self
    }

    pub fn driver(mut self, driver: Arc<dyn InverterDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Take meters and driver from a factory result
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.meter = Some(collaborators.meter);
        self.intermediate = collaborators.intermediate;
        self.driver = Some(collaborators.driver);
        self
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetryPublisher>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<ZeroExportController> {
        self.config.validate()?;
        let meter = self
            .meter
            .ok_or_else(|| ZeroFeedError::config("No grid power meter configured"))?;
        let driver = self
            .driver
            .ok_or_else(|| ZeroFeedError::config("No inverter driver configured"))?;
        let provider = self
            .provider
            .unwrap_or_else(|| Box::new(StaticConfigProvider::from_config(&self.config)));

        Ok(ZeroExportController {
            registry: InverterRegistry::from_config(&self.config),
            aggregate: AggregateControlState::default(),
            meter,
            intermediate: self.intermediate,
            driver,
            provider,
            telemetry: self.telemetry.unwrap_or_else(|| Arc::new(NullPublisher)),
            clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock::new())),
            control: self.config.control.clone(),
            setpoint: 0,
            logger: get_logger("controller"),
        })
    }
}

impl ZeroExportController {
    pub fn builder(config: Config) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    pub fn registry(&self) -> &InverterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut InverterRegistry {
        &mut self.registry
    }

    pub fn aggregate(&self) -> AggregateControlState {
        self.aggregate
    }

    /// Aggregate budget the next iteration starts from
    pub fn setpoint(&self) -> i64 {
        self.setpoint
    }

    pub fn set_setpoint(&mut self, watts: i64) {
        self.setpoint = watts;
    }

    fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.control.loop_interval_seconds)
    }

    fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.control.set_limit_timeout_seconds)
    }

    /// Startup sequence: version check, switch everything on, apply the
    /// minimum and read the meters once. Failures are logged and followed by
    /// one loop-interval pause.
    pub async fn initialize(&mut self) {
        self.logger.info("---Init---");
        if let Err(e) = self.try_initialize().await {
            self.logger.error(&format!("Initialization failed: {}", e));
            self.clock.sleep(self.loop_interval()).await;
        }
        self.logger.info("---Start Zero Export---");
    }

    async fn try_initialize(&mut self) -> Result<()> {
        self.setpoint = 0;
        self.driver.check_min_version().await?;
        self.registry.apply_tunables(self.provider.tunables());
        if self.refresh_availability().await {
            for idx in self.registry.ids() {
                self.set_power_status(idx, true).await?;
            }
            self.setpoint = self.registry.min_sum();
            self.apply_limit(self.setpoint).await;
            self.actual_output().await?;
            self.check_battery().await;
        }
        self.read_grid().await?;
        Ok(())
    }

    /// Run iterations until `shutdown` turns true. The flag is checked
    /// between iterations.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.initialize().await;
        loop {
            if *shutdown.borrow_and_update() {
                self.logger.info("Shutdown requested, leaving control loop");
                return Ok(());
            }
            if let Err(e) = self.run_iteration().await {
                self.logger.error(&format!("Iteration failed: {}", e));
                self.clock.sleep(self.loop_interval()).await;
            }
        }
    }
}
