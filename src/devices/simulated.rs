//! Deterministic in-memory plant for dry runs and tests
//!
//! Limits take effect immediately. Each inverter produces
//! `min(limit, available solar)` while reachable and switched on, and the grid
//! meter reads `house load - total output`.

use super::{InverterDriver, InverterInfo, PowerMeterReader};
use crate::config::{Config, DtuConfig};
use crate::error::{Result, ZeroFeedError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

/// Command observed by the simulated gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlantCommand {
    SetLimit { idx: usize, watts: i64 },
    SetPower { idx: usize, on: bool },
}

/// Simulated inverter
#[derive(Debug, Clone)]
pub struct SimInverter {
    pub serial: String,
    pub name: String,
    pub rated_watt: i64,
    pub available: bool,
    pub power_on: bool,
    pub limit_w: i64,
    pub solar_w: i64,
    pub panel_voltage: f64,
    pub temperature: f64,
    /// Whether limit commands are confirmed
    pub acknowledges: bool,
    /// Reject limit commands outright
    pub rejects_limits: bool,
    /// Report this limit instead of the applied one
    pub reported_limit: Option<f64>,
}

impl SimInverter {
    fn output(&self) -> i64 {
        if self.available && self.power_on {
            self.limit_w.min(self.solar_w).max(0)
        } else {
            0
        }
    }
}

#[derive(Debug, Default)]
struct PlantState {
    house_load_w: i64,
    inverters: Vec<SimInverter>,
    commands: Vec<PlantCommand>,
}

/// Shared plant; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct SimulatedPlant {
    state: Arc<Mutex<PlantState>>,
}

impl SimulatedPlant {
    /// Plant with one inverter per entry of `rated_watts`
    pub fn new(rated_watts: &[i64], solar_w: i64, panel_voltage: f64) -> Self {
        let inverters = rated_watts
            .iter()
            .enumerate()
            .map(|(idx, rated)| SimInverter {
                serial: format!("SIM{:04}", idx + 1),
                name: format!("sim-{}", idx + 1),
                rated_watt: *rated,
                available: true,
                power_on: true,
                limit_w: *rated,
                solar_w,
                panel_voltage,
                temperature: 25.0,
                acknowledges: true,
                rejects_limits: false,
                reported_limit: None,
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(PlantState {
                house_load_w: 0,
                inverters,
                commands: Vec::new(),
            })),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let (solar, voltage) = match &config.dtu {
            DtuConfig::Simulated {
                solar_available_w,
                panel_voltage_v,
            } => (*solar_available_w, *panel_voltage_v),
            DtuConfig::OpenDtu { .. } | DtuConfig::Ahoy { .. } => (0, 0.0),
        };
        let rated: Vec<i64> = config.inverters.iter().map(|i| i.rated_watt()).collect();
        let plant = Self::new(&rated, solar, voltage);
        {
            let mut state = plant.lock();
            for (sim, cfg) in state.inverters.iter_mut().zip(&config.inverters) {
                if !cfg.serial_number.is_empty() {
                    sim.serial = cfg.serial_number.clone();
                }
            }
        }
        plant
    }

    fn lock(&self) -> MutexGuard<'_, PlantState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` to one inverter
    pub fn with_inverter<T>(&self, idx: usize, f: impl FnOnce(&mut SimInverter) -> T) -> Option<T> {
        self.lock().inverters.get_mut(idx).map(f)
    }

    pub fn inverter(&self, idx: usize) -> Option<SimInverter> {
        self.lock().inverters.get(idx).cloned()
    }

    pub fn set_house_load(&self, watts: i64) {
        self.lock().house_load_w = watts;
    }

    pub fn set_available(&self, idx: usize, available: bool) {
        self.with_inverter(idx, |inv| inv.available = available);
    }

    pub fn set_panel_voltage(&self, idx: usize, volts: f64) {
        self.with_inverter(idx, |inv| inv.panel_voltage = volts);
    }

    pub fn set_solar(&self, idx: usize, watts: i64) {
        self.with_inverter(idx, |inv| inv.solar_w = watts);
    }

    /// Total inverter output
    pub fn production(&self) -> i64 {
        self.lock().inverters.iter().map(SimInverter::output).sum()
    }

    /// Grid power, positive when importing
    pub fn grid(&self) -> i64 {
        let state = self.lock();
        let production: i64 = state.inverters.iter().map(SimInverter::output).sum();
        state.house_load_w - production
    }

    /// Commands received so far
    pub fn commands(&self) -> Vec<PlantCommand> {
        self.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    fn checked<T>(&self, idx: usize, f: impl FnOnce(&mut SimInverter) -> T) -> Result<T> {
        self.with_inverter(idx, f)
            .ok_or_else(|| ZeroFeedError::communication(format!("No simulated inverter {}", idx)))
    }
}

/// Which quantity a simulated meter reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterRole {
    /// Grid import (positive) or export (negative)
    Grid,
    /// Combined inverter output
    Production,
}

pub struct SimulatedMeter {
    plant: SimulatedPlant,
    role: MeterRole,
}

impl SimulatedMeter {
    pub fn new(plant: SimulatedPlant, role: MeterRole) -> Self {
        Self { plant, role }
    }
}

#[async_trait]
impl PowerMeterReader for SimulatedMeter {
    async fn get_watts(&self) -> Result<i64> {
        Ok(match self.role {
            MeterRole::Grid => self.plant.grid(),
            MeterRole::Production => self.plant.production(),
        })
    }
}

pub struct SimulatedDtu {
    plant: SimulatedPlant,
}

impl SimulatedDtu {
    pub fn new(plant: SimulatedPlant) -> Self {
        Self { plant }
    }

    pub fn plant(&self) -> &SimulatedPlant {
        &self.plant
    }
}

#[async_trait]
impl InverterDriver for SimulatedDtu {
    async fn check_min_version(&self) -> Result<()> {
        Ok(())
    }

    async fn get_available(&self, idx: usize) -> Result<bool> {
        self.plant.checked(idx, |inv| inv.available)
    }

    async fn get_actual_limit_w(&self, idx: usize) -> Result<f64> {
        self.plant
            .checked(idx, |inv| inv.reported_limit.unwrap_or(inv.limit_w as f64))
    }

    async fn get_ac_power(&self, idx: usize) -> Result<i64> {
        self.plant.checked(idx, |inv| inv.output())
    }

    async fn get_info(&self, idx: usize) -> Result<InverterInfo> {
        self.plant.checked(idx, |inv| InverterInfo {
            serial: inv.serial.clone(),
            name: inv.name.clone(),
            temperature: Some(inv.temperature),
        })
    }

    async fn get_temperature(&self, idx: usize) -> Result<f64> {
        self.plant.checked(idx, |inv| inv.temperature)
    }

    async fn get_panel_min_voltage(&self, idx: usize, _excluded: &[usize]) -> Result<f64> {
        self.plant.checked(idx, |inv| inv.panel_voltage)
    }

    async fn set_limit(&self, idx: usize, watts: i64) -> Result<()> {
        let accepted = self.plant.checked(idx, |inv| {
            if inv.rejects_limits {
                false
            } else {
                inv.limit_w = watts;
                inv.reported_limit = None;
                true
            }
        })?;
        self.plant
            .lock()
            .commands
            .push(PlantCommand::SetLimit { idx, watts });
        if accepted {
            Ok(())
        } else {
            Err(ZeroFeedError::command(format!(
                "Simulated inverter {} rejected limit {}",
                idx, watts
            )))
        }
    }

    async fn limit_acknowledged(&self, idx: usize) -> Result<bool> {
        self.plant.checked(idx, |inv| inv.acknowledges)
    }

    async fn set_power_status(&self, idx: usize, on: bool) -> Result<()> {
        self.plant.checked(idx, |inv| inv.power_on = on)?;
        self.plant
            .lock()
            .commands
            .push(PlantCommand::SetPower { idx, on });
        Ok(())
    }
}
