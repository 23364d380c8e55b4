#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use zerofeed::clock::ManualClock;
use zerofeed::config::{Config, InverterConfig};
use zerofeed::devices::simulated::PlantCommand;
use zerofeed::devices::{PowerMeterReader, SimulatedDtu, SimulatedPlant};
use zerofeed::error::{Result, ZeroFeedError};
use zerofeed::{ControllerBuilder, ZeroExportController};

/// Grid meter replaying a script. `None` entries fail the read; the last
/// entry repeats once the script is exhausted.
#[derive(Clone, Default)]
pub struct ScriptedMeter {
    script: Arc<Mutex<VecDeque<Option<i64>>>>,
    last: Arc<Mutex<Option<i64>>>,
    reads: Arc<Mutex<u32>>,
}

impl ScriptedMeter {
    pub fn constant(watts: i64) -> Self {
        let meter = Self::default();
        meter.push(Some(watts));
        meter
    }

    pub fn failing() -> Self {
        let meter = Self::default();
        meter.push(None);
        meter
    }

    pub fn push(&self, reading: Option<i64>) {
        self.script.lock().unwrap().push_back(reading);
    }

    /// Replace the script with a single repeating value
    pub fn set(&self, watts: i64) {
        self.script.lock().unwrap().clear();
        self.push(Some(watts));
    }

    pub fn reads(&self) -> u32 {
        *self.reads.lock().unwrap()
    }
}

#[async_trait]
impl PowerMeterReader for ScriptedMeter {
    async fn get_watts(&self) -> Result<i64> {
        *self.reads.lock().unwrap() += 1;
        let next = self.script.lock().unwrap().pop_front();
        let reading = match next {
            Some(r) => {
                *self.last.lock().unwrap() = r;
                r
            }
            None => *self.last.lock().unwrap(),
        };
        reading.ok_or_else(|| ZeroFeedError::communication("scripted meter failure"))
    }
}

pub fn inverter(max_watt: i64, min_watt_percent: i64) -> InverterConfig {
    InverterConfig {
        max_watt,
        min_watt_percent,
        ..Default::default()
    }
}

pub fn battery_inverter(max_watt: i64, min_watt_percent: i64, priority: u8) -> InverterConfig {
    InverterConfig {
        max_watt,
        min_watt_percent,
        battery_mode: true,
        battery_priority: priority,
        ..Default::default()
    }
}

/// Config with the given inverters and an otherwise default setup
pub fn config_with(inverters: Vec<InverterConfig>) -> Config {
    let mut config = Config {
        inverters,
        ..Default::default()
    };
    config.logging.file = String::new();
    config
}

/// Everything a controller test needs to drive and observe one controller
pub struct Harness {
    pub controller: ZeroExportController,
    pub plant: SimulatedPlant,
    pub meter: ScriptedMeter,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(config: Config, meter: ScriptedMeter) -> Self {
        let rated: Vec<i64> = config.inverters.iter().map(|i| i.rated_watt()).collect();
        let plant = SimulatedPlant::new(&rated, 2000, 50.0);
        Self::with_plant(config, meter, plant)
    }

    pub fn with_plant(config: Config, meter: ScriptedMeter, plant: SimulatedPlant) -> Self {
        let clock = ManualClock::new();
        let controller = ControllerBuilder::new(config)
            .meter(Box::new(meter.clone()))
            .driver(Arc::new(SimulatedDtu::new(plant.clone())))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        Self {
            controller,
            plant,
            meter,
            clock,
        }
    }

    /// Limits sent to the plant, in order
    pub fn limit_commands(&self) -> Vec<(usize, i64)> {
        self.plant
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                PlantCommand::SetLimit { idx, watts } => Some((idx, watts)),
                PlantCommand::SetPower { .. } => None,
            })
            .collect()
    }

    pub fn power_commands(&self) -> Vec<(usize, bool)> {
        self.plant
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                PlantCommand::SetPower { idx, on } => Some((idx, on)),
                PlantCommand::SetLimit { .. } => None,
            })
            .collect()
    }

    pub fn applied_limit(&self, idx: usize) -> i64 {
        self.plant.inverter(idx).unwrap().limit_w
    }
}
