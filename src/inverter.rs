//! Inverter registry: static per-inverter data plus mutable runtime state
//!
//! All aggregate sums only count inverters that are *eligible*: reachable and
//! not switched off by the battery guard.

use crate::config::{Config, InverterConfig, Tunables};
use std::collections::VecDeque;

/// Battery voltage thresholds in volts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryThresholds {
    pub off: f64,
    pub reduce: f64,
    pub normal: f64,
    pub on: f64,
}

/// Immutable per-inverter data, built once from configuration
#[derive(Debug, Clone)]
pub struct InverterSpec {
    pub id: usize,
    pub enabled: bool,
    /// Physical rating in watts
    pub rated_watt: i64,
    /// Configured ceiling at startup
    pub configured_max_watt: i64,
    pub compensate_watt_factor: f64,
    pub battery_mode: bool,
    pub thresholds: BatteryThresholds,
    pub ignore_panels: Vec<usize>,
    pub average_count: usize,
    pub configured_serial: String,
}

impl InverterSpec {
    pub fn from_config(id: usize, cfg: &InverterConfig) -> Self {
        Self {
            id,
            enabled: cfg.enabled,
            rated_watt: cfg.rated_watt(),
            configured_max_watt: cfg.max_watt,
            compensate_watt_factor: cfg.compensate_watt_factor,
            battery_mode: cfg.battery_mode,
            thresholds: BatteryThresholds {
                off: cfg.battery_threshold_off_v,
                reduce: cfg.battery_threshold_reduce_v,
                normal: cfg.battery_threshold_normal_v,
                on: cfg.battery_threshold_on_v,
            },
            ignore_panels: cfg.battery_ignore_panels.clone(),
            average_count: cfg.battery_average_count.max(1),
            configured_serial: cfg.serial_number.clone(),
        }
    }
}

/// Mutable per-inverter state, owned by the controller
#[derive(Debug, Clone)]
pub struct InverterRuntimeState {
    pub available: bool,
    /// Eligible for allocation (always true for non-battery inverters)
    pub good_voltage: bool,
    /// Current derating ceiling in watts
    pub max_watt: i64,
    /// Last limit accepted by the driver; `None` until the first command
    pub commanded_limit: Option<i64>,
    pub last_ack: bool,
    /// Recent averaged-input samples of the minimum panel voltage
    pub voltage_history: VecDeque<f64>,
    pub temperature: Option<f64>,
    pub serial: String,
    pub name: String,
    pub last_power_status: bool,
    pub same_power_status_count: u32,
    /// Hot-reloadable values for this iteration
    pub min_watt_percent: i64,
    pub battery_priority: u8,
}

impl InverterRuntimeState {
    fn new(spec: &InverterSpec, cfg: &InverterConfig) -> Self {
        Self {
            available: false,
            good_voltage: true,
            max_watt: spec.configured_max_watt,
            commanded_limit: None,
            last_ack: false,
            voltage_history: VecDeque::with_capacity(spec.average_count),
            temperature: None,
            serial: spec.configured_serial.clone(),
            name: String::from("yet unknown"),
            last_power_status: false,
            same_power_status_count: 0,
            min_watt_percent: cfg.min_watt_percent,
            battery_priority: cfg.battery_priority,
        }
    }

    /// Forget everything learned while the inverter was last reachable
    pub fn reset_on_reconnect(&mut self) {
        self.last_ack = false;
        self.commanded_limit = None;
        self.voltage_history.clear();
        self.good_voltage = true;
        self.temperature = None;
        self.last_power_status = false;
        self.same_power_status_count = 0;
    }
}

/// Last aggregate budget issued and whether every inverter confirmed it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateControlState {
    pub last_limit: Option<i64>,
    pub last_ack: bool,
}

impl AggregateControlState {
    /// Force the next allocation to be dispatched even with an unchanged budget
    pub fn invalidate(&mut self) {
        self.last_limit = None;
        self.last_ack = false;
    }

    /// Whether `budget` was already issued and confirmed
    pub fn is_settled_at(&self, budget: i64) -> bool {
        self.last_limit == Some(budget) && self.last_ack
    }
}

#[derive(Debug, Clone)]
pub struct InverterRegistry {
    specs: Vec<InverterSpec>,
    states: Vec<InverterRuntimeState>,
}

impl InverterRegistry {
    pub fn from_config(config: &Config) -> Self {
        let specs: Vec<InverterSpec> = config
            .inverters
            .iter()
            .enumerate()
            .map(|(id, cfg)| InverterSpec::from_config(id, cfg))
            .collect();
        let states = specs
            .iter()
            .zip(&config.inverters)
            .map(|(spec, cfg)| InverterRuntimeState::new(spec, cfg))
            .collect();
        Self { specs, states }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn ids(&self) -> std::ops::Range<usize> {
        0..self.specs.len()
    }

    pub fn spec(&self, idx: usize) -> &InverterSpec {
        &self.specs[idx]
    }

    pub fn state(&self, idx: usize) -> &InverterRuntimeState {
        &self.states[idx]
    }

    pub fn state_mut(&mut self, idx: usize) -> &mut InverterRuntimeState {
        &mut self.states[idx]
    }

    /// Copy this iteration's hot-reloadable values into the runtime state
    pub fn apply_tunables(&mut self, tunables: &Tunables) {
        for (idx, state) in self.states.iter_mut().enumerate() {
            if let Some(t) = tunables.inverters.get(idx) {
                state.min_watt_percent = t.min_watt_percent;
                state.battery_priority = t.battery_priority;
            }
        }
    }

    pub fn is_eligible(&self, idx: usize) -> bool {
        let s = &self.states[idx];
        s.available && s.good_voltage
    }

    /// Minimum limit: a share of the physical rating, truncated
    pub fn min_watt(&self, idx: usize) -> i64 {
        self.specs[idx].rated_watt * self.states[idx].min_watt_percent / 100
    }

    pub fn max_watt(&self, idx: usize) -> i64 {
        self.states[idx].max_watt
    }

    fn eligible_where(&self, pred: impl Fn(usize) -> bool) -> impl Iterator<Item = usize> {
        self.ids().filter(move |&i| self.is_eligible(i) && pred(i))
    }

    /// Eligible non-battery inverters in index order
    pub fn non_battery(&self) -> Vec<usize> {
        self.eligible_where(|i| !self.specs[i].battery_mode).collect()
    }

    /// Eligible battery inverters of one priority tier in index order
    pub fn battery_tier(&self, priority: u8) -> Vec<usize> {
        self.eligible_where(|i| {
            self.specs[i].battery_mode && self.states[i].battery_priority == priority
        })
        .collect()
    }

    pub fn min_sum(&self) -> i64 {
        self.eligible_where(|_| true).map(|i| self.min_watt(i)).sum()
    }

    /// Sum of derating ceilings
    pub fn max_sum(&self) -> i64 {
        self.eligible_where(|_| true).map(|i| self.max_watt(i)).sum()
    }

    /// Sum of physical ratings
    pub fn rated_sum(&self) -> i64 {
        self.eligible_where(|_| true)
            .map(|i| self.specs[i].rated_watt)
            .sum()
    }

    /// `(Σmin, Σmax)` over a set of inverters
    pub fn bounds_of(&self, ids: &[usize]) -> (i64, i64) {
        ids.iter().fold((0, 0), |(lo, hi), &i| {
            (lo + self.min_watt(i), hi + self.max_watt(i))
        })
    }

    /// Clamp an aggregate budget to `[Σmin, Σmax]`; the minimum wins
    pub fn clamp_aggregate(&self, budget: i64) -> i64 {
        let max = self.max_sum();
        let min = self.min_sum();
        let mut b = budget;
        if b > max {
            b = max;
        }
        if b < min {
            b = min;
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(inverters: Vec<InverterConfig>) -> InverterRegistry {
        let config = Config {
            inverters,
            ..Default::default()
        };
        let mut reg = InverterRegistry::from_config(&config);
        for i in reg.ids() {
            reg.state_mut(i).available = true;
        }
        reg
    }

    #[test]
    fn min_watt_uses_rating() {
        let reg = registry(vec![InverterConfig {
            max_watt: 400,
            inverter_watt: Some(800),
            min_watt_percent: 5,
            ..Default::default()
        }]);
        assert_eq!(reg.min_watt(0), 40);
        assert_eq!(reg.max_watt(0), 400);
        assert_eq!(reg.rated_sum(), 800);
    }

    #[test]
    fn sums_skip_ineligible() {
        let mut reg = registry(vec![
            InverterConfig {
                max_watt: 600,
                min_watt_percent: 10,
                ..Default::default()
            },
            InverterConfig {
                max_watt: 800,
                min_watt_percent: 10,
                battery_mode: true,
                ..Default::default()
            },
            InverterConfig {
                max_watt: 300,
                ..Default::default()
            },
        ]);
        reg.state_mut(1).good_voltage = false;
        reg.state_mut(2).available = false;
        assert_eq!(reg.min_sum(), 60);
        assert_eq!(reg.max_sum(), 600);
        assert_eq!(reg.non_battery(), vec![0]);
        assert!(reg.battery_tier(1).is_empty());
    }

    #[test]
    fn clamp_prefers_minimum() {
        let mut reg = registry(vec![InverterConfig {
            max_watt: 600,
            min_watt_percent: 10,
            ..Default::default()
        }]);
        assert_eq!(reg.clamp_aggregate(1000), 600);
        assert_eq!(reg.clamp_aggregate(-5), 60);
        reg.state_mut(0).max_watt = 20;
        assert_eq!(reg.clamp_aggregate(500), 60);
    }

    #[test]
    fn reconnect_reset() {
        let mut reg = registry(vec![InverterConfig::default()]);
        let s = reg.state_mut(0);
        s.commanded_limit = Some(300);
        s.last_ack = true;
        s.good_voltage = false;
        s.voltage_history.push_back(47.0);
        s.same_power_status_count = 3;
        s.reset_on_reconnect();
        assert_eq!(s.commanded_limit, None);
        assert!(!s.last_ack);
        assert!(s.good_voltage);
        assert!(s.voltage_history.is_empty());
        assert_eq!(s.same_power_status_count, 0);
    }

    #[test]
    fn aggregate_invalidate() {
        let mut agg = AggregateControlState {
            last_limit: Some(500),
            last_ack: true,
        };
        assert!(agg.is_settled_at(500));
        agg.invalidate();
        assert!(!agg.is_settled_at(500));
        assert_eq!(agg.last_limit, None);
    }
}
