//! Hot-reloadable tunables
//!
//! The controller calls [`ConfigProvider::update`] once per outer iteration and
//! then reads the set-point band and per-inverter ceilings through the getters.
//! Everything else in [`Config`] is read once at startup.

use super::{Config, SetpointConfig};
use crate::logging::get_logger;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Per-inverter values that may change while running
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverterTunables {
    pub min_watt_percent: i64,
    pub normal_watt: i64,
    pub reduce_watt: i64,
    pub battery_priority: u8,
}

impl Default for InverterTunables {
    fn default() -> Self {
        Self {
            min_watt_percent: 0,
            normal_watt: 0,
            reduce_watt: 0,
            battery_priority: 1,
        }
    }
}

/// Snapshot of every hot-reloadable value
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub setpoint: SetpointConfig,
    pub inverters: Vec<InverterTunables>,
}

impl Tunables {
    pub fn from_config(config: &Config) -> Self {
        Self {
            setpoint: config.setpoint.clone(),
            inverters: config
                .inverters
                .iter()
                .map(|inv| InverterTunables {
                    min_watt_percent: inv.min_watt_percent,
                    normal_watt: inv.normal_watt(),
                    reduce_watt: inv.reduce_watt(),
                    battery_priority: inv.battery_priority,
                })
                .collect(),
        }
    }

    /// Tunables of one inverter; unknown indices yield neutral values
    pub fn inverter(&self, idx: usize) -> InverterTunables {
        self.inverters.get(idx).copied().unwrap_or_default()
    }
}

/// Source of hot-reloadable tunables
pub trait ConfigProvider: Send + Sync {
    /// Re-read the source. Failures keep the previous values.
    fn update(&mut self);

    /// Current snapshot
    fn tunables(&self) -> &Tunables;

    fn target_point(&self) -> i64 {
        self.tunables().setpoint.target_point
    }

    fn tolerance(&self) -> i64 {
        self.tunables().setpoint.tolerance
    }

    fn max_point(&self) -> i64 {
        self.tunables().setpoint.max_point
    }

    fn min_point(&self) -> i64 {
        self.tunables().setpoint.min_point
    }

    fn jump_to_limit_percent(&self) -> i64 {
        self.tunables().setpoint.jump_to_limit_percent
    }

    fn fast_limit_decrease(&self) -> bool {
        self.tunables().setpoint.fast_limit_decrease
    }

    fn min_watt_percent(&self, idx: usize) -> i64 {
        self.tunables().inverter(idx).min_watt_percent
    }

    fn normal_watt(&self, idx: usize) -> i64 {
        self.tunables().inverter(idx).normal_watt
    }

    fn reduce_watt(&self, idx: usize) -> i64 {
        self.tunables().inverter(idx).reduce_watt
    }

    fn battery_priority(&self, idx: usize) -> u8 {
        self.tunables().inverter(idx).battery_priority
    }
}

/// Serves a fixed snapshot
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    tunables: Tunables,
}

impl StaticConfigProvider {
    pub fn new(tunables: Tunables) -> Self {
        Self { tunables }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Tunables::from_config(config))
    }

    /// Replace the snapshot; visible to the controller from the next update
    pub fn set(&mut self, tunables: Tunables) {
        self.tunables = tunables;
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn update(&mut self) {}

    fn tunables(&self) -> &Tunables {
        &self.tunables
    }
}

/// Reloads tunables from a YAML file whenever its modification time changes
pub struct FileConfigProvider {
    path: PathBuf,
    last_modified: Option<SystemTime>,
    tunables: Tunables,
}

impl FileConfigProvider {
    /// Start from an already loaded configuration
    pub fn new<P: AsRef<Path>>(path: P, initial: &Config) -> Self {
        let path = path.as_ref().to_path_buf();
        let last_modified = modified_time(&path);
        Self {
            path,
            last_modified,
            tunables: Tunables::from_config(initial),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reload(&mut self) -> crate::error::Result<Tunables> {
        let config = Config::from_file(&self.path)?;
        config.validate()?;
        if config.inverters.len() != self.tunables.inverters.len() {
            return Err(crate::error::ZeroFeedError::config(format!(
                "inverter count changed from {} to {}; restart required",
                self.tunables.inverters.len(),
                config.inverters.len()
            )));
        }
        Ok(Tunables::from_config(&config))
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl ConfigProvider for FileConfigProvider {
    fn update(&mut self) {
        let modified = modified_time(&self.path);
        if modified.is_none() || modified == self.last_modified {
            return;
        }
        self.last_modified = modified;

        let logger = get_logger("config");
        match self.reload() {
            Ok(tunables) => {
                if tunables != self.tunables {
                    logger.info(&format!("Reloaded tunables from {}", self.path.display()));
                }
                self.tunables = tunables;
            }
            Err(e) => {
                logger.warn(&format!(
                    "Ignoring changed config {}: {}",
                    self.path.display(),
                    e
                ));
            }
        }
    }

    fn tunables(&self) -> &Tunables {
        &self.tunables
    }
}

/// Effective max point: widened to `target + tolerance + 50` when configured
/// below `target + tolerance`.
pub fn effective_max_point(target: i64, tolerance: i64, max_point: i64) -> i64 {
    if max_point < target + tolerance {
        target + tolerance + 50
    } else {
        max_point
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_getters() {
        let mut config = Config::default();
        config.setpoint.target_point = -20;
        config.inverters[0].min_watt_percent = 10;
        let provider = StaticConfigProvider::from_config(&config);
        assert_eq!(provider.target_point(), -20);
        assert_eq!(provider.min_watt_percent(0), 10);
        assert_eq!(provider.normal_watt(0), 600);
        assert_eq!(provider.reduce_watt(0), 300);
        assert_eq!(provider.battery_priority(7), 1);
    }

    #[test]
    fn max_point_widening() {
        assert_eq!(effective_max_point(0, 25, 10), 75);
        assert_eq!(effective_max_point(0, 25, 25), 25);
        assert_eq!(effective_max_point(0, 25, 200), 200);
    }
}
