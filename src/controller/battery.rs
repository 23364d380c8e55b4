use crate::devices::wait_for_ack;
use crate::error::Result;
use std::time::Duration;

/// Ceiling and power decision for one averaged voltage sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatteryAction {
    /// Switch off and fall back to the reduced ceiling
    Off,
    /// Lower the ceiling to the reduced wattage
    Reduce,
    /// Switch on; also restore the normal ceiling when `normal` is set
    On { normal: bool },
    /// Restore the normal ceiling
    Normal,
    /// Between thresholds: keep everything as is
    Hold,
}

/// Hysteresis decision, evaluated in threshold order off, reduce, on, normal
pub(crate) fn battery_action(voltage: f64, t: &crate::inverter::BatteryThresholds) -> BatteryAction {
    if voltage <= t.off {
        BatteryAction::Off
    } else if voltage <= t.reduce {
        BatteryAction::Reduce
    } else if voltage >= t.on {
        BatteryAction::On {
            normal: voltage >= t.normal,
        }
    } else if voltage >= t.normal {
        BatteryAction::Normal
    } else {
        BatteryAction::Hold
    }
}

impl super::ZeroExportController {
    /// Evaluate every battery inverter. Returns true if any non-battery
    /// inverter is available or any battery inverter has good voltage.
    pub async fn check_battery(&mut self) -> bool {
        let mut result = false;
        for idx in self.registry.ids() {
            if !self.registry.state(idx).available {
                continue;
            }
            if !self.registry.spec(idx).battery_mode {
                result = true;
                continue;
            }
            match self.guard_inverter(idx).await {
                Ok(()) => {
                    if self.registry.state(idx).good_voltage {
                        result = true;
                    }
                }
                Err(e) => {
                    self.logger
                        .for_inverter(idx, &self.registry.state(idx).serial)
                        .error(&format!("Battery check failed: {}", e));
                }
            }
        }
        result
    }

    /// Averaged minimum panel voltage over the configured window
    async fn average_panel_voltage(&mut self, idx: usize) -> Result<f64> {
        let excluded = self.registry.spec(idx).ignore_panels.clone();
        let sample = self.driver.get_panel_min_voltage(idx, &excluded).await?;
        let window = self.registry.spec(idx).average_count;
        let state = self.registry.state_mut(idx);
        state.voltage_history.push_back(sample);
        while state.voltage_history.len() > window {
            state.voltage_history.pop_front();
        }
        let mean = state.voltage_history.iter().sum::<f64>() / state.voltage_history.len() as f64;
        self.logger
            .for_inverter(idx, &self.registry.state(idx).serial)
            .info(&format!("Average min-panel voltage: {:.2} Volt", mean));
        Ok(mean)
    }

    fn set_ceiling(&mut self, idx: usize, watts: i64) {
        if self.registry.state(idx).max_watt != watts {
            self.logger
                .for_inverter(idx, &self.registry.state(idx).serial)
                .info(&format!("Derating ceiling set to {} Watt", watts));
            self.registry.state_mut(idx).max_watt = watts;
            self.aggregate.invalidate();
        }
    }

    async fn guard_inverter(&mut self, idx: usize) -> Result<()> {
        let voltage = self.average_panel_voltage(idx).await?;
        let reduce_watt = self.provider.reduce_watt(idx);
        let normal_watt = self.provider.normal_watt(idx);

        match battery_action(voltage, &self.registry.spec(idx).thresholds) {
            BatteryAction::Off => {
                self.set_power_status(idx, false).await?;
                if self.registry.state(idx).good_voltage {
                    // The eligible pool shrinks; the next budget must be redistributed.
                    self.aggregate.invalidate();
                }
                self.registry.state_mut(idx).good_voltage = false;
                self.set_ceiling(idx, reduce_watt);
            }
            BatteryAction::Reduce => self.set_ceiling(idx, reduce_watt),
            BatteryAction::On { normal } => {
                self.set_power_status(idx, true).await?;
                if !self.registry.state(idx).good_voltage {
                    self.ramp_up(idx).await?;
                }
                self.registry.state_mut(idx).good_voltage = true;
                if normal {
                    self.set_ceiling(idx, normal_watt);
                }
            }
            BatteryAction::Normal => self.set_ceiling(idx, normal_watt),
            BatteryAction::Hold => {}
        }
        Ok(())
    }

    /// Bring a re-enabled inverter up at its minimum before it takes part
    /// in allocation again.
    async fn ramp_up(&mut self, idx: usize) -> Result<()> {
        let min = self.registry.min_watt(idx);
        let logger = self
            .logger
            .for_inverter(idx, &self.registry.state(idx).serial);
        logger.info(&format!("Battery recovered, starting at {} Watt", min));

        self.driver.set_limit(idx, min).await?;
        self.registry.state_mut(idx).commanded_limit = Some(min);
        let timeout = self.ack_timeout();
        let ack = wait_for_ack(self.driver.as_ref(), self.clock.as_ref(), idx, timeout, &logger).await;
        if let Err(e) = &ack {
            logger.warn(&format!("Ramp-up limit not confirmed: {}", e));
        }
        self.registry.state_mut(idx).last_ack = ack.is_ok();
        self.aggregate.invalidate();
        Ok(())
    }

    /// Switch an inverter on or off, followed by the settle delay. Repeated
    /// identical commands are suppressed once they exceed the configured count.
    pub async fn set_power_status(&mut self, idx: usize, on: bool) -> Result<()> {
        if !self.registry.state(idx).available {
            return Ok(());
        }
        let limit = self.control.set_power_status_count;
        if limit > 0 {
            let state = self.registry.state_mut(idx);
            if state.last_power_status == on {
                state.same_power_status_count += 1;
            } else {
                state.last_power_status = on;
                state.same_power_status_count = 0;
            }
            if state.same_power_status_count > limit {
                self.logger
                    .for_inverter(idx, &self.registry.state(idx).serial)
                    .info(&format!(
                        "Retry counter exceeded: inverter power status already {}",
                        if on { "ON" } else { "OFF" }
                    ));
                return Ok(());
            }
        }
        self.driver.set_power_status(idx, on).await?;
        self.clock
            .sleep(Duration::from_secs(self.control.set_power_status_delay_seconds))
            .await;
        Ok(())
    }
}
