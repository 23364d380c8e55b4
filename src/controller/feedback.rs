//! Grid feedback loop
//!
//! One iteration reads the grid meter up to `loop / poll` times, reacting at
//! once to heavy import (or, optionally, heavy export), then adjusts the
//! aggregate budget by the distance to the target band and hands it to the
//! allocator.

use crate::config::ConfigProvider;
use crate::config::provider::effective_max_point;
use crate::error::Result;
use serde_json::json;
use std::time::Duration;

/// Set-point band for one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandInputs {
    pub target: i64,
    pub tolerance: i64,
    pub min_point: i64,
    /// Already widened to at least `target + tolerance`
    pub max_point: i64,
    pub jump_percent: i64,
    pub fast_decrease: bool,
    /// The configured max point was below `target + tolerance`
    pub widened: bool,
}

impl BandInputs {
    pub fn from_provider(provider: &dyn ConfigProvider) -> Self {
        let target = provider.target_point();
        let tolerance = provider.tolerance();
        let configured = provider.max_point();
        let max_point = effective_max_point(target, tolerance, configured);
        Self {
            target,
            tolerance,
            min_point: provider.min_point(),
            max_point,
            jump_percent: provider.jump_to_limit_percent(),
            fast_decrease: provider.fast_limit_decrease(),
            widened: max_point != configured,
        }
    }
}

/// Step the budget by the distance of `measured` from `target`
pub fn incremental(previous: i64, measured: i64, target: i64) -> i64 {
    previous + measured - target
}

/// Reaction to import above the max point: jump to a share of the rated
/// capacity, unless that would not raise the budget.
pub fn jump_candidate(previous: i64, measured: i64, band: &BandInputs, rated_sum: i64) -> i64 {
    if band.jump_percent > 0 {
        let jump = rated_sum * band.jump_percent / 100;
        if jump <= previous && band.jump_percent != 100 {
            incremental(previous, measured, band.target)
        } else {
            jump
        }
    } else {
        incremental(previous, measured, band.target)
    }
}

/// Slow approximation: when the step from `base` to `candidate` exceeds
/// `limit`, add `factor_percent` of the step to the candidate.
pub fn slow_approx(base: i64, candidate: i64, limit: i64, factor_percent: i64) -> (i64, bool) {
    let difference = (base - candidate).abs();
    if difference > limit {
        (candidate + difference * factor_percent / 100, true)
    } else {
        (candidate, false)
    }
}

impl super::ZeroExportController {
    /// One outer control iteration
    pub async fn run_iteration(&mut self) -> Result<()> {
        self.provider.update();
        self.registry.apply_tunables(self.provider.tunables());
        self.publish_config_state();

        let band = BandInputs::from_provider(self.provider.as_ref());
        if band.widened {
            self.logger.warn(&format!(
                "max_point < target_point + tolerance. Using max_point {}",
                band.max_point
            ));
        }

        let mut previous = self.setpoint;
        if !(self.refresh_availability().await && self.check_battery().await) {
            self.aggregate.invalidate();
            self.clock.sleep(self.loop_interval()).await;
            return Ok(());
        }

        if self.control.log_temperature {
            self.log_temperatures().await;
        }

        let measured = self.fast_reaction(&band, previous).await?;

        if self.control.max_difference_between_limit_and_output_power_percent != 100 {
            let cut = self.cut_limit_to_production(self.setpoint).await?;
            if cut != self.setpoint {
                self.setpoint = cut;
                previous = cut;
            }
        }

        if measured > band.max_point {
            return Ok(());
        }

        let max_all = self.registry.max_sum();
        let slow_limit = max_all * self.control.slow_approx_limit_percent / 100;
        let factor = self.control.slow_approx_factor_percent;

        if measured < band.target - band.tolerance {
            if previous >= max_all {
                let actual = self.actual_output().await?;
                let (mut candidate, _) = slow_approx(
                    actual,
                    incremental(actual, measured, band.target),
                    slow_limit,
                    factor,
                );
                if candidate > actual {
                    candidate = actual;
                }
                self.setpoint = candidate;
                self.logger
                    .info("Overproducing: reduce limit based on actual power");
            } else {
                let (candidate, damped) = slow_approx(
                    previous,
                    incremental(previous, measured, band.target),
                    slow_limit,
                    factor,
                );
                self.setpoint = candidate;
                if damped {
                    self.logger.info(
                        "Overproducing: reduce limit based on previous limit setpoint by approximation",
                    );
                } else {
                    self.logger
                        .info("Overproducing: reduce limit based on previous limit setpoint");
                }
            }
        } else if measured > band.target + band.tolerance {
            if previous < max_all {
                self.setpoint = incremental(previous, measured, band.target);
                self.logger
                    .info("Not enough energy producing: increasing limit");
            } else {
                self.logger
                    .info("Not enough energy producing: limit already at maximum");
            }
        }

        self.setpoint = self.registry.clamp_aggregate(self.setpoint);
        self.apply_limit(self.setpoint).await;
        Ok(())
    }

    /// Poll the grid meter across the iteration, applying immediate
    /// corrections. Returns the last reading.
    async fn fast_reaction(&mut self, band: &BandInputs, previous: i64) -> Result<i64> {
        let loop_s = self.control.loop_interval_seconds as f64;
        let poll_s = self.control.poll_interval_seconds as f64;
        let polls = (loop_s / poll_s) as u64;
        let poll = Duration::from_secs(self.control.poll_interval_seconds);

        let mut measured = 0;
        for x in 0..polls {
            measured = self.read_grid().await?;

            let reaction = if measured > band.max_point {
                Some(jump_candidate(
                    previous,
                    measured,
                    band,
                    self.registry.rated_sum(),
                ))
            } else if measured < band.min_point && band.fast_decrease {
                Some(incremental(previous, measured, band.target))
            } else {
                None
            };

            match reaction {
                Some(candidate) => {
                    self.setpoint = self.registry.clamp_aggregate(candidate);
                    self.apply_limit(self.setpoint).await;
                    let remaining = ((loop_s / poll_s - x as f64) * poll_s) as u64;
                    if remaining > 0 {
                        self.clock.sleep(Duration::from_secs(remaining)).await;
                        break;
                    }
                }
                None => self.clock.sleep(poll).await,
            }
        }
        Ok(measured)
    }

    /// Cap the budget at live production plus the configured headroom,
    /// unless it already equals the full capacity.
    async fn cut_limit_to_production(&mut self, setpoint: i64) -> Result<i64> {
        let max_all = self.registry.max_sum();
        if setpoint == max_all {
            return Ok(setpoint);
        }
        let actual = self.actual_output().await?;
        let percent = self.control.max_difference_between_limit_and_output_power_percent;
        let ceiling = actual as f64 + max_all as f64 * percent as f64 / 100.0;
        if setpoint as f64 > ceiling {
            let cut = ceiling as i64;
            self.logger.info(&format!(
                "Cut limit to {} Watt, limit was higher than {} percent of live-production",
                cut, percent
            ));
            return Ok(cut);
        }
        Ok(setpoint)
    }

    /// Grid power, positive when importing. On failure the inverters are
    /// optionally driven to their minimum before the error is returned.
    pub async fn read_grid(&mut self) -> Result<i64> {
        let reading = self.meter.get_watts().await;
        match reading {
            Ok(watts) => {
                self.logger.info(&format!("powermeter: {} Watt", watts));
                Ok(watts)
            }
            Err(e) => {
                self.logger.error(&format!("Reading grid power failed: {}", e));
                if self.control.set_inverter_to_min_on_powermeter_error {
                    self.apply_limit(0).await;
                }
                Err(e)
            }
        }
    }

    /// Combined inverter output: the intermediate meter if present, else the
    /// sum of AC power over eligible inverters.
    pub async fn actual_output(&mut self) -> Result<i64> {
        if let Some(meter) = &self.intermediate {
            match meter.get_watts().await {
                Ok(watts) => {
                    let watts = watts.abs();
                    self.logger
                        .info(&format!("intermediate meter: {} Watt", watts));
                    return Ok(watts);
                }
                Err(e) => {
                    self.logger.error(&format!(
                        "Reading intermediate meter failed: {}; falling back to inverter AC power",
                        e
                    ));
                }
            }
        }

        let mut total = 0;
        for idx in self.registry.ids() {
            if !self.registry.is_eligible(idx) {
                continue;
            }
            let reading = self.driver.get_ac_power(idx).await;
            match reading {
                Ok(watts) => total += watts,
                Err(e) => {
                    self.logger
                        .for_inverter(idx, &self.registry.state(idx).serial)
                        .error(&format!("Reading AC power failed: {}", e));
                    if self.control.set_inverter_to_min_on_powermeter_error {
                        self.apply_limit(0).await;
                    }
                    return Err(e);
                }
            }
        }
        self.logger.info(&format!("inverter output: {} Watt", total));
        Ok(total)
    }

    fn publish_config_state(&self) {
        let t = self.provider.tunables();
        let sp = &t.setpoint;
        self.telemetry
            .publish_state("target_point", json!(sp.target_point));
        self.telemetry.publish_state("max_point", json!(sp.max_point));
        self.telemetry.publish_state("min_point", json!(sp.min_point));
        self.telemetry.publish_state("tolerance", json!(sp.tolerance));
        self.telemetry
            .publish_state("jump_to_limit_percent", json!(sp.jump_to_limit_percent));
        self.telemetry
            .publish_state("fast_limit_decrease", json!(sp.fast_limit_decrease));
        self.telemetry
            .publish_state("inverter_count", json!(self.registry.len()));
        for idx in self.registry.ids() {
            let inv = t.inverter(idx);
            self.telemetry
                .publish_inverter_state(idx, "min_watt_percent", json!(inv.min_watt_percent));
            self.telemetry
                .publish_inverter_state(idx, "normal_watt", json!(inv.normal_watt));
            self.telemetry
                .publish_inverter_state(idx, "reduce_watt", json!(inv.reduce_watt));
            self.telemetry
                .publish_inverter_state(idx, "battery_priority", json!(inv.battery_priority));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(jump: i64) -> BandInputs {
        BandInputs {
            target: 0,
            tolerance: 50,
            min_point: -100,
            max_point: 100,
            jump_percent: jump,
            fast_decrease: false,
            widened: false,
        }
    }

    #[test]
    fn jump_only_when_it_raises_the_budget() {
        // 50 % of 1600 = 800
        assert_eq!(jump_candidate(200, 300, &band(50), 1600), 800);
        assert_eq!(jump_candidate(900, 300, &band(50), 1600), 1200);
        assert_eq!(jump_candidate(1600, 300, &band(100), 1600), 1600);
        assert_eq!(jump_candidate(200, 300, &band(0), 1600), 500);
    }

    #[test]
    fn slow_approx_adds_share_of_step() {
        // step of 400 over a limit of 160 adds 20 %
        assert_eq!(slow_approx(800, 400, 160, 20), (480, true));
        assert_eq!(slow_approx(800, 700, 160, 20), (700, false));
    }
}
