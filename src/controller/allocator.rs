//! Splitting an aggregate budget across inverters
//!
//! [`plan_allocation`] computes every per-inverter limit before anything is
//! sent. Non-battery inverters are served first, then battery tiers 1 to 5;
//! within a group each inverter receives a share proportional to its span
//! `max - min` on top of its minimum.

use crate::devices::wait_for_ack;
use crate::inverter::InverterRegistry;
use serde_json::json;

/// Highest battery priority tier
pub const MAX_PRIORITY: u8 = 5;

/// Limit for one inverter, in dispatch order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedLimit {
    pub idx: usize,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    /// Budget actually distributed; raised to Σmin when requested below it
    pub effective: i64,
    /// True when the request was at or below Σmin
    pub at_minimum: bool,
    pub limits: Vec<PlannedLimit>,
}

/// Proportional share of `budget` for one member of a group
fn share(budget: i64, min: i64, max: i64, span: i64) -> i64 {
    if span <= 0 {
        return min;
    }
    budget * (max - min) / span + min
}

/// Clamp to `[min, ceiling]`; the minimum wins if they cross
fn clamp_min_wins(value: i64, min: i64, ceiling: i64) -> i64 {
    let mut v = value;
    if v > ceiling {
        v = ceiling;
    }
    if v < min {
        v = min;
    }
    v
}

/// Apply the per-inverter compensation factor, re-clamped to the rating
fn compensate(registry: &InverterRegistry, idx: usize, limit: i64) -> i64 {
    let factor = registry.spec(idx).compensate_watt_factor;
    if factor == 1.0 {
        return limit;
    }
    let compensated = (limit as f64 * factor) as i64;
    clamp_min_wins(
        compensated,
        registry.min_watt(idx),
        registry.spec(idx).rated_watt,
    )
}

fn plan_group(
    registry: &InverterRegistry,
    members: &[usize],
    budget: i64,
    out: &mut Vec<PlannedLimit>,
) {
    let (min_sum, max_sum) = registry.bounds_of(members);
    let span = max_sum - min_sum;
    for &idx in members {
        let min = registry.min_watt(idx);
        let max = registry.max_watt(idx);
        let raw = share(budget, min, max, span);
        let limit = compensate(registry, idx, clamp_min_wins(raw, min, max));
        out.push(PlannedLimit { idx, limit });
    }
}

/// Compute every per-inverter limit for `budget` without side effects
pub fn plan_allocation(registry: &InverterRegistry, budget: i64) -> AllocationPlan {
    let min_sum = registry.min_sum();
    let at_minimum = budget <= min_sum;
    let effective = if at_minimum { min_sum } else { budget };
    let mut remaining = effective - min_sum;
    let mut limits = Vec::with_capacity(registry.len());

    let non_battery = registry.non_battery();
    let (nb_min, nb_max) = registry.bounds_of(&non_battery);
    let nb_span = nb_max - nb_min;
    let nb_budget = if remaining >= nb_span { nb_span } else { remaining };
    plan_group(registry, &non_battery, nb_budget, &mut limits);
    remaining -= nb_budget;

    for priority in 1..=MAX_PRIORITY {
        let tier = registry.battery_tier(priority);
        let (tier_min, tier_max) = registry.bounds_of(&tier);
        if tier_max <= 0 {
            continue;
        }
        let tier_span = tier_max - tier_min;
        let tier_budget = if remaining >= tier_span {
            tier_span
        } else {
            remaining
        };
        plan_group(registry, &tier, tier_budget, &mut limits);
        remaining -= tier_budget;
    }

    AllocationPlan {
        effective,
        at_minimum,
        limits,
    }
}

impl super::ZeroExportController {
    /// Distribute `budget` across eligible inverters and dispatch the result.
    ///
    /// An unchanged, fully acknowledged budget only triggers a consistency
    /// check. Per-inverter failures clear the acknowledgment flags and the
    /// remaining inverters are still processed. Returns the effective
    /// aggregate.
    pub async fn apply_limit(&mut self, budget: i64) -> i64 {
        if self.aggregate.is_settled_at(budget) {
            self.logger
                .info(&format!("Inverter limit was already accepted at {} Watt", budget));
            self.reconcile().await;
            return budget.max(self.registry.min_sum());
        }
        if self.aggregate.last_limit == Some(budget) {
            self.logger.info(&format!(
                "Inverter limit {} Watt was previously not accepted by at least one inverter, trying again...",
                budget
            ));
        }

        self.logger.info(&format!("Setting new limit to {} Watt", budget));
        self.aggregate.last_limit = Some(budget);
        self.aggregate.last_ack = true;

        let plan = plan_allocation(&self.registry, budget);
        self.telemetry.publish_state("limit", json!(plan.effective));

        for step in &plan.limits {
            self.dispatch_limit(step.idx, step.limit).await;
        }
        plan.effective
    }

    async fn dispatch_limit(&mut self, idx: usize, limit: i64) {
        let logger = self
            .logger
            .for_inverter(idx, &self.registry.state(idx).serial);
        let state = self.registry.state(idx);
        if state.commanded_limit == Some(limit) && state.last_ack {
            logger.info(&format!("Already at {} Watt", limit));
            return;
        }

        self.registry.state_mut(idx).last_ack = true;
        self.telemetry
            .publish_inverter_state(idx, "limit", json!(limit));

        match self.driver.set_limit(idx, limit).await {
            Ok(()) => {
                self.registry.state_mut(idx).commanded_limit = Some(limit);
                let timeout = self.ack_timeout();
                if let Err(e) = wait_for_ack(
                    self.driver.as_ref(),
                    self.clock.as_ref(),
                    idx,
                    timeout,
                    &logger,
                )
                .await
                {
                    logger.warn(&format!("Limit {} Watt not confirmed: {}", limit, e));
                    self.registry.state_mut(idx).last_ack = false;
                    self.aggregate.last_ack = false;
                }
            }
            Err(e) => {
                logger.error(&format!("Setting limit {} Watt failed: {}", limit, e));
                self.registry.state_mut(idx).last_ack = false;
                self.aggregate.last_ack = false;
            }
        }
    }
}
