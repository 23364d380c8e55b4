mod common;

use common::{Harness, ScriptedMeter, config_with, inverter};
use std::time::Duration;
use zerofeed::config::InverterConfig;

fn single(max_watt: i64, min_watt_percent: i64) -> zerofeed::Config {
    config_with(vec![inverter(max_watt, min_watt_percent)])
}

#[tokio::test]
async fn import_above_max_point_steps_up_by_measured_import() {
    // min 10 (1 % of 1000), max 800
    let mut config = config_with(vec![InverterConfig {
        max_watt: 800,
        inverter_watt: Some(1000),
        min_watt_percent: 1,
        ..Default::default()
    }]);
    config.setpoint.target_point = 0;
    config.setpoint.tolerance = 50;
    config.setpoint.min_point = -100;
    config.setpoint.max_point = 100;

    let mut h = Harness::new(config, ScriptedMeter::constant(300));
    h.controller.set_setpoint(200);

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.controller.setpoint(), 500);
    assert_eq!(h.applied_limit(0), 500);
    // one reading, then the rest of the loop interval
    assert_eq!(h.meter.reads(), 1);
    assert!(h.clock.sleeps().contains(&Duration::from_secs(5)));

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.controller.setpoint(), 800);

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.controller.setpoint(), 800);
    assert_eq!(h.limit_commands(), vec![(0, 500), (0, 800)]);
}

#[tokio::test]
async fn in_band_reading_keeps_the_budget() {
    let mut h = Harness::new(single(800, 5), ScriptedMeter::constant(10));
    h.controller.set_setpoint(200);

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.controller.setpoint(), 200);
    assert_eq!(h.meter.reads(), 5);
    assert_eq!(
        h.clock.sleeps()[..5].to_vec(),
        vec![Duration::from_secs(1); 5]
    );
    assert_eq!(h.limit_commands(), vec![(0, 200)]);
}

#[tokio::test]
async fn large_overproduction_is_damped() {
    // slow limit 20 % of 800 = 160; step 200 adds 20 % of 200
    let mut h = Harness::new(single(800, 5), ScriptedMeter::constant(-200));
    h.controller.set_setpoint(600);

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.controller.setpoint(), 440);
}

#[tokio::test]
async fn small_overproduction_steps_down_directly() {
    let mut h = Harness::new(single(800, 5), ScriptedMeter::constant(-100));
    h.controller.set_setpoint(600);

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.controller.setpoint(), 500);
}

#[tokio::test]
async fn overproduction_at_full_capacity_uses_actual_output() {
    // plant limit starts at the rating, so actual output is 800
    let mut h = Harness::new(single(800, 5), ScriptedMeter::constant(-200));
    h.controller.set_setpoint(800);

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.controller.setpoint(), 640);
}

#[tokio::test]
async fn fast_decrease_reacts_on_first_reading() {
    let mut config = single(800, 5);
    config.setpoint.fast_limit_decrease = true;
    let mut h = Harness::new(config, ScriptedMeter::constant(-300));
    h.controller.set_setpoint(600);

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.meter.reads(), 1);
    assert_eq!(h.limit_commands()[0], (0, 300));
}

#[tokio::test]
async fn jump_to_share_of_rated_capacity() {
    let mut config = single(800, 5);
    config.setpoint.jump_to_limit_percent = 50;
    let mut h = Harness::new(config, ScriptedMeter::constant(300));
    h.controller.set_setpoint(100);

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.controller.setpoint(), 400);

    // 400 is no longer above the budget: fall back to the increment
    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.controller.setpoint(), 700);
}

#[tokio::test]
async fn max_point_below_band_is_widened() {
    let mut config = single(800, 5);
    config.setpoint.tolerance = 25;
    config.setpoint.max_point = 10;
    let mut h = Harness::new(config, ScriptedMeter::constant(60));
    h.controller.set_setpoint(200);

    // 60 is below the widened max point of 75: no fast reaction
    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.meter.reads(), 5);
    assert_eq!(h.controller.setpoint(), 260);
}

#[tokio::test]
async fn limit_is_cut_to_live_production() {
    let mut config = single(800, 5);
    config
        .control
        .max_difference_between_limit_and_output_power_percent = 10;
    let mut h = Harness::new(config, ScriptedMeter::constant(0));
    h.plant.set_solar(0, 300);
    h.controller.set_setpoint(700);

    h.controller.run_iteration().await.unwrap();
    // 300 produced + 10 % of 800
    assert_eq!(h.controller.setpoint(), 380);
    assert_eq!(h.applied_limit(0), 380);
}

#[tokio::test]
async fn meter_failure_drives_inverters_to_minimum() {
    let mut config = single(800, 5);
    config.control.set_inverter_to_min_on_powermeter_error = true;
    let mut h = Harness::new(config, ScriptedMeter::failing());
    h.controller.set_setpoint(500);

    assert!(h.controller.run_iteration().await.is_err());
    assert_eq!(h.limit_commands(), vec![(0, 40)]);
    assert_eq!(h.applied_limit(0), 40);
}

#[tokio::test]
async fn meter_failure_without_safety_leaves_limits_alone() {
    let mut h = Harness::new(single(800, 5), ScriptedMeter::failing());
    h.controller.set_setpoint(500);

    let err = h.controller.run_iteration().await.unwrap_err();
    assert!(err.is_transient());
    assert!(h.limit_commands().is_empty());
}

#[tokio::test]
async fn no_available_inverter_skips_the_iteration() {
    let mut h = Harness::new(single(800, 5), ScriptedMeter::constant(300));
    h.plant.set_available(0, false);
    h.controller.set_setpoint(200);

    h.controller.run_iteration().await.unwrap();
    assert_eq!(h.meter.reads(), 0);
    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(5)]);
    assert_eq!(h.controller.aggregate().last_limit, None);
    assert!(h.plant.commands().is_empty());
}
