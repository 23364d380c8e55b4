mod common;

use common::{Harness, ScriptedMeter, config_with, inverter};

#[tokio::test]
async fn reported_limit_inside_band_is_left_alone() {
    let mut h = Harness::new(config_with(vec![inverter(800, 5)]), ScriptedMeter::constant(0));
    h.controller.refresh_availability().await;
    h.controller.apply_limit(300).await;

    // band is 5 % of 800
    h.plant.with_inverter(0, |inv| inv.reported_limit = Some(335.0));
    h.controller.apply_limit(300).await;
    assert_eq!(h.limit_commands(), vec![(0, 300)]);
}

#[tokio::test]
async fn drifted_limit_is_resent_without_waiting() {
    let mut h = Harness::new(config_with(vec![inverter(800, 5)]), ScriptedMeter::constant(0));
    h.controller.refresh_availability().await;
    h.controller.apply_limit(300).await;
    h.clock.clear_sleeps();

    h.plant.with_inverter(0, |inv| inv.reported_limit = Some(800.0));
    h.controller.reconcile().await;
    assert_eq!(h.limit_commands(), vec![(0, 300), (0, 300)]);
    assert!(h.clock.sleeps().is_empty());
    assert_eq!(h.plant.inverter(0).unwrap().reported_limit, None);
}

#[tokio::test]
async fn never_commanded_inverter_is_skipped() {
    let mut h = Harness::new(config_with(vec![inverter(800, 5)]), ScriptedMeter::constant(0));
    h.controller.refresh_availability().await;
    h.plant.with_inverter(0, |inv| inv.reported_limit = Some(12.0));

    h.controller.reconcile().await;
    assert!(h.plant.commands().is_empty());
}

#[tokio::test]
async fn unavailable_inverter_is_skipped() {
    let mut h = Harness::new(
        config_with(vec![inverter(800, 5), inverter(800, 5)]),
        ScriptedMeter::constant(0),
    );
    h.controller.refresh_availability().await;
    h.controller.apply_limit(400).await;
    h.plant.set_available(1, false);
    h.controller.refresh_availability().await;
    h.plant.clear_commands();

    h.plant.with_inverter(1, |inv| inv.reported_limit = Some(700.0));
    h.controller.reconcile().await;
    assert!(h.plant.commands().is_empty());
}
