use embassy_futures::block_on;

use super::*;
use crate::firmware::testing::{mock_now, set_mock_ms, MockRadio, NoDelay};

type Controller = RadioController<MockRadio, NoDelay>;

fn controller(radio: MockRadio) -> Controller {
    set_mock_ms(0);
    RadioController::with_clock(radio, NoDelay::default(), RadioPolicy::defaults(), mock_now)
}

#[test]
fn first_join_brings_the_link_up() {
    let mut radio = MockRadio::joining(&[Ok(())]);
    radio.join_ms = 2_000;
    let mut ctl = controller(radio);
    set_mock_ms(500);

    assert!(block_on(ctl.enable(3)));

    assert!(ctl.is_connected());
    assert_eq!(ctl.phase(), LinkPhase::Up);
    assert_eq!(ctl.driver.power_ups, 1);
    assert_eq!(ctl.driver.led, [true, false]);
    let stats = ctl.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.down_ms, 500);
    assert_eq!(stats.connecting_ms, 2_000);
}

#[test]
fn failed_joins_back_off_between_attempts() {
    let mut ctl = controller(MockRadio::joining(&[
        Err(RadioError::Join(LinkStatus::NoNetwork)),
        Err(RadioError::Timeout),
        Ok(()),
    ]));

    assert!(block_on(ctl.enable(5)));

    assert_eq!(ctl.delay.calls, 2);
    assert_eq!(ctl.delay.total_ms, 2 * u64::from(RadioPolicy::defaults().retry_backoff_ms));
    assert_eq!(ctl.stats().failures, 2);
}

#[test]
fn exhausted_retries_power_the_radio_down() {
    let mut ctl = controller(MockRadio::new());

    assert!(!block_on(ctl.enable(3)));

    assert!(!ctl.is_initialized());
    assert!(!ctl.driver.powered);
    assert_eq!(ctl.driver.power_downs, 1);
    assert_eq!(ctl.phase(), LinkPhase::Off);
    assert_eq!(ctl.stats().failures, 3);
    // No backoff after the last attempt.
    assert_eq!(ctl.delay.calls, 2);
}

#[test]
fn zero_retries_uses_policy() {
    let mut ctl = controller(MockRadio::new());
    assert!(!block_on(ctl.enable(0)));
    assert_eq!(
        ctl.stats().failures,
        u32::from(RadioPolicy::defaults().join_retries)
    );
}

#[test]
fn power_up_failure_skips_join() {
    let mut radio = MockRadio::joining(&[Ok(())]);
    radio.power_up_result = Err(RadioError::Init);
    let mut ctl = controller(radio);

    assert!(!block_on(ctl.enable(3)));
    assert_eq!(ctl.driver.joins.len(), 1);
    assert!(ctl.driver.led.is_empty());
}

#[test]
fn enable_is_idempotent_while_up() {
    let mut ctl = controller(MockRadio::joining(&[Ok(())]));
    assert!(block_on(ctl.enable(3)));
    assert!(block_on(ctl.enable(3)));
    assert_eq!(ctl.driver.power_ups, 1);
    assert_eq!(ctl.stats().sessions, 1);
}

#[test]
fn disable_twice_is_a_no_op() {
    let mut ctl = controller(MockRadio::joining(&[Ok(())]));
    assert!(block_on(ctl.enable(1)));
    set_mock_ms(10_000);
    block_on(ctl.disable());
    block_on(ctl.disable());

    assert_eq!(ctl.driver.power_downs, 1);
    assert_eq!(ctl.stats().up_ms, 10_000);
    assert_eq!(ctl.link_status(), LinkStatus::Down);
}

#[test]
fn dropped_link_is_noticed_and_rejoined() {
    let mut ctl = controller(MockRadio::joining(&[Ok(()), Ok(())]));
    assert!(block_on(ctl.enable(1)));
    ctl.driver.status = LinkStatus::Down;

    assert!(!ctl.is_connected());
    assert_eq!(ctl.phase(), LinkPhase::Connecting);

    assert!(block_on(ctl.enable(1)));
    assert_eq!(ctl.driver.power_ups, 1);
    assert_eq!(ctl.stats().sessions, 2);
}

#[test]
fn voltage_needs_a_powered_radio() {
    let mut radio = MockRadio::joining(&[Ok(())]);
    radio.supply = Some(SupplyLevel {
        volts: 4.9,
        on_battery: false,
    });
    let mut ctl = controller(radio);
    assert_eq!(ctl.measure_voltage(1_000), None);

    assert!(block_on(ctl.enable(1)));
    let reading = ctl.measure_voltage(2_000).unwrap();
    assert_eq!(reading.utc_ms, 2_000);
    assert!(!reading.on_battery);
}

#[test]
fn blink_pulses_the_led() {
    let mut ctl = controller(MockRadio::joining(&[Ok(())]));
    block_on(ctl.blink());
    assert!(ctl.driver.led.is_empty());

    assert!(block_on(ctl.enable(1)));
    ctl.driver.led.clear();
    block_on(ctl.blink());
    assert_eq!(ctl.driver.led, [true, false]);
    assert_eq!(ctl.delay.total_ms, u64::from(RadioPolicy::defaults().led_blink_ms));
}

#[test]
fn bus_guard_only_while_powered() {
    let mut ctl = controller(MockRadio::joining(&[Ok(())]));
    assert!(ctl.bus_guard().is_none());

    assert!(block_on(ctl.enable(1)));
    {
        let _guard = ctl.bus_guard();
    }
    assert!(!ctl.driver.bus_held);
    assert_eq!(ctl.driver.bus_acquires, 1);
}
