use super::*;
use crate::config::JackDirection;
use crate::hardware::SimPanel;
use crate::panel::LedState;
use crate::protocol::{SessionState, SignalType};
use crate::transport::LoopbackBus;

/// Every unit has the same panel: an output on button 0 / LED 0, an input on
/// button 1 with a bi-colour LED on 2 (primary) and 3 (secondary), two knobs
/// and a modifier on button 15.
fn layout(unit: u16) -> AppConfig {
    let yaml = format!(
        r#"
unit: {{ id: {unit}, name: "unit {unit}" }}
panel:
  knobs: 2
  modifier_button: 15
  jacks:
    - {{ id: 0, name: lfo, direction: output, signal: cv, button: 0, led: 0 }}
    - {{ id: 1, name: pitch, direction: input, signal: cv, button: 1, led: {{ primary: 2, secondary: 3 }} }}
"#
    );
    AppConfig::from_yaml(&yaml).unwrap()
}

struct Unit {
    sim: SimPanel,
    control: ControlLoop,
}

impl Unit {
    fn join(bus: &LoopbackBus, id: u16) -> Self {
        let sim = SimPanel::new();
        let (transport, inbox) = bus.join(id);
        let control = ControlLoop::new(
            &layout(id),
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            Box::new(transport),
            inbox,
        );
        Self { sim, control }
    }

    /// Press `button` at `down` and release it at `up`, ticking at both
    fn tap(&mut self, button: usize, down: u64, up: u64) {
        self.sim.press(button);
        self.control.tick(down);
        self.sim.release(button);
        self.control.tick(up);
    }

    fn connections(&self) -> Vec<PatchConnection> {
        self.control.protocol().registry().serialize()
    }

    fn led(&self, id: usize) -> LedState {
        self.control.panel().leds.state(id).unwrap()
    }
}

fn output() -> JackAddr {
    JackAddr::new(1, 0)
}

fn connection(dest: JackAddr, scale: f32) -> PatchConnection {
    PatchConnection {
        source: output(),
        dest,
        scale,
    }
}

/// Raw ADC reading for a normalized position (pots read inverted)
fn raw(value: f32) -> u16 {
    4095 - (value * 4095.0).round() as u16
}

fn assert_close(actual: Option<f32>, expected: f32) {
    let actual = actual.expect("knob value not published");
    assert!((actual - expected).abs() < 1e-3, "{} != {}", actual, expected);
}

/// Unit 1 patches its output into unit 2's input, finishing at t = 310
fn patch(a: &mut Unit, b: &mut Unit) {
    a.tap(0, 0, 100);
    b.control.tick(100);
    b.tap(1, 200, 300);
    a.control.tick(300);
    b.control.tick(310);
}

#[test]
fn test_request_offer_complete() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let mut b = Unit::join(&bus, 2);

    a.tap(0, 0, 100);
    assert_eq!(a.control.protocol().session_state(output()), SessionState::RequestPending);
    assert_eq!(a.led(0), LedState::BlinkSlow);
    assert!(a.sim.is_lit(0));

    b.control.tick(100);
    assert_eq!(b.control.protocol().session_state(output()), SessionState::Offering);
    assert_eq!(b.led(3), LedState::BlinkFast);
    assert!(b.sim.is_lit(3));
    assert!(!b.sim.is_lit(2));

    b.tap(1, 200, 300);
    a.control.tick(300);
    b.control.tick(310);

    let expected = vec![connection(JackAddr::new(2, 1), 1.0)];
    assert_eq!(a.connections(), expected);
    assert_eq!(b.connections(), expected);

    assert_eq!(a.control.protocol().sessions().count(), 0);
    assert_eq!(b.control.protocol().sessions().count(), 0);
    assert_eq!(a.led(0), LedState::On);
    assert_eq!(b.led(2), LedState::On);
    assert_eq!(b.led(3), LedState::Off);
}

#[test]
fn test_request_times_out() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let mut b = Unit::join(&bus, 2);

    a.tap(0, 0, 100);
    b.control.tick(100);
    assert!(b.sim.is_lit(3));

    a.control.tick(10_099);
    assert_eq!(a.control.protocol().session_state(output()), SessionState::RequestPending);

    a.control.tick(10_100);
    assert_eq!(a.control.protocol().session_state(output()), SessionState::Idle);
    assert_eq!(a.led(0), LedState::Off);
    assert!(bus
        .history()
        .iter()
        .any(|e| e.unit == 1 && e.body == MessageBody::Cancel { source: output() }));

    // The cancel ends the offer before its own deadline
    b.control.tick(10_050);
    assert_eq!(b.control.protocol().session_state(output()), SessionState::Idle);
    assert_eq!(b.led(3), LedState::Off);
    assert!(!b.sim.is_lit(3));
    assert!(a.connections().is_empty());
    assert!(b.connections().is_empty());
}

#[test]
fn test_single_unit_patches_itself() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let (_peer, peer_inbox) = bus.join(9);

    a.tap(0, 0, 100);
    assert_eq!(a.led(0), LedState::BlinkSlow);
    assert_eq!(a.led(3), LedState::BlinkFast);

    a.tap(1, 200, 300);
    assert_eq!(a.connections(), vec![connection(JackAddr::new(1, 1), 1.0)]);
    assert_eq!(a.control.protocol().sessions().count(), 0);
    assert_eq!(a.led(0), LedState::On);
    assert_eq!(a.led(2), LedState::On);
    assert_eq!(a.led(3), LedState::Off);

    let heard: Vec<_> = drain(&peer_inbox).into_iter().map(|e| e.body.kind()).collect();
    assert_eq!(heard, vec!["request", "complete", "clear"]);
}

#[test]
fn test_long_press_disconnects_everywhere() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let mut b = Unit::join(&bus, 2);
    patch(&mut a, &mut b);

    b.tap(1, 1000, 2600);
    a.control.tick(2600);

    assert!(a.connections().is_empty());
    assert!(b.connections().is_empty());
    assert_eq!(a.led(0), LedState::Off);
    assert_eq!(b.led(2), LedState::Off);
}

#[test]
fn test_short_press_on_connected_input_identifies_source() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let mut b = Unit::join(&bus, 2);
    patch(&mut a, &mut b);

    b.tap(1, 1000, 1100);
    a.control.tick(1100);
    assert_eq!(a.led(0), LedState::BlinkFast);
    assert_eq!(a.connections().len(), 1);

    a.control.tick(3100);
    assert_eq!(a.led(0), LedState::On);
}

#[test]
fn test_arbiter_revokes_late_completion() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let mut b = Unit::join(&bus, 2);
    let (peer, peer_inbox) = bus.join(3);

    a.tap(0, 0, 100);
    b.control.tick(100);
    b.tap(1, 200, 300);

    // A third unit completes the same request before the arbiter has seen either
    let late = JackAddr::new(3, 1);
    peer.broadcast(&Envelope::new(
        3,
        MessageBody::Complete {
            source: output(),
            dest: late,
            scale: 1.0,
        },
    ))
    .unwrap();

    a.control.tick(300);
    b.control.tick(310);

    let winner = vec![connection(JackAddr::new(2, 1), 1.0)];
    assert_eq!(a.connections(), winner);
    assert_eq!(b.connections(), winner);
    assert!(drain(&peer_inbox)
        .iter()
        .any(|e| e.unit == 1 && e.body == MessageBody::Disconnect { dest: late }));
}

#[test]
fn test_restore_and_state_inquiry() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let mut b = Unit::join(&bus, 2);
    let (peer, peer_inbox) = bus.join(9);

    let restored = connection(JackAddr::new(2, 1), 0.5);
    peer.broadcast(&Envelope::new(
        9,
        MessageBody::Restore {
            target: Some(2),
            connections: vec![restored],
            controls: vec![KnobRecord {
                knob: 0,
                mode: 0,
                value: 0.25,
            }],
        },
    ))
    .unwrap();

    a.control.tick(10);
    b.control.tick(10);

    assert!(a.connections().is_empty());
    assert_eq!(b.connections(), vec![restored]);
    assert!(b.control.panel().knobs.is_chasing(0).unwrap());
    assert_eq!(b.control.panel().knobs.value(0).unwrap(), 0.25);
    assert_eq!(b.led(2), LedState::On);

    peer.broadcast(&Envelope::new(9, MessageBody::StateInquiry)).unwrap();
    b.control.tick(20);

    let report = drain(&peer_inbox)
        .into_iter()
        .find(|e| e.unit == 2 && e.body.kind() == "state_report")
        .expect("no state report");
    match report.body {
        MessageBody::StateReport { connections, controls } => {
            assert_eq!(connections, vec![restored]);
            assert!(controls.contains(&KnobRecord {
                knob: 0,
                mode: 0,
                value: 0.25
            }));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_modifier_switches_knob_mode() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let reader = a.control.knob_reader();
    assert_eq!(reader.get(0, 0), None);

    a.sim.set_knob(0, raw(0.2));
    a.control.tick(0);
    assert_close(reader.get(0, 0), 0.2);

    a.sim.press(15);
    a.control.tick(10);
    a.sim.set_knob(0, raw(0.8));
    a.control.tick(20);
    assert_close(reader.get(0, 1), 0.8);
    assert_close(reader.get(0, 0), 0.2);

    // Back in mode 0 the knob holds its old value until it is picked up
    a.sim.release(15);
    a.control.tick(30);
    assert!(a.control.panel().knobs.is_chasing(0).unwrap());
    assert_close(reader.get(0, 0), 0.2);

    a.sim.set_knob(0, raw(0.22));
    a.control.tick(40);
    assert!(!a.control.panel().knobs.is_chasing(0).unwrap());
    assert_close(reader.get(0, 0), 0.22);

    // The modifier is never treated as a jack press
    assert_eq!(a.control.protocol().sessions().count(), 0);
}

#[test]
fn test_hardware_failures_keep_last_state() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let reader = a.control.knob_reader();

    a.sim.set_knob(0, raw(0.5));
    a.sim.press(0);
    a.control.tick(0);

    a.sim.fail_knobs(true);
    a.sim.fail_buttons(true);
    a.sim.set_knob(0, raw(0.9));
    a.sim.release(0);
    a.control.tick(100);
    assert_close(reader.get(0, 0), 0.5);
    assert!(a.control.panel().buttons.is_held(0).unwrap());

    a.sim.fail_knobs(false);
    a.sim.fail_buttons(false);
    a.sim.fail_leds(true);
    a.control.tick(200);
    assert_close(reader.get(0, 0), 0.9);
    assert_eq!(a.control.protocol().session_state(output()), SessionState::RequestPending);
    assert!(!a.sim.is_lit(0));

    a.sim.fail_leds(false);
    a.control.tick(210);
    assert!(a.sim.is_lit(0));
}

#[test]
fn test_status_follows_registry() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let mut b = Unit::join(&bus, 2);
    let status = b.control.subscribe_status();

    patch(&mut a, &mut b);

    let current = status.borrow().clone();
    assert_eq!(current.connections, vec![connection(JackAddr::new(2, 1), 1.0)]);
    assert!(current.sessions.is_empty());
    assert_ne!(current.leds & (1 << 2), 0);
}

#[test]
fn test_restore_snapshot_chases_saved_values() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let mut b = Unit::join(&bus, 2);
    patch(&mut a, &mut b);
    b.sim.set_knob(1, raw(0.4));
    b.control.tick(400);
    let snapshot = b.control.snapshot();

    let bus = LoopbackBus::new();
    let mut fresh = Unit::join(&bus, 2);
    fresh.control.restore(&snapshot);
    fresh.sim.set_knob(1, raw(0.9));
    fresh.control.tick(0);

    assert_eq!(fresh.connections(), snapshot.connections);
    assert!(fresh.control.panel().knobs.is_chasing(1).unwrap());
    assert_close(fresh.control.knob_reader().get(1, 0), 0.4);
    assert_eq!(fresh.led(2), LedState::On);
}

#[test]
fn test_send_failures_do_not_stop_the_loop() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    bus.leave(1);

    a.tap(0, 0, 100);
    assert_eq!(a.control.protocol().session_state(output()), SessionState::RequestPending);
    assert!(a.sim.is_lit(0));

    a.control.tick(10_100);
    assert_eq!(a.control.protocol().session_state(output()), SessionState::Idle);
}

#[test]
fn test_capabilities_inquiry_is_answered() {
    let bus = LoopbackBus::new();
    let mut a = Unit::join(&bus, 1);
    let (peer, peer_inbox) = bus.join(9);

    peer.broadcast(&Envelope::new(9, MessageBody::CapabilitiesInquiry)).unwrap();
    a.control.tick(10);

    let reply = drain(&peer_inbox)
        .into_iter()
        .find(|e| e.unit == 1)
        .expect("no capabilities reply");
    match reply.body {
        MessageBody::Capabilities { name, jacks } => {
            assert_eq!(name, "unit 1");
            assert_eq!(jacks.len(), 2);
            assert_eq!(jacks[0].direction, JackDirection::Output);
            assert_eq!(jacks[1].signal, SignalType::Cv);
        }
        other => panic!("unexpected {:?}", other),
    }
}
