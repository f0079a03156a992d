//! Control loop - the fixed-period orchestrator of one unit
//!
//! Each tick, in order:
//!
//! 1. drain the inbox of envelopes received since the last tick
//! 2. poll the button register and classify releases
//! 3. apply the modifier button to the knob modes, sample and publish knobs
//! 4. feed inbound envelopes, then local presses, to the protocol engine
//! 5. expire protocol timers and send the outbox
//! 6. map jack indicators onto LED states and write the LED register if the
//!    mask changed
//! 7. hand a snapshot to the persistence actor if anything worth saving changed
//!
//! Nothing in a tick blocks or fails: hardware and network errors are logged
//! and the loop carries on with the last known state.

mod feedback;
mod runner;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::AppConfig;
use crate::error::{CodecError, TransportError};
use crate::hardware::{PanelInput, PanelOutput};
use crate::panel::{knob_channel, KnobPublisher, KnobReader, LedBinding, Panel};
use crate::patch::snapshot::knob_records;
use crate::patch::{KnobRecord, PatchConnection, PatchSnapshot, PersistenceHandle};
use crate::protocol::{
    Envelope, JackAddr, JackIndicator, MessageBody, PatchProtocol, ProtocolEvent, ProtocolSettings,
    SessionState,
};
use crate::transport::{drain, Inbox, Transport};

pub use feedback::led_for;

/// Read-only view of a running loop, for the REPL and tests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStatus {
    pub connections: Vec<PatchConnection>,
    pub sessions: Vec<(JackAddr, SessionState)>,
    pub leds: u32,
}

pub struct ControlLoop {
    unit: u16,
    panel: Panel,
    protocol: PatchProtocol,
    input: Arc<dyn PanelInput>,
    output: Arc<dyn PanelOutput>,
    transport: Box<dyn Transport>,
    inbox: Inbox,
    publisher: KnobPublisher,
    persistence: Option<PersistenceHandle>,
    /// Button index -> jack id
    button_jacks: BTreeMap<usize, u8>,
    /// Jack id -> LED binding
    jack_leds: BTreeMap<u8, LedBinding>,
    modifier_button: Option<usize>,
    tick_ms: u64,
    last_buttons: u16,
    button_fault: bool,
    /// Bit n set while knob n fails to read
    knob_faults: u32,
    /// Indicator last drawn per jack
    indicators: BTreeMap<u8, JackIndicator>,
    snapshot_due: bool,
    leds: u32,
    status: watch::Sender<LoopStatus>,
}

impl ControlLoop {
    pub fn new(
        config: &AppConfig,
        input: Arc<dyn PanelInput>,
        output: Arc<dyn PanelOutput>,
        transport: Box<dyn Transport>,
        inbox: Inbox,
    ) -> Self {
        let (publisher, _) = knob_channel(config.panel.knobs);
        let (status, _) = watch::channel(LoopStatus::default());

        let button_jacks = config.panel.jacks.iter().map(|j| (j.button, j.id)).collect();
        let jack_leds = config.panel.jacks.iter().map(|j| (j.id, j.led)).collect();

        info!(
            "Unit {} '{}': {} jacks, {} knobs, input '{}', transport '{}'",
            config.unit.id,
            config.unit.name,
            config.panel.jacks.len(),
            config.panel.knobs,
            input.name(),
            transport.name()
        );

        Self {
            unit: config.unit.id,
            panel: Panel::new(config),
            protocol: PatchProtocol::from_config(config),
            input,
            output,
            transport,
            inbox,
            publisher,
            persistence: None,
            button_jacks,
            jack_leds,
            modifier_button: config.panel.modifier_button,
            tick_ms: config.tuning.tick_ms,
            last_buttons: 0,
            button_fault: false,
            knob_faults: 0,
            indicators: BTreeMap::new(),
            snapshot_due: false,
            leds: 0,
            status,
        }
    }

    /// Save snapshots through `handle` whenever patch state changes
    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        self.persistence = Some(handle);
        self
    }

    /// Reader for the audio engine
    pub fn knob_reader(&self) -> KnobReader {
        self.publisher.reader()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LoopStatus> {
        self.status.subscribe()
    }

    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    pub fn protocol(&self) -> &PatchProtocol {
        &self.protocol
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    /// Re-apply tunables from a reloaded config
    ///
    /// Jack layout, knob count and unit id are read once at startup.
    pub fn apply_config(&mut self, config: &AppConfig) {
        self.panel.apply_tuning(&config.tuning);
        self.protocol.set_settings(ProtocolSettings::from(config));
        self.tick_ms = config.tuning.tick_ms;
        info!("Tuning re-applied (tick {}ms, long press {}ms)", config.tuning.tick_ms, config.tuning.long_press_ms);
    }

    /// Restore connections and knob recall values; knobs chase their values
    pub fn restore(&mut self, snapshot: &PatchSnapshot) {
        if snapshot.unit != self.unit {
            warn!("Snapshot belongs to unit {}, restoring anyway", snapshot.unit);
        }
        self.protocol.load_connections(snapshot.connections.iter().copied());
        self.apply_controls(&snapshot.controls);
        info!(
            "Restored snapshot from {} ({} connections, {} knob values)",
            snapshot.saved_at,
            snapshot.connections.len(),
            snapshot.controls.len()
        );
    }

    fn apply_controls(&mut self, controls: &[KnobRecord]) {
        for record in controls {
            if let Err(e) = self
                .panel
                .knobs
                .set_saved_value(record.knob, record.value, record.mode, true)
            {
                warn!("Skipping stored knob value: {}", e);
            }
        }
    }

    pub fn snapshot(&self) -> PatchSnapshot {
        PatchSnapshot::capture(self.unit, self.protocol.registry(), &self.panel.knobs)
    }

    /// Run one control tick at `now_ms`
    pub fn tick(&mut self, now_ms: u64) {
        let inbound = drain(&self.inbox);

        let mask = self.read_buttons();
        let presses = self.panel.buttons.advance(now_ms, mask);

        self.update_knobs();

        for envelope in &inbound {
            self.protocol.handle_message(now_ms, envelope);
        }

        for press in presses {
            if Some(press.button) == self.modifier_button {
                continue;
            }
            match self.button_jacks.get(&press.button) {
                Some(&jack) => {
                    debug!("Button {} {:?} ({}ms) on jack {}", press.button, press.kind, press.held_ms, jack);
                    if let Err(e) = self.protocol.handle_press(now_ms, jack, press.kind) {
                        warn!("Press on button {} rejected: {}", press.button, e);
                    }
                }
                None => trace!("Button {} is not bound to a jack", press.button),
            }
        }

        self.protocol.advance(now_ms);

        for event in self.protocol.take_events() {
            match event {
                ProtocolEvent::RegistryChanged => self.snapshot_due = true,
                ProtocolEvent::StateRequested => self.send_state_report(),
                ProtocolEvent::CapabilitiesRequested => {
                    self.send(&Envelope::new(self.unit, self.protocol.capabilities()))
                }
                ProtocolEvent::ControlsRestored(controls) => {
                    self.apply_controls(&controls);
                    self.snapshot_due = true;
                }
            }
        }

        for envelope in self.protocol.take_outbox() {
            self.send(&envelope);
        }

        self.refresh_indicators();
        self.write_leds();
        self.persist();
        self.publish_status();
    }

    fn read_buttons(&mut self) -> u16 {
        match self.input.read_buttons() {
            Ok(mask) => {
                if self.button_fault {
                    info!("Button register readable again");
                    self.button_fault = false;
                }
                self.last_buttons = mask;
            }
            Err(e) => {
                if !self.button_fault {
                    warn!("{}; holding last button state", e);
                    self.button_fault = true;
                }
            }
        }
        self.last_buttons
    }

    fn update_knobs(&mut self) {
        let mode = match self.modifier_button {
            Some(button) => usize::from(self.panel.buttons.is_held(button).unwrap_or(false)),
            None => 0,
        };

        for knob in 0..self.panel.knobs.len() {
            if let Err(e) = self.panel.knobs.set_mode(knob, mode) {
                warn!("Knob {} stays in its mode: {}", knob, e);
            }
            let before = self.panel.knobs.value(knob).ok();

            let sampled = match self.input.read_knob(knob) {
                Ok(raw) => {
                    self.knob_faults &= !(1 << knob);
                    self.panel.knobs.sample(knob, raw)
                }
                Err(e) => {
                    if self.knob_faults & (1 << knob) == 0 {
                        warn!("{}; holding last value", e);
                        self.knob_faults |= 1 << knob;
                    }
                    self.panel.knobs.sample_failed(knob)
                }
            };

            if let Ok(value) = sampled {
                self.publisher.publish(knob, mode, value);
                if before != Some(value) {
                    self.snapshot_due = true;
                }
            }
        }
    }

    fn send(&self, envelope: &Envelope) {
        match self.transport.broadcast(envelope) {
            Ok(()) => trace!("-> {}", envelope),
            Err(e) => warn!("Failed to send {}: {}", envelope.body.kind(), e),
        }
    }

    /// Answer a state inquiry; knob values are dropped if they do not fit
    fn send_state_report(&self) {
        let connections = self.protocol.local_connections();
        let full = Envelope::new(
            self.unit,
            MessageBody::StateReport {
                connections: connections.clone(),
                controls: knob_records(&self.panel.knobs),
            },
        );

        match self.transport.broadcast(&full) {
            Ok(()) => debug!("Sent state report ({} connections)", connections.len()),
            Err(TransportError::Codec(CodecError::TooLarge { .. })) => {
                let brief = Envelope::new(
                    self.unit,
                    MessageBody::StateReport {
                        connections,
                        controls: Vec::new(),
                    },
                );
                self.send(&brief);
            }
            Err(e) => warn!("Failed to send state report: {}", e),
        }
    }

    fn write_leds(&mut self) {
        let Some(mask) = self.panel.leds.tick() else {
            return;
        };
        match self.output.write_leds(mask) {
            Ok(()) => self.leds = mask,
            Err(e) => {
                warn!("{}", e);
                // Retry on the next tick
                self.panel.leds.force_refresh();
            }
        }
    }

    fn persist(&mut self) {
        if !std::mem::take(&mut self.snapshot_due) {
            return;
        }
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(self.snapshot()) {
                debug!("{:#}", e);
            }
        }
    }

    fn publish_status(&self) {
        let status = LoopStatus {
            connections: self.protocol.registry().serialize(),
            sessions: self.protocol.sessions().map(|s| (s.source, s.state)).collect(),
            leds: self.leds,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
