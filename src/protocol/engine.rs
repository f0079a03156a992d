//! Patch-routing protocol engine
//!
//! One engine per unit. It consumes classified button presses on local jacks
//! and inbound envelopes, keeps one session per source jack under
//! negotiation, mutates the local copy of the [`PatchRegistry`] and queues
//! outbound envelopes in an outbox the control loop drains every tick.
//!
//! ## Gestures
//!
//! | Jack   | State      | Press | Effect                                      |
//! |--------|------------|-------|---------------------------------------------|
//! | output | idle       | short | broadcast `Request`, session pending        |
//! | input  | offering   | short | `Complete` + `Clear`, connect locally       |
//! | input  | connected  | long  | broadcast `Disconnect`, disconnect locally  |
//! | input  | connected  | short | broadcast `Identify` for its source         |
//!
//! ## Arbitration
//!
//! The unit that owns a source is its arbiter. The first `Complete` it sees
//! for a pending request wins and is recorded. A later `Complete` naming a
//! different destination is revoked with a `Disconnect` broadcast; repeats of
//! the winning one are applied again, which is a no-op.
//!
//! A request also offers the compatible idle inputs of the requesting unit.
//! Completing on one of those settles the request in place: the unit is its
//! own arbiter and never hears its own broadcasts.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace, warn};

use super::message::{Envelope, JackAddr, JackCapability, MessageBody, SignalType, UnitId};
use super::session::{ProtocolSession, SessionState};
use crate::config::{AppConfig, JackDirection, ReplacePolicy};
use crate::error::{IndexKind, PanelError};
use crate::panel::PressKind;
use crate::patch::{KnobRecord, PatchConnection, PatchRegistry};

/// A jack on this unit, as the protocol sees it
#[derive(Debug, Clone)]
pub struct LocalJack {
    pub id: u8,
    pub name: String,
    pub direction: JackDirection,
    pub signal: SignalType,
    /// Scale for connections completed on this input
    pub scale: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSettings {
    pub request_timeout_ms: u64,
    pub identify_flash_ms: u64,
    pub replace_policy: ReplacePolicy,
    pub default_scale: f32,
}

impl From<&AppConfig> for ProtocolSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            request_timeout_ms: config.tuning.request_timeout_ms,
            identify_flash_ms: config.tuning.identify_flash_ms,
            replace_policy: config.patching.replace_policy,
            default_scale: config.patching.default_scale,
        }
    }
}

/// What a jack's LED should show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JackIndicator {
    Idle,
    /// Output waiting for a destination
    Requesting,
    /// Input offered to a remote request
    Offering,
    Connected,
    /// Output flashing after an identify request
    Identifying,
}

/// Side effects the control loop has to carry out
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// The registry changed and should be persisted
    RegistryChanged,
    /// A peer asked for our state; answer with a `StateReport`
    StateRequested,
    /// A restore carried knob values for this unit
    ControlsRestored(Vec<KnobRecord>),
    /// A peer asked what this unit is; answer with [`PatchProtocol::capabilities`]
    CapabilitiesRequested,
}

pub struct PatchProtocol {
    unit: UnitId,
    name: String,
    jacks: BTreeMap<u8, LocalJack>,
    settings: ProtocolSettings,
    registry: PatchRegistry,
    sessions: BTreeMap<JackAddr, ProtocolSession>,
    /// Accepted destination per local source
    winners: BTreeMap<JackAddr, JackAddr>,
    /// Local output -> end of its identify flash
    identify_until: BTreeMap<u8, u64>,
    outbox: Vec<Envelope>,
    events: Vec<ProtocolEvent>,
}

impl PatchProtocol {
    pub fn new(unit: UnitId, jacks: impl IntoIterator<Item = LocalJack>, settings: ProtocolSettings) -> Self {
        Self {
            unit,
            name: format!("unit-{}", unit),
            jacks: jacks.into_iter().map(|j| (j.id, j)).collect(),
            settings,
            registry: PatchRegistry::new(),
            sessions: BTreeMap::new(),
            winners: BTreeMap::new(),
            identify_until: BTreeMap::new(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let jacks = config.panel.jacks.iter().map(|j| LocalJack {
            id: j.id,
            name: j.name.clone(),
            direction: j.direction,
            signal: j.signal,
            scale: j.scale,
        });
        Self::new(config.unit.id, jacks, config.into()).with_name(&config.unit.name)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn set_settings(&mut self, settings: ProtocolSettings) {
        self.settings = settings;
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    pub fn registry(&self) -> &PatchRegistry {
        &self.registry
    }

    /// Bulk reload from persistence; open sessions are left alone
    pub fn load_connections(&mut self, connections: impl IntoIterator<Item = PatchConnection>) {
        self.registry.deserialize(connections);
        self.winners.clear();
        info!("Loaded {} connections", self.registry.len());
    }

    /// Connections into this unit's inputs
    pub fn local_connections(&self) -> Vec<PatchConnection> {
        self.registry.connections_into(self.unit)
    }

    pub fn jacks(&self) -> impl Iterator<Item = &LocalJack> {
        self.jacks.values()
    }

    pub fn jack(&self, id: u8) -> Result<&LocalJack, PanelError> {
        self.jacks
            .get(&id)
            .ok_or_else(|| PanelError::invalid(IndexKind::Jack, id as usize, self.jacks.len()))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ProtocolSession> {
        self.sessions.values()
    }

    /// Reply to a capabilities inquiry
    pub fn capabilities(&self) -> MessageBody {
        MessageBody::Capabilities {
            name: self.name.clone(),
            jacks: self
                .jacks
                .values()
                .map(|j| JackCapability {
                    id: j.id,
                    direction: j.direction,
                    signal: j.signal,
                })
                .collect(),
        }
    }

    fn addr(&self, jack: u8) -> JackAddr {
        JackAddr::new(self.unit, jack)
    }

    fn broadcast(&mut self, body: MessageBody) {
        trace!("Queue {}", body.kind());
        self.outbox.push(Envelope::new(self.unit, body));
    }

    fn mark_changed(&mut self) {
        if !self.events.contains(&ProtocolEvent::RegistryChanged) {
            self.events.push(ProtocolEvent::RegistryChanged);
        }
    }

    pub fn take_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<ProtocolEvent> {
        std::mem::take(&mut self.events)
    }

    /// Source whose session currently offers local input `jack`
    fn offering_source(&self, jack: u8) -> Option<JackAddr> {
        self.sessions
            .values()
            .find(|s| s.offers(jack))
            .map(|s| s.source)
    }

    /// Local inputs that may be offered to a request for `source`
    fn candidates_for(&self, source: JackAddr, signal: SignalType) -> BTreeSet<u8> {
        let replace = self.settings.replace_policy == ReplacePolicy::Replace;
        self.jacks
            .values()
            .filter(|j| j.direction == JackDirection::Input && j.signal == signal)
            .filter(|j| self.offering_source(j.id).is_none())
            .filter(|j| match self.registry.lookup(self.addr(j.id)) {
                None => true,
                Some(existing) => replace && existing.source != source,
            })
            .map(|j| j.id)
            .collect()
    }

    // ---- local gestures ----------------------------------------------------

    pub fn handle_press(&mut self, now_ms: u64, jack_id: u8, kind: PressKind) -> Result<(), PanelError> {
        let jack = self.jack(jack_id)?.clone();
        match jack.direction {
            JackDirection::Output => self.press_output(now_ms, &jack, kind),
            JackDirection::Input => self.press_input(now_ms, &jack, kind),
        }
        Ok(())
    }

    fn press_output(&mut self, now_ms: u64, jack: &LocalJack, kind: PressKind) {
        let source = self.addr(jack.id);
        if kind == PressKind::Long {
            debug!("Long press on output {} has no effect", source);
            return;
        }
        if self.sessions.contains_key(&source) {
            debug!("Request for {} already pending, press ignored", source);
            return;
        }

        self.winners.remove(&source);
        let deadline = now_ms + self.settings.request_timeout_ms;
        let local = self.candidates_for(source, jack.signal);
        if !local.is_empty() {
            debug!("Offering local input(s) {:?} to {}", local, source);
        }
        self.sessions
            .insert(source, ProtocolSession::request(source, jack.signal, deadline, local));
        self.broadcast(MessageBody::Request {
            source,
            signal: jack.signal,
        });
        info!("Requesting destination for {} '{}' ({:?})", source, jack.name, jack.signal);
    }

    fn press_input(&mut self, now_ms: u64, jack: &LocalJack, kind: PressKind) {
        let dest = self.addr(jack.id);
        let connected = self.registry.lookup(dest).copied();

        match kind {
            PressKind::Long => match connected {
                Some(connection) => {
                    self.broadcast(MessageBody::Disconnect { dest });
                    self.registry.disconnect(dest);
                    self.winners.retain(|_, d| *d != dest);
                    self.mark_changed();
                    info!("Disconnected {} from {}", dest, connection.source);
                }
                None => debug!("Long press on unconnected input {}", dest),
            },
            PressKind::Short => {
                if let Some(source) = self.offering_source(jack.id) {
                    self.complete(source, jack);
                } else if let Some(connection) = connected {
                    debug!("Identify {} (source of {})", connection.source, dest);
                    if connection.source.unit == self.unit {
                        self.on_identify(now_ms, connection.source);
                    } else {
                        self.broadcast(MessageBody::Identify {
                            source: connection.source,
                        });
                    }
                } else {
                    debug!("Short press on idle input {}", dest);
                }
            }
        }
    }

    fn complete(&mut self, source: JackAddr, jack: &LocalJack) {
        let dest = self.addr(jack.id);
        let scale = jack.scale.unwrap_or(self.settings.default_scale);

        self.sessions.remove(&source);
        if source.unit == self.unit {
            self.winners.insert(source, dest);
        }
        self.broadcast(MessageBody::Complete { source, dest, scale });
        self.registry.connect(source, dest, scale);
        self.broadcast(MessageBody::Clear { source });
        self.mark_changed();
        info!("Connected {} -> {} (x{})", source, dest, scale);
    }

    // ---- inbound messages --------------------------------------------------

    pub fn handle_message(&mut self, now_ms: u64, envelope: &Envelope) {
        if envelope.unit == self.unit {
            trace!("Ignoring own {}", envelope.body.kind());
            return;
        }
        debug!("<- {}", envelope);

        match &envelope.body {
            MessageBody::Request { source, signal } => self.on_request(now_ms, *source, *signal),
            MessageBody::Complete { source, dest, scale } => self.on_complete(*source, *dest, *scale),
            MessageBody::Clear { source } => self.on_clear(*source),
            MessageBody::Cancel { source } => {
                // A pending request of ours only ends by completion or our own timeout
                let offering = self
                    .sessions
                    .get(source)
                    .is_some_and(|s| s.state == SessionState::Offering);
                if offering {
                    self.sessions.remove(source);
                    info!("Negotiation for {} cancelled by U{}", source, envelope.unit);
                }
            }
            MessageBody::Disconnect { dest } => {
                if self.registry.disconnect(*dest) {
                    self.mark_changed();
                    info!("Forgot connection into {}", dest);
                }
                self.winners.retain(|_, d| *d != *dest);
            }
            MessageBody::Identify { source } => self.on_identify(now_ms, *source),
            MessageBody::StateInquiry => self.events.push(ProtocolEvent::StateRequested),
            MessageBody::StateReport { connections, .. } => {
                self.on_state_report(envelope.unit, connections)
            }
            MessageBody::Restore {
                target,
                connections,
                controls,
            } => self.on_restore(*target, connections, controls),
            MessageBody::CapabilitiesInquiry => self.events.push(ProtocolEvent::CapabilitiesRequested),
            MessageBody::Capabilities { name, jacks } => {
                debug!("U{} is '{}' with {} jacks", envelope.unit, name, jacks.len())
            }
        }
    }

    fn on_request(&mut self, now_ms: u64, source: JackAddr, signal: SignalType) {
        if source.unit == self.unit {
            warn!("Peer sent a request for our own output {}", source);
            return;
        }
        if self.sessions.contains_key(&source) {
            trace!("Duplicate request for {}", source);
            return;
        }

        let candidates = self.candidates_for(source, signal);

        if candidates.is_empty() {
            debug!("No idle {:?} input for {}", signal, source);
            return;
        }

        info!("Offering {} input(s) {:?} to {}", candidates.len(), candidates, source);
        let deadline = now_ms + self.settings.request_timeout_ms;
        self.sessions
            .insert(source, ProtocolSession::offer(source, signal, deadline, candidates));
    }

    fn on_complete(&mut self, source: JackAddr, dest: JackAddr, scale: f32) {
        if dest.unit == self.unit {
            warn!("Ignoring completion into our own input {} from a peer", dest);
            return;
        }

        if source.unit != self.unit {
            self.apply_connect(source, dest, scale);
            return;
        }

        let pending = self
            .sessions
            .get(&source)
            .is_some_and(|s| s.state == SessionState::RequestPending);

        if pending {
            self.sessions.remove(&source);
            self.winners.insert(source, dest);
            self.apply_connect(source, dest, scale);
            self.broadcast(MessageBody::Clear { source });
            info!("{} accepted {} as destination", source, dest);
        } else if self.winners.get(&source) == Some(&dest) {
            self.apply_connect(source, dest, scale);
        } else {
            info!("Revoking late completion {} -> {}", source, dest);
            self.broadcast(MessageBody::Disconnect { dest });
            if self.registry.disconnect(dest) {
                self.mark_changed();
            }
        }
    }

    fn apply_connect(&mut self, source: JackAddr, dest: JackAddr, scale: f32) {
        let connection = PatchConnection { source, dest, scale };
        if self.registry.lookup(dest) == Some(&connection) {
            return;
        }
        self.registry.connect(source, dest, scale);
        self.mark_changed();
        debug!("Recorded {} -> {}", source, dest);
    }

    fn on_clear(&mut self, source: JackAddr) {
        let offering = self
            .sessions
            .get(&source)
            .is_some_and(|s| s.state == SessionState::Offering);
        if offering {
            self.sessions.remove(&source);
            debug!("Stopped offering for {}", source);
        }
    }

    fn on_identify(&mut self, now_ms: u64, source: JackAddr) {
        if source.unit != self.unit {
            return;
        }
        match self.jacks.get(&source.jack) {
            Some(jack) if jack.direction == JackDirection::Output => {
                self.identify_until
                    .insert(source.jack, now_ms + self.settings.identify_flash_ms);
                debug!("Identifying output {}", source);
            }
            _ => debug!("Identify for unknown output {}", source),
        }
    }

    /// A peer's report is authoritative for connections into its own jacks
    fn on_state_report(&mut self, reporter: UnitId, connections: &[PatchConnection]) {
        let reported: Vec<PatchConnection> = connections
            .iter()
            .filter(|c| c.dest.unit == reporter)
            .copied()
            .collect();
        if self.registry.connections_into(reporter) == reported {
            return;
        }

        self.registry.clear_unit(reporter);
        for c in &reported {
            self.registry.connect(c.source, c.dest, c.scale);
        }
        self.mark_changed();
        debug!("Synced {} connections into U{}", reported.len(), reporter);
    }

    fn on_restore(&mut self, target: Option<UnitId>, connections: &[PatchConnection], controls: &[KnobRecord]) {
        if target.is_some_and(|t| t != self.unit) {
            return;
        }

        let sources: BTreeSet<JackAddr> = connections.iter().map(|c| c.source).collect();
        let dests: BTreeSet<JackAddr> = connections.iter().map(|c| c.dest).collect();
        let unit = self.unit;
        let stale: Vec<JackAddr> = self
            .sessions
            .values()
            .filter(|s| {
                sources.contains(&s.source)
                    || s.candidates.iter().any(|j| dests.contains(&JackAddr::new(unit, *j)))
            })
            .map(|s| s.source)
            .collect();

        for source in stale {
            self.sessions.remove(&source);
            if source.unit == self.unit {
                self.broadcast(MessageBody::Cancel { source });
            }
        }

        self.load_connections(connections.iter().copied());
        self.mark_changed();
        if !controls.is_empty() {
            self.events.push(ProtocolEvent::ControlsRestored(controls.to_vec()));
        }
    }

    // ---- time --------------------------------------------------------------

    /// Expire sessions and identify flashes at `now_ms`
    pub fn advance(&mut self, now_ms: u64) {
        let expired: Vec<JackAddr> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now_ms))
            .map(|s| s.source)
            .collect();

        for source in expired {
            if let Some(session) = self.sessions.remove(&source) {
                info!("{:?} session for {} timed out", session.state, source);
                self.broadcast(MessageBody::Cancel { source });
            }
        }

        self.identify_until.retain(|_, until| now_ms < *until);
    }

    // ---- queries -----------------------------------------------------------

    pub fn session_state(&self, source: JackAddr) -> SessionState {
        if let Some(session) = self.sessions.get(&source) {
            return session.state;
        }
        let connected_here = self
            .registry
            .connections_from(source)
            .iter()
            .any(|c| c.dest.unit == self.unit);
        if connected_here {
            SessionState::Connected
        } else {
            SessionState::Idle
        }
    }

    pub fn jack_indicator(&self, jack_id: u8) -> Result<JackIndicator, PanelError> {
        let jack = self.jack(jack_id)?;
        let addr = self.addr(jack_id);

        let indicator = match jack.direction {
            JackDirection::Output => {
                if self.identify_until.contains_key(&jack_id) {
                    JackIndicator::Identifying
                } else if self
                    .sessions
                    .get(&addr)
                    .is_some_and(|s| s.state == SessionState::RequestPending)
                {
                    JackIndicator::Requesting
                } else if !self.registry.connections_from(addr).is_empty() {
                    JackIndicator::Connected
                } else {
                    JackIndicator::Idle
                }
            }
            JackDirection::Input => {
                if self.offering_source(jack_id).is_some() {
                    JackIndicator::Offering
                } else if self.registry.lookup(addr).is_some() {
                    JackIndicator::Connected
                } else {
                    JackIndicator::Idle
                }
            }
        };
        Ok(indicator)
    }
}
