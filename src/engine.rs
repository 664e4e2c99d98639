//! The bus protocol engine.
//!
//! [`Engine`] owns every piece of protocol state and is driven by one loop:
//! bytes from the bus go into [`Engine::receive`], [`Engine::tick`] is called
//! on every pass, and commands enter through [`Engine::submit`]. Everything
//! the outside world has to act on comes back as [`Event`]s, in order.

use crate::command::{CommandQueues, CommandRequest, Outcome};
use crate::config::{millis, Config};
use crate::controller::{Controller, ControllerEvent, ControllerState, Reply};
use crate::error::{Error, Result};
use crate::forward::Forwarder;
use crate::framer::{Frame, Framer};
use crate::history::HistoryStore;
use crate::protocol::{
    decode_params, encode_param, param_value_size, Crc, Packet, ParamRecord, Source,
    ADDRESS_HEAT_PUMP, HEADER_LENGTH, PACKET_TYPE_CLAIM, PACKET_TYPE_COUNTER,
    PACKET_TYPE_IDENTITY, PACKET_TYPE_RESTART,
};
use serde::Serialize;

/// Packet handed to the forwarding sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Forwarded {
    pub source: Source,
    pub address: u8,
    pub packet_type: u8,
    pub payload: Vec<u8>,
    /// Milliseconds on the engine clock.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    Forward(Forwarded),
    /// Sealed frame to put on the bus now.
    Transmit(Vec<u8>),
    CommandAcknowledged(CommandRequest),
    /// Command dropped after its last unacknowledged attempt.
    CommandFailed(CommandRequest),
    HeatPumpRestart,
    /// Bus session void, history cleared.
    SessionReset,
    StateChanged(ControllerState),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    pub frames: u64,
    pub frame_errors: u64,
    pub crc_errors: u64,
    pub overflows: u64,
    pub history_exhausted: u64,
    pub forwarded: u64,
    pub transmitted: u64,
    pub session_resets: u64,
    pub commands_acknowledged: u64,
    pub commands_failed: u64,
}

pub struct Engine {
    crc: Crc,
    write_buffer_size: usize,
    ctrl_id: [u8; 2],
    legacy_error_codes: bool,
    framer: Framer,
    history: HistoryStore,
    forwarder: Forwarder,
    commands: CommandQueues,
    controller: Controller,
    stats: Stats,
    // our last transmission, to recognize it when the bus reads it back
    echo: Option<Vec<u8>>,
    restart_seen: bool,
    last_state: ControllerState,
    // latest time seen by receive, tick or connect
    now: u64,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let mut controller = Controller::new(&config);
        controller.start(0);
        let last_state = controller.state();
        Ok(Self {
            crc: config.crc,
            write_buffer_size: config.write_buffer_size,
            ctrl_id: config.controller.ctrl_id,
            legacy_error_codes: config.legacy_error_codes,
            framer: Framer::new(config.read_buffer_size, millis(config.timing.frame_gap)),
            history: HistoryStore::new(config.saved_range, config.history_capacity),
            forwarder: Forwarder::new(&config),
            commands: CommandQueues::new(&config.commands),
            controller,
            stats: Stats::default(),
            echo: None,
            restart_seen: false,
            last_state,
            now: 0,
        })
    }

    pub fn state(&self) -> ControllerState {
        self.controller.state()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn commands(&self) -> &CommandQueues {
        &self.commands
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    fn report(&self, err: &Error) {
        match err.legacy_code() {
            Some(code) if self.legacy_error_codes => log::error!("error {code:#04X}: {err}"),
            Some(_) => log::error!("{err}"),
            None => log::warn!("{err}"),
        }
    }

    /// Queues a parameter write. The write quota is checked against the
    /// latest engine time.
    pub fn submit(&mut self, request: CommandRequest) -> Result<Outcome> {
        self.commands.submit(request, self.now)
    }

    /// Asks for the auxiliary slot in manual mode.
    pub fn connect(&mut self, now: u64) -> Vec<Event> {
        self.now = self.now.max(now);
        self.controller.connect(now);
        let mut events = Vec::new();
        self.push_state(&mut events);
        events
    }

    /// Feeds one byte read from the bus at `now`.
    pub fn receive(&mut self, byte: u8, now: u64) -> Vec<Event> {
        self.now = self.now.max(now);
        let mut events = Vec::new();
        match self.framer.push(byte, now) {
            Ok(Some(frame)) => self.handle_frame(frame, &mut events),
            Ok(None) => {}
            Err(_) => self.stats.overflows += 1,
        }
        if let Some(event) = self.controller.on_activity(now) {
            self.handle_controller(event, now, &mut events);
        }
        self.push_state(&mut events);
        events
    }

    /// Completes idle frames, runs timeouts and hands out due bus writes.
    pub fn tick(&mut self, now: u64) -> Vec<Event> {
        self.now = self.now.max(now);
        let mut events = Vec::new();
        if let Some(frame) = self.framer.poll(now) {
            self.handle_frame(frame, &mut events);
        }
        if let Some(event) = self.controller.tick(now) {
            self.handle_controller(event, now, &mut events);
        }
        self.push_state(&mut events);
        events
    }

    fn push_state(&mut self, events: &mut Vec<Event>) {
        let state = self.controller.state();
        if state != self.last_state {
            self.last_state = state;
            events.push(Event::StateChanged(state));
        }
    }

    fn reset_session(&mut self) {
        self.history.reset();
        self.forwarder.reset();
        self.commands.abandon_attempts();
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<Event>) {
        self.stats.frames += 1;
        let echo = self.echo.take().is_some_and(|sent| sent == frame.bytes);
        let body = match self.crc.validate(&frame.bytes) {
            Ok(body) => body,
            Err(_) => {
                // logged by the codec
                self.stats.crc_errors += 1;
                return;
            }
        };
        let packet = match Packet::classify(body) {
            Ok(packet) => packet,
            Err(_) => {
                self.stats.frame_errors += 1;
                return;
            }
        };
        let at = frame.ended_at;
        log::trace!(
            "{:?} {:02X} {:02X}: {:02X?}",
            packet.source,
            packet.address,
            packet.packet_type,
            packet.payload
        );

        if packet.source == Source::HeatPump && packet.packet_type == PACKET_TYPE_RESTART {
            let restart = packet.is_restart();
            if restart && !self.restart_seen {
                log::info!("Heat pump restart detected, clearing history");
                self.history.reset();
                self.forwarder.reset();
                events.push(Event::HeatPumpRestart);
            }
            self.restart_seen = restart;
        }

        let slot = self.history.index(&packet);
        let changed = self.history.changed(&packet);
        if let Err(err) = self.history.save(&packet) {
            self.stats.history_exhausted += 1;
            self.report(&err);
        }
        if self.forwarder.should_forward(&packet, slot, changed, at) {
            self.stats.forwarded += 1;
            events.push(Event::Forward(Forwarded {
                source: packet.source,
                address: packet.address,
                packet_type: packet.packet_type,
                payload: packet.payload.clone(),
                timestamp: at,
            }));
        }

        if !echo && packet.is_poll_for(self.controller.address()) {
            for ParamRecord { param, value } in decode_params(packet.packet_type, &packet.payload) {
                if let Some(entry) = self.commands.on_acknowledged(packet.packet_type, param, value) {
                    self.stats.commands_acknowledged += 1;
                    events.push(Event::CommandAcknowledged(entry.request));
                }
            }
            for entry in self.commands.on_poll(packet.packet_type) {
                self.stats.commands_failed += 1;
                events.push(Event::CommandFailed(entry.request));
            }
        }

        if let Some(event) = self.controller.observe(&packet, at, echo) {
            self.handle_controller(event, at, events);
        }
    }

    fn handle_controller(&mut self, event: ControllerEvent, now: u64, events: &mut Vec<Event>) {
        match event {
            ControllerEvent::Transmit(reply) => {
                let frame = self.build_reply(reply, now);
                match self.crc.seal(&frame, self.write_buffer_size) {
                    Ok(tx_buffer) => {
                        log::debug!("Writing {reply:?}: {tx_buffer:02X?}");
                        self.stats.transmitted += 1;
                        self.echo = Some(tx_buffer.clone());
                        events.push(Event::Transmit(tx_buffer));
                    }
                    Err(err) => self.report(&err),
                }
            }
            ControllerEvent::SessionLost => {
                self.stats.session_resets += 1;
                self.restart_seen = false;
                self.reset_session();
                self.framer.reset();
                events.push(Event::SessionReset);
            }
            ControllerEvent::TimedOut {
                was_connected: true,
            } => self.reset_session(),
            ControllerEvent::TimedOut {
                was_connected: false,
            }
            | ControllerEvent::ClaimWithdrawn
            | ControllerEvent::Retrying => {}
        }
    }

    fn payload_room(&self) -> usize {
        self.write_buffer_size - HEADER_LENGTH - usize::from(self.crc.enabled())
    }

    /// Frame without CRC for a due reply.
    fn build_reply(&mut self, reply: Reply, now: u64) -> Vec<u8> {
        let (packet_type, request_len) = match reply {
            Reply::Claim { request_len } => (PACKET_TYPE_CLAIM, request_len),
            Reply::Poll {
                packet_type,
                request_len,
            } => (packet_type, request_len),
            Reply::CounterRequest { page } => {
                return Packet::new(
                    Source::MainController,
                    ADDRESS_HEAT_PUMP,
                    PACKET_TYPE_COUNTER,
                    &[page],
                )
                .to_bytes();
            }
        };
        let payload = self.reply_payload(packet_type, request_len.min(self.payload_room()), now);
        Packet::new(
            Source::AuxiliaryController,
            self.controller.address(),
            packet_type,
            &payload,
        )
        .to_bytes()
    }

    fn reply_payload(&mut self, packet_type: u8, len: usize, now: u64) -> Vec<u8> {
        if packet_type == PACKET_TYPE_IDENTITY {
            let mut payload = vec![0; len];
            if let Some(id) = payload.get_mut(7..9) {
                id.copy_from_slice(&self.ctrl_id);
            }
            return payload;
        }
        if param_value_size(packet_type).is_none() {
            return vec![0; len];
        }
        let mut payload = vec![0xFF; len];
        if let Some(entry) = self
            .commands
            .next_to_send(packet_type, self.controller.state())
        {
            let record = ParamRecord {
                param: entry.request.param,
                value: entry.request.value,
            };
            match encode_param(packet_type, record, &mut payload) {
                Ok(()) => self.commands.on_send_attempted(&entry, now),
                Err(err) => self.report(&err),
            }
        }
        payload
    }
}
