//! Auxiliary controller emulation.
//!
//! The main controller regularly polls the auxiliary slot (`00 F0 30`). When
//! enough of these polls stay unanswered the gateway answers one itself, later than
//! any known auxiliary controller would, and only if the bus stayed silent
//! until then. Once connected every poll of the slot is answered after
//! `packet_3x_delay`.
//!
//! Nothing here blocks: replies are scheduled against the millisecond clock and
//! handed out by [`Controller::tick`] once due.

use crate::config::{millis, Config, ControllerMode};
use crate::protocol::{
    Packet, Source, ADDRESS_HEAT_PUMP, PACKET_TYPE_CLAIM, PACKET_TYPE_RESTART,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Idle,
    Listening,
    ClaimPending,
    Connected,
    TimedOut,
}

/// A bus write the controller wants to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Answer to the claim poll.
    Claim { request_len: usize },
    /// Answer to a poll of the auxiliary slot.
    Poll { packet_type: u8, request_len: usize },
    /// Counter request to the heat pump.
    CounterRequest { page: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub due_at: u64,
    pub reply: Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The scheduled reply is due.
    Transmit(Reply),
    /// No bus data for `data_timeout`.
    SessionLost,
    /// Slot not obtained in time, or lost after connecting.
    TimedOut { was_connected: bool },
    /// Bus activity before our claim fired.
    ClaimWithdrawn,
    /// Back-off is over, listening for claim polls again.
    Retrying,
}

#[derive(Debug)]
pub struct Controller {
    mode: ControllerMode,
    address: u8,
    claim_threshold: u8,
    counter_pages: u8,
    data_timeout: u64,
    controller_timeout: u64,
    retry_period: u64,
    packet_30_delay: u64,
    packet_3x_delay: u64,
    packet_b8_delay: u64,
    counter_period: u64,

    state: ControllerState,
    connect_requested: bool,
    unanswered_claims: u8,
    first_data_at: Option<u64>,
    last_data_at: Option<u64>,
    last_failed_at: Option<u64>,
    last_poll_at: Option<u64>,
    counter_round_at: Option<u64>,
    counter_page: Option<u8>,
    scheduled: Option<Scheduled>,
}

impl Controller {
    pub fn new(config: &Config) -> Self {
        let timing = &config.timing;
        Self {
            mode: config.controller.mode,
            address: config.controller.address,
            claim_threshold: config.controller.claim_threshold,
            counter_pages: config.controller.counter_pages,
            data_timeout: millis(timing.data_timeout),
            controller_timeout: millis(timing.controller_timeout),
            retry_period: millis(timing.controller_retry_period),
            packet_30_delay: millis(timing.packet_30_delay),
            packet_3x_delay: millis(timing.packet_3x_delay),
            packet_b8_delay: millis(timing.packet_b8_delay),
            counter_period: millis(timing.counter_request_period),
            state: ControllerState::Idle,
            connect_requested: false,
            unanswered_claims: 0,
            first_data_at: None,
            last_data_at: None,
            last_failed_at: None,
            last_poll_at: None,
            counter_round_at: None,
            counter_page: None,
            scheduled: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn unanswered_claims(&self) -> u8 {
        self.unanswered_claims
    }

    pub fn scheduled(&self) -> Option<Scheduled> {
        self.scheduled
    }

    pub fn ms_since_first_data(&self, now: u64) -> Option<u64> {
        self.first_data_at.map(|t| now.saturating_sub(t))
    }

    pub fn ms_since_last_retry_attempt(&self, now: u64) -> Option<u64> {
        self.last_failed_at.map(|t| now.saturating_sub(t))
    }

    /// Whether the gateway currently owns the auxiliary slot.
    pub fn may_write(&self) -> bool {
        self.state == ControllerState::Connected
    }

    fn wants_slot(&self) -> bool {
        match self.mode {
            ControllerMode::Disabled => false,
            ControllerMode::Manual => self.connect_requested,
            ControllerMode::Auto => true,
        }
    }

    fn backing_off(&self, now: u64) -> bool {
        self.last_failed_at
            .is_some_and(|t| now.saturating_sub(t) < self.retry_period)
    }

    fn enter(&mut self, state: ControllerState) {
        if self.state != state {
            log::info!("Controller {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn fail(&mut self, now: u64) {
        self.scheduled = None;
        self.unanswered_claims = 0;
        self.last_poll_at = None;
        self.last_failed_at = Some(now);
        self.enter(ControllerState::TimedOut);
    }

    /// Starts listening for claim polls, if the mode allows it.
    pub fn start(&mut self, now: u64) {
        if self.state != ControllerState::Idle || !self.wants_slot() {
            return;
        }
        if self.backing_off(now) {
            self.enter(ControllerState::TimedOut);
        } else {
            // connect deadline counts from the next bus data, not from startup
            self.unanswered_claims = 0;
            self.first_data_at = None;
            self.enter(ControllerState::Listening);
        }
    }

    /// Explicit connect request for manual mode.
    pub fn connect(&mut self, now: u64) {
        if self.mode == ControllerMode::Disabled {
            log::warn!("Controller emulation is disabled, ignoring connect request");
            return;
        }
        self.connect_requested = true;
        self.start(now);
    }

    /// A byte appeared on the bus. Cancels a reply that has not gone out.
    pub fn on_activity(&mut self, now: u64) -> Option<ControllerEvent> {
        let scheduled = self.scheduled.take()?;
        if matches!(scheduled.reply, Reply::Claim { .. }) {
            log::info!(
                "Bus activity at {now} before claim due at {}, withdrawing",
                scheduled.due_at
            );
            self.fail(now);
            return Some(ControllerEvent::ClaimWithdrawn);
        }
        log::debug!("Bus activity, dropping scheduled {:?}", scheduled.reply);
        None
    }

    fn schedule(&mut self, due_at: u64, reply: Reply) {
        log::trace!("Scheduling {reply:?} at {due_at}");
        self.scheduled = Some(Scheduled { due_at, reply });
    }

    fn counter_due(&self, now: u64) -> bool {
        self.counter_pages > 0
            && (self.counter_page.is_some()
                || self
                    .counter_round_at
                    .map_or(true, |t| now.saturating_sub(t) >= self.counter_period))
    }

    /// Feeds a classified packet. `echo` marks our own transmission read back.
    pub fn observe(&mut self, packet: &Packet, at: u64, echo: bool) -> Option<ControllerEvent> {
        self.last_data_at = Some(at);
        self.first_data_at.get_or_insert(at);
        if echo {
            return None;
        }
        let answer_on_slot =
            packet.source == Source::AuxiliaryController && packet.address == self.address;

        match self.state {
            ControllerState::Idle | ControllerState::TimedOut => None,
            ControllerState::Listening | ControllerState::ClaimPending => {
                if packet.is_poll_for(self.address) && packet.packet_type == PACKET_TYPE_CLAIM {
                    self.unanswered_claims = self.unanswered_claims.saturating_add(1);
                    log::trace!("Unanswered claim polls: {}", self.unanswered_claims);
                    if self.unanswered_claims >= self.claim_threshold {
                        self.schedule(
                            at + self.packet_30_delay,
                            Reply::Claim {
                                request_len: packet.payload.len(),
                            },
                        );
                        self.enter(ControllerState::ClaimPending);
                    }
                } else if answer_on_slot {
                    log::debug!("Another controller answers on {:#04X}", self.address);
                    self.unanswered_claims = 0;
                }
                None
            }
            ControllerState::Connected => {
                if packet.is_poll_for(self.address) {
                    self.last_poll_at = Some(at);
                    let delay = if packet.packet_type == PACKET_TYPE_CLAIM {
                        self.packet_30_delay
                    } else {
                        self.packet_3x_delay
                    };
                    self.schedule(
                        at + delay,
                        Reply::Poll {
                            packet_type: packet.packet_type,
                            request_len: packet.payload.len(),
                        },
                    );
                    None
                } else if answer_on_slot {
                    log::warn!(
                        "Bus collision: another controller answers on {:#04X}",
                        self.address
                    );
                    self.fail(at);
                    Some(ControllerEvent::TimedOut {
                        was_connected: true,
                    })
                } else {
                    if packet.source == Source::HeatPump
                        && packet.address == ADDRESS_HEAT_PUMP
                        && packet.packet_type == PACKET_TYPE_RESTART
                        && self.counter_due(at)
                    {
                        let page = self.counter_page.unwrap_or(0);
                        self.schedule(at + self.packet_b8_delay, Reply::CounterRequest { page });
                    }
                    None
                }
            }
        }
    }

    fn reset_session(&mut self, now: u64) {
        self.scheduled = None;
        self.unanswered_claims = 0;
        self.first_data_at = None;
        self.last_data_at = None;
        self.last_poll_at = None;
        self.counter_page = None;
        self.counter_round_at = None;
        self.state = ControllerState::Idle;
        self.start(now);
    }

    /// Checks timeouts and hands out a reply once due.
    pub fn tick(&mut self, now: u64) -> Option<ControllerEvent> {
        if self
            .last_data_at
            .is_some_and(|t| now.saturating_sub(t) >= self.data_timeout)
        {
            log::warn!("No bus data for {}ms, session lost", self.data_timeout);
            self.reset_session(now);
            return Some(ControllerEvent::SessionLost);
        }

        match self.state {
            ControllerState::Listening | ControllerState::ClaimPending
                if self
                    .first_data_at
                    .is_some_and(|t| now.saturating_sub(t) >= self.controller_timeout) =>
            {
                log::warn!(
                    "Could not connect as auxiliary controller within {}ms",
                    self.controller_timeout
                );
                self.fail(now);
                return Some(ControllerEvent::TimedOut {
                    was_connected: false,
                });
            }
            ControllerState::Connected
                if self
                    .last_poll_at
                    .is_some_and(|t| now.saturating_sub(t) >= self.controller_timeout) =>
            {
                log::warn!("Main controller stopped polling {:#04X}", self.address);
                self.fail(now);
                return Some(ControllerEvent::TimedOut {
                    was_connected: true,
                });
            }
            ControllerState::TimedOut if !self.backing_off(now) && self.wants_slot() => {
                self.unanswered_claims = 0;
                self.first_data_at = None;
                self.enter(ControllerState::Listening);
                return Some(ControllerEvent::Retrying);
            }
            _ => {}
        }

        let scheduled = self.scheduled?;
        if scheduled.due_at > now {
            return None;
        }
        self.scheduled = None;
        match scheduled.reply {
            Reply::Claim { .. } => {
                self.last_poll_at = Some(now);
                self.enter(ControllerState::Connected);
            }
            Reply::CounterRequest { page } => {
                if page == 0 {
                    self.counter_round_at = Some(now);
                }
                let next = page + 1;
                self.counter_page = (next < self.counter_pages).then_some(next);
            }
            Reply::Poll { .. } => {}
        }
        Some(ControllerEvent::Transmit(scheduled.reply))
    }
}
