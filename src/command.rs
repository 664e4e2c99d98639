//! Queues of parameter writes waiting for the auxiliary controller slot.
//!
//! Each writable packet type has its own bounded FIFO. An entry is written
//! when the main controller polls its packet type; the next poll of the same
//! type either carries the acknowledgement or counts the attempt as failed.

use crate::config::{millis, CommandsConfig};
use crate::controller::ControllerState;
use crate::error::{Error, Result};
use crate::protocol::{param_value_size, PACKET_TYPE_SETPOINT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// An external write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub packet_type: u8,
    pub param: u16,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    pub request: CommandRequest,
    pub attempts_remaining: u8,
    pub awaiting_ack: bool,
    pub last_sent_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    /// Setpoint too close to the last acknowledged value.
    HysteresisSuppressed,
    QueueFull,
    /// Write budget of the quota period used up.
    QuotaExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Accepted,
    /// Replaced a queued request for the same parameter.
    Superseded,
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy)]
struct SavedValue {
    param: u16,
    value: u32,
}

#[derive(Debug)]
pub struct CommandQueues {
    // BTreeMap keeps the packet types in ascending order
    queues: BTreeMap<u8, VecDeque<CommandEntry>>,
    saved: Vec<SavedValue>,
    capacity: usize,
    saved_capacity: usize,
    attempts: u8,
    hysteresis: u32,
    quota: usize,
    quota_period: u64,
    // send times of acknowledged writes inside the quota period
    writes: VecDeque<u64>,
}

impl CommandQueues {
    pub fn new(config: &CommandsConfig) -> Self {
        Self {
            queues: BTreeMap::new(),
            saved: Vec::with_capacity(config.saved_values),
            capacity: config.queue_capacity,
            saved_capacity: config.saved_values,
            attempts: config.attempts,
            hysteresis: config.hysteresis_tenths(),
            quota: usize::from(config.eeprom_quota),
            quota_period: millis(config.quota_period),
            writes: VecDeque::new(),
        }
    }

    fn saved_value(&self, param: u16) -> Option<u32> {
        self.saved
            .iter()
            .find(|saved| saved.param == param)
            .map(|saved| saved.value)
    }

    fn within_hysteresis(&self, request: &CommandRequest) -> bool {
        if request.packet_type != PACKET_TYPE_SETPOINT {
            return false;
        }
        let Some(last) = self.saved_value(request.param) else {
            return false;
        };
        let size = param_value_size(request.packet_type).unwrap_or(4);
        let delta = (signed(request.value, size) - signed(last, size)).unsigned_abs();
        delta < u64::from(self.hysteresis)
    }

    fn expire_writes(&mut self, now: u64) {
        while self
            .writes
            .front()
            .is_some_and(|&t| now.saturating_sub(t) >= self.quota_period)
        {
            self.writes.pop_front();
        }
    }

    /// Acknowledged writes still counted against the quota at `now`.
    pub fn writes_in_period(&mut self, now: u64) -> usize {
        self.expire_writes(now);
        self.writes.len()
    }

    pub fn submit(&mut self, request: CommandRequest, now: u64) -> Result<Outcome> {
        let size =
            param_value_size(request.packet_type).ok_or(Error::UnsupportedCommand(request.packet_type))?;
        if size < 4 && request.value >> (8 * size) != 0 {
            return Err(Error::RangeError {
                value: request.value,
                size,
            });
        }
        let suppressed = self.within_hysteresis(&request);
        self.expire_writes(now);
        let budget = self.quota.saturating_sub(self.writes.len() + self.len());
        let quota = self.quota;
        let capacity = self.capacity;
        let queue = self
            .queues
            .entry(request.packet_type)
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        let queued = queue
            .iter()
            .position(|entry| entry.request.param == request.param);

        if suppressed {
            if let Some(position) = queued {
                // the newest wish is what the heat pump already has
                if let Some(dropped) = queue.remove(position) {
                    log::debug!("Dropping superseded command {:?}", dropped.request);
                }
            }
            log::info!("Command {request:?} suppressed by hysteresis");
            return Ok(Outcome::Rejected(Rejection::HysteresisSuppressed));
        }

        let entry = CommandEntry {
            request,
            attempts_remaining: self.attempts,
            awaiting_ack: false,
            last_sent_at: None,
        };
        if let Some(position) = queued {
            // takes over the queued write's share of the budget
            queue[position] = entry;
            log::debug!("Command {request:?} replaces queued request");
            return Ok(Outcome::Superseded);
        }
        if quota > 0 && budget == 0 {
            log::warn!("EEPROM write quota of {quota} used up, rejecting {request:?}");
            return Ok(Outcome::Rejected(Rejection::QuotaExceeded));
        }
        if queue.len() >= capacity {
            log::warn!("Command queue for {:#04X} full, rejecting {request:?}", request.packet_type);
            return Ok(Outcome::Rejected(Rejection::QueueFull));
        }
        queue.push_back(entry);
        log::debug!("Command {request:?} queued");
        Ok(Outcome::Accepted)
    }

    /// Oldest entry of the polled packet type that is not waiting for its ack.
    pub fn next_to_send(
        &self,
        packet_type: u8,
        state: ControllerState,
    ) -> Option<CommandEntry> {
        if state != ControllerState::Connected {
            return None;
        }
        self.queues
            .get(&packet_type)?
            .iter()
            .find(|entry| !entry.awaiting_ack)
            .copied()
    }

    pub fn on_send_attempted(&mut self, entry: &CommandEntry, now: u64) {
        let Some(queued) = self.find_mut(&entry.request) else {
            return;
        };
        queued.attempts_remaining = queued.attempts_remaining.saturating_sub(1);
        queued.awaiting_ack = true;
        queued.last_sent_at = Some(now);
        log::debug!(
            "Command {:?} written, {} attempts left",
            queued.request,
            queued.attempts_remaining
        );
    }

    fn find_mut(&mut self, request: &CommandRequest) -> Option<&mut CommandEntry> {
        self.queues
            .get_mut(&request.packet_type)?
            .iter_mut()
            .find(|entry| entry.request.param == request.param && entry.request.value == request.value)
    }

    /// Removes the acknowledged entry and remembers its value.
    pub fn on_acknowledged(&mut self, packet_type: u8, param: u16, value: u32) -> Option<CommandEntry> {
        let queue = self.queues.get_mut(&packet_type)?;
        let position = queue
            .iter()
            .position(|entry| entry.awaiting_ack && entry.request.param == param && entry.request.value == value)?;
        let entry = queue.remove(position)?;
        if let Some(sent_at) = entry.last_sent_at {
            self.writes.push_back(sent_at);
        }
        if packet_type == PACKET_TYPE_SETPOINT {
            self.remember(param, value);
        }
        log::info!("Command {:?} acknowledged", entry.request);
        Some(entry)
    }

    fn remember(&mut self, param: u16, value: u32) {
        if let Some(saved) = self.saved.iter_mut().find(|saved| saved.param == param) {
            saved.value = value;
        } else if self.saved.len() < self.saved_capacity {
            self.saved.push(SavedValue { param, value });
        } else {
            log::warn!("No room to remember parameter {param:#06X}, hysteresis disabled for it");
        }
    }

    /// Closes the attempts of a polled packet type that got no acknowledgement.
    /// Returns the entries that ran out of attempts.
    pub fn on_poll(&mut self, packet_type: u8) -> Vec<CommandEntry> {
        let Some(queue) = self.queues.get_mut(&packet_type) else {
            return Vec::new();
        };
        let mut failed = Vec::new();
        queue.retain_mut(|entry| {
            if !entry.awaiting_ack {
                return true;
            }
            entry.awaiting_ack = false;
            if entry.attempts_remaining == 0 {
                log::warn!("Command {:?} not acknowledged, giving up", entry.request);
                failed.push(*entry);
                return false;
            }
            true
        });
        failed
    }

    /// Forgets outstanding attempts after the slot was lost.
    pub fn abandon_attempts(&mut self) {
        self.queues
            .values_mut()
            .flat_map(|queue| queue.iter_mut())
            .for_each(|entry| entry.awaiting_ack = false);
    }

    /// Queued entries in ascending packet type order.
    pub fn pending(&self) -> impl Iterator<Item = &CommandEntry> {
        self.queues.values().flat_map(|queue| queue.iter())
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads a raw value of `size` bytes as two's complement.
fn signed(value: u32, size: usize) -> i64 {
    let shift = 32 - 8 * size.clamp(1, 4) as u32;
    i64::from(((value << shift) as i32) >> shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues() -> CommandQueues {
        CommandQueues::new(&CommandsConfig::default())
    }

    fn setpoint(param: u16, value: u32) -> CommandRequest {
        CommandRequest {
            packet_type: PACKET_TYPE_SETPOINT,
            param,
            value,
        }
    }

    fn acknowledge(queues: &mut CommandQueues, request: CommandRequest) {
        let entry = queues
            .next_to_send(request.packet_type, ControllerState::Connected)
            .unwrap();
        queues.on_send_attempted(&entry, 0);
        assert!(queues
            .on_acknowledged(request.packet_type, request.param, request.value)
            .is_some());
    }

    #[test]
    fn hysteresis_boundary() {
        let mut queues = queues();
        assert_eq!(queues.submit(setpoint(3, 210), 0).unwrap(), Outcome::Accepted);
        acknowledge(&mut queues, setpoint(3, 210));

        assert_eq!(
            queues.submit(setpoint(3, 219), 0).unwrap(),
            Outcome::Rejected(Rejection::HysteresisSuppressed)
        );
        assert_eq!(
            queues.submit(setpoint(3, 201), 0).unwrap(),
            Outcome::Rejected(Rejection::HysteresisSuppressed)
        );
        assert_eq!(queues.submit(setpoint(3, 220), 0).unwrap(), Outcome::Accepted);
        assert_eq!(queues.submit(setpoint(3, 200), 0).unwrap(), Outcome::Superseded);
        // other parameters have no history yet
        assert_eq!(queues.submit(setpoint(4, 211), 0).unwrap(), Outcome::Accepted);
    }

    #[test]
    fn hysteresis_only_for_setpoints() {
        let mut queues = queues();
        let request = CommandRequest {
            packet_type: 0x35,
            param: 0x2F,
            value: 1,
        };
        queues.submit(request, 0).unwrap();
        acknowledge(&mut queues, request);
        assert_eq!(queues.submit(request, 0).unwrap(), Outcome::Accepted);
    }

    #[test]
    fn suppressed_request_cancels_queued_one() {
        let mut queues = queues();
        queues.submit(setpoint(3, 210), 0).unwrap();
        acknowledge(&mut queues, setpoint(3, 210));
        queues.submit(setpoint(3, 250), 0).unwrap();
        assert_eq!(queues.len(), 1);
        queues.submit(setpoint(3, 212), 0).unwrap();
        assert!(queues.is_empty());
    }

    #[test]
    fn queue_full() {
        let mut queues = queues();
        for param in 0..10 {
            assert_eq!(queues.submit(setpoint(param, 200), 0).unwrap(), Outcome::Accepted);
        }
        assert_eq!(
            queues.submit(setpoint(10, 200), 0).unwrap(),
            Outcome::Rejected(Rejection::QueueFull)
        );
        // separate queue per packet type
        let other = CommandRequest {
            packet_type: 0x3A,
            param: 1,
            value: 1,
        };
        assert_eq!(queues.submit(other, 0).unwrap(), Outcome::Accepted);
    }

    #[test]
    fn invalid_requests() {
        let mut queues = queues();
        let unsupported = CommandRequest {
            packet_type: 0x30,
            param: 0,
            value: 0,
        };
        assert!(matches!(queues.submit(unsupported, 0), Err(Error::UnsupportedCommand(0x30))));
        let too_big = CommandRequest {
            packet_type: 0x35,
            param: 0,
            value: 0x100,
        };
        assert!(matches!(queues.submit(too_big, 0), Err(Error::RangeError { size: 1, .. })));
    }

    #[test]
    fn only_connected_sends() {
        let mut queues = queues();
        queues.submit(setpoint(1, 200), 0).unwrap();
        assert!(queues.next_to_send(0x36, ControllerState::Listening).is_none());
        assert!(queues.next_to_send(0x35, ControllerState::Connected).is_none());
        assert!(queues.next_to_send(0x36, ControllerState::Connected).is_some());
    }

    #[test]
    fn fifo_skips_entries_awaiting_ack() {
        let mut queues = queues();
        queues.submit(setpoint(1, 200), 0).unwrap();
        queues.submit(setpoint(2, 200), 0).unwrap();
        let first = queues.next_to_send(0x36, ControllerState::Connected).unwrap();
        assert_eq!(first.request.param, 1);
        queues.on_send_attempted(&first, 10);
        let second = queues.next_to_send(0x36, ControllerState::Connected).unwrap();
        assert_eq!(second.request.param, 2);
    }

    #[test]
    fn retry_bound() {
        let mut queues = queues();
        queues.submit(setpoint(1, 200), 0).unwrap();
        let mut attempts = 0;
        let mut failed = Vec::new();
        for poll in 0..20 {
            failed.extend(queues.on_poll(0x36));
            if let Some(entry) = queues.next_to_send(0x36, ControllerState::Connected) {
                queues.on_send_attempted(&entry, poll * 1000);
                attempts += 1;
            }
        }
        assert_eq!(attempts, 5);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].request, setpoint(1, 200));
        assert!(queues.is_empty());
    }

    #[test]
    fn hysteresis_on_negative_setpoints() {
        let mut queues = queues();
        // -0.5 °C
        queues.submit(setpoint(3, 0xFFFB), 0).unwrap();
        acknowledge(&mut queues, setpoint(3, 0xFFFB));
        assert_eq!(
            queues.submit(setpoint(3, 0x0002), 0).unwrap(),
            Outcome::Rejected(Rejection::HysteresisSuppressed)
        );
        assert_eq!(queues.submit(setpoint(3, 0x0005), 0).unwrap(), Outcome::Accepted);
        assert_eq!(signed(0xFFF1, 2), -15);
        assert_eq!(signed(0x7F, 1), 127);
    }

    #[test]
    fn eeprom_quota_per_period() {
        let mut queues = queues();
        let day = 24 * 60 * 60 * 1000;
        for param in 0..24u16 {
            let request = setpoint(param, 200);
            assert_eq!(queues.submit(request, 1000).unwrap(), Outcome::Accepted);
            let entry = queues.next_to_send(0x36, ControllerState::Connected).unwrap();
            queues.on_send_attempted(&entry, 1000 + u64::from(param));
            queues.on_acknowledged(0x36, param, 200).unwrap();
        }
        assert_eq!(queues.writes_in_period(2000), 24);
        assert_eq!(
            queues.submit(setpoint(30, 200), 2000).unwrap(),
            Outcome::Rejected(Rejection::QuotaExceeded)
        );
        // the oldest write leaves the window
        assert_eq!(queues.submit(setpoint(30, 200), 1000 + day).unwrap(), Outcome::Accepted);
        assert_eq!(
            queues.submit(setpoint(31, 200), 1000 + day).unwrap(),
            Outcome::Rejected(Rejection::QuotaExceeded)
        );
        // replacing a queued write costs nothing extra
        assert_eq!(queues.submit(setpoint(30, 210), 1000 + day).unwrap(), Outcome::Superseded);
    }

    #[test]
    fn queued_writes_count_against_quota() {
        let config = CommandsConfig {
            eeprom_quota: 2,
            ..CommandsConfig::default()
        };
        let mut queues = CommandQueues::new(&config);
        queues.submit(setpoint(1, 200), 0).unwrap();
        queues.submit(setpoint(2, 200), 0).unwrap();
        assert_eq!(
            queues.submit(setpoint(3, 200), 0).unwrap(),
            Outcome::Rejected(Rejection::QuotaExceeded)
        );

        let unlimited = CommandsConfig {
            eeprom_quota: 0,
            ..CommandsConfig::default()
        };
        let mut queues = CommandQueues::new(&unlimited);
        for param in 0..10 {
            assert_eq!(queues.submit(setpoint(param, 200), 0).unwrap(), Outcome::Accepted);
        }
    }

    #[test]
    fn acknowledgement_must_match_value() {
        let mut queues = queues();
        queues.submit(setpoint(1, 200), 0).unwrap();
        let entry = queues.next_to_send(0x36, ControllerState::Connected).unwrap();
        queues.on_send_attempted(&entry, 0);
        assert!(queues.on_acknowledged(0x36, 1, 199).is_none());
        assert!(queues.on_acknowledged(0x36, 1, 200).is_some());
        assert!(queues.is_empty());
    }
}
