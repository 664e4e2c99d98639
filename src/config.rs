//! Gateway configuration.
//!
//! Loaded from a YAML document, every field falls back to the defaults of the
//! legacy gateway firmware. Timing values are durations in humantime notation
//! (`"100ms"`, `"10m"`).

use crate::error::{Error, Result};
use crate::protocol::{known_payload_size, Crc, Source, TypeRange};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

/// How data packets in the saved range are forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataPacketsMode {
    /// Every packet.
    Always,
    /// Only packets whose payload changed.
    OnlyChange,
    /// Changed packets, plus a resend once `data_resend_period` has passed.
    ChangeAndResend,
}

/// When the gateway claims the auxiliary controller slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerMode {
    /// Passive monitoring, never writes to the bus.
    Disabled,
    /// Claims only after an explicit connect request.
    Manual,
    /// Claims as soon as the slot is free.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandsConfig {
    /// Minimum setpoint change in °C before a 0x36 write is issued.
    pub hysteresis: f32,
    /// Attempts per command without acknowledgement.
    pub attempts: u8,
    /// Capacity of each per-type queue.
    pub queue_capacity: usize,
    /// Number of acknowledged values remembered for hysteresis.
    pub saved_values: usize,
    /// Parameter writes allowed per `quota_period`, 0 for no limit.
    /// Every acknowledged write costs the heat pump an EEPROM cycle.
    pub eeprom_quota: u8,
    #[serde(with = "humantime_serde")]
    pub quota_period: Duration,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            hysteresis: 1.0,
            attempts: 5,
            queue_capacity: 10,
            saved_values: 15,
            eeprom_quota: 24,
            quota_period: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CommandsConfig {
    /// Hysteresis in raw setpoint units (0.1 °C).
    pub fn hysteresis_tenths(&self) -> u32 {
        (self.hysteresis * 10.0).round().max(0.0) as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    pub mode: ControllerMode,
    /// Auxiliary slot, 0xF0 or 0xF1.
    pub address: u8,
    /// Unanswered claim polls before the slot counts as free.
    pub claim_threshold: u8,
    /// Adapter id written into the 0x31 reply.
    pub ctrl_id: [u8; 2],
    /// Counter pages cycled through by the 0xB8 requests.
    pub counter_pages: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ControllerMode::Manual,
            address: 0xF0,
            claim_threshold: 5,
            ctrl_id: [0xB4, 0x10],
            counter_pages: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Bus silence after which the session is void.
    #[serde(with = "humantime_serde")]
    pub data_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub data_resend_period: Duration,
    /// Window after the first data to get connected, and poll timeout once connected.
    #[serde(with = "humantime_serde")]
    pub controller_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub controller_retry_period: Duration,
    #[serde(with = "humantime_serde")]
    pub packet_30_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub packet_3x_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub packet_b8_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub counter_request_period: Duration,
    /// Idle time that ends a frame.
    #[serde(with = "humantime_serde")]
    pub frame_gap: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            data_timeout: Duration::from_secs(20),
            data_resend_period: Duration::from_secs(600),
            controller_timeout: Duration::from_secs(20),
            controller_retry_period: Duration::from_secs(600),
            packet_30_delay: Duration::from_millis(100),
            packet_3x_delay: Duration::from_millis(50),
            packet_b8_delay: Duration::from_millis(9),
            counter_request_period: Duration::from_secs(600),
            frame_gap: Duration::from_millis(5),
        }
    }
}

pub const PACKET_30_DELAY_RANGE: RangeInclusive<u64> = 81..=500;
pub const PACKET_3X_DELAY_RANGE: RangeInclusive<u64> = 26..=200;
pub const PACKET_B8_DELAY_RANGE: RangeInclusive<u64> = 1..=40;
pub const FRAME_GAP_RANGE: RangeInclusive<u64> = 1..=20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Packet types forwarded to the sink. 0xB8 always is.
    pub forward_range: TypeRange,
    /// Packet types deduplicated through the history store.
    pub saved_range: TypeRange,
    /// Forward every packet type, ignoring `forward_range`.
    pub forward_all: bool,
    pub data_mode: DataPacketsMode,
    pub crc: Crc,
    /// History arena size in bytes.
    pub history_capacity: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub commands: CommandsConfig,
    pub controller: ControllerConfig,
    pub timing: TimingConfig,
    /// Log errors with the single byte codes of the legacy firmware.
    pub legacy_error_codes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forward_range: TypeRange::new(0x10, 0x16),
            saved_range: TypeRange::new(0x10, 0x16),
            forward_all: false,
            data_mode: DataPacketsMode::ChangeAndResend,
            crc: Crc::default(),
            history_capacity: 200,
            read_buffer_size: 33,
            write_buffer_size: 32,
            commands: CommandsConfig::default(),
            controller: ControllerConfig::default(),
            timing: TimingConfig::default(),
            legacy_error_codes: false,
        }
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn check_range(name: &str, value: Duration, range: RangeInclusive<u64>) -> Result<()> {
    let ms = millis(value);
    if !range.contains(&ms) {
        return Err(Error::Config(format!(
            "{name} is {ms}ms, allowed {}..={}ms",
            range.start(),
            range.end()
        )));
    }
    Ok(())
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &str = "p1p2gateway.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)?;
        let config: Self = serde_yaml::from_reader(&config_file)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of history slots, two halves for the two recognized sources.
    pub fn saved_packets_num(&self) -> usize {
        2 * self.saved_range.width()
    }

    /// Bytes the known packets of the saved range occupy in the history arena.
    pub fn expected_history_bytes(&self) -> usize {
        (self.saved_range.first..=self.saved_range.last)
            .flat_map(|t| {
                [Source::MainController, Source::HeatPump]
                    .into_iter()
                    .filter_map(move |source| known_payload_size(source, t))
            })
            .sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.forward_range.first > self.forward_range.last {
            return Err(Error::Config(format!(
                "forward_range {} is empty",
                self.forward_range
            )));
        }
        if self.saved_range.first > self.saved_range.last {
            return Err(Error::Config(format!(
                "saved_range {} is empty",
                self.saved_range
            )));
        }
        if !self.saved_range.is_subset_of(&self.forward_range) {
            return Err(Error::Config(format!(
                "saved_range {} is not inside forward_range {}",
                self.saved_range, self.forward_range
            )));
        }
        let expected = self.expected_history_bytes();
        if self.history_capacity < expected {
            return Err(Error::Config(format!(
                "history_capacity {} is below the {} bytes needed for saved_range {}",
                self.history_capacity, expected, self.saved_range
            )));
        }
        if self.read_buffer_size < crate::protocol::HEADER_LENGTH + 1 {
            return Err(Error::Config("read_buffer_size is too small".into()));
        }
        if self.write_buffer_size < crate::protocol::HEADER_LENGTH + 1 {
            return Err(Error::Config("write_buffer_size is too small".into()));
        }
        if !crate::protocol::is_auxiliary_address(self.controller.address) {
            return Err(Error::Config(format!(
                "controller address {:#04X} is not an auxiliary address",
                self.controller.address
            )));
        }
        if !(1..=50).contains(&self.controller.claim_threshold) {
            return Err(Error::Config("claim_threshold must be 1..=50".into()));
        }
        if !(1..=20).contains(&self.commands.attempts) {
            return Err(Error::Config("commands.attempts must be 1..=20".into()));
        }
        if self.commands.queue_capacity == 0 {
            return Err(Error::Config("commands.queue_capacity must be positive".into()));
        }
        if self.commands.eeprom_quota > 0 && self.commands.quota_period.is_zero() {
            return Err(Error::Config("commands.quota_period must be positive".into()));
        }
        if !(self.commands.hysteresis >= 0.0) {
            return Err(Error::Config("commands.hysteresis must not be negative".into()));
        }
        let timing = &self.timing;
        check_range("packet_30_delay", timing.packet_30_delay, PACKET_30_DELAY_RANGE)?;
        check_range("packet_3x_delay", timing.packet_3x_delay, PACKET_3X_DELAY_RANGE)?;
        check_range("packet_b8_delay", timing.packet_b8_delay, PACKET_B8_DELAY_RANGE)?;
        check_range("frame_gap", timing.frame_gap, FRAME_GAP_RANGE)?;
        if timing.frame_gap >= timing.packet_b8_delay {
            return Err(Error::Config(
                "frame_gap must be shorter than packet_b8_delay".into(),
            ));
        }
        if timing.data_timeout.is_zero() || timing.controller_timeout.is_zero() {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.expected_history_bytes(), 196);
        assert_eq!(config.saved_packets_num(), 14);
        assert_eq!(config.commands.hysteresis_tenths(), 10);
        assert_eq!(config.commands.eeprom_quota, 24);
        assert_eq!(config.controller.mode, ControllerMode::Manual);
    }

    #[test]
    fn quota_needs_a_period() {
        let mut config = Config::default();
        config.commands.quota_period = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.commands.eeprom_quota = 0;
        config.validate().unwrap();
    }

    #[test]
    fn saved_range_outside_forward_range() {
        let config = Config {
            saved_range: TypeRange::new(0x10, 0x18),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn history_capacity_too_small() {
        let config = Config {
            history_capacity: 195,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn timing_outside_safe_range() {
        let mut config = Config::default();
        config.timing.packet_30_delay = Duration::from_millis(60);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.timing.packet_b8_delay = Duration::from_millis(4);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "forward_range: {{ first: 16, last: 32 }}\n\
             data_mode: only-change\n\
             commands:\n  hysteresis: 0.5\n  quota_period: 12h\n\
             controller:\n  mode: manual\n  address: 241\n\
             timing:\n  packet_b8_delay: 12ms\n  data_resend_period: 5m"
        )
        .unwrap();
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.forward_range, TypeRange::new(0x10, 0x20));
        assert_eq!(config.saved_range, TypeRange::new(0x10, 0x16));
        assert_eq!(config.data_mode, DataPacketsMode::OnlyChange);
        assert_eq!(config.commands.hysteresis_tenths(), 5);
        assert_eq!(config.commands.quota_period, Duration::from_secs(12 * 3600));
        assert_eq!(config.controller.mode, ControllerMode::Manual);
        assert_eq!(config.controller.address, 0xF1);
        assert_eq!(config.timing.packet_b8_delay, Duration::from_millis(12));
        assert_eq!(config.timing.data_resend_period, Duration::from_secs(300));
    }

    #[test]
    fn load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "history_capacity: 10").unwrap();
        assert!(matches!(
            Config::load(file.path().to_str().unwrap()),
            Err(Error::Config(_))
        ));
    }
}
