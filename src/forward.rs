use crate::config::{millis, Config, DataPacketsMode};
use crate::history::SlotId;
use crate::protocol::{Packet, TypeRange, PACKET_TYPE_COUNTER};

/// Decides which packets reach the forwarding sink.
#[derive(Debug)]
pub struct Forwarder {
    forward_range: TypeRange,
    saved_range: TypeRange,
    forward_all: bool,
    mode: DataPacketsMode,
    resend_period: u64,
    last_forward: Vec<Option<u64>>,
}

impl Forwarder {
    pub fn new(config: &Config) -> Self {
        Self {
            forward_range: config.forward_range,
            saved_range: config.saved_range,
            forward_all: config.forward_all,
            mode: config.data_mode,
            resend_period: millis(config.timing.data_resend_period),
            last_forward: vec![None; config.saved_packets_num()],
        }
    }

    /// `slot` is the history slot of the packet, `changed` its change status.
    /// Records the forward time when the answer is yes.
    pub fn should_forward(
        &mut self,
        packet: &Packet,
        slot: Option<SlotId>,
        changed: bool,
        now: u64,
    ) -> bool {
        if packet.packet_type == PACKET_TYPE_COUNTER {
            return true;
        }
        if !self.forward_all && !self.forward_range.contains(packet.packet_type) {
            return false;
        }
        let Some(slot) = slot.filter(|_| self.saved_range.contains(packet.packet_type)) else {
            return true;
        };
        let last = self.last_forward[slot];
        let forward = match self.mode {
            DataPacketsMode::Always => true,
            DataPacketsMode::OnlyChange => changed,
            DataPacketsMode::ChangeAndResend => {
                changed || last.map_or(true, |t| now.saturating_sub(t) >= self.resend_period)
            }
        };
        if forward {
            self.last_forward[slot] = Some(now);
        } else {
            log::trace!(
                "Suppressing unchanged {:?} type {:#04X}",
                packet.source,
                packet.packet_type
            );
        }
        forward
    }

    pub fn reset(&mut self) {
        self.last_forward.iter_mut().for_each(|t| *t = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Source;

    fn packet(packet_type: u8) -> Packet {
        Packet::new(Source::HeatPump, 0x00, packet_type, &[0; 8])
    }

    #[test]
    fn range_and_change() {
        let mut forwarder = Forwarder::new(&Config::default());
        assert!(!forwarder.should_forward(&packet(0x20), None, true, 0));
        assert!(forwarder.should_forward(&packet(0x11), Some(1), true, 0));
        assert!(!forwarder.should_forward(&packet(0x11), Some(1), false, 1000));
        assert!(forwarder.should_forward(&packet(0x11), Some(1), true, 2000));
    }

    #[test]
    fn counters_always_forward() {
        let mut forwarder = Forwarder::new(&Config::default());
        assert!(forwarder.should_forward(&packet(PACKET_TYPE_COUNTER), None, false, 0));
        assert!(forwarder.should_forward(&packet(PACKET_TYPE_COUNTER), None, false, 1));
    }

    #[test]
    fn resend_after_period() {
        let mut forwarder = Forwarder::new(&Config::default());
        assert!(forwarder.should_forward(&packet(0x10), Some(0), true, 0));
        assert!(!forwarder.should_forward(&packet(0x10), Some(0), false, 599_999));
        assert!(forwarder.should_forward(&packet(0x10), Some(0), false, 600_000));
        assert!(!forwarder.should_forward(&packet(0x10), Some(0), false, 600_001));
    }

    #[test]
    fn modes() {
        let mut config = Config::default();
        config.data_mode = DataPacketsMode::OnlyChange;
        let mut forwarder = Forwarder::new(&config);
        assert!(!forwarder.should_forward(&packet(0x10), Some(0), false, 0));
        assert!(!forwarder.should_forward(&packet(0x10), Some(0), false, 10_000_000));

        config.data_mode = DataPacketsMode::Always;
        config.forward_all = true;
        let mut forwarder = Forwarder::new(&config);
        assert!(forwarder.should_forward(&packet(0x10), Some(0), false, 0));
        assert!(forwarder.should_forward(&packet(0x40), None, false, 0));
    }
}
