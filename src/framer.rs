use crate::error::{Error, Result};

/// A complete bus frame, CRC byte still attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Vec<u8>,
    /// Arrival time of the last byte in milliseconds.
    pub ended_at: u64,
}

/// Splits the bus byte stream into frames on idle gaps.
#[derive(Debug)]
pub struct Framer {
    rx_buffer: Vec<u8>,
    capacity: usize,
    gap: u64,
    last_byte_at: u64,
    // set after an overflow until the next gap
    discarding: bool,
}

impl Framer {
    pub fn new(capacity: usize, gap: u64) -> Self {
        Self {
            rx_buffer: Vec::with_capacity(capacity),
            capacity,
            gap,
            last_byte_at: 0,
            discarding: false,
        }
    }

    fn idle(&self, now: u64) -> bool {
        now.saturating_sub(self.last_byte_at) >= self.gap
    }

    fn take(&mut self) -> Option<Frame> {
        if self.rx_buffer.is_empty() {
            return None;
        }
        let bytes = std::mem::replace(&mut self.rx_buffer, Vec::with_capacity(self.capacity));
        log::trace!("Frame complete: {:02X?}", bytes);
        Some(Frame {
            bytes,
            ended_at: self.last_byte_at,
        })
    }

    /// Feeds one byte. Returns the previous frame if this byte follows an idle gap.
    pub fn push(&mut self, byte: u8, now: u64) -> Result<Option<Frame>> {
        let mut completed = None;
        if self.idle(now) {
            completed = self.take();
            self.discarding = false;
        }
        self.last_byte_at = now;
        if self.discarding {
            return Ok(completed);
        }
        if self.rx_buffer.len() >= self.capacity {
            log::warn!(
                "Read buffer overflow, discarding {} bytes: {:02X?}",
                self.rx_buffer.len(),
                self.rx_buffer
            );
            self.rx_buffer.clear();
            self.discarding = true;
            return Err(Error::FrameOverflow {
                capacity: self.capacity,
            });
        }
        self.rx_buffer.push(byte);
        Ok(completed)
    }

    /// Completes the pending frame once the bus went idle.
    pub fn poll(&mut self, now: u64) -> Option<Frame> {
        if !self.idle(now) {
            return None;
        }
        self.discarding = false;
        self.take()
    }

    pub fn is_receiving(&self) -> bool {
        !self.rx_buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.rx_buffer.clear();
        self.discarding = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_on_gap() {
        let mut framer = Framer::new(8, 5);
        assert_eq!(framer.push(0x00, 100).unwrap(), None);
        assert_eq!(framer.push(0x00, 101).unwrap(), None);
        assert_eq!(framer.push(0x10, 102).unwrap(), None);
        assert_eq!(framer.poll(106), None);

        let frame = framer.push(0x40, 120).unwrap().unwrap();
        assert_eq!(frame.bytes, vec![0x00, 0x00, 0x10]);
        assert_eq!(frame.ended_at, 102);

        let frame = framer.poll(125).unwrap();
        assert_eq!(frame.bytes, vec![0x40]);
        assert_eq!(framer.poll(200), None);
    }

    #[test]
    fn overflow_discards_partial_frame() {
        let mut framer = Framer::new(4, 5);
        for (i, byte) in [1u8, 2, 3, 4].into_iter().enumerate() {
            framer.push(byte, 10 + i as u64).unwrap();
        }
        assert!(matches!(
            framer.push(5, 14),
            Err(Error::FrameOverflow { capacity: 4 })
        ));
        // rest of the oversized frame is dropped
        assert_eq!(framer.push(6, 15).unwrap(), None);
        assert_eq!(framer.poll(30), None);

        framer.push(7, 40).unwrap();
        assert_eq!(framer.poll(50).unwrap().bytes, vec![7]);
    }
}
