use crate::error::Result;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// Line settings of the bus adapter: 9600 baud, 8 data bits, even parity, one stop bit.
pub const BAUD_RATE: u32 = 9600;

/// Serial connection to the bus adapter.
pub struct BusPort {
    serial: Box<dyn serialport::SerialPort>,
}

impl std::fmt::Debug for BusPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusPort")
            .field("port", &self.serial.name())
            .finish()
    }
}

impl BusPort {
    /// Opens `port`. `timeout` bounds a single read and should stay well below
    /// the frame gap so byte arrival times stay accurate.
    pub fn open(port: &str, timeout: Duration) -> Result<Self> {
        let serial = serialport::new(port, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(std::io::Error::from)?;
        log::info!("Opened bus port {port} at {BAUD_RATE} baud 8E1");
        Ok(Self { serial })
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.serial
            .set_timeout(timeout)
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Reads whatever arrived. Returns 0 when the line stayed silent.
    ///
    /// The driver hands over everything buffered since the last call, so the
    /// bytes of one read carry no arrival times of their own. A caller that
    /// stalls longer than the frame gap gets several frames in one batch.
    pub fn read(&mut self, rx_buffer: &mut [u8]) -> Result<usize> {
        match self.serial.read(rx_buffer) {
            Ok(received) => {
                if received > 0 {
                    log::trace!("read: {:02X?}", &rx_buffer[..received]);
                }
                Ok(received)
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Puts a sealed frame on the bus.
    pub fn write_frame(&mut self, tx_buffer: &[u8]) -> Result<()> {
        log::trace!("write: {:02X?}", tx_buffer);
        self.serial.write_all(tx_buffer)?;
        self.serial.flush()?;
        Ok(())
    }
}
