use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::UdpSocket;

/// Plain text UDP link: forwarded packets go out as hex lines, command lines come in.
pub struct UdpLink {
    socket: UdpSocket,
    target: String,
}

impl UdpLink {
    pub fn bind(listen_port: u16, target: &str) -> Result<Self> {
        let bind_addr = format!("0.0.0.0:{listen_port}");
        let socket = UdpSocket::bind(&bind_addr)
            .with_context(|| format!("Cannot bind UDP socket to {bind_addr}"))?;
        socket
            .set_broadcast(true)
            .with_context(|| "Cannot enable UDP broadcast")?;
        socket
            .set_nonblocking(true)
            .with_context(|| "Cannot make UDP socket non-blocking")?;
        log::info!("UDP socket bound to {bind_addr}, sending to {target}");
        Ok(Self {
            socket,
            target: target.to_string(),
        })
    }

    pub fn send(&self, line: &str) {
        if let Err(e) = self.socket.send_to(line.as_bytes(), &self.target) {
            log::warn!("Failed to send UDP datagram to {}: {e}", self.target);
        }
    }

    /// Datagrams received since the last call, one command line each.
    pub fn receive(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut buffer = [0u8; 512];
        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, source_addr)) => {
                    let line = String::from_utf8_lossy(&buffer[..len]).trim().to_string();
                    log::debug!("UDP command from {source_addr}: {line}");
                    if !line.is_empty() {
                        lines.push(line);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("UDP receive failed: {e}");
                    break;
                }
            }
        }
        lines
    }
}
