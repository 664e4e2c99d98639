use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use p1p2gateway_lib::command::{CommandRequest, Outcome};
use p1p2gateway_lib::engine::Forwarded;
use p1p2gateway_lib::serialport::BusPort;
use p1p2gateway_lib::{Engine, Event};
use serde_json::json;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use crate::{commandline, mqtt, udp};

const STATS_INTERVAL: Duration = Duration::from_secs(60);
/// One byte on the wire at 9600 baud 8E1 (11 bits), in microseconds.
const BYTE_TIME_US: u64 = 1146;

enum Sink {
    Console,
    Mqtt {
        publisher: mqtt::MqttPublisher,
        format: commandline::MqttFormat,
        commands: Receiver<String>,
    },
    Udp(udp::UdpLink),
}

/// Header and payload as one uppercase hex string.
fn hex_packet(packet: &Forwarded) -> String {
    [packet.source.header_byte(), packet.address, packet.packet_type]
        .iter()
        .chain(&packet.payload)
        .map(|b| format!("{b:02X}"))
        .collect()
}

/// Instruction received on the command topic or UDP port.
#[derive(Debug, PartialEq, Eq)]
pub enum Control {
    Write(CommandRequest),
    /// Claim the auxiliary slot (manual mode).
    Connect,
}

/// Accepts `connect`, JSON (`{"packet_type":54,"param":3,"value":210}`) or `TT:PPPP:VVVV`.
pub fn parse_command_payload(payload: &str) -> Result<Control> {
    let payload = payload.trim();
    if payload.eq_ignore_ascii_case("connect") {
        return Ok(Control::Connect);
    }
    if payload.starts_with('{') {
        return serde_json::from_str(payload)
            .map(Control::Write)
            .with_context(|| format!("Cannot parse JSON command '{payload}'"));
    }
    commandline::parse_command(payload)
        .map(Control::Write)
        .map_err(anyhow::Error::msg)
}

/// Arrival estimates for a batch of `count` bytes whose last byte came in at
/// `now`, spaced one byte time apart and never earlier than `floor`.
fn byte_times(now: u64, count: usize, floor: u64) -> impl Iterator<Item = u64> {
    (0..count as u64)
        .rev()
        .map(move |back| now.saturating_sub(back * BYTE_TIME_US / 1000).max(floor))
}

fn submit(engine: &mut Engine, request: CommandRequest) {
    match engine.submit(request) {
        Ok(Outcome::Rejected(reason)) => warn!("Command {request:?} rejected: {reason:?}"),
        Ok(outcome) => info!("Command {request:?}: {outcome:?}"),
        Err(e) => error!("Command {request:?} refused: {e}"),
    }
}

impl Sink {
    fn open(output: &commandline::RunOutput) -> Result<Self> {
        Ok(match output {
            commandline::RunOutput::Console => Sink::Console,
            commandline::RunOutput::Mqtt {
                config_file,
                format,
            } => {
                let config = mqtt::MqttConfig::load(config_file)
                    .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
                info!("Successfully loaded MQTT config from {config_file}: {config:?}");
                let (sender, commands) = mpsc::channel();
                let publisher = mqtt::MqttPublisher::new(config, sender)
                    .with_context(|| "Failed to create MQTT publisher")?;
                Sink::Mqtt {
                    publisher,
                    format: *format,
                    commands,
                }
            }
            commandline::RunOutput::Udp {
                listen_port,
                target,
            } => Sink::Udp(udp::UdpLink::bind(*listen_port, target)?),
        })
    }

    fn commands(&self) -> Vec<String> {
        match self {
            Sink::Console => Vec::new(),
            Sink::Mqtt { commands, .. } => commands.try_iter().collect(),
            Sink::Udp(link) => link.receive(),
        }
    }

    fn publish(&self, event: &Event) {
        match self {
            Sink::Console => match event {
                Event::Forward(packet) => println!(
                    "{} {:?} {}",
                    chrono::Local::now().to_rfc3339(),
                    packet.source,
                    hex_packet(packet)
                ),
                other => println!("{} {other:?}", chrono::Local::now().to_rfc3339()),
            },
            Sink::Mqtt {
                publisher, format, ..
            } => {
                let base_topic = publisher.topic();
                let (topic, payload) = match (event, format) {
                    (Event::Forward(packet), commandline::MqttFormat::Hex) => {
                        (format!("{base_topic}/hex"), hex_packet(packet))
                    }
                    (Event::Forward(packet), commandline::MqttFormat::Json) => {
                        let mut value = match serde_json::to_value(packet) {
                            Ok(value) => value,
                            Err(e) => {
                                error!("Failed to serialize packet: {e}");
                                return;
                            }
                        };
                        value["time"] = json!(chrono::Utc::now().to_rfc3339());
                        (format!("{base_topic}/packet"), value.to_string())
                    }
                    (other, _) => match serde_json::to_string(other) {
                        Ok(payload) => (format!("{base_topic}/event"), payload),
                        Err(e) => {
                            error!("Failed to serialize event: {e}");
                            return;
                        }
                    },
                };
                if let Err(e) = publisher.publish(&topic, &payload) {
                    error!("Failed to publish data to MQTT: {e:?}");
                }
            }
            Sink::Udp(link) => match event {
                Event::Forward(packet) => link.send(&hex_packet(packet)),
                other => link.send(&format!("* {other:?}")),
            },
        }
    }

    fn publish_stats(&self, engine: &Engine) {
        let stats = engine.stats();
        info!("Bus statistics: {stats:?}, state {:?}", engine.state());
        if let Sink::Mqtt { publisher, .. } = self {
            let payload = json!({
                "time": chrono::Utc::now().to_rfc3339(),
                "state": engine.state(),
                "stats": stats,
                "pending_commands": engine.commands().len(),
            });
            if let Err(e) = publisher.publish(&format!("{}/stats", publisher.topic()), &payload.to_string()) {
                error!("Failed to publish statistics to MQTT: {e:?}");
            }
        }
    }
}

pub fn run(
    mut port: BusPort,
    mut engine: Engine,
    output: commandline::RunOutput,
    connect: bool,
) -> Result<()> {
    info!("Starting gateway: output={output:?}");
    let sink = Sink::open(&output)?;

    let start = Instant::now();
    let clock = || u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    if connect {
        for event in engine.connect(clock()) {
            sink.publish(&event);
        }
    }

    let mut rx_buffer = [0u8; 64];
    let mut last_stats = Instant::now();
    let mut last_read = 0;
    loop {
        let received = port
            .read(&mut rx_buffer)
            .with_context(|| "Cannot read from bus")?;
        let now = clock();
        let mut events = Vec::new();
        if received > 0 {
            let times = byte_times(now, received, last_read);
            for (&byte, at) in rx_buffer[..received].iter().zip(times) {
                events.extend(engine.receive(byte, at));
            }
            last_read = now;
        }
        events.extend(engine.tick(clock()));

        for event in &events {
            match event {
                Event::Transmit(tx_buffer) => port
                    .write_frame(tx_buffer)
                    .with_context(|| "Cannot write to bus")?,
                Event::StateChanged(state) => {
                    debug!("Controller state {state:?}");
                    sink.publish(event);
                }
                _ => sink.publish(event),
            }
        }

        for payload in sink.commands() {
            match parse_command_payload(&payload) {
                Ok(Control::Write(request)) => submit(&mut engine, request),
                Ok(Control::Connect) => {
                    info!("Connect requested");
                    for event in engine.connect(clock()) {
                        sink.publish(&event);
                    }
                }
                Err(e) => warn!("Ignoring command '{payload}': {e:#}"),
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            sink.publish_stats(&engine);
        }
    }
}

/// Queues the writes given on the command line.
pub fn queue_initial(engine: &mut Engine, requests: &[CommandRequest]) {
    for request in requests {
        submit(engine, *request);
    }
}
