use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use p1p2gateway_lib::command::CommandRequest;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

/// Parses `TT:PPPP:VVVV` (hex packet type, parameter and value).
pub fn parse_command(s: &str) -> Result<CommandRequest, String> {
    let mut parts = s.split(':');
    let (Some(packet_type), Some(param), Some(value), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected TT:PPPP:VVVV, got '{s}'"));
    };
    let packet_type = u8::from_str_radix(packet_type.trim(), 16)
        .map_err(|e| format!("invalid packet type '{packet_type}': {e}"))?;
    let param = u16::from_str_radix(param.trim(), 16)
        .map_err(|e| format!("invalid parameter '{param}': {e}"))?;
    let value = u32::from_str_radix(value.trim(), 16)
        .map_err(|e| format!("invalid value '{value}': {e}"))?;
    Ok(CommandRequest {
        packet_type,
        param,
        value,
    })
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum MqttFormat {
    /// One JSON document per event
    Json,
    /// Raw packets as hex strings
    Hex,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum RunOutput {
    /// Print forwarded packets and events to the standard output (console).
    Console,
    /// Publish forwarded packets to an MQTT broker and take commands from `<topic>/command`.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Json)]
        format: MqttFormat,
    },
    /// Send forwarded packets as hex strings over UDP and take commands on the listen port.
    Udp {
        /// Local port for incoming commands
        #[arg(long, default_value_t = 8099)]
        listen_port: u16,
        /// Destination of forwarded packets
        #[arg(long, default_value = "255.255.255.255:8099")]
        target: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the gateway on the bus
    Run {
        /// Output destination for forwarded packets
        #[command(subcommand)]
        output: RunOutput,
    },
    /// Print the effective configuration as YAML
    Config,
}

const fn about_text() -> &'static str {
    "P1/P2 heat pump bus gateway"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Gateway configuration file (YAML); defaults apply when it does not exist
    #[arg(short, long, default_value_t = p1p2gateway_lib::Config::DEFAULT_CONFIG_FILE.to_string())]
    pub config_file: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout of a single serial read, keep it below the frame gap (e.g., "1ms", "2ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1ms")]
    pub timeout: Duration,

    /// Auxiliary controller address, overrides the configuration (e.g., 0xF1)
    #[arg(long, value_parser = maybe_hex::<u8>)]
    pub address: Option<u8>,

    /// Parameter write to queue at start as TT:PPPP:VVVV in hex (e.g., 36:0003:00D2), may be repeated
    #[arg(long = "command", value_parser = parse_command)]
    pub commands: Vec<CommandRequest>,

    /// Ask for the auxiliary controller slot right away (manual controller mode)
    #[arg(long)]
    pub connect: bool,
}
