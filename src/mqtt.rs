use anyhow::{Context, Result};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::mpsc::Sender;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_interval",
        with = "humantime_serde"
    )]
    reconnect_interval: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "p1p2".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("p1p2gateway-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    pub fn command_topic(&self) -> String {
        format!("{}/command", self.topic)
    }

    fn create_client(&self) -> (Client, Connection) {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive_interval);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            self.host,
            self.port,
            self.client_id
        );
        Client::new(options, 64)
    }
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
}

impl MqttPublisher {
    /// Connects to the broker. A background thread drives the connection,
    /// subscribes to the command topic on every connect and hands command
    /// payloads to `commands`.
    pub fn new(config: MqttConfig, commands: Sender<String>) -> Result<Self> {
        let (client, connection) = config.create_client();
        let subscriber = client.clone();
        let thread_config = config.clone();
        std::thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || drive_connection(subscriber, connection, thread_config, commands))
            .with_context(|| "Cannot start MQTT connection thread")?;
        Ok(Self { client, config })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={}",
            topic,
            self.config.qos
        );
        self.client
            .publish(topic, self.config.qos(), false, payload.as_bytes().to_vec())
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;
        Ok(())
    }
}

fn drive_connection(
    client: Client,
    mut connection: Connection,
    config: MqttConfig,
    commands: Sender<String>,
) {
    let command_topic = config.command_topic();
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == command_topic => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                log::debug!("MQTT command received: {payload}");
                if commands.send(payload).is_err() {
                    log::info!("Command receiver gone, stopping MQTT thread");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log::info!("Connected to MQTT broker.");
                if let Err(e) = client.subscribe(command_topic.as_str(), config.qos()) {
                    log::error!("Cannot subscribe to MQTT topic {command_topic}: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("MQTT connection error: {e}");
                std::thread::sleep(config.reconnect_interval);
            }
        }
    }
}
