use crate::prelude::*;
use crate::solarmax::QueryField;

use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS,
    TlsConfiguration, Transport,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Message {{{
/// A message below the device's topic base `<origin>/<uuid>`.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

#[derive(Serialize)]
struct DataPoint {
    access: u8,
    description: &'static str,
    label: &'static str,
    name: &'static str,
    property: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    unit: &'static str,
}

#[derive(Serialize)]
struct Report<'a> {
    name: &'static str,
    uuid: &'a str,
    sensor: &'static str,
    vendor: &'static str,
    description: &'static str,
    ip: Option<&'a str>,
    org: &'a str,
    datas: Vec<DataPoint>,
}

#[derive(Serialize)]
struct Stop {
    alive: bool,
}

impl Message {
    /// Retained description of the device and of the fields in each
    /// production message.
    pub fn for_report(device: &config::Device) -> Result<Message> {
        let point = |name, label, description, property, kind, unit| DataPoint {
            access: 1,
            description,
            label,
            name,
            property,
            kind,
            unit,
        };

        let report = Report {
            name: "SolarMax inverter",
            uuid: device.uuid(),
            sensor: "solarmax",
            vendor: "SolarMax",
            description: "SolarMax inverters behind a MaxComm gateway",
            ip: device.ip(),
            org: device.origin(),
            datas: vec![
                point("time", "Timestamp", "Unix timestamp in seconds", "time", "numeric", "s"),
                point("inv", "Inverter", "Inverter address", "range", "numeric", ""),
                point("ivmax", "Ivmax", "Installed power", "power", "numeric", "W"),
                point("pac", "PAC", "AC production", "power", "numeric", "W"),
                point("eac", "Eac", "AC yield", "efficiency", "numeric", ""),
                point("pdc", "PDC", "DC production", "power", "numeric", "W"),
                point("edc", "Edc", "DC efficiency", "efficiency", "numeric", ""),
                point("qdy", "Qday", "Energy today", "days", "numeric", "kWh"),
                point("qt0", "Qtotal", "Energy total", "days", "numeric", "kWh"),
                point("stat", "Status", "Inverter status", "state", "text", ""),
                point("tmpr", "Temperature", "Heat sink temperature", "temperature", "numeric", "°C"),
            ],
        };

        Ok(Message {
            topic: "report".to_string(),
            retain: true,
            payload: serde_json::to_string(&report)?,
        })
    }

    pub fn for_stop() -> Result<Message> {
        Ok(Message {
            topic: "stop".to_string(),
            retain: false,
            payload: serde_json::to_string(&Stop { alive: false })?,
        })
    }

    /// `cmd/<address>/set` with `{"PAC": 4000}` becomes a `WriteSetting`.
    pub fn to_command(&self) -> Result<Command> {
        let (address, rest) = self.split_cmd_topic()?;

        match rest[..] {
            ["set"] => Ok(Command::WriteSetting(address, self.payload_settings()?)),
            [..] => bail!("unhandled: {:?}", self),
        }
    }

    fn split_cmd_topic(&self) -> Result<(u8, Vec<&str>)> {
        let parts: Vec<&str> = self.topic.split('/').collect();

        if parts.len() < 3 || parts[0] != "cmd" {
            bail!("ignoring badly formed MQTT topic: {}", self.topic);
        }

        let address: u8 = parts[1]
            .parse()
            .map_err(|err| anyhow!("bad inverter address {}: {}", parts[1], err))?;
        if !(1..=99).contains(&address) {
            bail!("inverter address {} outside 1..=99", address);
        }

        Ok((address, parts[2..].to_vec()))
    }

    fn payload_settings(&self) -> Result<Vec<(QueryField, u64)>> {
        let raw: BTreeMap<String, u64> = serde_json::from_str(&self.payload)
            .map_err(|err| anyhow!("payload_settings: {}", err))?;
        if raw.is_empty() {
            bail!("payload_settings: nothing to write");
        }

        raw.into_iter()
            .map(|(key, value)| Ok((QueryField::from_str(&key)?, value)))
            .collect()
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    shutdown: Arc<AtomicBool>,
    channels: Channels,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        Self {
            config,
            channels,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = &self.config;

        if !c.mqtt().enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let client_id = format!("solarmax-bridge-{}", c.device().uuid());
        let mut options = MqttOptions::new(client_id, c.mqtt().host(), c.mqtt().port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(c.mqtt().keepalive());
        if let (Some(u), Some(p)) = (c.mqtt().username(), c.mqtt().password()) {
            options.set_credentials(u, p);
        }
        if c.mqtt().use_tls() {
            options.set_transport(tls_transport(&c.mqtt())?);
        }

        info!(
            "initializing mqtt at {}:{}{}",
            c.mqtt().host(),
            c.mqtt().port(),
            if c.mqtt().use_tls() { " (tls)" } else { "" }
        );

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        client
            .subscribe(format!("{}/cmd/#", self.topic_base()), QoS::AtMostOnce)
            .await?;

        let report = Message::for_report(&self.config.device())?;
        client
            .publish(
                format!("{}/{}", self.topic_base(), report.topic),
                QoS::AtLeastOnce,
                report.retain,
                report.payload,
            )
            .await?;

        Ok(())
    }

    // mqtt -> poller
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            if let Ok(event) =
                tokio::time::timeout(std::time::Duration::from_secs(1), eventloop.poll()).await
            {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if let Err(e) = self.handle_message(publish) {
                            warn!("{}", e);
                        }
                    }
                    Err(e) => {
                        if !self.shutdown.load(Ordering::Relaxed) {
                            error!("{}", e);
                            info!("reconnecting in 5s");
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                    _ => {} // keepalives etc
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    fn handle_message(&self, publish: Publish) -> Result<()> {
        // strip the topic base including the following /
        let Some(topic) = publish
            .topic
            .strip_prefix(&self.topic_base())
            .and_then(|t| t.strip_prefix('/'))
        else {
            warn!("ignoring message outside {}: {}", self.topic_base(), publish.topic);
            return Ok(());
        };

        let message = Message {
            topic: topic.to_owned(),
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())
                .map_err(|err| anyhow!("ignoring non-UTF-8 payload on {}: {}", topic, err))?,
        };
        debug!("RX: {:?}", message);
        if self
            .channels
            .from_mqtt
            .send(ChannelData::Message(message))
            .is_err()
        {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }

    // poller -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            match receiver.recv().await? {
                ChannelData::Shutdown => {
                    info!("MQTT sender received shutdown signal");
                    let stop = Message::for_stop()?;
                    if let Err(err) = self.publish(&client, &stop).await {
                        warn!("publishing stop failed: {:?}", err);
                    }
                    self.shutdown.store(true, Ordering::Relaxed);
                    let _ = client.disconnect().await;
                    break;
                }
                ChannelData::Message(message) => {
                    let mut attempt = 1;
                    while let Err(err) = self.publish(&client, &message).await {
                        if attempt == 3 {
                            error!("MQTT publish failed, dropping {}: {:?}", message.topic, err);
                            break;
                        }
                        error!(
                            "MQTT publish failed: {:?} - retrying in 10s (attempt {}/3)",
                            err, attempt
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                        attempt += 1;
                    }
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: &Message) -> Result<()> {
        let topic = format!("{}/{}", self.topic_base(), message.topic);
        info!("publishing: {} = {}", topic, message.payload);
        client
            .publish(
                &topic,
                QoS::AtLeastOnce,
                message.retain,
                message.payload.as_bytes().to_vec(),
            )
            .await?;
        Ok(())
    }

    fn topic_base(&self) -> String {
        self.config.device().topic_base()
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.topic_base())
    }
}

fn tls_transport(mqtt: &config::Mqtt) -> Result<Transport> {
    let path = mqtt
        .ca_cert()
        .ok_or_else(|| anyhow!("mqtt.use_tls needs mqtt.ca_cert"))?;
    let ca = std::fs::read(path).map_err(|err| anyhow!("error reading {}: {}", path, err))?;

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, payload: &str) -> Message {
        Message {
            topic: topic.to_string(),
            retain: false,
            payload: payload.to_string(),
        }
    }

    #[test]
    fn set_command() {
        let command = message("cmd/2/set", r#"{"PAC": 4000, "KDY": 1}"#)
            .to_command()
            .unwrap();
        assert_eq!(
            command,
            Command::WriteSetting(2, vec![(QueryField::KDY, 1), (QueryField::PAC, 4000)])
        );
    }

    #[test]
    fn bad_commands() {
        assert!(message("cmd/2/get", "{}").to_command().is_err());
        assert!(message("cmd/2", r#"{"PAC": 1}"#).to_command().is_err());
        assert!(message("cmd/x/set", r#"{"PAC": 1}"#).to_command().is_err());
        assert!(message("cmd/100/set", r#"{"PAC": 1}"#).to_command().is_err());
        assert!(message("report/2/set", r#"{"PAC": 1}"#).to_command().is_err());
        assert!(message("cmd/2/set", r#"{"XYZ": 1}"#).to_command().is_err());
        assert!(message("cmd/2/set", "{}").to_command().is_err());
        assert!(message("cmd/2/set", "4000").to_command().is_err());
    }

    #[test]
    fn report_is_retained() {
        let device = config::Device {
            uuid: "0x4f2a9c".to_string(),
            origin: "home".to_string(),
            ip: None,
        };
        let report = Message::for_report(&device).unwrap();
        assert_eq!(report.topic, "report");
        assert!(report.retain);

        let json: serde_json::Value = serde_json::from_str(&report.payload).unwrap();
        assert_eq!(json["uuid"], "0x4f2a9c");
        assert_eq!(json["datas"].as_array().unwrap().len(), 11);
    }

    fn bridge() -> (Mqtt, broadcast::Receiver<ChannelData>) {
        let config = Config::from_yaml(
            r#"
device:
  uuid: "0x4f2a9c"
  origin: home
gateways:
  - host: 192.168.1.123
    inverters: [1]
mqtt:
  host: localhost
"#,
        )
        .unwrap();
        let channels = Channels::new();
        let commands = channels.from_mqtt.subscribe();
        (Mqtt::new(ConfigWrapper::from_config(config), channels), commands)
    }

    #[test]
    fn bad_payload_is_dropped_and_next_message_passes() {
        let (mqtt, mut commands) = bridge();

        let garbage = Publish::new("home/0x4f2a9c/cmd/2/set", QoS::AtMostOnce, vec![0xFF]);
        assert!(mqtt.handle_message(garbage).is_err());

        let other = Publish::new("elsewhere/cmd/2/set", QoS::AtMostOnce, "{}");
        assert!(mqtt.handle_message(other).is_ok());

        let good = Publish::new("home/0x4f2a9c/cmd/2/set", QoS::AtMostOnce, r#"{"PAC": 4000}"#);
        mqtt.handle_message(good).unwrap();

        match commands.try_recv().unwrap() {
            ChannelData::Message(message) => {
                assert_eq!(message.topic, "cmd/2/set");
                assert_eq!(message.payload, r#"{"PAC": 4000}"#);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn tls_needs_a_readable_ca() {
        let mut mqtt = config::Mqtt {
            enabled: true,
            host: "broker".to_string(),
            port: 8883,
            username: None,
            password: None,
            keepalive_secs: None,
            use_tls: true,
            ca_cert: None,
        };
        assert!(tls_transport(&mqtt).is_err());

        mqtt.ca_cert = Some("/nonexistent/ca.pem".to_string());
        assert!(tls_transport(&mqtt).is_err());
    }

    #[test]
    fn stop_message() {
        let stop = Message::for_stop().unwrap();
        assert_eq!(stop.topic, "stop");
        assert_eq!(stop.payload, r#"{"alive":false}"#);
    }
}
