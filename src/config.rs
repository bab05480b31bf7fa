use crate::prelude::*;

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub device: Device,
    pub gateways: Vec<Gateway>,
    #[serde(default)]
    pub poller: Poller,
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Device {{{
/// Identifies this bridge towards the broker; every topic starts with
/// `<origin>/<uuid>`.
#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    pub uuid: String,
    pub origin: String,
    /// Reported in the device report only.
    pub ip: Option<String>,
}

impl Device {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn topic_base(&self) -> String {
        format!("{}/{}", self.origin, self.uuid)
    }
} // }}}

// Gateway {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Gateway {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_gateway_port")]
    pub port: u16,
    pub inverters: Vec<u8>,

    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub use_tcp_nodelay: Option<bool>,
}

impl Gateway {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn inverters(&self) -> &[u8] {
        &self.inverters
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(2000))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.unwrap_or(10000))
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay.unwrap_or(true)
    }
} // }}}

// Poller {{{
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// one reading per inverter that answered cleanly
    #[default]
    All,
    /// only the last clean reading of a cycle
    Last,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Poller {
    #[serde(default = "Config::default_interval_secs")]
    pub interval_secs: f64,
    #[serde(default)]
    pub publish: PublishMode,
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            interval_secs: Config::default_interval_secs(),
            publish: PublishMode::default(),
        }
    }
}

impl Poller {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn publish(&self) -> PublishMode {
        self.publish
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    pub keepalive_secs: Option<u64>,

    #[serde(default)]
    pub use_tls: bool,
    /// PEM file with the broker's CA, required with `use_tls`.
    pub ca_cert: Option<String>,
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.unwrap_or(60))
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn ca_cert(&self) -> Option<&str> {
        self.ca_cert.as_deref()
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Config> {
        // a poisoned lock still holds a validated config
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device(&self) -> Device {
        self.lock().device.clone()
    }

    pub fn gateways(&self) -> Vec<Gateway> {
        self.lock().gateways.clone()
    }

    pub fn enabled_gateways(&self) -> Vec<Gateway> {
        self.gateways().into_iter().filter(|g| g.enabled()).collect()
    }

    /// Inverters configured across all enabled gateways.
    pub fn total_inverters(&self) -> usize {
        self.enabled_gateways()
            .iter()
            .map(|g| g.inverters().len())
            .sum()
    }

    pub fn poller(&self) -> Poller {
        self.lock().poller.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn log(&self) {
        self.lock().log();
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        let config = Self::from_yaml(&content)?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn log(&self) {
        info!("Configuration loaded successfully:");
        info!("  Device:");
        info!("    UUID: {}", self.device.uuid);
        info!("    Origin: {}", self.device.origin);
        info!("    IP: {}", self.device.ip.as_deref().unwrap_or_default());

        info!(
            "  Gateways: {} configured, {} enabled",
            self.gateways.len(),
            self.gateways.iter().filter(|g| g.enabled).count()
        );
        for (i, gw) in self.gateways.iter().enumerate() {
            info!("    Gateway[{}]:", i);
            info!("      Enabled: {}", gw.enabled);
            info!("      Host: {}", gw.host);
            info!("      Port: {}", gw.port);
            info!("      Inverters: {:?}", gw.inverters);
            info!("      Connect Timeout: {:?}", gw.connect_timeout());
            info!("      Read Timeout: {:?}", gw.read_timeout());
            info!("      TCP NoDelay: {}", gw.use_tcp_nodelay());
        }

        info!("  Poller:");
        info!("    Interval: {}s", self.poller.interval_secs);
        info!("    Publish: {:?}", self.poller.publish);

        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Keepalive: {:?}", self.mqtt.keepalive());
            info!("    TLS: {}", self.mqtt.use_tls);
            if let Some(ca) = &self.mqtt.ca_cert {
                info!("    CA Cert: {}", ca);
            }
        }

        info!("  Log Level: {}", self.loglevel);
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.uuid.is_empty() {
            bail!("device.uuid cannot be empty");
        }
        if self.device.origin.is_empty() {
            bail!("device.origin cannot be empty");
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
            if self.mqtt.use_tls && self.mqtt.ca_cert.as_deref().map_or(true, str::is_empty) {
                bail!("mqtt.use_tls needs mqtt.ca_cert");
            }
        }

        if !(self.poller.interval_secs > 0.0 && self.poller.interval_secs.is_finite()) {
            bail!("poller.interval_secs must be a positive number");
        }

        if !self.gateways.iter().any(|g| g.enabled) {
            bail!("at least one gateway must be enabled");
        }

        let mut seen = HashSet::new();
        for (i, gw) in self.gateways.iter().enumerate().filter(|(_, g)| g.enabled) {
            if gw.host.is_empty() {
                bail!("gateways[{}].host cannot be empty", i);
            }
            if gw.port == 0 {
                bail!("gateways[{}].port must be between 1 and 65535", i);
            }
            if gw.inverters.is_empty() {
                bail!("gateways[{}].inverters cannot be empty", i);
            }
            if gw.read_timeout_ms == Some(0) || gw.connect_timeout_ms == Some(0) {
                bail!("gateways[{}]: timeouts must be positive", i);
            }
            for address in &gw.inverters {
                if !(1..=99).contains(address) {
                    bail!("gateways[{}]: inverter address {} outside 1..=99", i, address);
                }
                if !seen.insert(*address) {
                    bail!("inverter address {} configured more than once", address);
                }
            }
        }

        Ok(())
    }

    fn default_gateway_port() -> u16 {
        12345
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_interval_secs() -> f64 {
        30.0
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
