use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{DeviceError, Result};
use crate::host::HostUpdater;
use crate::remote::SendErrorPolicy;
use crate::transport::Timeouts;

pub const DEFAULT_PORT: u16 = 60001;
pub const DEFAULT_NAME: &str = "RS-WFIREX4";
pub const MAX_TIMEOUT_SECS: u64 = 300;
pub const MAX_SEND_DELAY_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Administrative switch; when false sends are dropped and learning fails
    pub enabled: bool,
    pub delay_secs: f64,
    pub send_error_policy: SendErrorPolicy,
    pub learn_timeout_secs: u64,
    pub flag_save_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SensorConfig {
    pub scan_interval: u64,
    pub temp_offset: f64,
    pub humi_offset: f64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_secs() -> u64 {
    4
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 0.4,
            send_error_policy: SendErrorPolicy::Continue,
            learn_timeout_secs: 30,
            flag_save_delay_secs: 15,
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            scan_interval: 60,
            temp_offset: 0.0,
            humi_offset: 0.0,
            max_attempts: 3,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".storage"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device.host.trim().is_empty() {
            anyhow::bail!("device.host must not be empty");
        }
        if self.sensor.scan_interval == 0 {
            anyhow::bail!("sensor.scan_interval must be positive");
        }
        if !(-10.0..=10.0).contains(&self.sensor.temp_offset) {
            anyhow::bail!(
                "sensor.temp_offset {} out of range [-10, 10]",
                self.sensor.temp_offset
            );
        }
        if !(-20.0..=20.0).contains(&self.sensor.humi_offset) {
            anyhow::bail!(
                "sensor.humi_offset {} out of range [-20, 20]",
                self.sensor.humi_offset
            );
        }
        if self.sensor.max_attempts == 0 {
            anyhow::bail!("sensor.max_attempts must be at least 1");
        }
        for (name, secs) in [
            ("device.connect_timeout_secs", self.device.connect_timeout_secs),
            ("device.read_timeout_secs", self.device.read_timeout_secs),
            ("remote.learn_timeout_secs", self.remote.learn_timeout_secs),
        ] {
            if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
                anyhow::bail!("{} {} out of range [1, {}]", name, secs, MAX_TIMEOUT_SECS);
            }
        }
        send_delay_from_secs(self.remote.delay_secs).context("remote.delay_secs")?;
        Ok(())
    }

    pub fn send_delay(&self) -> anyhow::Result<Duration> {
        send_delay_from_secs(self.remote.delay_secs)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.device.connect_timeout_secs),
            read: Duration::from_secs(self.device.read_timeout_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                host: "192.168.1.100".to_string(),
                mac: String::new(),
                name: default_name(),
                port: DEFAULT_PORT,
                connect_timeout_secs: default_timeout_secs(),
                read_timeout_secs: default_timeout_secs(),
            },
            remote: RemoteConfig::default(),
            sensor: SensorConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Pause between sends, from seconds
pub fn send_delay_from_secs(secs: f64) -> anyhow::Result<Duration> {
    if !(0.0..=MAX_SEND_DELAY_SECS).contains(&secs) {
        anyhow::bail!(
            "send delay must be between 0 and {} seconds, got {}",
            MAX_SEND_DELAY_SECS,
            secs
        );
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Normalise a MAC address to lowercase colon-separated form
///
/// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff`
/// and bare `aabbccddeeff`. Anything else is returned lowercased.
pub fn format_mac(mac: &str) -> String {
    let lower = mac.trim().to_lowercase();
    let digits: String = lower.chars().filter(|c| !matches!(c, ':' | '-' | '.')).collect();

    if digits.len() == 12 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        digits
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":")
    } else {
        lower
    }
}

/// Stand-in MAC built from the last three IPv4 octets
///
/// `00:1c:c2` is the vendor prefix of the WFIREX4.
pub fn fallback_mac(ip: &str) -> Option<String> {
    let octets: Vec<u8> = ip
        .split('.')
        .map(|o| o.parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if octets.len() != 4 {
        return None;
    }
    Some(format!(
        "00:1c:c2:{:02x}:{:02x}:{:02x}",
        octets[1], octets[2], octets[3]
    ))
}

/// Stable identifier for the device
///
/// Uses the configured MAC when present, otherwise the MAC found for
/// `host` in `arp_mac`, otherwise a stand-in derived from the IP.
pub fn device_uid(device: &DeviceConfig, arp_mac: Option<String>) -> String {
    if !device.mac.trim().is_empty() {
        return format_mac(&device.mac);
    }
    if let Some(mac) = arp_mac.filter(|m| format_mac(m) != "00:00:00:00:00:00") {
        info!("Detected MAC address as {}", mac);
        return format_mac(&mac);
    }
    match fallback_mac(&device.host) {
        Some(mac) => {
            warn!(
                "The MAC address could not be detected; using \"{}\". Set device.mac for a stable id.",
                mac
            );
            mac
        }
        None => device.host.to_lowercase(),
    }
}

/// Config file on disk; persists host changes found by MAC lookup
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn rewrite_host(&self, host: &str) -> anyhow::Result<()> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {:?}", self.path))?;
        let mut doc: toml::Table = toml::from_str(&content).context("failed to parse config")?;

        let device = doc
            .entry("device")
            .or_insert(toml::Value::Table(toml::Table::new()));
        let device = device
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("[device] is not a table"))?;
        device.insert("host".to_string(), toml::Value::String(host.to_string()));

        std::fs::write(&self.path, toml::to_string_pretty(&doc)?)
            .with_context(|| format!("failed to write {:?}", self.path))?;
        Ok(())
    }
}

#[async_trait]
impl HostUpdater for ConfigFile {
    async fn update_host(&self, host: &str) -> Result<()> {
        self.rewrite_host(host)
            .map_err(|e| DeviceError::Store(format!("{:#}", e)))?;
        info!("Persisted new device host {} to {:?}", host, self.path);
        Ok(())
    }
}
