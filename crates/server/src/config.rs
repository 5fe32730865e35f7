//! Bridge configuration management

use crate::usb::DeviceFilter;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub status: StatusSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// TCP address the Ethernet worker listens on
    #[serde(default = "ServerSettings::default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            log_level: Self::default_log_level(),
        }
    }
}

impl ServerSettings {
    fn default_bind_addr() -> String {
        "0.0.0.0:8000".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Vendor ID filter ("0x1234" or "*")
    #[serde(default = "UsbSettings::wildcard")]
    pub vendor_id: String,
    /// Product ID filter ("0x5678" or "*")
    #[serde(default = "UsbSettings::wildcard")]
    pub product_id: String,
    /// Interface class code of the Active Servo interface
    #[serde(default = "UsbSettings::default_class_code")]
    pub class_code: u8,
    /// Interval between host ticks in milliseconds
    #[serde(default = "UsbSettings::default_host_tick_ms")]
    pub host_tick_ms: u64,
    /// Interval between attach/detach checks in milliseconds
    #[serde(default = "UsbSettings::default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Timeout of a single libusb bulk transfer in milliseconds
    #[serde(default = "UsbSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Capacity of the host event queue
    #[serde(default = "UsbSettings::default_event_queue_size")]
    pub event_queue_size: usize,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::wildcard(),
            product_id: Self::wildcard(),
            class_code: Self::default_class_code(),
            host_tick_ms: Self::default_host_tick_ms(),
            probe_interval_ms: Self::default_probe_interval_ms(),
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            event_queue_size: Self::default_event_queue_size(),
        }
    }
}

impl UsbSettings {
    fn wildcard() -> String {
        "*".to_string()
    }

    fn default_class_code() -> u8 {
        0xFF // Vendor specific
    }

    fn default_host_tick_ms() -> u64 {
        10
    }

    fn default_probe_interval_ms() -> u64 {
        500
    }

    fn default_transfer_timeout_ms() -> u64 {
        5
    }

    fn default_event_queue_size() -> usize {
        16
    }

    /// Device filter built from the configured IDs
    pub fn device_filter(&self) -> Result<DeviceFilter> {
        Ok(DeviceFilter {
            vendor_id: parse_id_filter(&self.vendor_id, "vendor_id")?,
            product_id: parse_id_filter(&self.product_id, "product_id")?,
            class_code: self.class_code,
        })
    }

    pub fn host_tick(&self) -> Duration {
        Duration::from_millis(self.host_tick_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Number of host ticks between two attach/detach checks
    pub fn probe_every(&self) -> u32 {
        let ticks = self.probe_interval_ms / self.host_tick_ms.max(1);
        u32::try_from(ticks.max(1)).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Frame slots in each of the inbound and outbound pools
    #[serde(default = "RelaySettings::default_pool_size")]
    pub pool_size: usize,
    /// Capacity of each relay queue
    #[serde(default = "RelaySettings::default_queue_size")]
    pub queue_size: usize,
    /// Ethernet worker tick in milliseconds
    #[serde(default = "RelaySettings::default_eth_tick_ms")]
    pub eth_tick_ms: u64,
    /// How often the USB worker checks for an attached device, in milliseconds
    #[serde(default = "RelaySettings::default_attach_poll_ms")]
    pub attach_poll_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            pool_size: Self::default_pool_size(),
            queue_size: Self::default_queue_size(),
            eth_tick_ms: Self::default_eth_tick_ms(),
            attach_poll_ms: Self::default_attach_poll_ms(),
        }
    }
}

impl RelaySettings {
    fn default_pool_size() -> usize {
        4
    }

    fn default_queue_size() -> usize {
        4
    }

    fn default_eth_tick_ms() -> u64 {
        1
    }

    fn default_attach_poll_ms() -> u64 {
        50
    }

    pub fn eth_tick(&self) -> Duration {
        Duration::from_millis(self.eth_tick_ms)
    }

    pub fn attach_poll(&self) -> Duration {
        Duration::from_millis(self.attach_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    #[serde(default = "StatusSettings::default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "StatusSettings::default_ethernet_blink_ms")]
    pub ethernet_blink_ms: u64,
    #[serde(default = "StatusSettings::default_usb_blink_ms")]
    pub usb_blink_ms: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            poll_ms: Self::default_poll_ms(),
            ethernet_blink_ms: Self::default_ethernet_blink_ms(),
            usb_blink_ms: Self::default_usb_blink_ms(),
        }
    }
}

impl StatusSettings {
    fn default_poll_ms() -> u64 {
        50
    }

    fn default_ethernet_blink_ms() -> u64 {
        250
    }

    fn default_usb_blink_ms() -> u64 {
        500
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/eth2usb/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("eth2usb").join("bridge.toml")
        } else {
            PathBuf::from(".config/eth2usb/bridge.toml")
        }
    }

    /// Parsed listen address
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.server.bind_addr))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        self.bind_addr()?;
        self.usb.device_filter()?;

        let non_zero = [
            ("usb.host_tick_ms", self.usb.host_tick_ms),
            ("usb.probe_interval_ms", self.usb.probe_interval_ms),
            ("usb.transfer_timeout_ms", self.usb.transfer_timeout_ms),
            ("usb.event_queue_size", self.usb.event_queue_size as u64),
            ("relay.pool_size", self.relay.pool_size as u64),
            ("relay.queue_size", self.relay.queue_size as u64),
            ("relay.eth_tick_ms", self.relay.eth_tick_ms),
            ("relay.attach_poll_ms", self.relay.attach_poll_ms),
            ("status.poll_ms", self.status.poll_ms),
            ("status.ethernet_blink_ms", self.status.ethernet_blink_ms),
            ("status.usb_blink_ms", self.status.usb_blink_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        Ok(())
    }
}

/// Parse a "0x1234" ID or "*" wildcard
fn parse_id_filter(id: &str, name: &str) -> Result<Option<u16>> {
    if id == "*" {
        return Ok(None);
    }

    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234') or be '*'",
            name,
            id
        ));
    };

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map(Some)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}
