//! Bridge configuration management

use crate::connection::ConnectionSettings;
use crate::identity;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const SYSTEM_CONFIG_PATH: &str = "/etc/usb-bridge/bridge.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Controller API base URL
    #[serde(default = "BridgeSettings::default_server_url")]
    pub server_url: String,
    /// Overrides the "Linux Bridge - <hostname>" default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub service_mode: bool,
    #[serde(default = "BridgeSettings::default_log_level")]
    pub log_level: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            server_url: Self::default_server_url(),
            name: None,
            service_mode: false,
            log_level: Self::default_log_level(),
        }
    }
}

impl BridgeSettings {
    fn default_server_url() -> String {
        "http://localhost:8000/api".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Interval between bridge heartbeats (e.g. "30s")
    #[serde(
        default = "PollingSettings::default_heartbeat_interval",
        with = "duration_serde"
    )]
    pub heartbeat_interval: Duration,
    /// Pause between command polls of one device
    #[serde(
        default = "PollingSettings::default_command_poll_interval",
        with = "duration_serde"
    )]
    pub command_poll_interval: Duration,
    /// Timeout applied to every USB transfer
    #[serde(default = "PollingSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Connect and read timeout of controller requests
    #[serde(
        default = "PollingSettings::default_http_timeout",
        with = "duration_serde"
    )]
    pub http_timeout: Duration,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Self::default_heartbeat_interval(),
            command_poll_interval: Self::default_command_poll_interval(),
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            http_timeout: Self::default_http_timeout(),
        }
    }
}

impl PollingSettings {
    fn default_heartbeat_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_command_poll_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_transfer_timeout_ms() -> u64 {
        5000
    }

    fn default_http_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns of devices to bridge; empty bridges everything
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Serde adapter for human-readable durations
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "1h30m", "30s" or "500ms"
    ///
    /// A trailing bare number counts as seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_ms: u64 = 0;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }
            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let unit_ms = match c {
                'h' => 3_600_000,
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    1
                }
                'm' => 60_000,
                's' => 1000,
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total_ms = num
                .checked_mul(unit_ms)
                .and_then(|ms| total_ms.checked_add(ms))
                .ok_or_else(|| format!("Duration too large: {}", s))?;
        }

        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_ms = num
                .checked_mul(1000)
                .and_then(|ms| total_ms.checked_add(ms))
                .ok_or_else(|| format!("Duration too large: {}", s))?;
        }

        if total_ms == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_millis(total_ms))
    }

    pub fn format_duration(d: Duration) -> String {
        let total_ms = d.as_millis() as u64;
        if total_ms % 1000 != 0 {
            return format!("{}ms", total_ms);
        }

        let secs = total_ms / 1000;
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        result
    }
}

impl BridgeConfig {
    /// Load configuration
    ///
    /// An explicit `path` must exist. Otherwise the user config directory
    /// and then `/etc/usb-bridge/bridge.toml` are tried, falling back to
    /// built-in defaults when neither exists.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => {
                let candidates = [Self::default_path(), PathBuf::from(SYSTEM_CONFIG_PATH)];
                match candidates.into_iter().find(|p| p.exists()) {
                    Some(p) => p,
                    None => {
                        tracing::info!("No configuration file found, using defaults");
                        return Ok(Self::default());
                    }
                }
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
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
            config_dir.join("usb-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/usb-bridge/bridge.toml")
        }
    }

    /// Engine settings derived from this configuration
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            bridge_name: self
                .bridge
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(identity::default_bridge_name),
            device_info: identity::device_info(),
            heartbeat_interval: self.polling.heartbeat_interval,
            poll_interval: self.polling.command_poll_interval,
            transfer_timeout: self.polling.transfer_timeout(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        Self::validate_server_url(&self.bridge.server_url)?;

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        let polling = &self.polling;
        for (name, value) in [
            ("heartbeat_interval", polling.heartbeat_interval),
            ("command_poll_interval", polling.command_poll_interval),
            ("http_timeout", polling.http_timeout),
            ("transfer_timeout_ms", polling.transfer_timeout()),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        Ok(())
    }

    /// Server URL must be an absolute http(s) URL
    pub fn validate_server_url(server_url: &str) -> Result<()> {
        let url = Url::parse(server_url.trim())
            .with_context(|| format!("Invalid server URL '{}'", server_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "Invalid server URL '{}', scheme must be http or https",
                server_url
            ));
        }
        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
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
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}
