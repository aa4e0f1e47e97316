//! Driver configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Vendor/product of the board this driver was written for (Arduino Uno R3)
pub const DEFAULT_DEVICE_FILTER: &str = "0x2341:0x0043";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    pub log_level: String,
    /// Node names are `{node_prefix}{minor}`
    #[serde(default = "DriverSettings::default_node_prefix")]
    pub node_prefix: String,
    /// Major number reported for every node
    #[serde(default = "DriverSettings::default_major")]
    pub major: u32,
    /// Size of the node table
    #[serde(default = "DriverSettings::default_max_devices")]
    pub max_devices: u32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            node_prefix: Self::default_node_prefix(),
            major: Self::default_major(),
            max_devices: Self::default_max_devices(),
        }
    }
}

impl DriverSettings {
    fn default_node_prefix() -> String {
        "ardu_device".to_string()
    }

    fn default_major() -> u32 {
        234
    }

    fn default_max_devices() -> u32 {
        8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Supported devices as VID:PID patterns
    pub filters: Vec<String>,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: vec![DEFAULT_DEVICE_FILTER.to_string()],
        }
    }
}

impl UsbSettings {
    /// True if some filter matches `vid:pid` (an empty list matches nothing)
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.filters
            .iter()
            .any(|filter| filter_matches(filter, vid, pid))
    }
}

/// Match one `0xVID:0xPID` pattern; `*` matches any id
pub fn filter_matches(filter: &str, vid: u16, pid: u16) -> bool {
    let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
        return false;
    };
    id_matches(filter_vid, vid) && id_matches(filter_pid, pid)
}

fn id_matches(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16).is_ok_and(|v| v == id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Default bound on a blocking read; unset waits for data indefinitely
    #[serde(
        default,
        with = "duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub read_timeout: Option<Duration>,
    /// Automatic resubmissions after a stall or short transfer
    #[serde(default = "TransferSettings::default_max_retries")]
    pub max_retries: u8,
    /// Bulk-out transfers allowed in flight per device
    #[serde(default = "TransferSettings::default_writes_in_flight")]
    pub writes_in_flight: usize,
    /// Timeout the transport applies to a single bulk-out transfer
    #[serde(default = "TransferSettings::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// How long detach and flush wait for writes before cancelling them
    #[serde(default = "TransferSettings::default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            read_timeout: None,
            max_retries: Self::default_max_retries(),
            writes_in_flight: Self::default_writes_in_flight(),
            write_timeout_ms: Self::default_write_timeout_ms(),
            drain_timeout_ms: Self::default_drain_timeout_ms(),
        }
    }
}

impl TransferSettings {
    fn default_max_retries() -> u8 {
        2
    }

    fn default_writes_in_flight() -> usize {
        8
    }

    fn default_write_timeout_ms() -> u64 {
        5000
    }

    fn default_drain_timeout_ms() -> u64 {
        1000
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Serde adapter for `Option<Duration>` written as "1h30m", "2s" or "250ms"
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => format_duration(*d).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_ms: u64 = 0;
        let mut chars = s.chars().peekable();

        while chars.peek().is_some() {
            let mut number = String::new();
            while let Some(c) = chars.next_if(char::is_ascii_digit) {
                number.push(c);
            }
            let mut unit = String::new();
            while let Some(c) = chars.next_if(char::is_ascii_alphabetic) {
                unit.push(c);
            }
            if number.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let value: u64 = number
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", number))?;

            let scale = match unit.as_str() {
                "h" => 3_600_000,
                "m" => 60_000,
                "s" | "" => 1000,
                "ms" => 1,
                other => return Err(format!("Invalid duration unit: {}", other)),
            };
            total_ms = total_ms
                .checked_add(value.saturating_mul(scale))
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

pub use duration_serde::parse_duration;

impl DriverConfig {
    /// Load configuration from `path`, or from the first standard location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => [Self::default_path(), PathBuf::from("/etc/ardu-usb/driver.toml")]
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if none is usable
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

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

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ardu-usb").join("driver.toml")
        } else {
            PathBuf::from(".config/ardu-usb/driver.toml")
        }
    }

    /// Expand `~` in a user-supplied path
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        let prefix = &self.driver.node_prefix;
        if prefix.is_empty() || prefix.contains('/') || prefix.chars().any(char::is_whitespace) {
            return Err(anyhow!("Invalid node prefix '{}'", prefix));
        }

        if self.driver.max_devices == 0 {
            return Err(anyhow!("max_devices must be at least 1"));
        }

        if self.transfer.writes_in_flight == 0 {
            return Err(anyhow!("writes_in_flight must be at least 1"));
        }

        if self.usb.filters.is_empty() {
            return Err(anyhow!("At least one USB filter is required"));
        }
        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x2341:0x0043' or '0x2341:*')",
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

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x2341')",
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
