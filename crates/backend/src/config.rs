//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "BridgeSettings::default_log_level")]
    pub log_level: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl BridgeSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Allowed devices as "0xVID:0xPID" patterns, `*` matches anything;
    /// empty allows every device
    #[serde(default)]
    pub filters: Vec<String>,
    /// Enable hotplug delivery at init when the host offers it
    #[serde(default = "UsbSettings::default_hotplug")]
    pub hotplug: bool,
    /// Timeout for transfers issued by the CLI (0 = wait forever)
    #[serde(default = "UsbSettings::default_timeout_ms")]
    pub default_timeout_ms: u32,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            hotplug: Self::default_hotplug(),
            default_timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl UsbSettings {
    fn default_hotplug() -> bool {
        true
    }

    fn default_timeout_ms() -> u32 {
        1000
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-bridge/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
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
            config_dir.join("usb-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/usb-bridge/bridge.toml")
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

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        parse_filter(filter).map(|_| ())
    }
}

/// One parsed side of a filter; `None` is the `*` wildcard
type FilterId = Option<u16>;

/// Split a `VID:PID` filter into its two ids
fn parse_filter(filter: &str) -> Result<(FilterId, FilterId)> {
    let (vid, pid) = filter
        .split_once(':')
        .filter(|(_, pid)| !pid.contains(':'))
        .ok_or_else(|| {
            anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            )
        })?;
    Ok((parse_filter_id(vid, "VID")?, parse_filter_id(pid, "PID")?))
}

fn parse_filter_id(id: &str, name: &str) -> Result<FilterId> {
    if id == "*" {
        return Ok(None);
    }

    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Invalid {} '{}', must start with '0x' (e.g., '0x1234')", name, id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!("Invalid {} '{}', hex part must be 1-4 digits", name, id));
    }

    u16::from_str_radix(hex_part, 16)
        .map(Some)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Load a configuration file, expanding a leading `~`
pub fn load_config(path: &str) -> Result<BridgeConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    BridgeConfig::load(Some(path_buf))
}

/// Check if a VID/PID pair is allowed by the filters
///
/// An empty list allows everything; malformed filters match nothing.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| match parse_filter(filter) {
        Ok((want_vid, want_pid)) => {
            want_vid.is_none_or(|want| want == vid) && want_pid.is_none_or(|want| want == pid)
        }
        Err(_) => false,
    })
}
