// Configuration management for the blegate CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blegate/config.json
// - Linux: ~/.config/blegate/config.json
// - Windows: %APPDATA%\blegate\config.json

use anyhow::{Context, Result};
use blegate_core::{normalize, DecodePolicy, GatewayConfig, IdleConfig, LifecycleConfig, StrDetection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// BLE stack the gateway runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// The host's Bluetooth radio
    Btleplug,
    /// In-memory demo peripheral
    Simulated,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Btleplug => write!(f, "btleplug"),
            AdapterKind::Simulated => write!(f, "simulated"),
        }
    }
}

impl std::str::FromStr for AdapterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "btleplug" => Ok(AdapterKind::Btleplug),
            "simulated" => Ok(AdapterKind::Simulated),
            _ => anyhow::bail!("Unknown adapter: {} (expected btleplug or simulated)", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen port
    pub port: u16,

    /// URL prefix of every API route
    pub prefix: String,

    /// Adapter implementation
    pub adapter: AdapterKind,

    /// Idle time before a connection is dropped, in seconds
    pub keep_alive_secs: u64,

    /// Time between idle sweeps, in seconds
    pub check_interval_secs: u64,

    /// Report repeated advertisements while scanning
    pub allow_duplicates: bool,

    /// Only scan for peripherals advertising one of these service UUIDs
    pub scan_filter: Vec<String>,

    /// Bound on a single connect attempt, in seconds
    pub connect_timeout_secs: u64,

    /// Bound on service discovery, in seconds
    pub discovery_timeout_secs: u64,

    /// Leave `num` out of decoded values equal to zero
    pub omit_zero_num: bool,

    /// Add `str` to any printable decoded value, not just `~`-prefixed ones
    pub printable_str: bool,

    /// Directory served under /test
    pub test_dir: Option<String>,

    /// Default tracing filter
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            prefix: "/altapi".to_string(),
            adapter: AdapterKind::Btleplug,
            keep_alive_secs: 180,
            check_interval_secs: 60,
            allow_duplicates: false,
            scan_filter: Vec::new(),
            connect_timeout_secs: 10,
            discovery_timeout_secs: 10,
            omit_zero_num: true,
            printable_str: false,
            test_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blegate");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    /// Load config from a file, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value; call `save` to persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "port" => {
                self.port = value.parse().context("Invalid port number")?;
            }
            "prefix" => {
                self.prefix = normalize_prefix(value);
            }
            "adapter" => {
                self.adapter = value.parse()?;
            }
            "keep_alive_secs" => {
                self.keep_alive_secs = value.parse().context("Invalid number")?;
            }
            "check_interval_secs" => {
                let secs: u64 = value.parse().context("Invalid number")?;
                anyhow::ensure!(secs > 0, "check_interval_secs must be at least 1");
                self.check_interval_secs = secs;
            }
            "allow_duplicates" => {
                self.allow_duplicates = value.parse().context("Invalid boolean value")?;
            }
            "scan_filter" => {
                self.scan_filter = parse_scan_filter(value)?;
            }
            "connect_timeout_secs" => {
                self.connect_timeout_secs = value.parse().context("Invalid number")?;
            }
            "discovery_timeout_secs" => {
                self.discovery_timeout_secs = value.parse().context("Invalid number")?;
            }
            "omit_zero_num" => {
                self.omit_zero_num = value.parse().context("Invalid boolean value")?;
            }
            "printable_str" => {
                self.printable_str = value.parse().context("Invalid boolean value")?;
            }
            "test_dir" => {
                self.test_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "log_level" => {
                self.log_level = value.to_string();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "port" => Some(self.port.to_string()),
            "prefix" => Some(self.prefix.clone()),
            "adapter" => Some(self.adapter.to_string()),
            "keep_alive_secs" => Some(self.keep_alive_secs.to_string()),
            "check_interval_secs" => Some(self.check_interval_secs.to_string()),
            "allow_duplicates" => Some(self.allow_duplicates.to_string()),
            "scan_filter" if self.scan_filter.is_empty() => None,
            "scan_filter" => Some(self.scan_filter.join(",")),
            "connect_timeout_secs" => Some(self.connect_timeout_secs.to_string()),
            "discovery_timeout_secs" => Some(self.discovery_timeout_secs.to_string()),
            "omit_zero_num" => Some(self.omit_zero_num.to_string()),
            "printable_str" => Some(self.printable_str.to_string()),
            "test_dir" => self.test_dir.clone(),
            "log_level" => Some(self.log_level.clone()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("port".to_string(), self.port.to_string()),
            ("prefix".to_string(), self.prefix.clone()),
            ("adapter".to_string(), self.adapter.to_string()),
            ("keep_alive_secs".to_string(), format!("{}s", self.keep_alive_secs)),
            ("check_interval_secs".to_string(), format!("{}s", self.check_interval_secs)),
            ("allow_duplicates".to_string(), self.allow_duplicates.to_string()),
            (
                "scan_filter".to_string(),
                if self.scan_filter.is_empty() {
                    "(none)".to_string()
                } else {
                    self.scan_filter.join(",")
                },
            ),
            ("connect_timeout_secs".to_string(), format!("{}s", self.connect_timeout_secs)),
            ("discovery_timeout_secs".to_string(), format!("{}s", self.discovery_timeout_secs)),
            ("omit_zero_num".to_string(), self.omit_zero_num.to_string()),
            ("printable_str".to_string(), self.printable_str.to_string()),
            (
                "test_dir".to_string(),
                self.test_dir.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            ("log_level".to_string(), self.log_level.clone()),
        ]
    }

    /// Codec field-presence policy selected by `omit_zero_num` and `printable_str`
    pub fn decode_policy(&self) -> DecodePolicy {
        DecodePolicy {
            omit_zero_num: self.omit_zero_num,
            str_detection: if self.printable_str {
                StrDetection::Printable
            } else {
                StrDetection::TildePrefixed
            },
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            lifecycle: LifecycleConfig {
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            },
            idle: IdleConfig {
                keep_alive: Duration::from_secs(self.keep_alive_secs),
                check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
            },
            decode_policy: self.decode_policy(),
            allow_duplicates: self.allow_duplicates,
            scan_filter: self.scan_filter.clone(),
        }
    }
}

/// Comma-separated service UUIDs, each normalized. Empty means no filter.
fn parse_scan_filter(value: &str) -> Result<Vec<String>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|uuid| !uuid.is_empty())
        .map(|uuid| {
            let plain = normalize::normalize(uuid);
            anyhow::ensure!(
                matches!(plain.len(), 4 | 8 | 32) && plain.chars().all(|c| c.is_ascii_hexdigit()),
                "Invalid service UUID: {}",
                uuid
            );
            Ok(plain)
        })
        .collect()
}

/// `altapi`, `/altapi/` and `/altapi` all mean the same prefix.
pub fn normalize_prefix(value: &str) -> String {
    let trimmed = value.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}
