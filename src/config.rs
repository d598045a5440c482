//! Configuration management for the supervisor
//!
//! Layers a YAML file (path from `SUPERVISOR_CONFIG`, default `config.yaml`)
//! under environment overrides such as `SUPERVISOR__SERVER__PORT=8080`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::command::CommandSpec;
use crate::registry::DeviceKind;

/// Environment variable holding the configuration file path
pub const CONFIG_PATH_ENV: &str = "SUPERVISOR_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP facade configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Polling and transport timing
    #[serde(default)]
    pub polling: PollingConfig,
    /// Supervised devices
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Device that receives `"system"` commands (defaults to the first PCS)
    #[serde(default)]
    pub system_device: Option<String>,
    /// Extra or overriding command definitions
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API host
    pub host: String,
    /// HTTP API port
    pub port: u16,
    /// Enable metrics endpoint
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Time between the starts of two polling cycles
    pub interval_ms: u64,
    /// Timeout for opening a device session
    pub connect_timeout_ms: u64,
    /// Timeout for a single request/response exchange
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device ID
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Device kind, selects the register map
    pub kind: DeviceKind,
    /// Host address
    pub host: String,
    /// Port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Modbus unit ID
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            metrics_enabled: true,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            connect_timeout_ms: 1000,
            request_timeout_ms: 1000,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        let local = |id: &str, name: &str, kind| DeviceConfig {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            host: "127.0.0.1".to_string(),
            port: default_modbus_port(),
            unit_id: default_unit_id(),
        };

        Self {
            server: ServerConfig::default(),
            polling: PollingConfig::default(),
            devices: vec![
                local("sbms", "SBMS", DeviceKind::Bms),
                local("pcs", "PCS", DeviceKind::Pcs),
                local("pn14", "PN14", DeviceKind::Renewable),
                local("diesel", "DG", DeviceKind::Genset),
            ],
            system_device: None,
            commands: vec![],
        }
    }
}

impl Config {
    /// Reject configurations the supervisor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            bail!("no devices configured");
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                bail!("device with empty id");
            }
            if device.id == crate::supervisor::SYSTEM_TARGET {
                bail!("device id `{}` is reserved", device.id);
            }
            if !seen.insert(device.id.as_str()) {
                bail!("duplicate device id `{}`", device.id);
            }
        }

        if self.polling.interval_ms == 0
            || self.polling.connect_timeout_ms == 0
            || self.polling.request_timeout_ms == 0
        {
            bail!("polling interval and timeouts must be greater than zero");
        }

        if let Some(system) = &self.system_device {
            if !seen.contains(system.as_str()) {
                bail!("system_device `{}` is not a configured device", system);
            }
        }

        for command in &self.commands {
            command
                .validate()
                .with_context(|| format!("invalid command `{}`", command.name))?;
        }

        Ok(())
    }
}

/// Load configuration from file or use defaults, then apply environment overrides
pub fn load_config() -> Result<Config> {
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.yaml".to_string());
    load_config_from(Path::new(&config_path))
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    let builder = if path.exists() {
        ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
    } else {
        tracing::warn!("Config file {} not found, using defaults", path.display());
        let defaults = ::config::Config::try_from(&Config::default())
            .with_context(|| "Failed to build default config")?;
        ::config::Config::builder().add_source(defaults)
    };

    let config: Config = builder
        .add_source(
            ::config::Environment::with_prefix("SUPERVISOR")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config file: {}", path.display()))?
        .try_deserialize()
        .with_context(|| "Failed to parse config file")?;

    config.validate()?;
    Ok(config)
}
