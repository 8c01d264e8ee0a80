//! Bridge configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use spinbridge_core::{AdapterSettings, BridgeConfig, KnownDevice, MacAddress, default_devices};
use spinbridge_types::{Characteristic, Metric};

/// Bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metrics sink settings.
    pub sink: SinkConfig,
    /// Host radio settings.
    pub adapter: AdapterConfig,
    /// Reconnect, recovery and timeout settings.
    pub timing: TimingConfig,
    /// Sensors to keep connected.
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sink: SinkConfig::default(),
            adapter: AdapterConfig::default(),
            timing: TimingConfig::default(),
            devices: default_devices().iter().map(DeviceConfig::from).collect(),
        }
    }
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    /// when no file exists.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// This checks:
    /// - The sink URL uses http or https
    /// - Intervals and timeouts are non-zero
    /// - Device addresses are 12-hex-digit MACs and unique
    /// - Each device lists at least one characteristic
    /// - No metric is fed by two devices
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.sink.validate());
        errors.extend(self.timing.validate());

        if self.devices.is_empty() {
            errors.push(ValidationError::new("devices", "at least one device is required"));
        }

        let mut seen_addresses = HashSet::new();
        let mut owners: HashMap<Metric, usize> = HashMap::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if let Ok(address) = MacAddress::parse(&device.address)
                && !seen_addresses.insert(address)
            {
                errors.push(ValidationError::new(
                    format!("{}.address", prefix),
                    format!("duplicate device address '{}'", device.address),
                ));
            }

            for metric in device.metrics() {
                match owners.get(&metric) {
                    Some(&owner) if owner != i => errors.push(ValidationError::new(
                        format!("{}.characteristics", prefix),
                        format!(
                            "metric '{}' is already provided by devices[{}]",
                            metric, owner
                        ),
                    )),
                    Some(_) => {}
                    None => {
                        owners.insert(metric, i);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Validate and convert into the orchestrator's settings.
    pub fn bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        self.validate()?;

        let mut devices = Vec::with_capacity(self.devices.len());
        for (i, device) in self.devices.iter().enumerate() {
            let address = MacAddress::parse(&device.address).map_err(|e| {
                ConfigError::Validation(vec![ValidationError::new(
                    format!("devices[{}].address", i),
                    e.to_string(),
                )])
            })?;
            devices.push(KnownDevice::new(
                device.name.clone(),
                address,
                device.characteristics.iter().copied(),
            ));
        }

        Ok(BridgeConfig {
            devices,
            publish_interval: Duration::from_millis(self.sink.interval_ms),
            status_interval: Duration::from_secs(self.timing.status_interval_secs),
            reconnect_delay: Duration::from_secs(self.timing.reconnect_delay_secs),
            recovery_delay: Duration::from_secs(self.timing.recovery_delay_secs),
            connect_timeout: Duration::from_secs(self.timing.connect_timeout_secs),
            discovery_timeout: Duration::from_secs(self.timing.discovery_timeout_secs),
            include_elapsed: self.sink.include_elapsed,
        })
    }

    /// Settings for the adapter health manager.
    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            index: self.adapter.index,
            vendor_signature: self.adapter.vendor_signature.clone(),
            service: self.adapter.service.clone(),
            grace: Duration::from_millis(self.adapter.grace_ms),
        }
    }

    /// Per-request timeout for the sink.
    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink.timeout_secs)
    }
}

/// Metrics sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Endpoint receiving `POST` requests with the JSON payload.
    pub url: String,
    /// Publish period in milliseconds.
    pub interval_ms: u64,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Add seconds since start to each payload.
    pub include_elapsed: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000/api/metrics".to_string(),
            interval_ms: 1000,
            timeout_secs: 2,
            include_elapsed: false,
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let url = self.url.trim();
        if url.is_empty() {
            errors.push(ValidationError::new("sink.url", "sink URL cannot be empty"));
        } else if !url.starts_with("http://") && !url.starts_with("https://") {
            errors.push(ValidationError::new(
                "sink.url",
                format!("URL must start with http:// or https://, got '{}'", url),
            ));
        }

        if self.interval_ms == 0 {
            errors.push(ValidationError::new(
                "sink.interval_ms",
                "publish interval must be greater than 0",
            ));
        }
        if self.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "sink.timeout_secs",
                "timeout must be greater than 0",
            ));
        }

        errors
    }
}

/// Host radio configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Use this radio index instead of matching by vendor.
    pub index: Option<u32>,
    /// Manufacturer substring of the preferred dongle.
    pub vendor_signature: String,
    /// OS Bluetooth service unit name.
    pub service: String,
    /// Wait after starting the service, in milliseconds.
    pub grace_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        let settings = AdapterSettings::default();
        Self {
            index: settings.index,
            vendor_signature: settings.vendor_signature,
            service: settings.service,
            grace_ms: duration_ms(settings.grace),
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Timer configuration, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub reconnect_delay_secs: u64,
    pub recovery_delay_secs: u64,
    pub status_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub discovery_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            recovery_delay_secs: 5,
            status_interval_secs: 5,
            connect_timeout_secs: 15,
            discovery_timeout_secs: 10,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        [
            ("timing.reconnect_delay_secs", self.reconnect_delay_secs),
            ("timing.recovery_delay_secs", self.recovery_delay_secs),
            ("timing.status_interval_secs", self.status_interval_secs),
            ("timing.connect_timeout_secs", self.connect_timeout_secs),
            ("timing.discovery_timeout_secs", self.discovery_timeout_secs),
        ]
        .into_iter()
        .filter(|(_, value)| *value == 0)
        .map(|(field, _)| ValidationError::new(field, "must be greater than 0"))
        .collect()
    }
}

/// A sensor to keep connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name used in logs.
    pub name: String,
    /// Bluetooth MAC address, with or without colons.
    pub address: String,
    /// Characteristics to subscribe to.
    pub characteristics: Vec<Characteristic>,
}

impl DeviceConfig {
    fn metrics(&self) -> HashSet<Metric> {
        self.characteristics.iter().map(|c| c.metric()).collect()
    }

    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{}.name", prefix),
                "device name cannot be empty",
            ));
        }

        if let Err(e) = MacAddress::parse(&self.address) {
            errors.push(ValidationError::new(
                format!("{}.address", prefix),
                e.to_string(),
            ));
        }

        if self.characteristics.is_empty() {
            errors.push(ValidationError::new(
                format!("{}.characteristics", prefix),
                "at least one characteristic is required",
            ));
        }

        errors
    }
}

impl From<&KnownDevice> for DeviceConfig {
    fn from(device: &KnownDevice) -> Self {
        Self {
            name: device.name.clone(),
            address: device.address.to_string(),
            characteristics: device.characteristics.clone(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `sink.url` or `devices[0].address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spinbridge")
        .join("bridge.toml")
}
