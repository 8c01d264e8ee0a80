//! Configuration and diagnostics for the `spinbridge` binary.
//!
//! The bridge reads `~/.config/spinbridge/bridge.toml` when present:
//!
//! ```toml
//! [sink]
//! url = "http://localhost:3000/api/metrics"
//! interval_ms = 1000
//!
//! [adapter]
//! vendor_signature = "Cambridge Silicon Radio"
//!
//! [[devices]]
//! name = "Gymnasticon"
//! address = "B8:27:EB:95:0B:90"
//! characteristics = ["cycling_power", "csc"]
//!
//! [[devices]]
//! name = "COROS PACE 3"
//! address = "F7:AF:40:38:08:90"
//! characteristics = ["heart_rate"]
//! ```

pub mod check;
pub mod config;

pub use check::format_radio_table;
pub use config::{
    AdapterConfig, Config, ConfigError, DeviceConfig, SinkConfig, TimingConfig, ValidationError,
    default_config_path,
};
