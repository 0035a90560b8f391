//! TOML configuration for the bench.
//!
//! Every key is optional; missing keys fall back to the protocol defaults.
//!
//! ```toml
//! # bench.toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! slave_address = 0xC0
//! write_timeout_ms = 1000
//!
//! [link]
//! confirmation_timeout_ms = 5000
//! max_retries = 2
//! resync_high_water = 100
//!
//! [sequencer]
//! action_delay_ms = 100
//! measurement_timeout_ms = 5000
//! default_step_timeout_ms = 60000
//! ack_timeout_ms = 16000
//! pause_ack_timeout_ms = 3000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::link::LinkConfig;
use crate::sequencer::SequencerConfig;
use crate::transport::SerialSettings;

pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Root of a `bench.toml` file.
#[derive(Debug, Default, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub serial: SerialSection,
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub sequencer: SequencerSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct SerialSection {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub slave_address: Option<u8>,
    pub write_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LinkSection {
    pub confirmation_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub resync_high_water: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SequencerSection {
    pub action_delay_ms: Option<u64>,
    pub measurement_timeout_ms: Option<u64>,
    pub default_step_timeout_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    pub pause_ack_timeout_ms: Option<u64>,
}

impl BenchConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Serial settings, with `port` taking precedence over the file.
    pub fn serial_settings(&self, port: Option<&str>) -> Option<SerialSettings> {
        let port = port.map(str::to_owned).or_else(|| self.serial.port.clone())?;
        Some(SerialSettings { port, baud_rate: self.serial.baud_rate.unwrap_or(DEFAULT_BAUD_RATE) })
    }

    pub fn link_config(&self) -> LinkConfig {
        let defaults = LinkConfig::default();
        LinkConfig {
            slave_address: self.serial.slave_address.unwrap_or(defaults.slave_address),
            write_timeout: millis_or(self.serial.write_timeout_ms, defaults.write_timeout),
            confirmation_timeout: millis_or(self.link.confirmation_timeout_ms, defaults.confirmation_timeout),
            max_retries: self.link.max_retries.unwrap_or(defaults.max_retries),
            resync_high_water: self.link.resync_high_water.unwrap_or(defaults.resync_high_water),
        }
    }

    pub fn sequencer_config(&self) -> SequencerConfig {
        let defaults = SequencerConfig::default();
        let s = &self.sequencer;
        SequencerConfig {
            action_delay: millis_or(s.action_delay_ms, defaults.action_delay),
            measurement_timeout: millis_or(s.measurement_timeout_ms, defaults.measurement_timeout),
            default_step_timeout: millis_or(s.default_step_timeout_ms, defaults.default_step_timeout),
            ack_timeout: millis_or(s.ack_timeout_ms, defaults.ack_timeout),
            pause_ack_timeout: millis_or(s.pause_ack_timeout_ms, defaults.pause_ack_timeout),
        }
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}
