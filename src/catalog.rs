//! Step catalog: the declarative test script and its JSON interchange form.
//!
//! Every action is written with the complete field set regardless of kind so
//! that files stay readable by older tooling; fields a kind does not use are
//! filled with their defaults and ignored when read back.

use std::fmt;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::codec::{self, CommandFrame, RelayKey, VoltageChannel};
use crate::error::{CatalogError, CodecError};

/// Version written into every interchange document.
pub const FORMAT_VERSION: &str = "1.0";

/// Step timeout used when a document does not specify one.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 60_000;

/// How a current check compares the measured value with its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Pass when `measured <= threshold`.
    Upper,
    /// Pass when `measured >= threshold`.
    Lower,
}

impl Limit {
    pub fn passes(self, measured_ma: f64, threshold_ma: f64) -> bool {
        match self {
            Limit::Upper => measured_ma <= threshold_ma,
            Limit::Lower => measured_ma >= threshold_ma,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Limit::Upper => "<=",
            Limit::Lower => ">=",
        }
    }
}

/// One atomic operation inside a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ActionRecord", into = "ActionRecord")]
pub enum SubAction {
    SetVoltage { channel: VoltageChannel, volts: f64 },
    OpenChannel { channel: VoltageChannel },
    /// Opens a V1–V3 rail and V4 with a single frame.
    OpenChannels { primary: VoltageChannel },
    StartDetection,
    /// Stops the meter stream (wire command "stop detection").
    PauseDetection,
    CheckCurrent { threshold_ma: f64, limit: Limit },
    PressKey { key: RelayKey },
    Delay { duration_ms: u64 },
    UserConfirm { prompt: String },
}

impl SubAction {
    /// The frame this action sends, or `None` for actions with no bus
    /// traffic.
    pub fn command_frame(&self) -> Option<Result<CommandFrame, CodecError>> {
        let frame = match self {
            SubAction::SetVoltage { channel, volts } => codec::set_voltage(*channel, *volts),
            SubAction::OpenChannel { channel } => Ok(codec::open_channel(*channel)),
            SubAction::OpenChannels { primary } => codec::open_channels(*primary),
            SubAction::StartDetection => Ok(codec::start_detection()),
            SubAction::PauseDetection => Ok(codec::stop_detection()),
            SubAction::PressKey { key } => Ok(codec::relay_key(*key)),
            SubAction::CheckCurrent { .. } | SubAction::Delay { .. } | SubAction::UserConfirm { .. } => {
                return None
            }
        };
        Some(frame)
    }
}

impl fmt::Display for SubAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubAction::SetVoltage { channel, volts } => write!(f, "set {channel} to {volts:.2} V"),
            SubAction::OpenChannel { channel } => write!(f, "open channel {channel}"),
            SubAction::OpenChannels { primary } => write!(f, "open channels {primary} and V4"),
            SubAction::StartDetection => f.write_str("start current detection"),
            SubAction::PauseDetection => f.write_str("pause current detection"),
            SubAction::CheckCurrent { threshold_ma, limit } => {
                write!(f, "check current {} {threshold_ma:.3} mA", limit.symbol())
            }
            SubAction::PressKey { key } => write!(f, "press {key} key"),
            SubAction::Delay { duration_ms } => write!(f, "wait {duration_ms} ms"),
            SubAction::UserConfirm { prompt } => write!(f, "operator check: {prompt}"),
        }
    }
}

/// One named step of a test script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,
    #[serde(default)]
    pub actions: Vec<SubAction>,
}

impl StepSpec {
    pub fn new(id: u32, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            actions: Vec::new(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step_timeout_ms = timeout_ms;
        self
    }

    pub fn action(mut self, action: SubAction) -> Self {
        self.actions.push(action);
        self
    }
}

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

// --- Interchange records ---

mod kind {
    pub const SET_V1_VOLTAGE: i64 = 0;
    pub const SET_V4_VOLTAGE: i64 = 1;
    pub const OPEN_V1_CHANNEL: i64 = 2;
    pub const OPEN_V4_CHANNEL: i64 = 3;
    pub const START_DETECTION: i64 = 4;
    pub const PAUSE_DETECTION: i64 = 5;
    pub const CHECK_CURRENT: i64 = 6;
    pub const PRESS_KEY: i64 = 7;
    pub const DELAY: i64 = 8;
    pub const USER_CONFIRM: i64 = 9;
    pub const OPEN_CHANNEL: i64 = 10;
}

/// Flat wire shape of a [`SubAction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    #[serde(rename = "type")]
    pub kind: i64,
    #[serde(default)]
    pub v1_value: f64,
    #[serde(default)]
    pub v2_value: f64,
    #[serde(default = "default_rail")]
    pub v1_channel: i64,
    #[serde(default)]
    pub key: i64,
    #[serde(default)]
    pub delay_ms: i64,
    #[serde(default)]
    pub current_threshold: f64,
    #[serde(default = "default_upper_limit")]
    pub is_upper_limit: bool,
    #[serde(default)]
    pub confirm_message: String,
    #[serde(default = "default_rail")]
    pub open_v1_channel: i64,
    #[serde(default = "default_battery_rail")]
    pub open_v4_channel: i64,
}

fn default_rail() -> i64 {
    i64::from(VoltageChannel::V1.id())
}

fn default_battery_rail() -> i64 {
    i64::from(VoltageChannel::V4.id())
}

fn default_upper_limit() -> bool {
    true
}

impl Default for ActionRecord {
    fn default() -> Self {
        Self {
            kind: kind::DELAY,
            v1_value: 0.0,
            v2_value: 0.0,
            v1_channel: default_rail(),
            key: 0,
            delay_ms: 0,
            current_threshold: 0.0,
            is_upper_limit: true,
            confirm_message: String::new(),
            open_v1_channel: default_rail(),
            open_v4_channel: default_battery_rail(),
        }
    }
}

impl From<SubAction> for ActionRecord {
    fn from(action: SubAction) -> Self {
        let base = ActionRecord::default();
        match action {
            SubAction::SetVoltage { channel: VoltageChannel::V4, volts } => {
                ActionRecord { kind: kind::SET_V4_VOLTAGE, v2_value: volts, ..base }
            }
            SubAction::SetVoltage { channel, volts } => ActionRecord {
                kind: kind::SET_V1_VOLTAGE,
                v1_value: volts,
                v1_channel: i64::from(channel.id()),
                ..base
            },
            SubAction::OpenChannel { channel: VoltageChannel::V4 } => {
                ActionRecord { kind: kind::OPEN_V4_CHANNEL, ..base }
            }
            SubAction::OpenChannel { channel } => ActionRecord {
                kind: kind::OPEN_V1_CHANNEL,
                v1_channel: i64::from(channel.id()),
                ..base
            },
            SubAction::OpenChannels { primary } => ActionRecord {
                kind: kind::OPEN_CHANNEL,
                open_v1_channel: i64::from(primary.id()),
                ..base
            },
            SubAction::StartDetection => ActionRecord { kind: kind::START_DETECTION, ..base },
            SubAction::PauseDetection => ActionRecord { kind: kind::PAUSE_DETECTION, ..base },
            SubAction::CheckCurrent { threshold_ma, limit } => ActionRecord {
                kind: kind::CHECK_CURRENT,
                current_threshold: threshold_ma,
                is_upper_limit: limit == Limit::Upper,
                ..base
            },
            SubAction::PressKey { key } => {
                ActionRecord { kind: kind::PRESS_KEY, key: i64::from(key.code()), ..base }
            }
            SubAction::Delay { duration_ms } => ActionRecord {
                kind: kind::DELAY,
                delay_ms: i64::try_from(duration_ms).unwrap_or(i64::MAX),
                ..base
            },
            SubAction::UserConfirm { prompt } => {
                ActionRecord { kind: kind::USER_CONFIRM, confirm_message: prompt, ..base }
            }
        }
    }
}

fn rail(field: &'static str, value: i64) -> Result<VoltageChannel, CatalogError> {
    u8::try_from(value)
        .ok()
        .and_then(VoltageChannel::from_id)
        .filter(|ch| !ch.is_battery())
        .ok_or(CatalogError::InvalidField { field, value })
}

impl TryFrom<ActionRecord> for SubAction {
    type Error = CatalogError;

    fn try_from(record: ActionRecord) -> Result<Self, Self::Error> {
        let action = match record.kind {
            kind::SET_V1_VOLTAGE => SubAction::SetVoltage {
                channel: rail("v1Channel", record.v1_channel)?,
                volts: record.v1_value,
            },
            kind::SET_V4_VOLTAGE => {
                SubAction::SetVoltage { channel: VoltageChannel::V4, volts: record.v2_value }
            }
            kind::OPEN_V1_CHANNEL => SubAction::OpenChannel { channel: rail("v1Channel", record.v1_channel)? },
            kind::OPEN_V4_CHANNEL => SubAction::OpenChannel { channel: VoltageChannel::V4 },
            kind::START_DETECTION => SubAction::StartDetection,
            kind::PAUSE_DETECTION => SubAction::PauseDetection,
            kind::CHECK_CURRENT => SubAction::CheckCurrent {
                threshold_ma: record.current_threshold,
                limit: if record.is_upper_limit { Limit::Upper } else { Limit::Lower },
            },
            kind::PRESS_KEY => SubAction::PressKey {
                key: u8::try_from(record.key)
                    .ok()
                    .and_then(RelayKey::from_code)
                    .ok_or(CatalogError::InvalidField { field: "key", value: record.key })?,
            },
            kind::DELAY => SubAction::Delay {
                duration_ms: u64::try_from(record.delay_ms)
                    .map_err(|_| CatalogError::InvalidField { field: "delayMs", value: record.delay_ms })?,
            },
            kind::USER_CONFIRM => SubAction::UserConfirm { prompt: record.confirm_message },
            kind::OPEN_CHANNEL => {
                if record.open_v4_channel != default_battery_rail() {
                    return Err(CatalogError::InvalidField {
                        field: "openV4Channel",
                        value: record.open_v4_channel,
                    });
                }
                SubAction::OpenChannels { primary: rail("openV1Channel", record.open_v1_channel)? }
            }
            other => return Err(CatalogError::UnknownActionType(other)),
        };
        Ok(action)
    }
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    version: &'a str,
    steps: &'a [StepSpec],
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    version: String,
    #[serde(default)]
    steps: Vec<StepSpec>,
}

/// Serialises `steps` into a versioned interchange document.
pub fn to_json(steps: &[StepSpec]) -> Result<String, CatalogError> {
    let doc = DocumentRef { version: FORMAT_VERSION, steps };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Parses an interchange document.
pub fn from_json(text: &str) -> Result<Vec<StepSpec>, CatalogError> {
    let doc: Document = serde_json::from_str(text)?;
    if doc.version != FORMAT_VERSION {
        warn!("step document version '{}' (expected {FORMAT_VERSION})", doc.version);
    }
    Ok(doc.steps)
}

pub fn load(path: impl AsRef<Path>) -> Result<Vec<StepSpec>, CatalogError> {
    let path = path.as_ref();
    let steps = from_json(&fs::read_to_string(path)?)?;
    debug!("loaded {} steps from {}", steps.len(), path.display());
    Ok(steps)
}

pub fn save(path: impl AsRef<Path>, steps: &[StepSpec]) -> Result<(), CatalogError> {
    let path = path.as_ref();
    fs::write(path, to_json(steps)?)?;
    debug!("saved {} steps to {}", steps.len(), path.display());
    Ok(())
}

/// The standard four-step PCBA campaign.
pub fn pcba_sequence() -> Vec<StepSpec> {
    use SubAction::*;

    let check = |threshold_ma| CheckCurrent { threshold_ma, limit: Limit::Upper };
    let delay = |duration_ms| Delay { duration_ms };
    let confirm = |prompt: &str| UserConfirm { prompt: prompt.to_string() };

    vec![
        StepSpec::new(
            1,
            "Static current and power-on",
            "V1=2.2V, V4=2.9V; off current <= 5 uA, running current with buzzer <= 160 mA",
        )
        .with_timeout_ms(120_000)
        .action(OpenChannel { channel: VoltageChannel::V1 })
        .action(SetVoltage { channel: VoltageChannel::V1, volts: 2.2 })
        .action(OpenChannel { channel: VoltageChannel::V4 })
        .action(SetVoltage { channel: VoltageChannel::V4, volts: 2.9 })
        .action(StartDetection)
        .action(delay(8000))
        .action(check(0.005))
        .action(PauseDetection)
        .action(PressKey { key: RelayKey::PowerConfirm })
        .action(delay(5000))
        .action(PressKey { key: RelayKey::Right })
        .action(delay(1000))
        .action(confirm("Does the battery indicator show 4 bars?"))
        .action(StartDetection)
        .action(delay(8000))
        .action(check(160.0))
        .action(PauseDetection),
        StepSpec::new(2, "Over-voltage protection", "V1=2.4V, V4=5.5V; the device must refuse to power on")
            .with_timeout_ms(120_000)
            .action(SetVoltage { channel: VoltageChannel::V1, volts: 2.4 })
            .action(SetVoltage { channel: VoltageChannel::V4, volts: 5.5 })
            .action(delay(500))
            .action(PressKey { key: RelayKey::PowerConfirm })
            .action(delay(3000))
            .action(confirm("Did the device stay off?")),
        StepSpec::new(
            3,
            "Normal voltage",
            "V1=2.4V, V4=3.9V; 3 bars after power-on, running current <= 120 mA",
        )
        .with_timeout_ms(120_000)
        .action(SetVoltage { channel: VoltageChannel::V4, volts: 3.9 })
        .action(delay(500))
        .action(PressKey { key: RelayKey::PowerConfirm })
        .action(delay(5000))
        .action(PressKey { key: RelayKey::Right })
        .action(delay(1000))
        .action(confirm("Does the battery indicator show 3 bars?"))
        .action(StartDetection)
        .action(delay(8000))
        .action(check(120.0))
        .action(PauseDetection),
        StepSpec::new(
            4,
            "Low-battery shutdown",
            "V1=2.4V, V4=2.9V; device shuts down by itself, off current <= 5 uA",
        )
        .with_timeout_ms(120_000)
        .action(SetVoltage { channel: VoltageChannel::V4, volts: 2.9 })
        .action(delay(15_000))
        .action(StartDetection)
        .action(delay(8000))
        .action(check(0.005))
        .action(PauseDetection),
    ]
}
