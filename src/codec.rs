//! Frame builders for the slave board's binary command protocol.
//!
//! Every builder is a pure function: it returns the data bytes that follow the
//! multidrop address byte, together with the confirmation the board is
//! expected to send back.

use std::fmt;

use crate::error::CodecError;

/// Multidrop address of the slave board.
pub const SLAVE_ADDRESS: u8 = 0xC0;

/// First byte of every meter telemetry frame (`0x50` + little-endian `f32`).
pub const TELEMETRY_HEADER: u8 = 0x50;

/// Telemetry frames are the header byte followed by a 4-byte float.
pub const TELEMETRY_FRAME_LEN: usize = 5;

/// Two-byte "pause acknowledged" pair; never occurs inside a float payload.
pub const PAUSE_ACK: [u8; 2] = [0xAA, 0x55];

/// Single-byte acknowledgements the board only ever sends on their own.
pub const STANDALONE_ACKS: [u8; 2] = [0x05, 0xAA];

/// Payload used by the link self-test when none is given.
pub const DEFAULT_LINK_TEST_PAYLOAD: [u8; 2] = [0x34, 0x34];

/// Command identifier bytes.
pub mod id {
    pub const POWER: u8 = 0x01;
    pub const VOLTAGE: u8 = 0x02;
    pub const DETECTION: u8 = 0x03;
    pub const CHANNEL_CONFIG: u8 = 0x04;
    pub const STEP_ADJUST: u8 = 0x06;
    pub const CHANNEL_OPEN: u8 = 0x12;
    pub const START_DETECTION: u8 = 0x50;
    pub const STOP_DETECTION: u8 = 0x51;
    pub const PAUSE_DETECTION: u8 = 0xAA;
    pub const BOOTLOADER_JUMP: u8 = 0x99;
}

const BOOTLOADER_JUMP_CONFIRM: u8 = 0xAA;
const START_DETECTION_ACK: u8 = 0xAA;
const STOP_DETECTION_ACK: u8 = 0x55;

/// Bytes that can start a frame on the wire; used to resynchronise a
/// confirmation buffer that grew without a match.
pub const FRAME_START_CODES: [u8; 10] = [
    id::POWER,
    id::VOLTAGE,
    id::DETECTION,
    id::CHANNEL_CONFIG,
    0x05,
    id::STEP_ADJUST,
    id::CHANNEL_OPEN,
    TELEMETRY_HEADER,
    id::STOP_DETECTION,
    id::PAUSE_DETECTION,
];

/// Programmable output rails. V1–V3 share one encoder; V4 (the battery
/// simulator) has its own code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoltageChannel {
    V1,
    V2,
    V3,
    V4,
}

impl VoltageChannel {
    pub fn id(self) -> u8 {
        match self {
            VoltageChannel::V1 => 0x01,
            VoltageChannel::V2 => 0x02,
            VoltageChannel::V3 => 0x03,
            VoltageChannel::V4 => 0x04,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(VoltageChannel::V1),
            0x02 => Some(VoltageChannel::V2),
            0x03 => Some(VoltageChannel::V3),
            0x04 => Some(VoltageChannel::V4),
            _ => None,
        }
    }

    pub fn is_battery(self) -> bool {
        self == VoltageChannel::V4
    }
}

impl fmt::Display for VoltageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.id())
    }
}

/// Relay-simulated front panel keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayKey {
    Right,
    PowerConfirm,
    Sw3,
    Sw4,
    Sw5,
    Sw6,
}

impl RelayKey {
    pub fn code(self) -> u8 {
        match self {
            RelayKey::Right => 0x02,
            RelayKey::PowerConfirm => 0x03,
            RelayKey::Sw3 => 0x31,
            RelayKey::Sw4 => 0x41,
            RelayKey::Sw5 => 0x51,
            RelayKey::Sw6 => 0x61,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x02 => Some(RelayKey::Right),
            0x03 => Some(RelayKey::PowerConfirm),
            0x31 => Some(RelayKey::Sw3),
            0x41 => Some(RelayKey::Sw4),
            0x51 => Some(RelayKey::Sw5),
            0x61 => Some(RelayKey::Sw6),
            _ => None,
        }
    }
}

impl fmt::Display for RelayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayKey::Right => "right",
            RelayKey::PowerConfirm => "power/confirm",
            RelayKey::Sw3 => "SW3",
            RelayKey::Sw4 => "SW4",
            RelayKey::Sw5 => "SW5",
            RelayKey::Sw6 => "SW6",
        };
        f.write_str(name)
    }
}

/// Current meter range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterRange {
    MilliAmp,
    MicroAmp,
}

impl MeterRange {
    pub fn code(self) -> u8 {
        match self {
            MeterRange::MilliAmp => 0x01,
            MeterRange::MicroAmp => 0x02,
        }
    }
}

/// Current meter input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterChannel {
    Ch1,
    Ch2,
    Ch3,
    Ch4,
}

impl MeterChannel {
    pub fn code(self) -> u8 {
        match self {
            MeterChannel::Ch1 => 0x11,
            MeterChannel::Ch2 => 0x21,
            MeterChannel::Ch3 => 0x31,
            MeterChannel::Ch4 => 0x41,
        }
    }
}

/// Fine adjustment direction for a rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepDirection {
    Up,
    Down,
}

impl StepDirection {
    pub fn code(self) -> u8 {
        match self {
            StepDirection::Up => 0x01,
            StepDirection::Down => 0x02,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0x01 => Ok(StepDirection::Up),
            0x02 => Ok(StepDirection::Down),
            other => Err(CodecError::InvalidDirection(other)),
        }
    }
}

/// Semantic identity of a frame; confirmations are matched against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    PowerOn,
    PowerOff,
    VoltageControl(VoltageChannel),
    SetVoltage(VoltageChannel),
    StepAdjust(VoltageChannel),
    OpenChannels(VoltageChannel),
    OpenChannel(VoltageChannel),
    DetectionSelect,
    StartDetection,
    StopDetection,
    PauseDetection,
    RelayKey(RelayKey),
    LinkTest,
    BootloaderJump,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::PowerOn => f.write_str("power on"),
            Command::PowerOff => f.write_str("power off"),
            Command::VoltageControl(ch) => write!(f, "voltage control {ch}"),
            Command::SetVoltage(ch) => write!(f, "set voltage {ch}"),
            Command::StepAdjust(ch) => write!(f, "step adjust {ch}"),
            Command::OpenChannels(ch) => write!(f, "open channels {ch}+V4"),
            Command::OpenChannel(ch) => write!(f, "open channel {ch}"),
            Command::DetectionSelect => f.write_str("detection select"),
            Command::StartDetection => f.write_str("start detection"),
            Command::StopDetection => f.write_str("stop detection"),
            Command::PauseDetection => f.write_str("pause detection"),
            Command::RelayKey(key) => write!(f, "relay key {key}"),
            Command::LinkTest => f.write_str("link test"),
            Command::BootloaderJump => f.write_str("bootloader jump"),
        }
    }
}

/// One outbound frame: the bytes after the address byte plus the confirmation
/// that acknowledges it (`None` for fire-and-forget commands).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    command: Command,
    bytes: Vec<u8>,
    expected: Option<Vec<u8>>,
}

impl CommandFrame {
    fn echoed(command: Command, bytes: Vec<u8>) -> Self {
        let expected = Some(bytes.clone());
        Self { command, bytes, expected }
    }

    fn with_response(command: Command, bytes: Vec<u8>, expected: Vec<u8>) -> Self {
        Self { command, bytes, expected: Some(expected) }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn expected(&self) -> Option<&[u8]> {
        self.expected.as_deref()
    }

    pub fn into_parts(self) -> (Command, Vec<u8>, Option<Vec<u8>>) {
        (self.command, self.bytes, self.expected)
    }
}

/// Rails V1–V3 and the battery rail V4 accept slightly different codes;
/// these are the canonical V4 levels with a dedicated code.
const SPECIAL_VOLTAGE_CODES: [(f64, u8); 10] = [
    (2.90, 0x29),
    (3.20, 0x32),
    (3.45, 0xD9),
    (3.65, 0xDB),
    (3.85, 0xDD),
    (3.90, 0x39),
    (4.05, 0xE5),
    (4.70, 0x47),
    (5.50, 0x55),
    (0.00, 0x00),
];

/// Packs a voltage into one byte: integer volts in the high nibble, tenths in
/// the low nibble. Rounds to 0.1 V and clamps to `[0.0, 9.9]`.
pub fn encode_voltage(volts: f64) -> u8 {
    let tenths = ((volts * 10.0).round() as i64).clamp(0, 99);
    (((tenths / 10) << 4) | (tenths % 10)) as u8
}

/// V4 encoding: exact table codes for canonical levels (±0.01 V), otherwise
/// the plain nibble encoding.
pub fn encode_special_voltage(volts: f64) -> u8 {
    let volts = (volts * 100.0).round() / 100.0;
    SPECIAL_VOLTAGE_CODES
        .iter()
        .find(|(level, _)| (volts - level).abs() < 0.01)
        .map(|&(_, code)| code)
        .unwrap_or_else(|| encode_voltage(volts))
}

/// Encodes a voltage with the encoder the given rail uses.
pub fn encode_for_channel(channel: VoltageChannel, volts: f64) -> u8 {
    if channel.is_battery() {
        encode_special_voltage(volts)
    } else {
        encode_voltage(volts)
    }
}

fn check_rail_voltage(volts: f64) -> Result<(), CodecError> {
    if volts.is_nan() || (volts != 0.0 && !(1.2..=5.0).contains(&volts)) {
        return Err(CodecError::VoltageOutOfRange { volts, allowed: "0.0 or 1.2-5.0 V" });
    }
    Ok(())
}

fn check_battery_voltage(volts: f64) -> Result<(), CodecError> {
    if volts.is_nan() || (volts != 0.0 && !(1.60..=10.80).contains(&volts)) {
        return Err(CodecError::VoltageOutOfRange { volts, allowed: "0.0 or 1.60-10.80 V" });
    }
    Ok(())
}

fn require_rail(channel: VoltageChannel) -> Result<(), CodecError> {
    if channel.is_battery() {
        return Err(CodecError::InvalidChannel(channel.id()));
    }
    Ok(())
}

/// `01 01`
pub fn power_on() -> CommandFrame {
    CommandFrame::echoed(Command::PowerOn, vec![id::POWER, 0x01])
}

/// `01 00`
pub fn power_off() -> CommandFrame {
    CommandFrame::echoed(Command::PowerOff, vec![id::POWER, 0x00])
}

/// Four-byte form setting a rail and the V2 level together:
/// `02 ch bcd(v1) bcd(v2)`.
pub fn voltage_control(channel: VoltageChannel, v1: f64, v2: f64) -> Result<CommandFrame, CodecError> {
    require_rail(channel)?;
    if v1.is_nan() || !(1.2..=5.0).contains(&v1) {
        return Err(CodecError::VoltageOutOfRange { volts: v1, allowed: "1.2-5.0 V" });
    }
    check_battery_voltage(v2)?;
    Ok(CommandFrame::echoed(
        Command::VoltageControl(channel),
        vec![id::VOLTAGE, channel.id(), encode_voltage(v1), encode_voltage(v2)],
    ))
}

/// `02 ch code` where `code` uses the rail's encoder.
pub fn set_voltage(channel: VoltageChannel, volts: f64) -> Result<CommandFrame, CodecError> {
    if channel.is_battery() {
        check_battery_voltage(volts)?;
    } else {
        check_rail_voltage(volts)?;
    }
    Ok(CommandFrame::echoed(
        Command::SetVoltage(channel),
        vec![id::VOLTAGE, channel.id(), encode_for_channel(channel, volts)],
    ))
}

/// `06 ch dir`
pub fn step_adjust(channel: VoltageChannel, direction: StepDirection) -> CommandFrame {
    CommandFrame::echoed(
        Command::StepAdjust(channel),
        vec![id::STEP_ADJUST, channel.id(), direction.code()],
    )
}

/// Opens a rail and V4 in one frame: `12 ch 04`.
pub fn open_channels(primary: VoltageChannel) -> Result<CommandFrame, CodecError> {
    require_rail(primary)?;
    Ok(CommandFrame::echoed(
        Command::OpenChannels(primary),
        vec![id::CHANNEL_OPEN, primary.id(), VoltageChannel::V4.id()],
    ))
}

/// `12 ch`
pub fn open_channel(channel: VoltageChannel) -> CommandFrame {
    CommandFrame::echoed(Command::OpenChannel(channel), vec![id::CHANNEL_OPEN, channel.id()])
}

/// `03 range ch`
pub fn detection_select(range: MeterRange, channel: MeterChannel) -> CommandFrame {
    CommandFrame::echoed(
        Command::DetectionSelect,
        vec![id::DETECTION, range.code(), channel.code()],
    )
}

/// Starts the meter's continuous stream: `50`, acknowledged with `50 AA`.
pub fn start_detection() -> CommandFrame {
    CommandFrame::with_response(
        Command::StartDetection,
        vec![id::START_DETECTION],
        vec![id::START_DETECTION, START_DETECTION_ACK],
    )
}

/// Stops the meter's stream: `51`, acknowledged with `51 55` once sampling
/// has physically stopped.
pub fn stop_detection() -> CommandFrame {
    CommandFrame::with_response(
        Command::StopDetection,
        vec![id::STOP_DETECTION],
        vec![id::STOP_DETECTION, STOP_DETECTION_ACK],
    )
}

/// Legacy pause: `AA`, acknowledged with the reserved pair `AA 55`.
pub fn pause_detection() -> CommandFrame {
    CommandFrame::with_response(Command::PauseDetection, vec![id::PAUSE_DETECTION], PAUSE_ACK.to_vec())
}

/// `01 key` (relays reuse the power command byte).
pub fn relay_key(key: RelayKey) -> CommandFrame {
    CommandFrame::echoed(Command::RelayKey(key), vec![id::POWER, key.code()])
}

/// Arbitrary payload the board echoes back verbatim.
pub fn link_test(payload: &[u8]) -> Result<CommandFrame, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    Ok(CommandFrame::echoed(Command::LinkTest, payload.to_vec()))
}

/// `99 AA`; the board resets into its bootloader and sends nothing back.
pub fn bootloader_jump() -> CommandFrame {
    CommandFrame {
        command: Command::BootloaderJump,
        bytes: vec![id::BOOTLOADER_JUMP, BOOTLOADER_JUMP_CONFIRM],
        expected: None,
    }
}

/// Upper-case, space separated hex used in log lines.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // --- Voltage encoders ---

    #[test]
    fn plain_encoding_packs_nibbles() {
        assert_eq!(encode_voltage(2.2), 0x22);
        assert_eq!(encode_voltage(0.1), 0x01);
        assert_eq!(encode_voltage(5.9), 0x59);
        assert_eq!(encode_voltage(9.9), 0x99);
    }

    #[test]
    fn plain_encoding_rounds_and_clamps() {
        assert_eq!(encode_voltage(9.95), 0x99);
        assert_eq!(encode_voltage(12.0), 0x99);
        assert_eq!(encode_voltage(-0.3), 0x00);
        assert_eq!(encode_voltage(2.24), 0x22);
        assert_eq!(encode_voltage(2.26), 0x23);
        assert_eq!(encode_voltage(f64::NAN), 0x00);
    }

    #[test]
    fn special_encoding_uses_table() {
        assert_eq!(encode_special_voltage(2.90), 0x29);
        assert_eq!(encode_special_voltage(3.45), 0xD9);
        assert_eq!(encode_special_voltage(3.65), 0xDB);
        assert_eq!(encode_special_voltage(3.85), 0xDD);
        assert_eq!(encode_special_voltage(4.05), 0xE5);
        assert_eq!(encode_special_voltage(0.00), 0x00);
        assert_eq!(encode_special_voltage(2.905), 0x29);
    }

    #[test]
    fn special_encoding_falls_back_to_plain() {
        assert_eq!(encode_special_voltage(4.20), 0x42);
        assert_eq!(encode_special_voltage(1.6), 0x16);
    }

    proptest! {
        #[test]
        fn encoders_are_deterministic_and_well_formed(volts in -20.0f64..20.0) {
            let code = encode_voltage(volts);
            prop_assert_eq!(code, encode_voltage(volts));
            prop_assert!(code >> 4 <= 9 && code & 0x0F <= 9);
            prop_assert_eq!(encode_special_voltage(volts), encode_special_voltage(volts));
        }
    }

    // --- Frame layouts ---

    #[test]
    fn power_frames() {
        assert_eq!(power_on().bytes(), &[0x01, 0x01]);
        assert_eq!(power_on().expected(), Some(&[0x01, 0x01][..]));
        assert_eq!(power_off().bytes(), &[0x01, 0x00]);
    }

    #[test]
    fn voltage_frames_use_channel_encoder() {
        let v1 = set_voltage(VoltageChannel::V1, 2.2).unwrap();
        assert_eq!(v1.bytes(), &[0x02, 0x01, 0x22]);
        assert_eq!(v1.command(), Command::SetVoltage(VoltageChannel::V1));

        let v4 = set_voltage(VoltageChannel::V4, 3.45).unwrap();
        assert_eq!(v4.bytes(), &[0x02, 0x04, 0xD9]);
        assert_eq!(v4.expected(), Some(&[0x02, 0x04, 0xD9][..]));
    }

    #[test]
    fn voltage_control_frame_is_four_bytes() {
        let frame = voltage_control(VoltageChannel::V2, 3.3, 5.5).unwrap();
        assert_eq!(frame.bytes(), &[0x02, 0x02, 0x33, 0x55]);
    }

    #[test]
    fn out_of_range_voltages_are_rejected() {
        assert!(set_voltage(VoltageChannel::V1, 0.8).is_err());
        assert!(set_voltage(VoltageChannel::V1, f64::NAN).is_err());
        assert!(set_voltage(VoltageChannel::V4, 11.0).is_err());
        assert!(set_voltage(VoltageChannel::V4, 0.0).is_ok());
        assert!(voltage_control(VoltageChannel::V4, 2.0, 3.0).is_err());
    }

    #[test]
    fn channel_open_frames() {
        assert_eq!(open_channel(VoltageChannel::V1).bytes(), &[0x12, 0x01]);
        assert_eq!(open_channel(VoltageChannel::V4).bytes(), &[0x12, 0x04]);
        assert_eq!(open_channels(VoltageChannel::V3).unwrap().bytes(), &[0x12, 0x03, 0x04]);
        assert_eq!(
            open_channels(VoltageChannel::V4).unwrap_err(),
            CodecError::InvalidChannel(0x04)
        );
    }

    #[test]
    fn detection_frames_and_acks() {
        assert_eq!(start_detection().bytes(), &[0x50]);
        assert_eq!(start_detection().expected(), Some(&[0x50, 0xAA][..]));
        assert_eq!(stop_detection().bytes(), &[0x51]);
        assert_eq!(stop_detection().expected(), Some(&[0x51, 0x55][..]));
        assert_eq!(pause_detection().expected(), Some(&PAUSE_ACK[..]));
        assert_eq!(
            detection_select(MeterRange::MicroAmp, MeterChannel::Ch3).bytes(),
            &[0x03, 0x02, 0x31]
        );
    }

    #[test]
    fn relay_and_adjust_frames() {
        assert_eq!(relay_key(RelayKey::PowerConfirm).bytes(), &[0x01, 0x03]);
        assert_eq!(relay_key(RelayKey::Sw6).bytes(), &[0x01, 0x61]);
        assert_eq!(step_adjust(VoltageChannel::V4, StepDirection::Down).bytes(), &[0x06, 0x04, 0x02]);
        assert!(StepDirection::from_code(0x03).is_err());
    }

    #[test]
    fn bootloader_jump_expects_nothing() {
        let frame = bootloader_jump();
        assert_eq!(frame.bytes(), &[0x99, 0xAA]);
        assert_eq!(frame.expected(), None);
    }

    #[test]
    fn link_test_echoes_payload() {
        let frame = link_test(&DEFAULT_LINK_TEST_PAYLOAD).unwrap();
        assert_eq!(frame.expected(), Some(&[0x34, 0x34][..]));
        assert_eq!(link_test(&[]).unwrap_err(), CodecError::EmptyPayload);
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(to_hex(&[0xC0, 0x01, 0xaa]), "C0 01 AA");
        assert_eq!(to_hex(&[]), "");
    }
}
