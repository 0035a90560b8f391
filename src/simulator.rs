//! # Slave Board Simulator
//!
//! Stands in for the slave board and its current meter on the multidrop bus,
//! so sequences can run without hardware. It answers frames addressed to it
//! the way the firmware does, ignores frames for other addresses, and streams
//! telemetry while detection is running.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, warn};

use crate::codec::{id, RelayKey, StepDirection, VoltageChannel, SLAVE_ADDRESS};
use crate::error::TransportError;
use crate::telemetry;
use crate::transport::Transport;

/// Frames the simulated firmware rejects. Rejected frames get no answer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimulatorError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame for command 0x{command:02X} is too short ({len} bytes)")]
    TooShort { command: u8, len: usize },
    #[error("invalid parameter 0x{value:02X} for command 0x{command:02X}")]
    InvalidParameter { command: u8, value: u8 },
}

// State of one output rail.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rail {
    // Last voltage code written (nibble or special V4 code).
    pub code: u8,
    pub open: bool,
}

// The simulated board.
#[derive(Debug, Clone)]
pub struct BoardSimulator {
    // Multidrop address the board answers to.
    pub address: u8,
    pub powered: bool,
    pub rails: [Rail; 4],
    // Range and channel codes from the last detection select.
    pub meter: Option<(u8, u8)>,
    pub key_presses: Vec<RelayKey>,
    pub detecting: bool,
    pub in_bootloader: bool,
    // Current reported in every telemetry frame.
    pub current_ma: f32,
    // Confirmations still to be dropped.
    swallow: usize,
    frames_handled: usize,
}

impl BoardSimulator {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            powered: false,
            rails: Default::default(),
            meter: None,
            key_presses: Vec::new(),
            detecting: false,
            in_bootloader: false,
            current_ma: 0.0,
            swallow: 0,
            frames_handled: 0,
        }
    }

    /// Drops the next `count` confirmations. The commands still take effect.
    pub fn swallow_confirmations(&mut self, count: usize) {
        self.swallow = count;
    }

    /// Frames addressed to this board that were executed.
    pub fn frames_handled(&self) -> usize {
        self.frames_handled
    }

    /// Processes one frame and returns the board's answer, if any.
    pub fn process_frame(&mut self, address: u8, data: &[u8]) -> Result<Option<Vec<u8>>, SimulatorError> {
        if address != self.address {
            return Ok(None); // Silently ignore
        }
        if self.in_bootloader {
            debug!("simulator: in bootloader, ignoring frame");
            return Ok(None);
        }
        let response = self.execute(data)?;
        self.frames_handled += 1;

        match response {
            Some(_) if self.swallow > 0 => {
                self.swallow -= 1;
                debug!("simulator: swallowing confirmation, {} left", self.swallow);
                Ok(None)
            }
            response => Ok(response),
        }
    }

    /// One telemetry frame if the meter is streaming.
    pub fn telemetry(&self) -> Option<[u8; 5]> {
        self.detecting.then(|| telemetry::encode_frame(self.current_ma))
    }

    fn execute(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, SimulatorError> {
        let (&command, params) = data.split_first().ok_or(SimulatorError::EmptyFrame)?;
        let require = |len: usize| {
            if data.len() < len {
                Err(SimulatorError::TooShort { command, len: data.len() })
            } else {
                Ok(())
            }
        };
        let invalid = |value: u8| SimulatorError::InvalidParameter { command, value };

        match command {
            id::POWER => {
                require(2)?;
                match params[0] {
                    0x00 => self.powered = false,
                    0x01 => self.powered = true,
                    code => self.key_presses.push(RelayKey::from_code(code).ok_or(invalid(code))?),
                }
            }
            id::VOLTAGE => {
                require(3)?;
                let channel = VoltageChannel::from_id(params[0]).ok_or(invalid(params[0]))?;
                self.rails[rail_index(channel)].code = params[1];
                if let Some(&v2) = params.get(2) {
                    self.rails[rail_index(VoltageChannel::V2)].code = v2;
                }
            }
            id::DETECTION => {
                require(3)?;
                self.meter = Some((params[0], params[1]));
            }
            id::STEP_ADJUST => {
                require(3)?;
                let channel = VoltageChannel::from_id(params[0]).ok_or(invalid(params[0]))?;
                let direction = StepDirection::from_code(params[1]).map_err(|_| invalid(params[1]))?;
                let rail = &mut self.rails[rail_index(channel)];
                rail.code = step_code(rail.code, direction);
            }
            id::CHANNEL_OPEN => {
                require(2)?;
                for &ch in params {
                    let channel = VoltageChannel::from_id(ch).ok_or(invalid(ch))?;
                    self.rails[rail_index(channel)].open = true;
                }
            }
            id::START_DETECTION if params.is_empty() => {
                self.detecting = true;
                return Ok(Some(vec![id::START_DETECTION, 0xAA]));
            }
            id::STOP_DETECTION if params.is_empty() => {
                self.detecting = false;
                return Ok(Some(vec![id::STOP_DETECTION, 0x55]));
            }
            id::PAUSE_DETECTION if params.is_empty() => {
                self.detecting = false;
                return Ok(Some(vec![id::PAUSE_DETECTION, 0x55]));
            }
            id::BOOTLOADER_JUMP if params == [0xAA] => {
                self.detecting = false;
                self.in_bootloader = true;
                return Ok(None);
            }
            // Channel config and link-test payloads are looped back as is.
            _ => {}
        }
        Ok(Some(data.to_vec()))
    }
}

impl Default for BoardSimulator {
    fn default() -> Self {
        Self::new(SLAVE_ADDRESS)
    }
}

fn rail_index(channel: VoltageChannel) -> usize {
    usize::from(channel.id() - 1)
}

/// Moves a nibble-encoded voltage one tenth up or down.
fn step_code(code: u8, direction: StepDirection) -> u8 {
    let tenths = i32::from(code >> 4) * 10 + i32::from(code & 0x0F);
    let tenths = match direction {
        StepDirection::Up => tenths + 1,
        StepDirection::Down => tenths - 1,
    }
    .clamp(0, 99);
    (((tenths / 10) << 4) | (tenths % 10)) as u8
}

/// [`Transport`] wired straight to a [`BoardSimulator`].
///
/// Every read returns the board's queued answers followed by one telemetry
/// frame while detection is running.
#[derive(Debug)]
pub struct SimulatedTransport {
    board: BoardSimulator,
    open: bool,
    selected: Option<u8>,
    outbound: VecDeque<u8>,
    fail_fatally: bool,
}

impl SimulatedTransport {
    pub fn new(board: BoardSimulator) -> Self {
        Self { board, open: true, selected: None, outbound: VecDeque::new(), fail_fatally: false }
    }

    pub fn board(&self) -> &BoardSimulator {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut BoardSimulator {
        &mut self.board
    }

    /// The next data write fails as if the adapter was unplugged.
    pub fn fail_next_write_fatally(&mut self) {
        self.fail_fatally = true;
    }

    /// Queues raw bytes on the receive side (line noise, stale frames).
    pub fn inject(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes);
    }
}

impl Transport for SimulatedTransport {
    fn is_open(&self) -> bool {
        self.open
    }

    fn write_address_byte(&mut self, address: u8, _timeout: Duration) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        self.selected = Some(address);
        Ok(())
    }

    fn write_data(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if std::mem::take(&mut self.fail_fatally) {
            self.open = false;
            return Err(TransportError::DeviceNotFound("simulated adapter unplugged".to_string()));
        }
        let Some(address) = self.selected else {
            debug!("simulator: data without address byte, ignored");
            return Ok(());
        };
        match self.board.process_frame(address, bytes) {
            Ok(Some(response)) => self.outbound.extend(response),
            Ok(None) => {}
            Err(e) => warn!("simulator rejected frame: {e}"),
        }
        Ok(())
    }

    fn read_available(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let mut chunk: Vec<u8> = self.outbound.drain(..).collect();
        if let Some(frame) = self.board.telemetry() {
            chunk.extend_from_slice(&frame);
        }
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn close(&mut self) {
        self.open = false;
        self.selected = None;
        self.outbound.clear();
    }
}
