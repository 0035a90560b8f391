//! Byte transport for the multidrop bus.
//!
//! The bus uses 9-bit framing: the address byte carries a 9th bit of 1 so
//! every slave latches it, data bytes carry 0 so only the addressed slave keeps
//! reading. UARTs behind `serialport` only offer odd/even parity, so the 9th
//! bit is produced per byte by picking whichever of the two yields the wanted
//! parity bit for that byte's popcount.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::codec::to_hex;
use crate::error::TransportError;

/// Value of the emulated 9th bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NinthBit {
    /// Parity bit 1; marks an address byte.
    Mark,
    /// Parity bit 0; data bytes.
    Space,
}

/// Parity setting that puts `bit` into the parity slot when sending `byte`.
pub fn parity_for(byte: u8, bit: NinthBit) -> Parity {
    let odd_ones = byte.count_ones() % 2 == 1;
    match (bit, odd_ones) {
        // Even parity emits 1 exactly when the data has an odd number of ones.
        (NinthBit::Mark, true) | (NinthBit::Space, false) => Parity::Even,
        (NinthBit::Mark, false) | (NinthBit::Space, true) => Parity::Odd,
    }
}

/// Splits `bytes` into maximal runs that share one parity setting.
pub fn parity_runs(bytes: &[u8], bit: NinthBit) -> Vec<(Parity, &[u8])> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=bytes.len() {
        if i == bytes.len() || parity_for(bytes[i], bit) != parity_for(bytes[start], bit) {
            runs.push((parity_for(bytes[start], bit), &bytes[start..i]));
            start = i;
        }
    }
    runs
}

/// Physical link used by the link controller.
///
/// Implementations perform no protocol interpretation.
pub trait Transport {
    fn is_open(&self) -> bool;

    /// Sends one byte with the 9th bit set and waits until it has left the
    /// wire. On error no data bytes may follow for the same command.
    fn write_address_byte(&mut self, address: u8, timeout: Duration) -> Result<(), TransportError>;

    /// Sends `bytes` with the 9th bit clear and waits for completion.
    fn write_data(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Returns the next inbound chunk, or `None` when nothing is waiting.
    fn read_available(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    fn close(&mut self);
}

/// Serial port settings for [`SerialTransport::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
}

/// [`Transport`] over a real serial port.
pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    parity: Option<Parity>,
}

impl SerialTransport {
    /// Opens the port at 8 data bits, 1 stop bit, no flow control.
    pub fn open(settings: &SerialSettings) -> Result<Self, TransportError> {
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .parity(Parity::Odd)
            .timeout(Duration::from_millis(10))
            .open()?;
        debug!("opened {} at {} baud", settings.port, settings.baud_rate);
        Ok(Self {
            name: settings.port.clone(),
            port: Some(port),
            parity: Some(Parity::Odd),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn write_with(&mut self, bytes: &[u8], bit: NinthBit, timeout: Duration) -> Result<(), TransportError> {
        let result = self.write_runs(bytes, bit, timeout);
        if let Err(err) = &result {
            if err.is_fatal() {
                error!("{}: fatal serial error, closing port: {}", self.name, err);
                self.close();
            } else {
                warn!("{}: write failed: {}", self.name, err);
            }
        }
        result
    }

    fn write_runs(&mut self, bytes: &[u8], bit: NinthBit, timeout: Duration) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        let started = Instant::now();
        port.set_timeout(timeout)?;
        for (parity, run) in parity_runs(bytes, bit) {
            if self.parity != Some(parity) {
                port.set_parity(parity)?;
                self.parity = Some(parity);
            }
            write_run(port.as_mut(), run, timeout)?;
            if started.elapsed() > timeout {
                return Err(TransportError::WriteTimeout(timeout));
            }
        }
        Ok(())
    }
}

fn write_run(port: &mut dyn SerialPort, run: &[u8], timeout: Duration) -> Result<(), TransportError> {
    match port.write_all(run) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::TimedOut => return Err(TransportError::WriteTimeout(timeout)),
        Err(err) if err.kind() == io::ErrorKind::WriteZero => {
            return Err(TransportError::ShortWrite { written: 0, expected: run.len() })
        }
        Err(err) => return Err(err.into()),
    }
    // Drains the output queue; the parity of the next run must not apply to
    // bytes still waiting in the UART.
    port.flush()?;
    Ok(())
}

impl Transport for SerialTransport {
    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_address_byte(&mut self, address: u8, timeout: Duration) -> Result<(), TransportError> {
        debug!("{}: address {:02X}", self.name, address);
        self.write_with(&[address], NinthBit::Mark, timeout)
    }

    fn write_data(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        debug!("{}: data {}", self.name, to_hex(bytes));
        self.write_with(bytes, NinthBit::Space, timeout)
    }

    fn read_available(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        let result = match port.bytes_to_read() {
            Ok(0) => return Ok(None),
            Ok(waiting) => {
                let mut buf = vec![0; waiting as usize];
                match port.read(&mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Ok((n > 0).then_some(buf))
                    }
                    Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(None),
                    Err(err) => Err(TransportError::from(err)),
                }
            }
            Err(err) => Err(TransportError::from(err)),
        };
        if let Err(err) = &result {
            if err.is_fatal() {
                error!("{}: fatal serial error, closing port: {}", self.name, err);
                self.close();
            }
        }
        result
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("closed {}", self.name);
        }
        self.parity = None;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn ninth_bit(byte: u8, parity: Parity) -> u32 {
        let ones = byte.count_ones();
        match parity {
            Parity::Even => ones % 2,
            Parity::Odd => (ones + 1) % 2,
            Parity::None => panic!("no parity bit"),
        }
    }

    #[test]
    fn address_byte_gets_mark() {
        // 0xC0 has two ones: even parity would emit 0, so odd is needed.
        assert_eq!(parity_for(0xC0, NinthBit::Mark), Parity::Odd);
        assert_eq!(parity_for(0x01, NinthBit::Mark), Parity::Even);
    }

    #[test]
    fn every_byte_gets_requested_ninth_bit() {
        for byte in 0..=u8::MAX {
            assert_eq!(ninth_bit(byte, parity_for(byte, NinthBit::Mark)), 1, "mark {byte:02X}");
            assert_eq!(ninth_bit(byte, parity_for(byte, NinthBit::Space)), 0, "space {byte:02X}");
        }
    }

    #[test]
    fn runs_group_bytes_with_same_parity() {
        // 01 and 02 have one bit set, 03 has two.
        let bytes = [0x01, 0x02, 0x03, 0x50];
        let runs = parity_runs(&bytes, NinthBit::Space);
        assert_eq!(
            runs,
            vec![
                (Parity::Odd, &bytes[0..2]),
                (Parity::Even, &bytes[2..4]),
            ]
        );
        assert!(parity_runs(&[], NinthBit::Space).is_empty());
    }

    #[test]
    fn fatal_classification() {
        assert!(TransportError::from(io::Error::from(io::ErrorKind::NotFound)).is_fatal());
        assert!(TransportError::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_fatal());
        assert!(TransportError::from(io::Error::from(io::ErrorKind::PermissionDenied)).is_fatal());
        assert!(!TransportError::from(io::Error::from(io::ErrorKind::TimedOut)).is_fatal());
        assert!(!TransportError::WriteTimeout(Duration::from_secs(1)).is_fatal());
        assert!(!TransportError::ShortWrite { written: 1, expected: 2 }.is_fatal());
    }
}
