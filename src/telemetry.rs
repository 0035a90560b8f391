//! Meter telemetry: `0x50` followed by a little-endian `f32` in milliamps.

use chrono::{DateTime, Local};
use log::{debug, trace};
use serde::Serialize;

use crate::codec::{TELEMETRY_FRAME_LEN, TELEMETRY_HEADER};

/// One decoded current reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeasurementSample {
    pub value_ma: f32,
    pub timestamp: DateTime<Local>,
}

/// Strips telemetry frames from a byte stream that may start mid-frame.
#[derive(Debug, Default)]
pub struct TelemetryDemuxer {
    buffer: Vec<u8>,
    dropped: usize,
}

impl TelemetryDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every complete frame now at the front.
    ///
    /// A leading byte that is not the header is dropped on its own and
    /// decoding continues, so garbage costs exactly its own length.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<MeasurementSample> {
        self.buffer.extend_from_slice(bytes);
        let mut samples = Vec::new();
        let mut consumed = 0;
        while self.buffer.len() - consumed >= TELEMETRY_FRAME_LEN {
            let frame = &self.buffer[consumed..consumed + TELEMETRY_FRAME_LEN];
            if frame[0] != TELEMETRY_HEADER {
                trace!("telemetry: dropping stray byte {:02X}", frame[0]);
                self.dropped += 1;
                consumed += 1;
                continue;
            }
            let value_ma = f32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
            debug!("telemetry: {value_ma:.4} mA");
            samples.push(MeasurementSample { value_ma, timestamp: Local::now() });
            consumed += TELEMETRY_FRAME_LEN;
        }
        self.buffer.drain(..consumed);
        samples
    }

    /// Total stray bytes dropped while resynchronising.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Encodes one telemetry frame.
pub fn encode_frame(value_ma: f32) -> [u8; TELEMETRY_FRAME_LEN] {
    let [a, b, c, d] = value_ma.to_le_bytes();
    [TELEMETRY_HEADER, a, b, c, d]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(samples: &[MeasurementSample]) -> Vec<f32> {
        samples.iter().map(|s| s.value_ma).collect()
    }

    #[test]
    fn decodes_consecutive_frames() {
        let mut demux = TelemetryDemuxer::new();
        let mut bytes = encode_frame(12.5).to_vec();
        bytes.extend(encode_frame(-0.25));
        assert_eq!(values(&demux.feed(&bytes)), vec![12.5, -0.25]);
        assert_eq!(values(&demux.feed(&encode_frame(1.0))), vec![1.0]);
    }

    #[test]
    fn partial_frame_waits_for_rest() {
        let mut demux = TelemetryDemuxer::new();
        let frame = encode_frame(3.0);
        assert!(demux.feed(&frame[..3]).is_empty());
        assert_eq!(values(&demux.feed(&frame[3..])), vec![3.0]);
    }

    #[test]
    fn corrupted_leading_byte_is_dropped_alone() {
        let mut demux = TelemetryDemuxer::new();
        let mut bytes = vec![0x13];
        bytes.extend(encode_frame(1.0));
        bytes.extend(encode_frame(2.0));
        assert_eq!(values(&demux.feed(&bytes)), vec![1.0, 2.0]);
        assert_eq!(demux.dropped(), 1);
    }

    #[test]
    fn several_stray_bytes_resync_one_at_a_time() {
        let mut demux = TelemetryDemuxer::new();
        let mut bytes = vec![0x01, 0x02, 0x03];
        bytes.extend(encode_frame(0.004));
        assert_eq!(values(&demux.feed(&bytes)), vec![0.004]);
        assert_eq!(demux.dropped(), 3);
    }
}
