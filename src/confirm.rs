//! Locating an expected confirmation inside a buffer that may also carry
//! interleaved telemetry frames.

use std::ops::Range;

use crate::codec::{PAUSE_ACK, STANDALONE_ACKS, TELEMETRY_FRAME_LEN, TELEMETRY_HEADER};

/// Bytes of float payload that follow a telemetry header.
const PAYLOAD_LEN: usize = TELEMETRY_FRAME_LEN - 1;

/// Finds `expected` in `buffer`, returning the byte range of the match.
///
/// All comparisons are on unsigned bytes.
/// * the reserved pause pair is a plain substring search;
/// * standalone single-byte acks match on first occurrence;
/// * other single-byte acks are skipped while a telemetry header sits in the
///   4 bytes before them, since they could be the tail of a float payload;
/// * anything longer is the first exact contiguous occurrence.
pub fn find_confirmation(buffer: &[u8], expected: &[u8]) -> Option<Range<usize>> {
    match expected {
        [] => None,
        [byte] if STANDALONE_ACKS.contains(byte) => {
            let at = buffer.iter().position(|b| b == byte)?;
            Some(at..at + 1)
        }
        [byte] => buffer
            .iter()
            .enumerate()
            .filter(|&(_, b)| b == byte)
            .map(|(at, _)| at)
            .find(|&at| !follows_telemetry_header(buffer, at))
            .map(|at| at..at + 1),
        pair if pair == PAUSE_ACK => find_subsequence(buffer, pair),
        multi => find_subsequence(buffer, multi),
    }
}

fn follows_telemetry_header(buffer: &[u8], at: usize) -> bool {
    buffer[at.saturating_sub(PAYLOAD_LEN)..at].contains(&TELEMETRY_HEADER)
}

fn find_subsequence(buffer: &[u8], needle: &[u8]) -> Option<Range<usize>> {
    buffer
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|at| at..at + needle.len())
}

/// Drops everything before the most recent frame-start byte, or the whole
/// buffer when none is present. Returns the number of bytes discarded.
pub fn resync(buffer: &mut Vec<u8>, start_codes: &[u8]) -> usize {
    match buffer.iter().rposition(|b| start_codes.contains(b)) {
        Some(at) => {
            buffer.drain(..at);
            at
        }
        None => {
            let dropped = buffer.len();
            buffer.clear();
            dropped
        }
    }
}
