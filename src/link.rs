//! Link controller: one command in flight, confirmation tracking with
//! retries, and separation of confirmation bytes from meter telemetry.
//!
//! Nothing here blocks or spawns. The owner calls [`LinkController::poll`]
//! with the current time; inbound bytes are read, confirmations matched,
//! deadlines checked, and the results queued as [`LinkEvent`]s.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::codec::{to_hex, Command, CommandFrame, FRAME_START_CODES, SLAVE_ADDRESS};
use crate::confirm::{find_confirmation, resync};
use crate::error::{LinkError, TransportError};
use crate::telemetry::{MeasurementSample, TelemetryDemuxer};
use crate::transport::Transport;

/// Protocol timing and addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub slave_address: u8,
    pub write_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub max_retries: u32,
    /// Confirmation buffer size that triggers a resync.
    pub resync_high_water: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            slave_address: SLAVE_ADDRESS,
            write_timeout: Duration::from_millis(1000),
            confirmation_timeout: Duration::from_millis(5000),
            max_retries: 2,
            resync_high_water: 100,
        }
    }
}

/// Why a confirmation ended without a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    RetriesExhausted,
    ResendFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RetriesExhausted => f.write_str("no confirmation after all retries"),
            FailureReason::ResendFailed => f.write_str("retransmission could not be sent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    ConfirmationSucceeded { command: Command, sent: Vec<u8>, matched: Vec<u8> },
    ConfirmationFailed { command: Command, sent: Vec<u8>, reason: FailureReason },
    Sample(MeasurementSample),
    /// The transport failed fatally and was closed; `pending` was dropped.
    Disconnected { pending: Option<Command> },
}

/// The command-issuing surface the sequencer drives.
pub trait DeviceLink {
    /// Sends a frame. Frames with an expected response become the single
    /// pending confirmation.
    fn submit(&mut self, frame: CommandFrame, now: Instant) -> Result<(), LinkError>;

    /// Drops any pending confirmation without reporting an outcome.
    fn cancel_pending(&mut self);

    fn is_awaiting(&self) -> bool;

    fn is_connected(&self) -> bool;
}

#[derive(Debug)]
struct PendingConfirmation {
    command: Command,
    sent_bytes: Vec<u8>,
    expected: Vec<u8>,
    buffer: Vec<u8>,
    retry_count: u32,
    deadline: Instant,
}

pub struct LinkController<T: Transport> {
    transport: T,
    config: LinkConfig,
    pending: Option<PendingConfirmation>,
    telemetry: TelemetryDemuxer,
    events: VecDeque<LinkEvent>,
    resync_count: usize,
}

impl<T: Transport> LinkController<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        Self {
            transport,
            config,
            pending: None,
            telemetry: TelemetryDemuxer::new(),
            events: VecDeque::new(),
            resync_count: 0,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn pending_command(&self) -> Option<Command> {
        self.pending.as_ref().map(|p| p.command)
    }

    pub fn retry_count(&self) -> Option<u32> {
        self.pending.as_ref().map(|p| p.retry_count)
    }

    /// Number of times the confirmation buffer had to be resynchronised.
    pub fn resync_count(&self) -> usize {
        self.resync_count
    }

    /// Deadline of the pending confirmation, for sleeping until it is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        self.events.drain(..).collect()
    }

    /// Sends `payload` to the slave and starts waiting for `expected`.
    ///
    /// Fails with [`LinkError::AlreadyPending`] while another confirmation is
    /// outstanding. If either the address or the data phase fails nothing is
    /// pending afterwards.
    pub fn send_command(
        &mut self,
        command: Command,
        payload: &[u8],
        expected: &[u8],
        now: Instant,
    ) -> Result<(), LinkError> {
        if let Some(pending) = &self.pending {
            return Err(LinkError::AlreadyPending(pending.command));
        }
        if !self.transport.is_open() {
            return Err(LinkError::NotConnected);
        }
        info!("send {command}: {}", to_hex(payload));
        self.write_frame(payload)?;
        self.pending = Some(PendingConfirmation {
            command,
            sent_bytes: payload.to_vec(),
            expected: expected.to_vec(),
            buffer: Vec::new(),
            retry_count: 0,
            deadline: now + self.config.confirmation_timeout,
        });
        Ok(())
    }

    /// Sends a frame that expects no confirmation. Allowed while another
    /// command is pending.
    pub fn send_unconfirmed(&mut self, command: Command, payload: &[u8]) -> Result<(), LinkError> {
        if !self.transport.is_open() {
            return Err(LinkError::NotConnected);
        }
        info!("send {command} (unconfirmed): {}", to_hex(payload));
        self.write_frame(payload)?;
        Ok(())
    }

    pub fn send_frame(&mut self, frame: CommandFrame, now: Instant) -> Result<(), LinkError> {
        let (command, bytes, expected) = frame.into_parts();
        match expected {
            Some(expected) => self.send_command(command, &bytes, &expected, now),
            None => self.send_unconfirmed(command, &bytes),
        }
    }

    /// Drops the pending confirmation silently. Bytes collected for it are
    /// handed to the telemetry path.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("cancelled pending {}", pending.command);
            self.feed_telemetry(&pending.buffer);
        }
    }

    /// Takes one chunk from the transport, then checks the confirmation
    /// deadline. A streaming source never runs dry, so one read per poll.
    pub fn poll(&mut self, now: Instant) {
        if self.transport.is_open() {
            match self.transport.read_available() {
                Ok(Some(chunk)) => self.receive(&chunk),
                Ok(None) => {}
                Err(err) if err.is_fatal() => self.disconnect(&err),
                Err(err) => warn!("read failed: {err}"),
            }
        }
        self.check_timeout(now);
    }

    /// Processes one inbound chunk.
    pub fn receive(&mut self, chunk: &[u8]) {
        debug!("rx {}", to_hex(chunk));
        let Some(pending) = self.pending.as_mut() else {
            self.feed_telemetry(chunk);
            return;
        };
        pending.buffer.extend_from_slice(chunk);

        if let Some(range) = find_confirmation(&pending.buffer, &pending.expected) {
            let Some(pending) = self.pending.take() else { return };
            let matched = pending.buffer[range.clone()].to_vec();
            info!("{} confirmed: {}", pending.command, to_hex(&matched));
            self.feed_telemetry(&pending.buffer[..range.start]);
            self.events.push_back(LinkEvent::ConfirmationSucceeded {
                command: pending.command,
                sent: pending.sent_bytes,
                matched,
            });
            self.feed_telemetry(&pending.buffer[range.end..]);
            return;
        }

        if pending.buffer.len() > self.config.resync_high_water {
            let dropped = resync(&mut pending.buffer, &FRAME_START_CODES);
            self.resync_count += 1;
            warn!(
                "confirmation buffer resync while awaiting {}: dropped {} bytes, kept {}",
                pending.command,
                dropped,
                pending.buffer.len()
            );
        }
    }

    fn check_timeout(&mut self, now: Instant) {
        let Some(pending) = self.pending.as_mut() else { return };
        if now < pending.deadline {
            return;
        }

        if pending.retry_count >= self.config.max_retries {
            warn!(
                "{} not confirmed after {} retries, giving up",
                pending.command, pending.retry_count
            );
            self.finish_unmatched(FailureReason::RetriesExhausted);
            return;
        }

        pending.retry_count += 1;
        warn!(
            "{} confirmation timed out, retry {}/{}: {}",
            pending.command,
            pending.retry_count,
            self.config.max_retries,
            to_hex(&pending.sent_bytes)
        );
        let resend = pending.sent_bytes.clone();
        match self.write_frame(&resend) {
            Ok(()) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.deadline = now + self.config.confirmation_timeout;
                }
            }
            // The disconnect already carried the pending command.
            Err(LinkError::Transport(err)) if err.is_fatal() => {}
            Err(_) => self.finish_unmatched(FailureReason::ResendFailed),
        }
    }

    fn finish_unmatched(&mut self, reason: FailureReason) {
        if let Some(pending) = self.pending.take() {
            self.feed_telemetry(&pending.buffer);
            self.events.push_back(LinkEvent::ConfirmationFailed {
                command: pending.command,
                sent: pending.sent_bytes,
                reason,
            });
        }
    }

    /// Address phase then data phase; the data phase is skipped when the
    /// address byte did not go out. A fatal failure closes the link.
    fn write_frame(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let result = self
            .transport
            .write_address_byte(self.config.slave_address, self.config.write_timeout)
            .and_then(|()| self.transport.write_data(payload, self.config.write_timeout));
        if let Err(err) = &result {
            if err.is_fatal() {
                self.disconnect(err);
            } else {
                warn!("send failed: {err}");
            }
        }
        result.map_err(LinkError::from)
    }

    /// Closes the transport and drops the pending confirmation.
    fn disconnect(&mut self, err: &TransportError) {
        error!("transport failed, closing link: {err}");
        self.transport.close();
        let pending = self.pending.take().map(|p| {
            self.feed_telemetry(&p.buffer);
            p.command
        });
        self.events.push_back(LinkEvent::Disconnected { pending });
    }

    fn feed_telemetry(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let dropped_before = self.telemetry.dropped();
        for sample in self.telemetry.feed(bytes) {
            self.events.push_back(LinkEvent::Sample(sample));
        }
        let stray = self.telemetry.dropped() - dropped_before;
        if stray > 0 {
            warn!("telemetry: skipped {stray} stray bytes");
        }
    }
}

impl<T: Transport> DeviceLink for LinkController<T> {
    fn submit(&mut self, frame: CommandFrame, now: Instant) -> Result<(), LinkError> {
        self.send_frame(frame, now)
    }

    fn cancel_pending(&mut self) {
        self.cancel();
    }

    fn is_awaiting(&self) -> bool {
        self.pending.is_some()
    }

    fn is_connected(&self) -> bool {
        self.transport.is_open()
    }
}
