//! Test sequencer: runs a list of [`StepSpec`]s against a [`DeviceLink`].
//!
//! The sequencer is a passive state machine. It reacts to three stimuli:
//! API calls (`start`, `pause`, ...), link events via
//! [`Sequencer::on_link_event`], and timer expiry via [`Sequencer::poll`].
//! Each call runs to a stable state and queues [`SequencerEvent`]s for the
//! owner to drain.
//!
//! A failed step never ends the run; only `stop` or running out of steps is
//! terminal.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::catalog::{Limit, StepSpec, SubAction};
use crate::codec::{self, Command};
use crate::error::SequencerError;
use crate::link::{DeviceLink, FailureReason, LinkEvent};
use crate::timer::DeadlineTimer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerConfig {
    /// Pause between one action settling and the next being sent.
    pub action_delay: Duration,
    pub measurement_timeout: Duration,
    /// Used for steps whose own timeout is zero.
    pub default_step_timeout: Duration,
    /// Backstop for a command that never settles on the link.
    pub ack_timeout: Duration,
    pub pause_ack_timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            action_delay: Duration::from_millis(100),
            measurement_timeout: Duration::from_millis(5000),
            default_step_timeout: Duration::from_millis(60_000),
            ack_timeout: Duration::from_millis(16_000),
            pause_ack_timeout: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerState {
    Idle,
    Running,
    Paused,
    WaitingForUser,
    WaitingForMeasurement,
    WaitingForAck,
    WaitingForPauseAck,
    Finished,
    Aborted,
}

impl SequencerState {
    /// A run is in progress (not idle and not terminal).
    pub fn is_active(self) -> bool {
        !matches!(self, SequencerState::Idle | SequencerState::Finished | SequencerState::Aborted)
    }
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequencerState::Idle => "idle",
            SequencerState::Running => "running",
            SequencerState::Paused => "paused",
            SequencerState::WaitingForUser => "waiting for operator",
            SequencerState::WaitingForMeasurement => "waiting for measurement",
            SequencerState::WaitingForAck => "waiting for confirmation",
            SequencerState::WaitingForPauseAck => "waiting for pause confirmation",
            SequencerState::Finished => "finished",
            SequencerState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Category of a step-scoped failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    TransportFailure,
    ConfirmationTimeout,
    MeasurementTimeout,
    ThresholdViolation,
    UserRejection,
    StepTimeout,
    InvalidAction,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransportFailure => "transport failure",
            ErrorKind::ConfirmationTimeout => "confirmation timeout",
            ErrorKind::MeasurementTimeout => "measurement timeout",
            ErrorKind::ThresholdViolation => "current out of limit",
            ErrorKind::UserRejection => "rejected by operator",
            ErrorKind::StepTimeout => "step timeout",
            ErrorKind::InvalidAction => "invalid action",
        };
        f.write_str(name)
    }
}

/// One failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub step_index: usize,
    pub step_name: String,
    /// `None` for step-level failures such as a step timeout.
    pub action_index: Option<usize>,
    pub action_description: String,
    pub kind: ErrorKind,
    pub detail: String,
    pub timestamp: DateTime<Local>,
    pub measured_ma: Option<f64>,
    pub threshold_ma: Option<f64>,
}

impl ErrorRecord {
    pub fn has_measurement(&self) -> bool {
        self.measured_ma.is_some() && self.threshold_ma.is_some()
    }

    pub fn formatted_measured(&self) -> String {
        format_ma(self.measured_ma.filter(|_| self.has_measurement()))
    }

    pub fn formatted_threshold(&self) -> String {
        format_ma(self.threshold_ma.filter(|_| self.has_measurement()))
    }
}

fn format_ma(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.3} mA"),
        None => "-".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SequencerEvent {
    StateChanged(SequencerState),
    StepStarted { index: usize, id: u32, name: String },
    StepFinished { index: usize, passed: bool },
    ActionStarted { step: usize, action: usize, description: String },
    ActionFinished { step: usize, action: usize, passed: bool },
    UserConfirmRequired { prompt: String },
    Log(String),
    SequenceFinished { all_passed: bool, passed: usize, total: usize },
    CurrentCheckResult { measured_ma: f64, threshold_ma: f64, limit: Limit, passed: bool },
}

/// What the command currently on the link was sent for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Action(Command),
    /// Stop-detection issued by `pause`.
    PauseStop,
    /// Start-detection reissued by `resume`.
    Restart,
}

/// Outcome of an action command, held back while paused.
#[derive(Debug, Clone, PartialEq)]
enum Settle {
    Confirmed,
    Failed { kind: ErrorKind, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerId {
    Step,
    Dispatch,
    Delay,
    Measurement,
    Ack,
    PauseAck,
}

const TIMER_ORDER: [TimerId; 6] = [
    TimerId::PauseAck,
    TimerId::Ack,
    TimerId::Measurement,
    TimerId::Delay,
    TimerId::Dispatch,
    TimerId::Step,
];

#[derive(Debug, Default)]
struct Timers {
    step: DeadlineTimer,
    dispatch: DeadlineTimer,
    delay: DeadlineTimer,
    measurement: DeadlineTimer,
    ack: DeadlineTimer,
    pause_ack: DeadlineTimer,
}

impl Timers {
    fn get(&self, id: TimerId) -> &DeadlineTimer {
        match id {
            TimerId::Step => &self.step,
            TimerId::Dispatch => &self.dispatch,
            TimerId::Delay => &self.delay,
            TimerId::Measurement => &self.measurement,
            TimerId::Ack => &self.ack,
            TimerId::PauseAck => &self.pause_ack,
        }
    }

    fn get_mut(&mut self, id: TimerId) -> &mut DeadlineTimer {
        match id {
            TimerId::Step => &mut self.step,
            TimerId::Dispatch => &mut self.dispatch,
            TimerId::Delay => &mut self.delay,
            TimerId::Measurement => &mut self.measurement,
            TimerId::Ack => &mut self.ack,
            TimerId::PauseAck => &mut self.pause_ack,
        }
    }

    /// Earliest due timer; ties resolve in `TIMER_ORDER`.
    fn next_due(&self, now: Instant) -> Option<TimerId> {
        TIMER_ORDER
            .iter()
            .copied()
            .filter(|&id| self.get(id).is_due(now))
            .min_by_key(|&id| self.get(id).deadline())
    }

    fn next_deadline(&self) -> Option<Instant> {
        TIMER_ORDER.iter().filter_map(|&id| self.get(id).deadline()).min()
    }

    fn stop_action_timers(&mut self) {
        self.dispatch.stop();
        self.delay.stop();
        self.measurement.stop();
        self.ack.stop();
    }

    fn stop_all(&mut self) {
        for id in TIMER_ORDER {
            self.get_mut(id).stop();
        }
    }

    fn freeze_all(&mut self, now: Instant) {
        for id in TIMER_ORDER {
            self.get_mut(id).freeze(now);
        }
    }
}

pub struct Sequencer {
    config: SequencerConfig,
    steps: Vec<StepSpec>,
    step_results: Vec<Option<bool>>,
    state: SequencerState,
    step_index: usize,
    action_index: Option<usize>,
    errors: Vec<ErrorRecord>,
    events: VecDeque<SequencerEvent>,
    timers: Timers,
    in_flight: Option<InFlight>,
    detection_active: bool,
    check: Option<(f64, Limit)>,
    paused_from: Option<SequencerState>,
    pause_deferred: bool,
    restart_on_resume: bool,
    dispatch_after_restart: bool,
    parked: Option<Settle>,
}

impl Sequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            steps: Vec::new(),
            step_results: Vec::new(),
            state: SequencerState::Idle,
            step_index: 0,
            action_index: None,
            errors: Vec::new(),
            events: VecDeque::new(),
            timers: Timers::default(),
            in_flight: None,
            detection_active: false,
            check: None,
            paused_from: None,
            pause_deferred: false,
            restart_on_resume: false,
            dispatch_after_restart: false,
            parked: None,
        }
    }

    // --- Accessors ---

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn current_step_index(&self) -> Option<usize> {
        (self.state != SequencerState::Idle && self.step_index < self.steps.len()).then_some(self.step_index)
    }

    pub fn current_action_index(&self) -> Option<usize> {
        self.action_index
    }

    /// Per-step verdicts of the current or last run; `None` = not reached.
    pub fn step_results(&self) -> &[Option<bool>] {
        &self.step_results
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn is_detection_active(&self) -> bool {
        self.detection_active
    }

    /// Earliest armed deadline, for sleeping until the next timer is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn drain_events(&mut self) -> Vec<SequencerEvent> {
        self.events.drain(..).collect()
    }

    // --- API ---

    pub fn load_steps(&mut self, steps: Vec<StepSpec>) -> Result<(), SequencerError> {
        if self.state.is_active() {
            return Err(SequencerError::Running);
        }
        self.step_results = vec![None; steps.len()];
        self.steps = steps;
        self.log(format!("loaded {} test steps", self.steps.len()));
        Ok(())
    }

    /// Starts a fresh run. The first action is dispatched by the next
    /// [`Sequencer::poll`].
    pub fn start(&mut self, now: Instant) -> Result<(), SequencerError> {
        if self.state.is_active() {
            return Err(SequencerError::Running);
        }
        if self.steps.is_empty() {
            return Err(SequencerError::NoSteps);
        }
        self.errors.clear();
        self.step_results = vec![None; self.steps.len()];
        self.timers.stop_all();
        self.in_flight = None;
        self.detection_active = false;
        self.check = None;
        self.paused_from = None;
        self.pause_deferred = false;
        self.restart_on_resume = false;
        self.dispatch_after_restart = false;
        self.parked = None;
        self.log(format!("test sequence started, {} steps", self.steps.len()));
        self.begin_step(0, now);
        Ok(())
    }

    /// Pauses the run. With the meter streaming, the stream is stopped first
    /// and `Paused` is reached on its confirmation (or the pause-ack
    /// timeout).
    pub fn pause(&mut self, link: &mut dyn DeviceLink, now: Instant) {
        match self.state {
            SequencerState::Running
            | SequencerState::WaitingForUser
            | SequencerState::WaitingForMeasurement
            | SequencerState::WaitingForAck => {}
            other => {
                debug!("pause ignored in state {other}");
                return;
            }
        }
        let link_busy = self.in_flight == Some(InFlight::Restart)
            || (self.state == SequencerState::WaitingForAck && self.detection_active);
        if link_busy {
            // Stopping the meter needs the link, which the pending command still holds.
            self.pause_deferred = true;
            self.log("pause requested, waiting for the current command to settle".to_string());
            return;
        }

        self.paused_from = Some(self.state);
        self.timers.freeze_all(now);

        if !self.detection_active {
            self.restart_on_resume = false;
            self.enter_paused(now);
            return;
        }

        self.restart_on_resume = true;
        self.detection_active = false;
        match link.submit(codec::stop_detection(), now) {
            Ok(()) => {
                self.in_flight = Some(InFlight::PauseStop);
                self.timers.pause_ack.start(now, self.config.pause_ack_timeout);
                self.set_state(SequencerState::WaitingForPauseAck);
                self.log("stopping current detection before pausing".to_string());
            }
            Err(err) => {
                warn!("could not stop detection for pause: {err}");
                self.enter_paused(now);
            }
        }
    }

    /// Resumes a paused run, restarting detection first if pause stopped it
    /// and re-arming every frozen timer with its captured remaining time.
    pub fn resume(&mut self, link: &mut dyn DeviceLink, now: Instant) {
        if self.state != SequencerState::Paused {
            debug!("resume ignored in state {}", self.state);
            return;
        }
        let restored = self.paused_from.take().unwrap_or(SequencerState::Running);
        self.log(format!("resuming into {restored}"));

        if self.restart_on_resume {
            self.restart_on_resume = false;
            match link.submit(codec::start_detection(), now) {
                Ok(()) => {
                    self.in_flight = Some(InFlight::Restart);
                    self.detection_active = true;
                }
                Err(err) => {
                    self.set_state(restored);
                    self.record_error(
                        ErrorKind::TransportFailure,
                        self.action_index,
                        format!("restarting detection after pause failed: {err}"),
                        None,
                    );
                    self.fail_step(link, now);
                    return;
                }
            }
        }

        let mut action_timer_thawed = false;
        for id in [TimerId::Dispatch, TimerId::Delay, TimerId::Measurement, TimerId::Ack] {
            action_timer_thawed |= self.timers.get_mut(id).thaw(now);
        }
        self.timers.step.thaw(now);
        self.set_state(restored);

        if let Some(settle) = self.parked.take() {
            self.settle_action(link, settle, now);
            return;
        }
        match restored {
            SequencerState::WaitingForUser => {
                if let Some(SubAction::UserConfirm { prompt }) = self.current_action().cloned() {
                    self.events.push_back(SequencerEvent::UserConfirmRequired { prompt });
                }
            }
            SequencerState::Running if !action_timer_thawed => {
                self.timers.dispatch.start(now, Duration::ZERO);
            }
            _ => {}
        }
    }

    /// Aborts the run. Safe in any state; a no-op once idle or terminal.
    pub fn stop(&mut self, link: &mut dyn DeviceLink, now: Instant) {
        if !self.state.is_active() {
            return;
        }
        self.timers.stop_all();
        if self.in_flight.take().is_some() || link.is_awaiting() {
            link.cancel_pending();
        }
        if self.detection_active || self.restart_on_resume {
            if let Err(err) = link.submit(codec::stop_detection(), now) {
                warn!("stop detection on abort failed: {err}");
            }
        }
        self.detection_active = false;
        self.restart_on_resume = false;
        self.pause_deferred = false;
        self.dispatch_after_restart = false;
        self.parked = None;
        self.check = None;
        self.set_state(SequencerState::Aborted);
        self.log("test sequence stopped".to_string());
    }

    /// Operator answer to a confirmation prompt.
    pub fn user_confirm(&mut self, link: &mut dyn DeviceLink, accepted: bool, now: Instant) {
        if self.state != SequencerState::WaitingForUser {
            debug!("operator answer ignored in state {}", self.state);
            return;
        }
        if accepted {
            self.action_passed(now);
        } else {
            let prompt = match self.current_action() {
                Some(SubAction::UserConfirm { prompt }) => prompt.clone(),
                _ => String::new(),
            };
            self.fail_action(link, ErrorKind::UserRejection, format!("operator answered no: {prompt}"), None, now);
        }
    }

    // --- Stimuli ---

    pub fn on_link_event(&mut self, link: &mut dyn DeviceLink, event: &LinkEvent, now: Instant) {
        if !self.state.is_active() {
            return;
        }
        match event {
            LinkEvent::Sample(sample) => {
                if self.state == SequencerState::WaitingForMeasurement {
                    self.evaluate_sample(link, f64::from(sample.value_ma), now);
                }
            }
            LinkEvent::ConfirmationSucceeded { command, .. } => {
                self.on_settled(link, *command, Settle::Confirmed, now);
            }
            LinkEvent::ConfirmationFailed { command, reason, .. } => {
                let kind = match reason {
                    FailureReason::RetriesExhausted => ErrorKind::ConfirmationTimeout,
                    FailureReason::ResendFailed => ErrorKind::TransportFailure,
                };
                let detail = format!("{command}: {reason}");
                self.on_settled(link, *command, Settle::Failed { kind, detail }, now);
            }
            LinkEvent::Disconnected { pending } => {
                error!("device link disconnected");
                let Some(in_flight) = self.in_flight else { return };
                let command = match in_flight {
                    InFlight::Action(command) => command,
                    InFlight::PauseStop => Command::StopDetection,
                    InFlight::Restart => Command::StartDetection,
                };
                if pending.is_some_and(|p| p != command) {
                    debug!("disconnect dropped {pending:?}, sequencer expected {command}");
                }
                let detail = format!("{command}: link disconnected");
                self.on_settled(
                    link,
                    command,
                    Settle::Failed { kind: ErrorKind::TransportFailure, detail },
                    now,
                );
            }
        }
    }

    /// Fires every timer that is due at `now`, earliest deadline first.
    pub fn poll(&mut self, link: &mut dyn DeviceLink, now: Instant) {
        while let Some(id) = self.timers.next_due(now) {
            self.timers.get_mut(id).stop();
            self.on_timer(link, id, now);
        }
    }

    // --- Internals ---

    fn on_timer(&mut self, link: &mut dyn DeviceLink, id: TimerId, now: Instant) {
        match id {
            TimerId::Step => {
                let timeout = self.step_timeout(self.step_index);
                self.log(format!("step timed out after {} ms", timeout.as_millis()));
                if self.in_flight.take().is_some() {
                    link.cancel_pending();
                }
                self.record_error(
                    ErrorKind::StepTimeout,
                    None,
                    format!("step did not finish within {} ms", timeout.as_millis()),
                    None,
                );
                self.fail_step(link, now);
                self.apply_deferred_pause(link, now);
            }
            TimerId::Dispatch => {
                if self.in_flight == Some(InFlight::Restart) {
                    self.dispatch_after_restart = true;
                } else if self.state == SequencerState::Running {
                    self.dispatch_next(link, now);
                }
            }
            TimerId::Delay => {
                if self.state == SequencerState::Running {
                    self.action_passed(now);
                }
            }
            TimerId::Measurement => {
                if self.state == SequencerState::WaitingForMeasurement {
                    let timeout = self.config.measurement_timeout.as_millis();
                    self.fail_action(
                        link,
                        ErrorKind::MeasurementTimeout,
                        format!("no current sample within {timeout} ms"),
                        None,
                        now,
                    );
                }
            }
            TimerId::Ack => {
                if self.state == SequencerState::WaitingForAck {
                    let command = match self.in_flight.take() {
                        Some(InFlight::Action(command)) => command.to_string(),
                        _ => "command".to_string(),
                    };
                    link.cancel_pending();
                    self.fail_action(
                        link,
                        ErrorKind::ConfirmationTimeout,
                        format!("{command} never settled"),
                        None,
                        now,
                    );
                    self.apply_deferred_pause(link, now);
                }
            }
            TimerId::PauseAck => {
                if self.state == SequencerState::WaitingForPauseAck {
                    warn!("no confirmation of stop detection, pausing anyway");
                    self.in_flight = None;
                    link.cancel_pending();
                    self.enter_paused(now);
                }
            }
        }
    }

    fn on_settled(&mut self, link: &mut dyn DeviceLink, command: Command, settle: Settle, now: Instant) {
        match self.in_flight {
            Some(InFlight::Action(expected)) if expected == command => {
                self.in_flight = None;
                if self.state == SequencerState::Paused {
                    debug!("{command} settled while paused, holding outcome");
                    self.parked = Some(settle);
                } else {
                    self.settle_action(link, settle, now);
                    self.apply_deferred_pause(link, now);
                }
            }
            Some(InFlight::PauseStop) if command == Command::StopDetection => {
                self.in_flight = None;
                if let Settle::Failed { detail, .. } = &settle {
                    warn!("stop detection for pause failed: {detail}");
                }
                if self.state == SequencerState::WaitingForPauseAck {
                    self.enter_paused(now);
                }
            }
            Some(InFlight::Restart) if command == Command::StartDetection => {
                self.in_flight = None;
                match settle {
                    Settle::Confirmed => {
                        self.log("detection restarted".to_string());
                        if std::mem::take(&mut self.dispatch_after_restart) {
                            self.timers.dispatch.start(now, self.config.action_delay);
                        }
                    }
                    Settle::Failed { kind, detail } => {
                        self.dispatch_after_restart = false;
                        self.record_error(
                            kind,
                            self.action_index,
                            format!("restarting detection after pause failed: {detail}"),
                            None,
                        );
                        self.fail_step(link, now);
                    }
                }
                self.apply_deferred_pause(link, now);
            }
            _ => debug!("ignoring outcome of {command}, not awaited"),
        }
    }

    fn settle_action(&mut self, link: &mut dyn DeviceLink, settle: Settle, now: Instant) {
        if self.state != SequencerState::WaitingForAck {
            return;
        }
        match settle {
            Settle::Confirmed => self.action_passed(now),
            Settle::Failed { kind, detail } => self.fail_action(link, kind, detail, None, now),
        }
    }

    fn evaluate_sample(&mut self, link: &mut dyn DeviceLink, measured_ma: f64, now: Instant) {
        let Some((threshold_ma, limit)) = self.check.take() else { return };
        let passed = limit.passes(measured_ma, threshold_ma);
        self.events.push_back(SequencerEvent::CurrentCheckResult { measured_ma, threshold_ma, limit, passed });
        if passed {
            self.log(format!(
                "current {measured_ma:.3} mA {} {threshold_ma:.3} mA: pass",
                limit.symbol()
            ));
            self.action_passed(now);
        } else {
            self.fail_action(
                link,
                ErrorKind::ThresholdViolation,
                format!("measured {measured_ma:.3} mA, limit {} {threshold_ma:.3} mA", limit.symbol()),
                Some((measured_ma, threshold_ma)),
                now,
            );
        }
    }

    fn begin_step(&mut self, index: usize, now: Instant) {
        self.timers.stop_all();
        if index >= self.steps.len() {
            self.finish_sequence();
            return;
        }
        self.step_index = index;
        self.action_index = None;
        self.set_state(SequencerState::Running);
        let step = &self.steps[index];
        let (id, name) = (step.id, step.name.clone());
        info!("step {id}: {name}");
        self.events.push_back(SequencerEvent::StepStarted { index, id, name });
        let timeout = self.step_timeout(index);
        self.timers.step.start(now, timeout);
        self.timers.dispatch.start(now, Duration::ZERO);
    }

    fn step_timeout(&self, index: usize) -> Duration {
        match self.steps.get(index).map(|s| s.step_timeout_ms) {
            Some(0) | None => self.config.default_step_timeout,
            Some(ms) => Duration::from_millis(ms),
        }
    }

    fn current_action(&self) -> Option<&SubAction> {
        let step = self.steps.get(self.step_index)?;
        step.actions.get(self.action_index?)
    }

    fn dispatch_next(&mut self, link: &mut dyn DeviceLink, now: Instant) {
        let next = self.action_index.map_or(0, |i| i + 1);
        let step = self.step_index;
        let Some(action) = self.steps[step].actions.get(next).cloned() else {
            self.complete_step(now);
            return;
        };
        self.action_index = Some(next);
        self.events.push_back(SequencerEvent::ActionStarted {
            step,
            action: next,
            description: action.to_string(),
        });
        self.log(format!("action {}: {action}", next + 1));

        match action {
            SubAction::Delay { duration_ms } => {
                self.timers.delay.start(now, Duration::from_millis(duration_ms));
            }
            SubAction::UserConfirm { prompt } => {
                self.set_state(SequencerState::WaitingForUser);
                self.events.push_back(SequencerEvent::UserConfirmRequired { prompt });
            }
            SubAction::CheckCurrent { threshold_ma, limit } => {
                self.check = Some((threshold_ma, limit));
                self.timers.measurement.start(now, self.config.measurement_timeout);
                self.set_state(SequencerState::WaitingForMeasurement);
            }
            ref command_action => {
                let frame = match command_action.command_frame() {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        self.fail_action(link, ErrorKind::InvalidAction, err.to_string(), None, now);
                        return;
                    }
                    None => {
                        self.action_passed(now);
                        return;
                    }
                };
                let command = frame.command();
                if let Err(err) = link.submit(frame, now) {
                    self.fail_action(link, ErrorKind::TransportFailure, format!("{command}: {err}"), None, now);
                    return;
                }
                match command_action {
                    SubAction::StartDetection => self.detection_active = true,
                    SubAction::PauseDetection => self.detection_active = false,
                    _ => {}
                }
                self.in_flight = Some(InFlight::Action(command));
                self.timers.ack.start(now, self.config.ack_timeout);
                self.set_state(SequencerState::WaitingForAck);
            }
        }
    }

    fn action_passed(&mut self, now: Instant) {
        let Some(action) = self.action_index else { return };
        self.timers.stop_action_timers();
        self.check = None;
        self.events.push_back(SequencerEvent::ActionFinished { step: self.step_index, action, passed: true });
        self.set_state(SequencerState::Running);
        self.timers.dispatch.start(now, self.config.action_delay);
    }

    fn fail_action(
        &mut self,
        link: &mut dyn DeviceLink,
        kind: ErrorKind,
        detail: String,
        measurement: Option<(f64, f64)>,
        now: Instant,
    ) {
        let action = self.action_index;
        self.record_error(kind, action, detail, measurement);
        if let Some(action) = action {
            self.events.push_back(SequencerEvent::ActionFinished {
                step: self.step_index,
                action,
                passed: false,
            });
        }
        self.fail_step(link, now);
    }

    fn fail_step(&mut self, link: &mut dyn DeviceLink, now: Instant) {
        if self.in_flight.take().is_some() {
            link.cancel_pending();
        }
        self.dispatch_after_restart = false;
        self.check = None;
        self.parked = None;
        self.finish_step(false, now);
    }

    fn complete_step(&mut self, now: Instant) {
        self.finish_step(true, now);
    }

    fn finish_step(&mut self, passed: bool, now: Instant) {
        let index = self.step_index;
        if let Some(result) = self.step_results.get_mut(index) {
            *result = Some(passed);
        }
        self.events.push_back(SequencerEvent::StepFinished { index, passed });
        if passed {
            info!("step {} passed", index + 1);
        } else {
            warn!("step {} failed", index + 1);
        }
        self.begin_step(index + 1, now);
    }

    fn finish_sequence(&mut self) {
        self.timers.stop_all();
        self.action_index = None;
        let total = self.steps.len();
        let passed = self.step_results.iter().filter(|r| **r == Some(true)).count();
        let all_passed = passed == total;
        self.set_state(SequencerState::Finished);
        self.log(format!("test sequence finished: {passed}/{total} steps passed"));
        self.events.push_back(SequencerEvent::SequenceFinished { all_passed, passed, total });
    }

    fn enter_paused(&mut self, now: Instant) {
        self.timers.pause_ack.stop();
        self.set_state(SequencerState::Paused);
        match self.timers.step.remaining(now) {
            Some(left) => self.log(format!("test sequence paused, {} ms left in step", left.as_millis())),
            None => self.log("test sequence paused".to_string()),
        }
    }

    /// Applies a pause that was held back while a command settled.
    fn apply_deferred_pause(&mut self, link: &mut dyn DeviceLink, now: Instant) {
        if std::mem::take(&mut self.pause_deferred) && self.state.is_active() {
            self.pause(link, now);
        }
    }

    fn record_error(
        &mut self,
        kind: ErrorKind,
        action_index: Option<usize>,
        detail: String,
        measurement: Option<(f64, f64)>,
    ) {
        let step_name = self.steps.get(self.step_index).map(|s| s.name.clone()).unwrap_or_default();
        let action_description = action_index
            .and_then(|i| self.steps.get(self.step_index)?.actions.get(i))
            .map(|a| a.to_string())
            .unwrap_or_else(|| "step".to_string());
        error!("step {} ({step_name}), {action_description}: {kind}: {detail}", self.step_index + 1);
        self.events.push_back(SequencerEvent::Log(format!("{kind}: {detail}")));
        self.errors.push(ErrorRecord {
            step_index: self.step_index,
            step_name,
            action_index,
            action_description,
            kind,
            detail,
            timestamp: Local::now(),
            measured_ma: measurement.map(|(m, _)| m),
            threshold_ma: measurement.map(|(_, t)| t),
        });
    }

    fn set_state(&mut self, state: SequencerState) {
        if self.state != state {
            debug!("sequencer: {} -> {}", self.state, state);
            self.state = state;
            self.events.push_back(SequencerEvent::StateChanged(state));
        }
    }

    fn log(&mut self, message: String) {
        info!("{message}");
        self.events.push_back(SequencerEvent::Log(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CommandFrame, RelayKey, VoltageChannel};
    use crate::error::{LinkError, TransportError};
    use crate::telemetry::MeasurementSample;

    /// Records submitted frames; outcomes are injected by the test.
    #[derive(Default)]
    struct FakeLink {
        sent: Vec<CommandFrame>,
        awaiting: bool,
        cancels: usize,
        fail_next: bool,
        disconnected: bool,
    }

    impl FakeLink {
        fn last_bytes(&self) -> &[u8] {
            self.sent.last().map(|f| f.bytes()).unwrap_or(&[])
        }
    }

    impl DeviceLink for FakeLink {
        fn submit(&mut self, frame: CommandFrame, _now: Instant) -> Result<(), LinkError> {
            if self.disconnected {
                return Err(LinkError::NotConnected);
            }
            if std::mem::take(&mut self.fail_next) {
                return Err(TransportError::WriteTimeout(Duration::from_secs(1)).into());
            }
            if frame.expected().is_some() {
                if self.awaiting {
                    return Err(LinkError::AlreadyPending(frame.command()));
                }
                self.awaiting = true;
            }
            self.sent.push(frame);
            Ok(())
        }

        fn cancel_pending(&mut self) {
            if self.awaiting {
                self.cancels += 1;
            }
            self.awaiting = false;
        }

        fn is_awaiting(&self) -> bool {
            self.awaiting
        }

        fn is_connected(&self) -> bool {
            !self.disconnected
        }
    }

    struct Bench {
        seq: Sequencer,
        link: FakeLink,
        now: Instant,
    }

    impl Bench {
        fn new(steps: Vec<StepSpec>) -> Self {
            let mut seq = Sequencer::new(SequencerConfig::default());
            seq.load_steps(steps).unwrap();
            let now = Instant::now();
            Self { seq, link: FakeLink::default(), now }
        }

        fn start(&mut self) {
            self.seq.start(self.now).unwrap();
            self.seq.poll(&mut self.link, self.now);
        }

        fn advance(&mut self, ms: u64) {
            self.now += Duration::from_millis(ms);
            self.seq.poll(&mut self.link, self.now);
        }

        fn deliver(&mut self, event: LinkEvent) {
            self.seq.on_link_event(&mut self.link, &event, self.now);
        }

        /// Confirms the last frame sent.
        fn ack(&mut self) {
            let frame = self.link.sent.last().cloned().unwrap();
            self.link.awaiting = false;
            self.deliver(LinkEvent::ConfirmationSucceeded {
                command: frame.command(),
                sent: frame.bytes().to_vec(),
                matched: frame.expected().unwrap().to_vec(),
            });
        }

        fn sample(&mut self, value_ma: f32) {
            self.deliver(LinkEvent::Sample(MeasurementSample { value_ma, timestamp: Local::now() }));
        }

        fn pause(&mut self) {
            self.seq.pause(&mut self.link, self.now);
        }

        fn resume(&mut self) {
            self.seq.resume(&mut self.link, self.now);
        }

        fn finished(&mut self) -> Option<(bool, usize, usize)> {
            self.seq.drain_events().into_iter().find_map(|e| match e {
                SequencerEvent::SequenceFinished { all_passed, passed, total } => Some((all_passed, passed, total)),
                _ => None,
            })
        }
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn step(id: u32, actions: Vec<SubAction>) -> StepSpec {
        StepSpec { actions, ..StepSpec::new(id, format!("step {id}"), "") }
    }

    fn check(threshold_ma: f64) -> SubAction {
        SubAction::CheckCurrent { threshold_ma, limit: Limit::Upper }
    }

    // --- Basic flow ---

    #[test]
    fn start_requires_steps_and_rejects_reload_while_running() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        assert_eq!(seq.start(Instant::now()), Err(SequencerError::NoSteps));

        let mut bench = Bench::new(vec![step(1, vec![SubAction::Delay { duration_ms: 10 }])]);
        bench.start();
        assert_eq!(bench.seq.state(), SequencerState::Running);
        assert_eq!(bench.seq.load_steps(Vec::new()), Err(SequencerError::Running));
        assert_eq!(bench.seq.start(bench.now), Err(SequencerError::Running));
    }

    #[test]
    fn command_action_waits_for_ack_then_paces() {
        let mut bench = Bench::new(vec![step(
            1,
            vec![SubAction::PressKey { key: RelayKey::PowerConfirm }, SubAction::Delay { duration_ms: 50 }],
        )]);
        bench.start();
        assert_eq!(bench.link.last_bytes(), &[0x01, 0x03]);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForAck);

        bench.ack();
        assert_eq!(bench.seq.state(), SequencerState::Running);
        assert_eq!(bench.seq.next_deadline(), Some(bench.now + ms(100)));
        assert_eq!(bench.seq.current_action_index(), Some(0));

        bench.advance(100);
        assert_eq!(bench.seq.current_action_index(), Some(1));
        bench.advance(50);
        bench.advance(100);
        assert_eq!(bench.seq.state(), SequencerState::Finished);
        assert_eq!(bench.finished(), Some((true, 1, 1)));
    }

    #[test]
    fn failed_step_does_not_stop_the_run() {
        let mut bench = Bench::new(vec![
            step(1, vec![SubAction::Delay { duration_ms: 100 }]),
            step(2, vec![SubAction::StartDetection, check(1.0)]),
            step(3, vec![SubAction::Delay { duration_ms: 100 }]),
        ]);
        bench.start();
        bench.advance(100); // delay done
        bench.advance(100); // pacing, step 1 complete, step 2 starts
        assert_eq!(bench.link.last_bytes(), &[0x50]);
        bench.ack();
        bench.advance(100);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForMeasurement);

        bench.sample(5.0);
        assert_eq!(bench.seq.current_step_index(), Some(2));
        bench.advance(100); // step 3 delay begins
        bench.advance(100);
        bench.advance(100);

        assert_eq!(bench.seq.state(), SequencerState::Finished);
        assert_eq!(bench.finished(), Some((false, 2, 3)));
        assert_eq!(bench.seq.step_results(), &[Some(true), Some(false), Some(true)]);

        let errors = bench.seq.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::ThresholdViolation);
        assert_eq!(errors[0].step_index, 1);
        assert_eq!(errors[0].action_index, Some(1));
        assert_eq!(errors[0].measured_ma, Some(5.0));
        assert_eq!(errors[0].threshold_ma, Some(1.0));
        assert_eq!(errors[0].formatted_measured(), "5.000 mA");
    }

    #[test]
    fn only_first_sample_is_judged() {
        let mut bench = Bench::new(vec![step(1, vec![check(1.0), SubAction::Delay { duration_ms: 1000 }])]);
        bench.start();
        bench.sample(0.5);
        bench.sample(50.0);
        assert!(bench.seq.errors().is_empty());
        let results: Vec<_> = bench
            .seq
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SequencerEvent::CurrentCheckResult { .. }))
            .collect();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn samples_outside_a_check_are_ignored() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::Delay { duration_ms: 100 }])]);
        bench.start();
        bench.sample(999.0);
        assert_eq!(bench.seq.state(), SequencerState::Running);
        assert!(bench.seq.errors().is_empty());
    }

    // --- Failure kinds ---

    #[test]
    fn user_rejection_fails_step() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::UserConfirm { prompt: "4 bars?".into() }])]);
        bench.start();
        assert_eq!(bench.seq.state(), SequencerState::WaitingForUser);
        assert!(bench
            .seq
            .drain_events()
            .contains(&SequencerEvent::UserConfirmRequired { prompt: "4 bars?".into() }));

        bench.seq.user_confirm(&mut bench.link, false, bench.now);
        assert_eq!(bench.seq.state(), SequencerState::Finished);
        assert_eq!(bench.seq.errors()[0].kind, ErrorKind::UserRejection);
        assert_eq!(bench.finished(), Some((false, 0, 1)));
    }

    #[test]
    fn user_acceptance_advances() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::UserConfirm { prompt: "ok?".into() }])]);
        bench.start();
        bench.seq.user_confirm(&mut bench.link, true, bench.now);
        bench.advance(100);
        assert_eq!(bench.finished(), Some((true, 1, 1)));
    }

    #[test]
    fn measurement_timeout() {
        let mut bench = Bench::new(vec![step(1, vec![check(1.0)])]);
        bench.start();
        bench.advance(4999);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForMeasurement);
        bench.advance(1);
        assert_eq!(bench.seq.errors()[0].kind, ErrorKind::MeasurementTimeout);
        assert!(!bench.seq.errors()[0].has_measurement());
        assert_eq!(bench.seq.errors()[0].formatted_measured(), "-");
    }

    #[test]
    fn step_timeout_cuts_a_long_delay() {
        let mut bench = Bench::new(vec![
            step(1, vec![SubAction::Delay { duration_ms: 5000 }]).with_timeout_ms(1000),
            step(2, vec![]),
        ]);
        bench.start();
        bench.advance(1000);
        let errors = bench.seq.errors();
        assert_eq!(errors[0].kind, ErrorKind::StepTimeout);
        assert_eq!(errors[0].action_index, None);
        assert_eq!(errors[0].action_description, "step");
        assert_eq!(bench.seq.state(), SequencerState::Finished);
        assert_eq!(bench.finished(), Some((false, 1, 2)));
    }

    #[test]
    fn step_timeout_cancels_command_in_flight() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::StartDetection]).with_timeout_ms(500)]);
        bench.start();
        assert!(bench.link.is_awaiting());
        bench.advance(500);
        assert_eq!(bench.link.cancels, 1);
        assert_eq!(bench.seq.errors()[0].kind, ErrorKind::StepTimeout);
    }

    #[test]
    fn confirmation_failure_is_recorded() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::PressKey { key: RelayKey::Right }])]);
        bench.start();
        bench.link.awaiting = false;
        bench.deliver(LinkEvent::ConfirmationFailed {
            command: Command::RelayKey(RelayKey::Right),
            sent: vec![0x01, 0x02],
            reason: FailureReason::RetriesExhausted,
        });
        assert_eq!(bench.seq.errors()[0].kind, ErrorKind::ConfirmationTimeout);
        assert_eq!(bench.seq.state(), SequencerState::Finished);
    }

    #[test]
    fn ack_backstop_fails_step() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::StartDetection])]);
        bench.start();
        bench.advance(16_000);
        assert_eq!(bench.seq.errors()[0].kind, ErrorKind::ConfirmationTimeout);
        assert_eq!(bench.link.cancels, 1);
    }

    #[test]
    fn send_failure_and_invalid_parameters() {
        let mut bench = Bench::new(vec![
            step(1, vec![SubAction::PressKey { key: RelayKey::Right }]),
            step(2, vec![SubAction::SetVoltage { channel: VoltageChannel::V1, volts: 9.0 }]),
        ]);
        bench.link.fail_next = true;
        bench.start();
        bench.advance(0);
        let kinds: Vec<_> = bench.seq.errors().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ErrorKind::TransportFailure, ErrorKind::InvalidAction]);
        assert!(bench.link.sent.is_empty());
        assert_eq!(bench.seq.state(), SequencerState::Finished);
    }

    #[test]
    fn disconnect_fails_command_in_flight() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::OpenChannel { channel: VoltageChannel::V4 }])]);
        bench.start();
        bench.link.awaiting = false;
        bench.link.disconnected = true;
        bench.deliver(LinkEvent::Disconnected { pending: Some(Command::OpenChannel(VoltageChannel::V4)) });
        assert_eq!(bench.seq.errors()[0].kind, ErrorKind::TransportFailure);
        assert_eq!(bench.seq.state(), SequencerState::Finished);
    }

    #[test]
    fn stale_confirmation_is_ignored() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::StartDetection])]);
        bench.start();
        bench.deliver(LinkEvent::ConfirmationSucceeded {
            command: Command::PowerOn,
            sent: vec![0x01, 0x01],
            matched: vec![0x01, 0x01],
        });
        assert_eq!(bench.seq.state(), SequencerState::WaitingForAck);
    }

    // --- Pause / resume ---

    #[test]
    fn pause_without_detection_freezes_timers_exactly() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::Delay { duration_ms: 8000 }])]);
        bench.start();
        bench.advance(3000);
        bench.pause();
        assert_eq!(bench.seq.state(), SequencerState::Paused);
        assert!(bench.link.sent.is_empty());
        assert_eq!(bench.seq.next_deadline(), None);

        bench.advance(60_000);
        assert_eq!(bench.seq.state(), SequencerState::Paused);

        bench.resume();
        assert_eq!(bench.seq.state(), SequencerState::Running);
        assert_eq!(bench.seq.next_deadline(), Some(bench.now + ms(5000)));
        bench.advance(4999);
        assert_eq!(bench.seq.current_action_index(), Some(0));
        bench.advance(1);
        bench.advance(100);
        assert_eq!(bench.finished(), Some((true, 1, 1)));
    }

    #[test]
    fn pause_with_detection_stops_meter_and_resume_restarts_it() {
        let mut bench = Bench::new(vec![step(
            1,
            vec![SubAction::StartDetection, SubAction::Delay { duration_ms: 8000 }, check(1.0)],
        )]);
        bench.start();
        bench.ack();
        bench.advance(100); // delay begins
        assert!(bench.seq.is_detection_active());
        bench.advance(3000);

        bench.pause();
        assert_eq!(bench.seq.state(), SequencerState::WaitingForPauseAck);
        assert_eq!(bench.link.last_bytes(), &[0x51]);
        bench.advance(1000);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForPauseAck);
        bench.ack();
        assert_eq!(bench.seq.state(), SequencerState::Paused);

        bench.advance(30_000);
        bench.resume();
        assert_eq!(bench.link.last_bytes(), &[0x50]);
        assert_eq!(bench.seq.state(), SequencerState::Running);
        let resumed = bench.now;
        assert_eq!(bench.seq.next_deadline(), Some(resumed + ms(5000)));
        bench.ack();
        assert!(bench.seq.is_detection_active());

        bench.advance(5000);
        bench.advance(100);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForMeasurement);
        bench.sample(0.25);
        bench.advance(100);
        assert_eq!(bench.finished(), Some((true, 1, 1)));
        assert!(bench.seq.errors().is_empty());
    }

    #[test]
    fn pause_during_detection_restart_waits_then_stops_meter() {
        let mut bench = Bench::new(vec![step(
            1,
            vec![SubAction::StartDetection, SubAction::Delay { duration_ms: 8000 }, check(1.0)],
        )]);
        bench.start();
        bench.ack();
        bench.advance(100); // delay begins
        bench.advance(3000);
        bench.pause();
        bench.ack();
        assert_eq!(bench.seq.state(), SequencerState::Paused);

        bench.resume();
        assert_eq!(bench.link.last_bytes(), &[0x50]);
        bench.pause();
        // The restart still holds the link; nothing new goes out yet.
        assert_eq!(bench.seq.state(), SequencerState::Running);
        assert_eq!(bench.link.sent.len(), 3);

        bench.ack();
        assert_eq!(bench.link.last_bytes(), &[0x51]);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForPauseAck);
        bench.advance(500);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForPauseAck);
        bench.ack();
        assert_eq!(bench.seq.state(), SequencerState::Paused);
        assert!(!bench.seq.is_detection_active());

        bench.resume();
        bench.ack();
        assert_eq!(bench.seq.next_deadline(), Some(bench.now + ms(5000)));
        bench.advance(5000);
        bench.advance(100);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForMeasurement);
        bench.sample(0.25);
        bench.advance(100);

        let opcodes: Vec<u8> = bench.link.sent.iter().map(|f| f.bytes()[0]).collect();
        assert_eq!(opcodes, vec![0x50, 0x51, 0x50, 0x51, 0x50]);
        assert_eq!(bench.finished(), Some((true, 1, 1)));
        assert!(bench.seq.errors().is_empty());
    }

    #[test]
    fn repeated_pause_resume_keeps_remaining_delay() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::Delay { duration_ms: 6000 }])]);
        bench.start();
        for _ in 0..3 {
            bench.advance(1000);
            bench.pause();
            assert_eq!(bench.seq.state(), SequencerState::Paused);
            bench.advance(20_000);
            bench.resume();
        }
        assert_eq!(bench.seq.next_deadline(), Some(bench.now + ms(3000)));
        bench.advance(3000);
        bench.advance(100);
        assert_eq!(bench.finished(), Some((true, 1, 1)));
    }

    #[test]
    fn pause_ack_timeout_forces_paused() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::StartDetection, check(1.0)])]);
        bench.start();
        bench.ack();
        bench.advance(100);
        bench.pause();
        assert_eq!(bench.seq.state(), SequencerState::WaitingForPauseAck);
        bench.advance(2999);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForPauseAck);
        bench.advance(1);
        assert_eq!(bench.seq.state(), SequencerState::Paused);
        assert_eq!(bench.link.cancels, 1);
        assert!(bench.seq.errors().is_empty());
    }

    #[test]
    fn pause_waits_for_start_detection_ack() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::StartDetection, check(1.0)])]);
        bench.start();
        bench.pause();
        assert_eq!(bench.seq.state(), SequencerState::WaitingForAck);
        assert_eq!(bench.link.sent.len(), 1);

        bench.ack();
        assert_eq!(bench.seq.state(), SequencerState::WaitingForPauseAck);
        assert_eq!(bench.link.last_bytes(), &[0x51]);
        bench.ack();
        assert_eq!(bench.seq.state(), SequencerState::Paused);

        bench.resume();
        assert_eq!(bench.link.last_bytes(), &[0x50]);
        // Pacing expires before the restart is confirmed; dispatch waits.
        bench.advance(200);
        assert_eq!(bench.seq.state(), SequencerState::Running);
        bench.ack();
        bench.advance(100);
        assert_eq!(bench.seq.state(), SequencerState::WaitingForMeasurement);
    }

    #[test]
    fn confirmation_during_pause_is_replayed_on_resume() {
        let mut bench = Bench::new(vec![step(
            1,
            vec![SubAction::SetVoltage { channel: VoltageChannel::V4, volts: 2.9 }, SubAction::Delay { duration_ms: 10 }],
        )]);
        bench.start();
        assert_eq!(bench.link.last_bytes(), &[0x02, 0x04, 0x29]);
        bench.pause();
        assert_eq!(bench.seq.state(), SequencerState::Paused);

        bench.ack();
        assert_eq!(bench.seq.state(), SequencerState::Paused);
        assert_eq!(bench.seq.current_action_index(), Some(0));

        bench.resume();
        assert_eq!(bench.seq.state(), SequencerState::Running);
        bench.advance(100);
        assert_eq!(bench.seq.current_action_index(), Some(1));
    }

    #[test]
    fn resume_in_gap_between_actions_dispatches() {
        let mut bench = Bench::new(vec![step(
            1,
            vec![SubAction::PressKey { key: RelayKey::Sw3 }, SubAction::PressKey { key: RelayKey::Sw4 }],
        )]);
        bench.start();
        bench.ack();
        bench.advance(40);
        bench.pause();
        bench.advance(10_000);
        bench.resume();
        bench.advance(59);
        assert_eq!(bench.link.sent.len(), 1);
        bench.advance(1);
        assert_eq!(bench.link.last_bytes(), &[0x01, 0x41]);
    }

    #[test]
    fn resume_reprompts_operator() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::UserConfirm { prompt: "look".into() }])]);
        bench.start();
        bench.pause();
        bench.seq.drain_events();
        bench.seq.user_confirm(&mut bench.link, true, bench.now);
        assert_eq!(bench.seq.state(), SequencerState::Paused);
        bench.resume();
        assert!(bench
            .seq
            .drain_events()
            .contains(&SequencerEvent::UserConfirmRequired { prompt: "look".into() }));
    }

    #[test]
    fn pause_and_resume_are_ignored_when_not_applicable() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::Delay { duration_ms: 10 }])]);
        bench.pause();
        bench.resume();
        assert_eq!(bench.seq.state(), SequencerState::Idle);
        bench.start();
        bench.resume();
        assert_eq!(bench.seq.state(), SequencerState::Running);
    }

    // --- Stop ---

    #[test]
    fn stop_is_a_no_op_when_idle_or_terminal() {
        let mut bench = Bench::new(vec![step(1, vec![])]);
        bench.seq.stop(&mut bench.link, bench.now);
        assert_eq!(bench.seq.state(), SequencerState::Idle);
        bench.start();
        bench.advance(0);
        assert_eq!(bench.seq.state(), SequencerState::Finished);
        bench.seq.stop(&mut bench.link, bench.now);
        assert_eq!(bench.seq.state(), SequencerState::Finished);
    }

    #[test]
    fn stop_silences_meter_and_is_terminal() {
        let mut bench = Bench::new(vec![step(1, vec![SubAction::StartDetection, check(1.0)])]);
        bench.start();
        bench.ack();
        bench.advance(100);
        bench.seq.stop(&mut bench.link, bench.now);
        assert_eq!(bench.seq.state(), SequencerState::Aborted);
        assert_eq!(bench.link.last_bytes(), &[0x51]);
        assert_eq!(bench.seq.next_deadline(), None);

        bench.sample(100.0);
        bench.advance(10_000);
        assert_eq!(bench.seq.state(), SequencerState::Aborted);
        bench.resume();
        assert_eq!(bench.seq.state(), SequencerState::Aborted);
        assert!(bench.seq.errors().is_empty());
    }

    #[test]
    fn restart_after_finish_clears_errors() {
        let mut bench = Bench::new(vec![step(1, vec![check(1.0)])]);
        bench.start();
        bench.sample(2.0);
        assert_eq!(bench.seq.errors().len(), 1);
        bench.start();
        assert!(bench.seq.errors().is_empty());
        assert_eq!(bench.seq.step_results(), &[None]);
    }
}
