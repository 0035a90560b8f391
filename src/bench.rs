//! Owns a link and a sequencer and shuttles events between them.
//!
//! The owner drives it with [`TestBench::tick`] from its own loop and drains
//! [`SequencerEvent`]s for display.

use std::time::Instant;

use crate::catalog::StepSpec;
use crate::error::SequencerError;
use crate::link::{LinkConfig, LinkController};
use crate::sequencer::{Sequencer, SequencerConfig, SequencerEvent, SequencerState};
use crate::transport::Transport;

pub struct TestBench<T: Transport> {
    link: LinkController<T>,
    sequencer: Sequencer,
}

impl<T: Transport> TestBench<T> {
    pub fn new(transport: T, link_config: LinkConfig, sequencer_config: SequencerConfig) -> Self {
        Self {
            link: LinkController::new(transport, link_config),
            sequencer: Sequencer::new(sequencer_config),
        }
    }

    pub fn link(&self) -> &LinkController<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkController<T> {
        &mut self.link
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn state(&self) -> SequencerState {
        self.sequencer.state()
    }

    pub fn load_steps(&mut self, steps: Vec<StepSpec>) -> Result<(), SequencerError> {
        self.sequencer.load_steps(steps)
    }

    pub fn start(&mut self, now: Instant) -> Result<(), SequencerError> {
        self.sequencer.start(now)?;
        self.settle(now);
        Ok(())
    }

    pub fn pause(&mut self, now: Instant) {
        self.sequencer.pause(&mut self.link, now);
        self.settle(now);
    }

    pub fn resume(&mut self, now: Instant) {
        self.sequencer.resume(&mut self.link, now);
        self.settle(now);
    }

    pub fn stop(&mut self, now: Instant) {
        self.sequencer.stop(&mut self.link, now);
        self.settle(now);
    }

    pub fn user_confirm(&mut self, accepted: bool, now: Instant) {
        self.sequencer.user_confirm(&mut self.link, accepted, now);
        self.settle(now);
    }

    /// Reads the transport, runs link retries and fires due sequencer timers.
    pub fn tick(&mut self, now: Instant) {
        self.link.poll(now);
        self.settle(now);
    }

    /// Earliest deadline of either the link or the sequencer.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.link.next_deadline(), self.sequencer.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn drain_events(&mut self) -> Vec<SequencerEvent> {
        self.sequencer.drain_events()
    }

    /// Feeds link events to the sequencer until neither has work left at
    /// `now`.
    fn settle(&mut self, now: Instant) {
        loop {
            self.sequencer.poll(&mut self.link, now);
            let events = self.link.drain_events();
            if events.is_empty() {
                break;
            }
            for event in &events {
                self.sequencer.on_link_event(&mut self.link, event, now);
            }
        }
    }
}
