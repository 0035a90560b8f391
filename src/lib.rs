//! # PCBA Bench Library
//!
//! Drives a production test fixture over a 9-bit multidrop RS-485 bus: a slave
//! board that switches rails and relays, and a current meter that streams
//! telemetry on the same wire.
//!
//! The layers, bottom up:
//!
//! * [`codec`] builds command frames and their expected confirmations.
//! * [`transport`] writes address and data bytes with the right ninth bit.
//! * [`link`] sends one confirmed command at a time, retries it, and splits
//!   confirmations from telemetry.
//! * [`sequencer`] runs [`catalog`] steps against the link with pause, resume
//!   and per-step error records.
//!
//! [`bench::TestBench`] wires a link and a sequencer together, and
//! [`simulator`] stands in for the hardware.

pub mod bench;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod confirm;
pub mod error;
pub mod link;
pub mod sequencer;
pub mod simulator;
pub mod telemetry;
pub mod timer;
pub mod transport;

pub use bench::TestBench;
pub use catalog::{Limit, StepSpec, SubAction};
pub use codec::{Command, CommandFrame, RelayKey, VoltageChannel};
pub use config::BenchConfig;
pub use error::{CatalogError, CodecError, ConfigError, LinkError, SequencerError, TransportError};
pub use link::{DeviceLink, LinkConfig, LinkController, LinkEvent};
pub use sequencer::{ErrorKind, ErrorRecord, Sequencer, SequencerConfig, SequencerEvent, SequencerState};
pub use simulator::{BoardSimulator, SimulatedTransport};
pub use telemetry::MeasurementSample;
pub use transport::{SerialSettings, SerialTransport, Transport};
