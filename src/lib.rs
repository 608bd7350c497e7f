//! CS1237 ADC host link with optional Python bindings.
//!
//! The CS1237 bridge firmware talks over a serial line that mixes menu text with
//! two binary frame dialects. This crate splits that stream, drives the
//! configuration menu, and turns the measurement frames into a clean,
//! time-ordered signal.
//!
//! # Data flow
//!
//! ```text
//! transport bytes -> ByteRingBuffer -> FrameDecoder
//!     TextLine    -> CommandSequencer / line sink
//!     BinaryFrame -> TelemetryInterpreter -> ConditioningPipeline -> samples
//! ```
//!
//! [`device::Cs1237`] wires all of it to a serial port (or any `Read`/`Write`
//! pair) and runs the decoding side on a background thread.
//!
//! # Timing and Synchronization
//!
//! Frames carry no timestamps. Sample times are rebuilt from arrival times and
//! the configured rate: samples arriving in a burst are spread on the nominal
//! grid, and emitted times never go backwards within a session. Each sample is
//! held until two newer ones arrive so that single and double spikes can be
//! replaced before anything leaves the pipeline.

pub mod buffer;
pub mod config;
pub mod device;
pub mod errors;
pub mod frame;
pub mod interpret;
pub mod kalman;
pub mod logging;
pub mod outlier;
pub mod pipeline;
pub mod sequencer;

#[cfg(feature = "python")]
mod python;

pub use buffer::ByteRingBuffer;
pub use config::{AcquisitionConfig, ChannelMode, Gain, SampleRate, SharedConfig};
pub use device::{Cs1237, LinkStats, Streams, BAUD_RATE};
pub use errors::*;
pub use frame::{BinaryFrame, DecodedEvent, Dialect, FrameDecoder};
pub use interpret::{ConfigAck, DeviceFault, Reading, StatusRecord, Telemetry, Unit};
pub use pipeline::{ConditioningPipeline, Sample};
pub use sequencer::{CommandSequencer, Step};
