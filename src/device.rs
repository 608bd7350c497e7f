//! CS1237 device driver.
//!
//! Owns the serial link to the CS1237 bridge firmware: a background reader thread
//! drains the transport into the frame decoder, interprets measurement frames and
//! runs them through the conditioning pipeline; the calling thread sends commands
//! and drives the configuration menu.
//!
//! # Outputs
//!
//! [`Cs1237::from_transport`] returns a [`Streams`] bundle with one channel per
//! data flow: every decoded event, corrected samples, and device telemetry
//! (status, config acknowledgements, faults). Drop a receiver you do not need;
//! the reader keeps running. The event and telemetry queues are bounded: once
//! full, new entries are dropped and counted in [`LinkStats::dropped`]. The
//! sample queue is not bounded.
//!
//! # Timing
//!
//! The firmware sends no timestamps. Sample times are reconstructed on the host
//! from read arrival times and the configured rate (see [`crate::pipeline`]).

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, error, info, warn};
use tokio::runtime::Runtime;

use crate::config::{AcquisitionConfig, ChannelMode, Gain, SampleRate, SharedConfig};
use crate::errors::{DriverError, Result};
use crate::frame::{BinaryFrame, DecodedEvent, FrameDecoder};
use crate::interpret::{Telemetry, TelemetryInterpreter};
use crate::pipeline::{ConditioningPipeline, RawSample, Sample};
use crate::sequencer::{
    channel_steps, gain_steps, sample_rate_steps, write_command, CommandSequencer, ResponseBuffer,
    SharedWriter, Step,
};

// ============================================================================
// Constants
// ============================================================================

/// Default serial baud rate of the bridge firmware
pub const BAUD_RATE: u32 = 9600;

/// Serial read timeout; bounds how long shutdown waits for the reader
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Command delay to ensure the firmware processes the command
const COMMAND_DELAY: Duration = Duration::from_millis(50);

/// Pause when a non-blocking transport has nothing to read
const IDLE_BACKOFF: Duration = Duration::from_millis(2);

const READ_CHUNK: usize = 256;

/// Quiet period after which the decoder settles frames held for a longer reading
const IDLE_SETTLE: Duration = Duration::from_millis(50);

/// Decoded events buffered for a consumer that is not reading them
pub const EVENT_QUEUE_DEPTH: usize = 4096;
/// Telemetry records buffered for a consumer that is not reading them
pub const TELEMETRY_QUEUE_DEPTH: usize = 256;

// Firmware single-byte commands
const CMD_START_CONTINUOUS: u8 = b'A';
const CMD_STOP: u8 = b's';
const CMD_SINGLE_READ: u8 = b'R';
const CMD_STATUS: u8 = b'S';
const CMD_POWER_DOWN: u8 = b'D';
const CMD_POWER_UP: u8 = b'U';
const CMD_HELP: u8 = b'?';

// ============================================================================
// Data Types
// ============================================================================

/// Receivers for everything the reader thread produces.
pub struct Streams {
    pub events: Receiver<DecodedEvent>,
    pub samples: Receiver<Sample>,
    pub telemetry: Receiver<Telemetry>,
}

/// Link counters, as last published by the reader thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames: u64,
    pub text_lines: u64,
    pub resync_discards: u64,
    pub interpretation_faults: u64,
    /// Samples corrected in the current session
    pub outliers: u64,
    /// Samples delivered on the sample channel
    pub samples: u64,
    pub stale_dropped: u64,
    /// Events and telemetry records dropped because their queue was full
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct SharedStats {
    frames: AtomicU64,
    text_lines: AtomicU64,
    resync_discards: AtomicU64,
    interpretation_faults: AtomicU64,
    outliers: AtomicU64,
    samples: AtomicU64,
    stale_dropped: AtomicU64,
    dropped: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> LinkStats {
        LinkStats {
            frames: self.frames.load(Ordering::Relaxed),
            text_lines: self.text_lines.load(Ordering::Relaxed),
            resync_discards: self.resync_discards.load(Ordering::Relaxed),
            interpretation_faults: self.interpretation_faults.load(Ordering::Relaxed),
            outliers: self.outliers.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

enum Control {
    ResetSession,
}

// ============================================================================
// Cs1237 Driver
// ============================================================================

/// CS1237 device driver.
///
/// # Example (Rust)
/// ```ignore
/// let config = AcquisitionConfig::default();
/// let (device, streams) = Cs1237::connect_serial("/dev/ttyUSB0", BAUD_RATE, config)?;
/// device.set_sample_rate(SampleRate::Hz40)?;
/// device.start()?;
/// for sample in streams.samples.iter().take(100) {
///     println!("{:.3}s {:+.4} mV", sample.time, sample.value);
/// }
/// device.stop()?;
/// device.shutdown()?;
/// ```
pub struct Cs1237 {
    writer: SharedWriter,
    config: SharedConfig,
    sequencer: CommandSequencer,
    stats: Arc<SharedStats>,
    control: Sender<Control>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<Result<()>>>,
}

impl Cs1237 {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open a serial port (e.g. `/dev/ttyUSB0`, `COM3`) and start the reader.
    pub fn connect_serial(
        path: &str,
        baud_rate: u32,
        config: AcquisitionConfig,
    ) -> anyhow::Result<(Self, Streams)> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("Failed to open serial port at {}", path))?;
        let reader = port
            .try_clone()
            .with_context(|| format!("Failed to clone serial handle for {}", path))?;

        info!("Connected to {} at {} baud", path, baud_rate);
        let link = Self::from_transport(reader, port, config)
            .with_context(|| format!("Failed to start reader for {}", path))?;
        Ok(link)
    }

    /// Start a driver over any byte transport.
    ///
    /// `reader` should return `TimedOut` or `WouldBlock` when idle rather than
    /// block indefinitely, otherwise [`Cs1237::shutdown`] waits for the next byte.
    pub fn from_transport<R, W>(
        reader: R,
        writer: W,
        config: AcquisitionConfig,
    ) -> Result<(Self, Streams)>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let config = SharedConfig::new(config);
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer) as Box<dyn Write + Send>));
        let responses = ResponseBuffer::new();
        let stats = Arc::new(SharedStats::default());
        let stop = Arc::new(AtomicBool::new(false));

        let (events_tx, events) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let (samples_tx, samples) = mpsc::channel();
        let (telemetry_tx, telemetry) = mpsc::sync_channel(TELEMETRY_QUEUE_DEPTH);
        let (control, control_rx) = mpsc::channel();

        let worker = ReaderWorker {
            decoder: FrameDecoder::new(),
            interpreter: TelemetryInterpreter::new(config.clone()),
            pipeline: ConditioningPipeline::new(config.clone()),
            responses: responses.clone(),
            stats: Arc::clone(&stats),
            stop: Arc::clone(&stop),
            control: control_rx,
            events: events_tx,
            samples: samples_tx,
            telemetry: telemetry_tx,
            delivered: 0,
            faults: 0,
            dropped: 0,
        };
        let handle = thread::Builder::new()
            .name("cs1237-reader".into())
            .spawn(move || worker.run(reader))?;

        let device = Self {
            sequencer: CommandSequencer::new(Arc::clone(&writer), responses),
            writer,
            config,
            stats,
            control,
            stop,
            reader: Some(handle),
        };
        Ok((
            device,
            Streams {
                events,
                samples,
                telemetry,
            },
        ))
    }

    // ------------------------------------------------------------------------
    // Device Commands
    // ------------------------------------------------------------------------

    /// Start continuous conversion. Begins a new sample session.
    pub fn start(&self) -> Result<()> {
        self.reset_session()?;
        self.send_command(CMD_START_CONTINUOUS)?;
        debug!(
            "Started continuous acquisition at {} Hz",
            self.config.load().sample_rate.hz()
        );
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.send_command(CMD_STOP)
    }

    /// Request one conversion.
    pub fn single_read(&self) -> Result<()> {
        self.send_command(CMD_SINGLE_READ)
    }

    /// Ask for a status frame; the answer arrives on the telemetry channel.
    pub fn query_status(&self) -> Result<()> {
        self.send_command(CMD_STATUS)
    }

    pub fn power_down(&self) -> Result<()> {
        self.send_command(CMD_POWER_DOWN)
    }

    pub fn power_up(&self) -> Result<()> {
        self.send_command(CMD_POWER_UP)
    }

    /// Print the firmware help text (arrives as text lines).
    pub fn help(&self) -> Result<()> {
        self.send_command(CMD_HELP)
    }

    // ------------------------------------------------------------------------
    // Menu Configuration
    // ------------------------------------------------------------------------

    pub fn set_gain(&self, gain: Gain) -> Result<()> {
        self.run_sequence(&gain_steps(gain))?;
        self.config.update(|cfg| cfg.gain = gain);
        info!("Gain set to x{}", gain.factor());
        Ok(())
    }

    pub fn set_sample_rate(&self, rate: SampleRate) -> Result<()> {
        self.run_sequence(&sample_rate_steps(rate))?;
        self.config.update(|cfg| cfg.sample_rate = rate);
        info!("Sample rate set to {} Hz", rate.hz());
        Ok(())
    }

    pub fn set_channel(&self, channel: ChannelMode) -> Result<()> {
        if channel == ChannelMode::Temperature && self.config.load().gain != Gain::X1 {
            warn!("Temperature channel selected with gain != 1; the firmware will report an error");
        }
        self.run_sequence(&channel_steps(channel))?;
        self.config.update(|cfg| cfg.channel_mode = channel);
        info!("Channel set to {:?}", channel);
        Ok(())
    }

    /// Run a step list, blocking until it completes.
    ///
    /// Builds a private runtime, so it must not be called from inside one;
    /// use [`Cs1237::run_sequence_async`] there.
    pub fn run_sequence(&self, steps: &[Step]) -> Result<()> {
        let rt = Runtime::new()?;
        rt.block_on(self.sequencer.run(steps))
    }

    /// Run a step list from async code.
    pub async fn run_sequence_async(&self, steps: &[Step]) -> Result<()> {
        self.sequencer.run(steps).await
    }

    /// Abort the running sequence at its next check, or the next sequence to
    /// start if none is running.
    pub fn cancel_sequence(&self) {
        self.sequencer.cancel();
    }

    /// Handle that can cancel sequences from another thread.
    pub fn sequence_canceller(&self) -> CommandSequencer {
        self.sequencer.clone()
    }

    /// Override the sequencer's pre-send pause and polling period.
    pub fn set_sequencer_timing(&mut self, pre_send_delay: Duration, poll_interval: Duration) {
        self.sequencer = self
            .sequencer
            .clone()
            .with_timing(pre_send_delay, poll_interval);
    }

    // ------------------------------------------------------------------------
    // Session and State
    // ------------------------------------------------------------------------

    /// Discard pending samples and restart the sample clock.
    pub fn reset_session(&self) -> Result<()> {
        self.control
            .send(Control::ResetSession)
            .map_err(|_| DriverError::TransportClosed)
    }

    /// Shared configuration; updates take effect on the next sample.
    pub fn config(&self) -> SharedConfig {
        self.config.clone()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats.snapshot()
    }

    /// Stop the reader, flush the pipeline, and report the transport fault that
    /// ended the stream, if any.
    pub fn shutdown(mut self) -> Result<()> {
        self.join_reader()
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    /// Send a single-byte command to the firmware.
    fn send_command(&self, cmd: u8) -> Result<()> {
        write_command(&self.writer, &[cmd])?;
        thread::sleep(COMMAND_DELAY);
        Ok(())
    }

    fn join_reader(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        match self.reader.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(DriverError::Io(std::io::Error::other("reader thread panicked")))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Cs1237 {
    fn drop(&mut self) {
        if let Err(e) = self.join_reader() {
            debug!("Reader ended with error during drop: {e}");
        }
    }
}

// ============================================================================
// Reader Thread
// ============================================================================

struct ReaderWorker {
    decoder: FrameDecoder,
    interpreter: TelemetryInterpreter,
    pipeline: ConditioningPipeline,
    responses: ResponseBuffer,
    stats: Arc<SharedStats>,
    stop: Arc<AtomicBool>,
    control: Receiver<Control>,
    events: SyncSender<DecodedEvent>,
    samples: Sender<Sample>,
    telemetry: SyncSender<Telemetry>,
    delivered: u64,
    faults: u64,
    dropped: u64,
}

impl ReaderWorker {
    fn run<R: Read>(mut self, mut transport: R) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        let mut last_data = Instant::now();

        let outcome = loop {
            if self.stop.load(Ordering::SeqCst) {
                break Ok(());
            }
            self.apply_control();

            match transport.read(&mut buf) {
                Ok(0) => break Err(DriverError::TransportClosed),
                Ok(n) => {
                    // A reset sent before the command that produced these bytes
                    // must apply to them.
                    self.apply_control();
                    last_data = Instant::now();
                    let events = self.decoder.feed_at(&buf[..n], last_data);
                    self.dispatch(events);
                    self.publish_stats();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => self.settle_if_idle(last_data),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.settle_if_idle(last_data);
                    thread::sleep(IDLE_BACKOFF);
                }
                Err(e) => break Err(e.into()),
            }
        };

        if let Err(e) = &outcome {
            error!("Transport fault, reader stopped: {e}");
        }

        let tail = self.decoder.finish();
        self.dispatch(tail);
        for sample in self.pipeline.flush(true) {
            self.deliver(sample);
        }
        self.publish_stats();
        debug!("Reader stopped: {:?}", self.stats.snapshot());
        outcome
    }

    fn settle_if_idle(&mut self, last_data: Instant) {
        if self.decoder.buffered() == 0 || last_data.elapsed() < IDLE_SETTLE {
            return;
        }
        let events = self.decoder.settle();
        if !events.is_empty() {
            self.dispatch(events);
            self.publish_stats();
        }
    }

    fn apply_control(&mut self) {
        while let Ok(msg) = self.control.try_recv() {
            match msg {
                Control::ResetSession => {
                    self.pipeline.reset();
                    debug!("Sample session reset");
                }
            }
        }
    }

    fn dispatch(&mut self, events: Vec<DecodedEvent>) {
        for event in events {
            match &event {
                DecodedEvent::TextLine(line) => {
                    debug!("Device: {line}");
                    self.responses.push_line(line);
                }
                DecodedEvent::BinaryFrame(frame) => self.handle_frame(frame),
            }
            if let Err(TrySendError::Full(_)) = self.events.try_send(event) {
                self.dropped += 1;
            }
        }
    }

    fn handle_frame(&mut self, frame: &BinaryFrame) {
        match self.interpreter.interpret(frame) {
            Ok(Telemetry::Reading(reading)) => {
                let raw = RawSample {
                    arrival: reading.arrival,
                    value: reading.value,
                };
                if let Some(sample) = self.pipeline.push(raw) {
                    self.deliver(sample);
                }
            }
            Ok(record) => {
                if let Err(TrySendError::Full(_)) = self.telemetry.try_send(record) {
                    self.dropped += 1;
                }
            }
            Err(e) => {
                self.faults += 1;
                warn!("Dropping frame 0x{:02X}: {e}", frame.cmd);
            }
        }
    }

    fn deliver(&mut self, sample: Sample) {
        self.delivered += 1;
        let _ = self.samples.send(sample);
    }

    fn publish_stats(&self) {
        let decoder = self.decoder.stats();
        let pipeline = self.pipeline.stats();
        let s = &self.stats;
        s.frames.store(decoder.frames, Ordering::Relaxed);
        s.text_lines.store(decoder.text_lines, Ordering::Relaxed);
        s.resync_discards.store(decoder.resync_discards, Ordering::Relaxed);
        s.interpretation_faults.store(self.faults, Ordering::Relaxed);
        s.outliers.store(pipeline.outliers, Ordering::Relaxed);
        s.samples.store(self.delivered, Ordering::Relaxed);
        s.stale_dropped.store(pipeline.stale_dropped, Ordering::Relaxed);
        s.dropped.store(self.dropped, Ordering::Relaxed);
    }
}
