//! Python bindings, built with the `python` feature.

use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::config::{AcquisitionConfig, ChannelMode, Gain, SampleRate};
use crate::device::{Cs1237, Streams, BAUD_RATE, EVENT_QUEUE_DEPTH};
use crate::errors::DriverError;
use crate::frame::DecodedEvent;
use crate::logging;
use crate::pipeline::Sample;

fn to_py_err(e: DriverError) -> PyErr {
    match e {
        DriverError::Timeout { .. } => PyErr::new::<PyTimeoutError, _>(e.to_string()),
        DriverError::Config(_) => PyErr::new::<PyValueError, _>(e.to_string()),
        DriverError::Io(_) | DriverError::Serial(_) | DriverError::TransportClosed => {
            PyErr::new::<PyIOError, _>(e.to_string())
        }
        _ => PyErr::new::<PyRuntimeError, _>(e.to_string()),
    }
}

/// A corrected sample.
///
/// Attributes:
///     time: Seconds since the acquisition session started.
///     value: Calibrated value (mV, or °C on the temperature channel).
#[pyclass(name = "Sample", frozen, eq)]
#[derive(Clone, PartialEq)]
struct PySample {
    #[pyo3(get)]
    time: f64,
    #[pyo3(get)]
    value: f64,
}

#[pymethods]
impl PySample {
    #[new]
    fn new(time: f64, value: f64) -> Self {
        PySample { time, value }
    }

    fn __repr__(&self) -> String {
        format!("Sample(time={:.4}, value={})", self.time, self.value)
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("time", self.time)?;
        dict.set_item("value", self.value)?;
        Ok(dict)
    }
}

impl From<Sample> for PySample {
    fn from(s: Sample) -> Self {
        PySample {
            time: s.time,
            value: s.value,
        }
    }
}

/// CS1237 serial link.
///
/// Example:
///     >>> dev = Cs1237("/dev/ttyUSB0")
///     >>> dev.set_sample_rate(40)
///     >>> dev.start()
///     >>> samples = dev.read_samples(100, timeout_ms=500)
///     >>> dev.stop()
///     >>> dev.close()
#[pyclass(name = "Cs1237", unsendable)]
struct PyCs1237 {
    inner: Option<Cs1237>,
    streams: Streams,
}

impl PyCs1237 {
    fn device(&self) -> PyResult<&Cs1237> {
        self.inner
            .as_ref()
            .ok_or_else(|| PyErr::new::<PyRuntimeError, _>("device is closed"))
    }
}

#[pymethods]
impl PyCs1237 {
    /// Open the serial port and start the reader thread.
    #[new]
    #[pyo3(signature = (path, baud_rate=BAUD_RATE))]
    fn new(path: &str, baud_rate: u32) -> PyResult<Self> {
        let (device, streams) =
            Cs1237::connect_serial(path, baud_rate, AcquisitionConfig::default())
                .map_err(|e| PyErr::new::<PyIOError, _>(format!("{e:#}")))?;
        Ok(PyCs1237 {
            inner: Some(device),
            streams,
        })
    }

    fn start(&self) -> PyResult<()> {
        self.device()?.start().map_err(to_py_err)
    }

    fn stop(&self) -> PyResult<()> {
        self.device()?.stop().map_err(to_py_err)
    }

    fn single_read(&self) -> PyResult<()> {
        self.device()?.single_read().map_err(to_py_err)
    }

    fn query_status(&self) -> PyResult<()> {
        self.device()?.query_status().map_err(to_py_err)
    }

    fn power_down(&self) -> PyResult<()> {
        self.device()?.power_down().map_err(to_py_err)
    }

    fn power_up(&self) -> PyResult<()> {
        self.device()?.power_up().map_err(to_py_err)
    }

    /// Set the PGA gain.
    ///
    /// Args:
    ///     factor: One of 1, 2, 64, 128.
    ///
    /// Raises:
    ///     ValueError: For an unsupported factor.
    ///     TimeoutError: If the firmware menu does not answer.
    fn set_gain(&self, factor: u16) -> PyResult<()> {
        let gain = Gain::from_factor_checked(factor).map_err(to_py_err)?;
        self.device()?.set_gain(gain).map_err(to_py_err)
    }

    /// Set the output rate in Hz (10, 40, 640 or 1280).
    fn set_sample_rate(&self, hz: u16) -> PyResult<()> {
        let rate = SampleRate::from_hz_checked(hz).map_err(to_py_err)?;
        self.device()?.set_sample_rate(rate).map_err(to_py_err)
    }

    /// Select the input channel by firmware code (0 differential, 2 temperature, 3 short).
    fn set_channel(&self, code: u8) -> PyResult<()> {
        let channel = ChannelMode::from_code_checked(code).map_err(to_py_err)?;
        self.device()?.set_channel(channel).map_err(to_py_err)
    }

    /// Toggle spike correction and smoothing. `None` leaves a flag unchanged.
    #[pyo3(signature = (outlier_filter=None, smoothing=None))]
    fn set_filters(&self, outlier_filter: Option<bool>, smoothing: Option<bool>) -> PyResult<()> {
        self.device()?.config().update(|cfg| {
            if let Some(on) = outlier_filter {
                cfg.enable_outlier_filter = on;
            }
            if let Some(on) = smoothing {
                cfg.enable_smoothing = on;
            }
        });
        Ok(())
    }

    /// Abort the next menu exchange at its first check.
    ///
    /// The configuration setters hold the device for their whole exchange, so
    /// this cannot interrupt one already running.
    fn cancel_sequence(&self) -> PyResult<()> {
        self.device()?.cancel_sequence();
        Ok(())
    }

    /// Collect up to `max_samples`, waiting at most `timeout_ms` for the first one.
    #[pyo3(signature = (max_samples=100, timeout_ms=100))]
    fn read_samples(&self, max_samples: usize, timeout_ms: u64) -> PyResult<Vec<PySample>> {
        let mut out = Vec::new();
        if max_samples == 0 {
            return Ok(out);
        }
        match self
            .streams
            .samples
            .recv_timeout(Duration::from_millis(timeout_ms))
        {
            Ok(sample) => out.push(PySample::from(sample)),
            Err(RecvTimeoutError::Timeout) => return Ok(out),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PyErr::new::<PyIOError, _>("reader thread has stopped"))
            }
        }
        while out.len() < max_samples {
            match self.streams.samples.try_recv() {
                Ok(sample) => out.push(PySample::from(sample)),
                Err(_) => break,
            }
        }
        Ok(out)
    }

    /// Drain the text lines received so far.
    ///
    /// Events queue up to `EVENT_QUEUE_DEPTH` while nothing reads them. Later
    /// ones are dropped and counted under `dropped` in `stats()`.
    fn read_lines(&self) -> Vec<String> {
        self.streams
            .events
            .try_iter()
            .filter_map(|event| match event {
                DecodedEvent::TextLine(line) => Some(line),
                DecodedEvent::BinaryFrame(_) => None,
            })
            .collect()
    }

    /// Drain status, acknowledgement and fault records as readable strings.
    fn read_telemetry(&self) -> Vec<String> {
        self.streams
            .telemetry
            .try_iter()
            .map(|record| format!("{record:?}"))
            .collect()
    }

    /// Link counters as a dictionary.
    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.device()?.stats();
        let dict = PyDict::new(py);
        dict.set_item("frames", stats.frames)?;
        dict.set_item("text_lines", stats.text_lines)?;
        dict.set_item("resync_discards", stats.resync_discards)?;
        dict.set_item("interpretation_faults", stats.interpretation_faults)?;
        dict.set_item("outliers", stats.outliers)?;
        dict.set_item("samples", stats.samples)?;
        dict.set_item("stale_dropped", stats.stale_dropped)?;
        dict.set_item("dropped", stats.dropped)?;
        Ok(dict)
    }

    /// Current configuration as a dictionary.
    fn config<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let cfg = self.device()?.config().load();
        let dict = PyDict::new(py);
        dict.set_item("sample_rate_hz", cfg.sample_rate.hz())?;
        dict.set_item("gain", cfg.gain.factor())?;
        dict.set_item("channel", cfg.channel_mode.code())?;
        dict.set_item("reference_voltage", cfg.reference_voltage)?;
        dict.set_item("outlier_filter", cfg.enable_outlier_filter)?;
        dict.set_item("smoothing", cfg.enable_smoothing)?;
        Ok(dict)
    }

    /// Stop the reader thread. Samples still pending are flushed first.
    fn close(&mut self) -> PyResult<()> {
        match self.inner.take() {
            Some(device) => device.shutdown().map_err(to_py_err),
            None => Ok(()),
        }
    }

    fn __repr__(&self) -> String {
        match &self.inner {
            Some(device) => {
                let cfg = device.config().load();
                format!(
                    "Cs1237(rate={}Hz, gain=x{})",
                    cfg.sample_rate.hz(),
                    cfg.gain.factor()
                )
            }
            None => "Cs1237(closed)".to_string(),
        }
    }
}

/// Install the Rust logger. Returns the effective level name.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(level: Option<&str>) -> PyResult<String> {
    let parsed = match level {
        Some(name) => Some(
            logging::parse_level(Some(name))
                .ok_or_else(|| PyErr::new::<PyValueError, _>(format!("unknown level {name:?}")))?,
        ),
        None => None,
    };
    Ok(logging::init_logging_with(parsed).to_string())
}

#[pymodule]
fn cs1237_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyCs1237>()?;
    m.add_class::<PySample>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    m.add("DEFAULT_BAUD_RATE", BAUD_RATE)?;
    m.add("EVENT_QUEUE_DEPTH", EVENT_QUEUE_DEPTH)?;
    m.add("VALID_SAMPLE_RATES", vec![10u16, 40, 640, 1280])?;
    m.add("VALID_GAINS", vec![1u16, 2, 64, 128])?;

    Ok(())
}
