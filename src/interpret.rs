//! Gives meaning to validated binary frames.
//!
//! Measurement frames become calibrated [`Reading`]s in millivolts (or °C when
//! the temperature channel is selected). Status and configuration-ack frames
//! describe the device's actual settings and are written back into the shared
//! configuration, so conversion and timestamp reconstruction follow the device
//! rather than what the host last asked for.

use std::fmt;
use std::time::Instant;

use log::{debug, info, warn};

use crate::config::{ChannelMode, Gain, SampleRate, SharedConfig, ADC_FULL_SCALE};
use crate::errors::{DriverError, Result};
use crate::frame::{BinaryFrame, Dialect};

// ============================================================================
// Command ids
// ============================================================================

/// Raw 24-bit conversion result, big-endian i32
pub const CMD_ADC_DATA: u8 = 0x01;
pub const CMD_ERROR: u8 = 0x03;
pub const CMD_STATUS: u8 = 0x04;
pub const CMD_CONFIG_ACK: u8 = 0xB1;

const ACK_GAIN: u8 = 0xA1;
const ACK_SAMPLE_RATE: u8 = 0xA2;
const ACK_CHANNEL: u8 = 0xA3;
const ACK_POWER: u8 = 0xA4;

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Millivolts,
    Celsius,
}

/// One calibrated measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub unit: Unit,
    /// Gain the conversion was made with
    pub gain: Gain,
    pub arrival: Instant,
}

/// Snapshot reported by the status command (`S`).
///
/// Codes the host does not know are left as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub gain: Option<Gain>,
    pub sample_rate: Option<SampleRate>,
    pub channel: Option<ChannelMode>,
    /// Successful conversions since power-up
    pub success_count: u64,
}

/// Confirmation of a single setting change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAck {
    Gain(Gain),
    SampleRate(SampleRate),
    Channel(ChannelMode),
    Power { down: bool },
}

/// Error reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    SpiReadFailed,
    InvalidData,
    Timeout,
    /// The temperature sensor only works with gain 1
    TemperatureNeedsUnityGain,
    Unknown(u8),
}

impl DeviceFault {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => DeviceFault::SpiReadFailed,
            0x02 => DeviceFault::InvalidData,
            0x03 => DeviceFault::Timeout,
            0x04 => DeviceFault::TemperatureNeedsUnityGain,
            other => DeviceFault::Unknown(other),
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFault::SpiReadFailed => write!(f, "SPI read failed"),
            DeviceFault::InvalidData => write!(f, "invalid data"),
            DeviceFault::Timeout => write!(f, "conversion timeout"),
            DeviceFault::TemperatureNeedsUnityGain => {
                write!(f, "temperature mode requires PGA=1")
            }
            DeviceFault::Unknown(code) => write!(f, "unknown error (0x{code:02X})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Telemetry {
    Reading(Reading),
    Status(StatusRecord),
    ConfigAck(ConfigAck),
    Fault(DeviceFault),
}

// ============================================================================
// Interpreter
// ============================================================================

pub struct TelemetryInterpreter {
    config: SharedConfig,
    power_down: bool,
}

impl TelemetryInterpreter {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            power_down: false,
        }
    }

    /// Last power state confirmed by the device.
    pub fn is_powered_down(&self) -> bool {
        self.power_down
    }

    pub fn interpret(&mut self, frame: &BinaryFrame) -> Result<Telemetry> {
        if frame.dialect == Dialect::Voltage {
            return self.voltage_frame(frame);
        }
        match frame.cmd {
            CMD_ADC_DATA => self.adc_frame(frame),
            CMD_ERROR => {
                let code = *frame
                    .payload
                    .first()
                    .ok_or_else(|| DriverError::Interpretation("empty error frame".into()))?;
                let fault = DeviceFault::from_code(code);
                warn!("Device reported error: {fault}");
                Ok(Telemetry::Fault(fault))
            }
            CMD_STATUS => self.status_frame(&frame.payload),
            CMD_CONFIG_ACK => self.config_ack(&frame.payload),
            other => Err(DriverError::Interpretation(format!(
                "unknown command 0x{other:02X}"
            ))),
        }
    }

    fn voltage_frame(&mut self, frame: &BinaryFrame) -> Result<Telemetry> {
        let bytes: [u8; 6] = frame.payload.as_slice().try_into().map_err(|_| {
            DriverError::Interpretation(format!(
                "voltage frame carries {} bytes, expected 6",
                frame.payload.len()
            ))
        })?;
        let volts = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let pga = u16::from_le_bytes([bytes[4], bytes[5]]);
        let gain = Gain::from_factor(pga)
            .ok_or_else(|| DriverError::Interpretation(format!("unsupported PGA {pga}")))?;

        if self.config.load().gain != gain {
            debug!("Gain reported by voltage frame: x{}", gain.factor());
            self.config.update(|cfg| cfg.gain = gain);
        }
        Ok(Telemetry::Reading(self.calibrate(
            f64::from(volts) * 1000.0,
            gain,
            frame.arrival,
        )?))
    }

    fn adc_frame(&self, frame: &BinaryFrame) -> Result<Telemetry> {
        let bytes: [u8; 4] = frame.payload.as_slice().try_into().map_err(|_| {
            DriverError::Interpretation(format!(
                "ADC frame carries {} bytes, expected 4",
                frame.payload.len()
            ))
        })?;
        let code = i32::from_be_bytes(bytes);

        let cfg = self.config.load();
        let scale = cfg.reference_voltage / (f64::from(cfg.gain.factor()) * ADC_FULL_SCALE);
        let millivolts = f64::from(code) * scale * 1000.0;
        Ok(Telemetry::Reading(self.calibrate(
            millivolts,
            cfg.gain,
            frame.arrival,
        )?))
    }

    fn calibrate(&self, millivolts: f64, gain: Gain, arrival: Instant) -> Result<Reading> {
        let cfg = self.config.load();
        let (value, unit) = match cfg.channel_mode {
            ChannelMode::Temperature => (
                cfg.temperature_calibration.apply(millivolts)?,
                Unit::Celsius,
            ),
            _ => (cfg.voltage_calibration.apply(millivolts), Unit::Millivolts),
        };
        Ok(Reading {
            value,
            unit,
            gain,
            arrival,
        })
    }

    fn status_frame(&mut self, data: &[u8]) -> Result<Telemetry> {
        if data.len() < 5 {
            return Err(DriverError::Interpretation(format!(
                "status frame carries {} bytes, expected at least 5",
                data.len()
            )));
        }
        let record = StatusRecord {
            gain: Gain::from_code(data[0]),
            sample_rate: SampleRate::from_code(data[1]),
            channel: ChannelMode::from_code(data[2]),
            success_count: data[3..]
                .iter()
                .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        };

        let cfg = self.config.load();
        let changed = record.gain.is_some_and(|g| g != cfg.gain)
            || record.sample_rate.is_some_and(|r| r != cfg.sample_rate)
            || record.channel.is_some_and(|c| c != cfg.channel_mode);
        if changed {
            self.config.update(|cfg| {
                if let Some(gain) = record.gain {
                    cfg.gain = gain;
                }
                if let Some(rate) = record.sample_rate {
                    cfg.sample_rate = rate;
                }
                if let Some(channel) = record.channel {
                    cfg.channel_mode = channel;
                }
            });
        }
        info!(
            "Device status: gain={:?}, rate={:?}, channel={:?}, conversions={}",
            record.gain, record.sample_rate, record.channel, record.success_count
        );
        Ok(Telemetry::Status(record))
    }

    fn config_ack(&mut self, data: &[u8]) -> Result<Telemetry> {
        let &[kind, value, ..] = data else {
            return Err(DriverError::Interpretation(format!(
                "config ack carries {} bytes, expected 2",
                data.len()
            )));
        };
        let invalid = || {
            DriverError::Interpretation(format!(
                "config ack 0x{kind:02X} with invalid value {value}"
            ))
        };

        let ack = match kind {
            ACK_GAIN => {
                let gain = Gain::from_code(value).ok_or_else(invalid)?;
                self.config.update(|cfg| cfg.gain = gain);
                ConfigAck::Gain(gain)
            }
            ACK_SAMPLE_RATE => {
                let rate = SampleRate::from_code(value).ok_or_else(invalid)?;
                self.config.update(|cfg| cfg.sample_rate = rate);
                ConfigAck::SampleRate(rate)
            }
            ACK_CHANNEL => {
                let channel = ChannelMode::from_code(value).ok_or_else(invalid)?;
                self.config.update(|cfg| cfg.channel_mode = channel);
                ConfigAck::Channel(channel)
            }
            ACK_POWER => {
                self.power_down = value == 1;
                ConfigAck::Power {
                    down: self.power_down,
                }
            }
            other => {
                return Err(DriverError::Interpretation(format!(
                    "unknown config ack type 0x{other:02X}"
                )))
            }
        };
        info!("Device confirmed {ack:?}");
        Ok(Telemetry::ConfigAck(ack))
    }
}
