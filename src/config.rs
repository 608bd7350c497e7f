//! Acquisition configuration shared between the device façade, the frame
//! interpreter and the conditioning pipeline.
//!
//! The configuration is a read-mostly snapshot behind an [`ArcSwap`]. Readers take
//! a cheap `Arc` on every sample, so updates made by a collaborator (or by status
//! frames reported from the device) take effect on the next sample without
//! restarting anything.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

// ============================================================================
// Named thresholds
// ============================================================================

/// Slope ratio above which a successive-difference pair is considered a jump.
pub const DEFAULT_SLOPE_RATIO: f64 = 20.0;
/// Absolute floor of the clamp band used when a replacement strays from the median.
pub const DEFAULT_CLAMP_FLOOR: f64 = 1000.0;
/// Multiple of |median| used for the single-spike clamp band.
pub const DEFAULT_CLAMP_MEDIAN_MULTIPLE: f64 = 3.0;
/// Absolute value (mV) above which a sample whose leading slope jumps is a spike.
pub const DEFAULT_MAGNITUDE_CEILING: f64 = 5000.0;
/// Ratio to the neighbour median above which a sample whose leading slope jumps is a spike.
pub const DEFAULT_MEDIAN_RATIO: f64 = 10.0;
/// Fraction of |median| allowed for double-spike replacements.
pub const DEFAULT_BAND_FRACTION: f64 = 0.1;
/// Fraction of the double-spike band used to separate collapsed replacements.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.01;

/// Arrivals this much earlier than the last assigned time mark a stream reset.
pub const STREAM_RESET_GAP: Duration = Duration::from_secs(1);
/// Arrivals this much earlier than the session start are stale and dropped.
pub const STALE_TOLERANCE: Duration = Duration::from_millis(100);

/// CS1237 conversions are 24-bit signed: full scale is 2^23 codes.
pub const ADC_FULL_SCALE: f64 = 8_388_608.0;

// ============================================================================
// Device enums
// ============================================================================

/// Output data rates supported by the CS1237.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleRate {
    #[default]
    Hz10 = 10,
    Hz40 = 40,
    Hz640 = 640,
    Hz1280 = 1280,
}

impl SampleRate {
    /// Firmware menu / status code for this rate.
    pub fn code(self) -> u8 {
        match self {
            SampleRate::Hz10 => 0,
            SampleRate::Hz40 => 1,
            SampleRate::Hz640 => 2,
            SampleRate::Hz1280 => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SampleRate::Hz10),
            1 => Some(SampleRate::Hz40),
            2 => Some(SampleRate::Hz640),
            3 => Some(SampleRate::Hz1280),
            _ => None,
        }
    }

    /// Parse a rate in Hz, returning an error on unsupported values.
    pub fn from_hz_checked(value: u16) -> Result<Self> {
        match value {
            10 => Ok(SampleRate::Hz10),
            40 => Ok(SampleRate::Hz40),
            640 => Ok(SampleRate::Hz640),
            1280 => Ok(SampleRate::Hz1280),
            _ => Err(DriverError::Config(format!(
                "invalid sample rate {value}. Supported: 10, 40, 640, 1280."
            ))),
        }
    }

    pub fn hz(self) -> f64 {
        self as u16 as f64
    }

    /// Nominal spacing between two samples.
    pub fn period(self) -> Duration {
        Duration::from_secs_f64(1.0 / self.hz())
    }
}

/// Programmable gain amplifier setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Gain {
    X1,
    X2,
    X64,
    #[default]
    X128,
}

impl Gain {
    pub fn code(self) -> u8 {
        match self {
            Gain::X1 => 0,
            Gain::X2 => 1,
            Gain::X64 => 2,
            Gain::X128 => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Gain::X1),
            1 => Some(Gain::X2),
            2 => Some(Gain::X64),
            3 => Some(Gain::X128),
            _ => None,
        }
    }

    /// Gain as the multiplication factor carried in voltage frames.
    pub fn factor(self) -> u16 {
        match self {
            Gain::X1 => 1,
            Gain::X2 => 2,
            Gain::X64 => 64,
            Gain::X128 => 128,
        }
    }

    pub fn from_factor(factor: u16) -> Option<Self> {
        match factor {
            1 => Some(Gain::X1),
            2 => Some(Gain::X2),
            64 => Some(Gain::X64),
            128 => Some(Gain::X128),
            _ => None,
        }
    }

    pub fn from_factor_checked(factor: u16) -> Result<Self> {
        Self::from_factor(factor).ok_or_else(|| {
            DriverError::Config(format!("invalid gain {factor}. Supported: 1, 2, 64, 128."))
        })
    }
}

/// Input channel multiplexer setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelMode {
    /// Channel A, differential input
    #[default]
    Differential,
    Reserved,
    /// On-chip temperature sensor
    Temperature,
    /// Inputs internally shorted (offset measurement)
    Short,
}

impl ChannelMode {
    pub fn code(self) -> u8 {
        match self {
            ChannelMode::Differential => 0,
            ChannelMode::Reserved => 1,
            ChannelMode::Temperature => 2,
            ChannelMode::Short => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChannelMode::Differential),
            1 => Some(ChannelMode::Reserved),
            2 => Some(ChannelMode::Temperature),
            3 => Some(ChannelMode::Short),
            _ => None,
        }
    }

    pub fn from_code_checked(code: u8) -> Result<Self> {
        Self::from_code(code).ok_or_else(|| {
            DriverError::Config(format!("invalid channel code {code}. Supported: 0-3."))
        })
    }
}

// ============================================================================
// Calibration and filter parameters
// ============================================================================

/// Linear correction applied to millivolt readings: `mv * slope + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageCalibration {
    pub slope: f64,
    pub offset: f64,
}

impl Default for VoltageCalibration {
    fn default() -> Self {
        Self {
            slope: 1.0,
            offset: 0.0,
        }
    }
}

impl VoltageCalibration {
    pub fn apply(&self, millivolts: f64) -> f64 {
        millivolts * self.slope + self.offset
    }
}

/// Single-point temperature correction constants.
///
/// `a` is the reference temperature in °C and `ya` the sensor output (mV)
/// measured at that temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureCalibration {
    pub a: f64,
    pub ya: f64,
}

impl Default for TemperatureCalibration {
    fn default() -> Self {
        Self { a: 25.0, ya: 114.75 }
    }
}

impl TemperatureCalibration {
    /// Convert a sensor reading in millivolts to °C.
    pub fn apply(&self, millivolts: f64) -> Result<f64> {
        if self.ya.abs() < f64::EPSILON {
            return Err(DriverError::Config(
                "temperature calibration Ya must be non-zero".into(),
            ));
        }
        Ok(millivolts * (273.15 + self.a) / self.ya - 273.15)
    }
}

/// Thresholds of the five-point spike detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierThresholds {
    pub slope_ratio: f64,
    pub clamp_floor: f64,
    pub clamp_median_multiple: f64,
    pub magnitude_ceiling: f64,
    pub median_ratio: f64,
    pub band_fraction: f64,
    pub jitter_fraction: f64,
}

impl Default for OutlierThresholds {
    fn default() -> Self {
        Self {
            slope_ratio: DEFAULT_SLOPE_RATIO,
            clamp_floor: DEFAULT_CLAMP_FLOOR,
            clamp_median_multiple: DEFAULT_CLAMP_MEDIAN_MULTIPLE,
            magnitude_ceiling: DEFAULT_MAGNITUDE_CEILING,
            median_ratio: DEFAULT_MEDIAN_RATIO,
            band_fraction: DEFAULT_BAND_FRACTION,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

/// Noise parameters of the scalar recursive estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothingParams {
    /// Process noise covariance (q)
    pub process_noise: f64,
    /// Measurement noise covariance (r); larger is smoother
    pub measurement_noise: f64,
    /// Initial estimate error covariance (p)
    pub initial_covariance: f64,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            process_noise: 0.002,
            measurement_noise: 1.0,
            initial_covariance: 1.0,
        }
    }
}

// ============================================================================
// Acquisition configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub sample_rate: SampleRate,
    pub gain: Gain,
    pub channel_mode: ChannelMode,
    /// ADC reference voltage in volts
    pub reference_voltage: f64,
    pub voltage_calibration: VoltageCalibration,
    pub temperature_calibration: TemperatureCalibration,
    pub enable_outlier_filter: bool,
    pub enable_smoothing: bool,
    pub outliers: OutlierThresholds,
    pub smoothing: SmoothingParams,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::default(),
            gain: Gain::default(),
            channel_mode: ChannelMode::default(),
            reference_voltage: 5.0,
            voltage_calibration: VoltageCalibration::default(),
            temperature_calibration: TemperatureCalibration::default(),
            enable_outlier_filter: true,
            enable_smoothing: false,
            outliers: OutlierThresholds::default(),
            smoothing: SmoothingParams::default(),
        }
    }
}

/// Shared, atomically swappable configuration snapshot.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<AcquisitionConfig>>,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(AcquisitionConfig::default())
    }
}

impl SharedConfig {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<AcquisitionConfig> {
        self.inner.load_full()
    }

    /// Replace the whole configuration.
    pub fn store(&self, config: AcquisitionConfig) {
        self.inner.store(Arc::new(config));
    }

    /// Apply an in-place edit to a copy of the current configuration and publish it.
    pub fn update<F>(&self, edit: F)
    where
        F: Fn(&mut AcquisitionConfig),
    {
        self.inner.rcu(|current| {
            let mut next = AcquisitionConfig::clone(current);
            edit(&mut next);
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_firmware_menu() {
        assert_eq!(SampleRate::Hz640.code(), 2);
        assert_eq!(SampleRate::from_code(3), Some(SampleRate::Hz1280));
        assert_eq!(Gain::from_code(2), Some(Gain::X64));
        assert_eq!(Gain::X64.factor(), 64);
        assert_eq!(ChannelMode::from_code(2), Some(ChannelMode::Temperature));
        assert!(ChannelMode::from_code(4).is_none());
    }

    #[test]
    fn checked_parsing_rejects_unsupported_values() {
        assert!(SampleRate::from_hz_checked(100).is_err());
        assert_eq!(SampleRate::from_hz_checked(40).ok(), Some(SampleRate::Hz40));
        assert!(Gain::from_factor_checked(3).is_err());
        assert!(matches!(
            ChannelMode::from_code_checked(9),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn sample_period_follows_rate() {
        assert_eq!(SampleRate::Hz10.period(), Duration::from_millis(100));
        assert!((SampleRate::Hz1280.hz() - 1280.0).abs() < f64::EPSILON);
    }

    #[test]
    fn temperature_calibration_reference_point_maps_to_a() {
        let cal = TemperatureCalibration::default();
        let t = cal.apply(cal.ya).expect("valid calibration");
        assert!((t - cal.a).abs() < 1e-9);

        let broken = TemperatureCalibration { a: 25.0, ya: 0.0 };
        assert!(broken.apply(100.0).is_err());
    }

    #[test]
    fn shared_updates_are_visible_to_clones() {
        let shared = SharedConfig::default();
        let reader = shared.clone();
        assert!(!reader.load().enable_smoothing);

        shared.update(|cfg| {
            cfg.enable_smoothing = true;
            cfg.sample_rate = SampleRate::Hz640;
        });
        let snapshot = reader.load();
        assert!(snapshot.enable_smoothing);
        assert_eq!(snapshot.sample_rate, SampleRate::Hz640);
    }
}
