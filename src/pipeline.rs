//! Turns interpreted readings into an ordered, spike-corrected sample stream.
//!
//! Three stages run for every reading, synchronously on the reader thread:
//!
//! 1. **Timestamp reconstruction.** Serial reads batch samples together, so host
//!    arrival times bunch up. Arrivals close to the next expected slot snap onto
//!    the nominal sample grid; a large jump backwards re-aligns the time base.
//! 2. **Spike correction.** Samples wait in a five-deep lookahead queue until they
//!    have two newer siblings, so the five-point detector can replace a glitch
//!    (and its follower) before either is committed.
//! 3. **Smoothing.** An optional scalar Kalman filter runs on committed values.
//!
//! Committed times never decrease.

use std::collections::VecDeque;
use std::time::Instant;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{SharedConfig, STALE_TOLERANCE, STREAM_RESET_GAP};
use crate::kalman::KalmanFilter;
use crate::outlier::{classify, Verdict};

/// Queue depth at which the oldest pending sample is committed
pub const LOOKAHEAD: usize = 5;
/// Committed values kept as fallback context for the detector
pub const HISTORY_LEN: usize = 100;

/// A physical value as it left the interpreter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub arrival: Instant,
    pub value: f64,
}

/// A committed sample, timed relative to the session start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since session start
    pub time: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    at: f64,
    value: f64,
    checked: bool,
}

/// Counters exposed alongside the sample stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub committed: u64,
    /// Samples replaced by the spike detector
    pub outliers: u64,
    pub stale_dropped: u64,
}

pub struct ConditioningPipeline {
    config: SharedConfig,
    start: Instant,
    last_assigned: Option<f64>,
    last_emitted: f64,
    pending: VecDeque<Pending>,
    history: VecDeque<f64>,
    kalman: Option<KalmanFilter>,
    stats: PipelineStats,
}

impl ConditioningPipeline {
    pub fn new(config: SharedConfig) -> Self {
        Self::with_start(config, Instant::now())
    }

    /// Pipeline whose session starts at `start`.
    pub fn with_start(config: SharedConfig, start: Instant) -> Self {
        Self {
            config,
            start,
            last_assigned: None,
            last_emitted: 0.0,
            pending: VecDeque::with_capacity(LOOKAHEAD + 1),
            history: VecDeque::with_capacity(HISTORY_LEN),
            kalman: None,
            stats: PipelineStats::default(),
        }
    }

    /// Accept one reading; returns the sample committed as a result, if any.
    pub fn push(&mut self, raw: RawSample) -> Option<Sample> {
        self.stats.received += 1;

        let Some(at) = self.assign_time(raw.arrival) else {
            self.stats.stale_dropped += 1;
            return None;
        };
        self.pending.push_back(Pending {
            at,
            value: raw.value,
            checked: false,
        });
        self.inspect();

        let mut committed = None;
        while self.pending.len() >= LOOKAHEAD {
            if let Some(sample) = self.commit_front() {
                committed = Some(sample);
            }
        }
        committed
    }

    /// Commit what is ready. With `force`, everything still pending is committed,
    /// uncorrected where it never got two newer siblings.
    pub fn flush(&mut self, force: bool) -> Vec<Sample> {
        self.inspect();
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some(front) = self.pending.front() {
            if !force && !front.checked {
                break;
            }
            if let Some(sample) = self.commit_front() {
                out.push(sample);
            }
        }
        out
    }

    /// Clear all state and start a new session now.
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&mut self, start: Instant) {
        self.start = start;
        self.last_assigned = None;
        self.last_emitted = 0.0;
        self.pending.clear();
        self.history.clear();
        self.kalman = None;
        self.stats = PipelineStats::default();
    }

    pub fn outlier_count(&self) -> u64 {
        self.stats.outliers
    }

    pub fn stale_dropped(&self) -> u64 {
        self.stats.stale_dropped
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn session_start(&self) -> Instant {
        self.start
    }

    // ------------------------------------------------------------------------
    // Timestamp reconstruction
    // ------------------------------------------------------------------------

    fn assign_time(&mut self, arrival: Instant) -> Option<f64> {
        let ts = seconds_since(self.start, arrival);
        if ts < -STALE_TOLERANCE.as_secs_f64() {
            return None;
        }

        let interval = self.config.load().sample_rate.period().as_secs_f64();
        let assigned = match self.last_assigned {
            None => ts,
            Some(last) if ts < last - STREAM_RESET_GAP.as_secs_f64() => {
                debug!("Stream reset detected: arrival {ts:.3}s after last {last:.3}s");
                ts
            }
            Some(last) if ts < last + 1.5 * interval => last + interval,
            Some(_) => ts,
        };
        let assigned = assigned.max(0.0);
        self.last_assigned = Some(assigned);
        Some(assigned)
    }

    // ------------------------------------------------------------------------
    // Spike correction
    // ------------------------------------------------------------------------

    fn inspect(&mut self) {
        let cfg = self.config.load();
        let len = self.pending.len();

        for i in 0..len {
            if self.pending[i].checked || i + 2 >= len {
                continue;
            }
            self.pending[i].checked = true;
            if !cfg.enable_outlier_filter {
                continue;
            }
            let Some([p1, p2]) = self.older_pair(i) else {
                continue;
            };

            let window = [
                p1,
                p2,
                self.pending[i].value,
                self.pending[i + 1].value,
                self.pending[i + 2].value,
            ];
            match classify(window, &cfg.outliers) {
                Verdict::Clean => {}
                Verdict::Spike { replacement } => {
                    debug!(
                        "Spike at {:.3}s: {} -> {}",
                        self.pending[i].at, self.pending[i].value, replacement
                    );
                    self.pending[i].value = replacement;
                    self.stats.outliers += 1;
                }
                Verdict::DoubleSpike { current, next } => {
                    debug!(
                        "Double spike at {:.3}s: {}, {} -> {}, {}",
                        self.pending[i].at,
                        self.pending[i].value,
                        self.pending[i + 1].value,
                        current,
                        next
                    );
                    self.pending[i].value = current;
                    self.pending[i + 1].value = next;
                    self.stats.outliers += 2;
                }
            }
        }
    }

    /// The two values preceding pending index `i`, oldest first, falling back on
    /// committed history.
    fn older_pair(&self, i: usize) -> Option<[f64; 2]> {
        let mut older = [0.0; 2];
        for (slot, back) in [(1usize, 1usize), (0, 2)] {
            older[slot] = if back <= i {
                self.pending[i - back].value
            } else {
                let from_end = back - i;
                if from_end > self.history.len() {
                    return None;
                }
                self.history[self.history.len() - from_end]
            };
        }
        Some(older)
    }

    // ------------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------------

    fn commit_front(&mut self) -> Option<Sample> {
        let front = self.pending.pop_front()?;

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(front.value);

        let time = front.at.max(self.last_emitted);
        self.last_emitted = time;

        let cfg = self.config.load();
        let value = if cfg.enable_smoothing {
            // Seeded from the value entering the filter: a raw spike would
            // carry straight into the smoothed output.
            let filter = self
                .kalman
                .get_or_insert_with(|| KalmanFilter::new(&cfg.smoothing, front.value));
            filter.retune(&cfg.smoothing);
            filter.update(front.value)
        } else {
            self.kalman = None;
            front.value
        };

        self.stats.committed += 1;
        Some(Sample { time, value })
    }
}

/// Signed seconds from `start` to `at`.
fn seconds_since(start: Instant, at: Instant) -> f64 {
    match at.checked_duration_since(start) {
        Some(elapsed) => elapsed.as_secs_f64(),
        None => -start.duration_since(at).as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{AcquisitionConfig, SampleRate};

    fn pipeline(config: AcquisitionConfig) -> (ConditioningPipeline, Instant) {
        let start = Instant::now();
        (
            ConditioningPipeline::with_start(SharedConfig::new(config), start),
            start,
        )
    }

    fn at(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    /// Push values 100 ms apart and return every committed sample, flush included.
    fn run_all(p: &mut ConditioningPipeline, start: Instant, values: &[f64]) -> Vec<Sample> {
        let mut out: Vec<Sample> = values
            .iter()
            .enumerate()
            .filter_map(|(k, &value)| {
                p.push(RawSample {
                    arrival: at(start, 100 * k as u64),
                    value,
                })
            })
            .collect();
        out.extend(p.flush(true));
        out
    }

    fn values(samples: &[Sample]) -> Vec<f64> {
        samples.iter().map(|s| s.value).collect()
    }

    #[test]
    fn single_spike_is_replaced() {
        let (mut p, start) = pipeline(AcquisitionConfig::default());
        let out = run_all(&mut p, start, &[100.0, 102.0, 101.0, 8_388_502.0, 103.0, 104.0]);
        assert_eq!(values(&out), vec![100.0, 102.0, 101.0, 102.5, 103.0, 104.0]);
        assert_eq!(p.outlier_count(), 1);
    }

    #[test]
    fn smooth_data_passes_unchanged() {
        let (mut p, start) = pipeline(AcquisitionConfig::default());
        let input: Vec<f64> = (0..60)
            .map(|k| 0.5 * k as f64 + 0.01 * (k * k) as f64)
            .collect();
        let out = run_all(&mut p, start, &input);
        assert_eq!(values(&out), input);
        assert_eq!(p.outlier_count(), 0);
    }

    #[test]
    fn push_commits_at_most_one_sample_and_flush_completes() {
        let (mut p, start) = pipeline(AcquisitionConfig::default());
        let mut committed = 0;
        for k in 0..23u64 {
            let out = p.push(RawSample {
                arrival: at(start, 100 * k),
                value: k as f64,
            });
            committed += usize::from(out.is_some());
            assert!(p.pending_len() < LOOKAHEAD);
        }
        assert_eq!(committed, 23 - (LOOKAHEAD - 1));
        assert!(p.flush(false).len() <= LOOKAHEAD - 1);
        p.flush(true);
        assert_eq!(p.pending_len(), 0);
        assert_eq!(p.stats().committed, 23);
    }

    #[test]
    fn burst_arrivals_are_spread_on_the_sample_grid() {
        let (mut p, start) = pipeline(AcquisitionConfig::default());
        for k in 0..3 {
            p.push(RawSample {
                arrival: start,
                value: k as f64,
            });
        }
        let out = p.flush(true);
        let times: Vec<f64> = out.iter().map(|s| s.time).collect();
        assert_eq!(times.len(), 3);
        assert!((times[0] - 0.0).abs() < 1e-9);
        assert!((times[1] - 0.1).abs() < 1e-9);
        assert!((times[2] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn late_arrival_keeps_its_own_time() {
        let config = AcquisitionConfig {
            sample_rate: SampleRate::Hz40,
            ..AcquisitionConfig::default()
        };
        let (mut p, start) = pipeline(config);
        p.push(RawSample {
            arrival: start,
            value: 1.0,
        });
        p.push(RawSample {
            arrival: at(start, 500),
            value: 2.0,
        });
        let out = p.flush(true);
        assert!((out[1].time - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stale_arrivals_are_dropped() {
        let start = Instant::now() + Duration::from_secs(2);
        let mut p = ConditioningPipeline::with_start(SharedConfig::default(), start);
        let stale = p.push(RawSample {
            arrival: start - Duration::from_millis(500),
            value: 1.0,
        });
        assert!(stale.is_none());
        assert_eq!(p.stale_dropped(), 1);

        // within tolerance: floored at the session start
        p.push(RawSample {
            arrival: start - Duration::from_millis(50),
            value: 2.0,
        });
        let out = p.flush(true);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time, 0.0);
        assert_eq!(p.stale_dropped(), 1);
        assert_eq!(p.stats().committed, 1);
        assert_eq!(p.stats().received, 2);
    }

    #[test]
    fn smoothing_enabled_mid_stream_starts_from_corrected_value() {
        let shared = SharedConfig::default();
        let start = Instant::now();
        let mut p = ConditioningPipeline::with_start(shared.clone(), start);

        let input = [100.0, 102.0, 101.0, 8_388_502.0, 103.0, 104.0, 102.0];
        let mut out = Vec::new();
        for (k, &value) in input.iter().enumerate() {
            out.extend(p.push(RawSample {
                arrival: at(start, 100 * k as u64),
                value,
            }));
        }
        assert_eq!(values(&out), vec![100.0, 102.0, 101.0]);

        // the next commit is the corrected spike
        shared.update(|cfg| cfg.enable_smoothing = true);
        let smoothed = p
            .push(RawSample {
                arrival: at(start, 700),
                value: 101.0,
            })
            .unwrap();
        assert!((smoothed.value - 102.5).abs() < 1e-9);
        assert_eq!(p.outlier_count(), 1);
    }

    #[test]
    fn commit_order_survives_stream_reset() {
        let (mut p, start) = pipeline(AcquisitionConfig::default());
        let arrivals = [0u64, 100, 200, 3000, 3100, 3200, 1000, 1100, 3300, 50, 60, 3400];
        let mut out = Vec::new();
        for (k, ms) in arrivals.iter().enumerate() {
            out.extend(p.push(RawSample {
                arrival: at(start, *ms),
                value: 10.0 + k as f64,
            }));
        }
        out.extend(p.flush(true));
        assert_eq!(out.len(), arrivals.len());
        assert!(out.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn trailing_jump_corrects_two_samples() {
        let (mut p, start) = pipeline(AcquisitionConfig::default());
        let out = run_all(&mut p, start, &[100.0, 110.0, 120.0, 2000.0, 2001.0]);
        let step = (2001.0 - 110.0) / 3.0;
        assert_eq!(out.len(), 5);
        assert!((out[2].value - (110.0 + step)).abs() < 1e-9);
        assert!((out[3].value - (110.0 + 2.0 * step)).abs() < 1e-9);
        assert_eq!(p.outlier_count(), 2);
    }

    #[test]
    fn committed_history_supplies_older_context() {
        let (mut p, start) = pipeline(AcquisitionConfig::default());
        let ramp: Vec<f64> = (0..10).map(f64::from).collect();
        let first = run_all(&mut p, start, &ramp);
        assert_eq!(first.len(), 10);

        let mut out = Vec::new();
        for (k, value) in [10.0, 5000.0, 12.0, 13.0, 14.0].into_iter().enumerate() {
            out.extend(p.push(RawSample {
                arrival: at(start, 1000 + 100 * k as u64),
                value,
            }));
        }
        out.extend(p.flush(true));
        assert_eq!(values(&out), vec![10.0, 11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn disabled_filter_passes_spikes_through() {
        let config = AcquisitionConfig {
            enable_outlier_filter: false,
            ..AcquisitionConfig::default()
        };
        let (mut p, start) = pipeline(config);
        let input = [100.0, 102.0, 101.0, 8_388_502.0, 103.0, 104.0];
        let out = run_all(&mut p, start, &input);
        assert_eq!(values(&out), input.to_vec());
        assert_eq!(p.outlier_count(), 0);
    }

    #[test]
    fn smoothing_starts_from_latest_value_and_lags_steps() {
        let shared = SharedConfig::new(AcquisitionConfig {
            enable_outlier_filter: false,
            ..AcquisitionConfig::default()
        });
        let start = Instant::now();
        let mut p = ConditioningPipeline::with_start(shared.clone(), start);
        shared.update(|cfg| cfg.enable_smoothing = true);

        let input = [10.0, 10.0, 10.0, 10.0, 10.0, 20.0, 20.0, 20.0];
        let out = run_all(&mut p, start, &input);
        assert_eq!(out[0].value, 10.0);
        assert!((out[4].value - 10.0).abs() < 1e-9);
        assert!(out[5].value > 10.0 && out[5].value < 20.0);
        assert!(out[7].value > out[5].value);
    }

    #[test]
    fn reset_clears_state_and_counters() {
        let (mut p, start) = pipeline(AcquisitionConfig::default());
        run_all(&mut p, start, &[100.0, 102.0, 101.0, 8_388_502.0, 103.0, 104.0]);
        assert_eq!(p.outlier_count(), 1);

        let restart = at(start, 10_000);
        p.reset_at(restart);
        assert_eq!(p.outlier_count(), 0);
        assert_eq!(p.pending_len(), 0);
        assert_eq!(p.session_start(), restart);

        p.push(RawSample {
            arrival: at(restart, 20),
            value: 1.0,
        });
        let out = p.flush(true);
        assert!((out[0].time - 0.02).abs() < 1e-9);
    }
}
