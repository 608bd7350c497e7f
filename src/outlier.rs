//! Five-point spike detector.
//!
//! The sample under test is `p3`, with two older (`p1`, `p2`) and two newer
//! (`p4`, `p5`) neighbours. Successive differences `a = p2-p1`, `b = p3-p2`,
//! `c = p4-p3`, `d = p5-p4` are compared pairwise: a genuine signal changes slope
//! gradually, a transmission glitch makes one difference dwarf its neighbour.

use crate::config::OutlierThresholds;

const EPS: f64 = 1e-9;

/// Outcome of classifying the middle sample of a five-point window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Clean,
    /// `p3` alone is corrupt.
    Spike { replacement: f64 },
    /// `p3` and `p4` are both corrupt.
    DoubleSpike { current: f64, next: f64 },
}

/// Classify `window[2]` given `[p1, p2, p3, p4, p5]`.
pub fn classify(window: [f64; 5], thresholds: &OutlierThresholds) -> Verdict {
    let [p1, p2, p3, p4, p5] = window;

    let a = p2 - p1;
    let b = p3 - p2;
    let c = p4 - p3;
    let d = p5 - p4;

    let jump_before = slope_ratio(b, a) > thresholds.slope_ratio;
    let jump_after = slope_ratio(c, d) > thresholds.slope_ratio;

    let median = median4([p1, p2, p4, p5]);

    if jump_before && jump_after {
        return Verdict::Spike {
            replacement: neighbour_mean(p1, p2, p4, p5, median, thresholds),
        };
    }

    if jump_before {
        let ratio_to_median = p3.abs() / median.abs().max(EPS);
        if p3.abs() > thresholds.magnitude_ceiling || ratio_to_median > thresholds.median_ratio {
            return Verdict::Spike {
                replacement: neighbour_mean(p1, p2, p4, p5, median, thresholds),
            };
        }
    }

    if jump_after {
        let step = (p5 - p2) / 3.0;
        let band = (median.abs() * thresholds.band_fraction).max(thresholds.clamp_floor);
        let low = median - band;
        let high = median + band;

        let mut current = (p2 + step).clamp(low, high);
        let mut next = (p2 + 2.0 * step).clamp(low, high);

        if (current - next).abs() < EPS {
            let jitter = band * thresholds.jitter_fraction;
            // keep the interpolation direction
            if p5 >= p2 {
                current = median - jitter;
                next = median + jitter;
            } else {
                current = median + jitter;
                next = median - jitter;
            }
        }
        return Verdict::DoubleSpike { current, next };
    }

    Verdict::Clean
}

/// `|x / y|`, with infinity for a non-zero `x` over a vanishing `y` and 1 when both vanish.
fn slope_ratio(x: f64, y: f64) -> f64 {
    if y.abs() < EPS {
        if x.abs() < EPS {
            1.0
        } else {
            f64::INFINITY
        }
    } else {
        (x / y).abs()
    }
}

fn median4(mut values: [f64; 4]) -> f64 {
    values.sort_by(f64::total_cmp);
    (values[1] + values[2]) / 2.0
}

/// Mean of the four neighbours, pulled back to their median when it strays.
fn neighbour_mean(
    p1: f64,
    p2: f64,
    p4: f64,
    p5: f64,
    median: f64,
    thresholds: &OutlierThresholds,
) -> f64 {
    let mean = (p1 + p2 + p4 + p5) / 4.0;
    let limit = (thresholds.clamp_median_multiple * median.abs()).max(thresholds.clamp_floor);
    if (mean - median).abs() > limit {
        median
    } else {
        mean
    }
}
