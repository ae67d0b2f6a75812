// Per-frame spectrum statistics
//
// Stateless reduction of one frame into peak, average and -3dB bandwidth.
// Producer-supplied summary fields win over recomputation.

use crate::streaming::source::Frame;
use serde::{Deserialize, Serialize};

/// Drop from the peak that still counts as "in band"
pub const BANDWIDTH_DROP_DB: f64 = 3.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Statistics {
    pub peak_domain: f64,
    pub peak_value: f64,
    pub average_value: f64,
    pub bandwidth: f64,
}

/// Reduce a frame to its statistics
///
/// Frames with no finite value report zero peak and average.
pub fn reduce(frame: &Frame) -> Statistics {
    let (peak_domain, peak_value) = match (frame.peak_domain, frame.peak_value) {
        (Some(domain), Some(value)) => (domain, value),
        _ => find_peak(&frame.values)
            .map(|index| (frame.domain.get(index).copied().unwrap_or(0.0), frame.values[index]))
            .unwrap_or((0.0, 0.0)),
    };

    let average_value = frame
        .average_value
        .unwrap_or_else(|| finite_mean(&frame.values).unwrap_or(0.0));

    let bandwidth = bandwidth_3db(&frame.domain, &frame.values, peak_value);

    Statistics {
        peak_domain,
        peak_value,
        average_value,
        bandwidth,
    }
}

/// Index of the largest finite value; ties resolve to the first occurrence
pub fn find_peak(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        if !v.is_finite() {
            continue;
        }
        match best {
            Some((_, current)) if v <= current => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Arithmetic mean over finite values only
pub fn finite_mean(values: &[f64]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));

    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Span between the outermost samples within 3dB of `peak_value`
///
/// The left edge is the first qualifying sample scanning low to high, the
/// right edge the first qualifying sample scanning high to low. The region
/// between them need not be contiguous above threshold.
pub fn bandwidth_3db(domain: &[f64], values: &[f64], peak_value: f64) -> f64 {
    let n = domain.len().min(values.len());
    if n == 0 || !peak_value.is_finite() {
        return 0.0;
    }

    let threshold = peak_value - BANDWIDTH_DROP_DB;
    let qualifies = |i: &usize| domain[*i].is_finite() && values[*i] >= threshold;

    let Some(left) = (0..n).find(qualifies) else {
        return 0.0;
    };
    let Some(right) = (0..n).rev().find(qualifies) else {
        return 0.0;
    };

    let span = domain[right] - domain[left];
    if span > 0.0 {
        span
    } else {
        0.0
    }
}
