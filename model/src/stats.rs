//! Summary statistics over a numeric series.

use serde::{Deserialize, Serialize};

/// Summary of a series of samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Stats {
    /// The mean of the series.
    pub score: f64,
    /// Average change per sample between the first and last values.
    pub velocity: f64,
    /// `1 / (1 + stdev)`: 1 for a perfectly steady series, approaching 0 as it gets noisier.
    pub trust: f64,
}

/// Compute [`Stats`] for `series`, rounding each value to 3 decimal places.
///
/// An empty series yields all zeros.
pub fn calc_stats(series: &[f64]) -> Stats {
    if series.is_empty() {
        return Stats::default();
    }
    let len = series.len() as f64;
    let score = series.iter().sum::<f64>() / len;
    let velocity = (series[series.len() - 1] - series[0]) / (len - 1.0).max(1.0);
    let var = series.iter().map(|x| (x - score).powi(2)).sum::<f64>() / len;
    let trust = 1.0 / (1.0 + var.sqrt());
    Stats {
        score: round3(score),
        velocity: round3(velocity),
        trust: round3(trust),
    }
}

/// Round to 3 decimal places. Exact halves round to the nearest even digit.
fn round3(x: f64) -> f64 {
    (x * 1000.0).round_ties_even() / 1000.0
}
