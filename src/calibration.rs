use crate::preprocessing::median;
use log::debug;
use ndarray::{ArrayView2, Axis, Slice};

/// Rows inspected when estimating a gain.
pub const CALIBRATION_ROWS: usize = 10_000;
/// Desired 5th-95th percentile spread after scaling.
pub const TARGET_AMPLITUDE: f32 = 1.5;
/// Gains a calibrated display may use.
pub const GAIN_LADDER: [f32; 6] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Linearly interpolated percentile of sorted data, `p` in 0..=100.
fn percentile(sorted: &[f32], p: f32) -> f32 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p / 100.0 * (n - 1) as f32;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let fraction = rank - lower as f32;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}

/// 5th to 95th percentile spread of every channel.
pub fn channel_spreads(data: ArrayView2<f32>) -> Vec<f32> {
    data.axis_iter(Axis(1))
        .map(|column| {
            let mut sorted = column.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            percentile(&sorted, 95.0) - percentile(&sorted, 5.0)
        })
        .collect()
}

/// Nearest ladder rung by absolute difference; the first rung wins a tie.
pub fn snap_to_ladder(raw_gain: f32) -> f32 {
    GAIN_LADDER
        .iter()
        .copied()
        .fold(GAIN_LADDER[0], |best, rung| {
            if (rung - raw_gain).abs() < (best - raw_gain).abs() {
                rung
            } else {
                best
            }
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct GainSuggestion {
    pub median_spread: Option<f32>,
    pub raw_gain: f32,
    pub gain: f32,
    /// Channels with a nonzero spread
    pub live_channels: usize,
}

/// Suggests a display gain from the first rows of `data`.
pub fn suggest_gain(data: ArrayView2<f32>) -> GainSuggestion {
    let rows = data.nrows().min(CALIBRATION_ROWS);
    let sample = data.slice_axis(Axis(0), Slice::from(0..rows));

    let mut spreads: Vec<f32> = channel_spreads(sample)
        .into_iter()
        .filter(|&spread| spread > 0.0)
        .collect();
    let live_channels = spreads.len();

    let (median_spread, raw_gain) = if spreads.is_empty() {
        (None, 1.0)
    } else {
        let spread = median(&mut spreads);
        (Some(spread), TARGET_AMPLITUDE / spread)
    };
    let gain = snap_to_ladder(raw_gain);

    debug!(
        "auto gain: {} live channels, median spread {:?}, raw gain {:.3} -> {}",
        live_channels, median_spread, raw_gain, gain
    );

    GainSuggestion {
        median_spread,
        raw_gain,
        gain,
        live_channels,
    }
}
