use log::debug;
use ndarray::{ArrayView1, ArrayView2, Axis};

/// Peaks must exceed this multiple of the segment's standard deviation.
pub const PEAK_THRESHOLD_STD: f32 = 0.6;
/// Shortest accepted spacing between beats, in seconds.
pub const REFRACTORY_SECONDS: f32 = 0.4;

/// Lead II when the recording has one, otherwise the first channel.
pub fn reference_channel(channels: usize) -> usize {
    1.min(channels.saturating_sub(1))
}

/// Population standard deviation.
fn std_dev(data: ArrayView1<f32>) -> f32 {
    let n = data.len() as f32;
    if n == 0.0 {
        return 0.0;
    }
    let mean = data.sum() / n;
    let variance = data
        .iter()
        .map(|&x| {
            let diff = x - mean;
            diff * diff
        })
        .sum::<f32>()
        / n;
    variance.sqrt()
}

/// Indices of local maxima. A flat top counts once, at its middle sample;
/// the first and last samples are never peaks.
fn local_maxima(data: ArrayView1<f32>) -> Vec<usize> {
    let mut peaks = Vec::new();
    if data.len() < 3 {
        return peaks;
    }

    let i_max = data.len() - 1;
    let mut i = 1;
    while i < i_max {
        if data[i - 1] < data[i] {
            let mut i_ahead = i + 1;
            while i_ahead < i_max && data[i_ahead] == data[i] {
                i_ahead += 1;
            }
            if data[i_ahead] < data[i] {
                let left = i;
                let right = i_ahead - 1;
                peaks.push((left + right) / 2);
                i = i_ahead;
            }
        }
        i += 1;
    }
    peaks
}

/// Drops peaks closer than `distance` samples to a higher peak.
fn select_by_distance(peaks: &[usize], heights: &[f32], distance: usize) -> Vec<usize> {
    let mut keep = vec![true; peaks.len()];

    let mut by_height: Vec<usize> = (0..peaks.len()).collect();
    by_height.sort_by(|&a, &b| heights[a].total_cmp(&heights[b]));

    for &j in by_height.iter().rev() {
        if !keep[j] {
            continue;
        }

        let mut k = j;
        while k > 0 && peaks[j] - peaks[k - 1] < distance {
            keep[k - 1] = false;
            k -= 1;
        }

        let mut k = j + 1;
        while k < peaks.len() && peaks[k] - peaks[j] < distance {
            keep[k] = false;
            k += 1;
        }
    }

    peaks
        .iter()
        .zip(keep)
        .filter(|(_, kept)| *kept)
        .map(|(&peak, _)| peak)
        .collect()
}

/// Local maxima at least `height` tall and at least `distance` samples apart.
pub fn find_peaks(data: ArrayView1<f32>, height: f32, distance: usize) -> Vec<usize> {
    let candidates: Vec<usize> = local_maxima(data)
        .into_iter()
        .filter(|&i| data[i] >= height)
        .collect();
    let heights: Vec<f32> = candidates.iter().map(|&i| data[i]).collect();
    select_by_distance(&candidates, &heights, distance.max(1))
}

/// Estimates beats per minute from one channel. `None` when fewer than two beats are found.
pub fn beat_rate(signal: ArrayView1<f32>, sample_rate: u32) -> Option<u32> {
    if sample_rate == 0 {
        return None;
    }

    let threshold = std_dev(signal) * PEAK_THRESHOLD_STD;
    let min_distance = (REFRACTORY_SECONDS * sample_rate as f32) as usize;
    let peaks = find_peaks(signal, threshold, min_distance);

    debug!(
        "beat detection: threshold {:.3}, min distance {} samples, {} peaks",
        threshold,
        min_distance,
        peaks.len()
    );

    if peaks.len() < 2 {
        return None;
    }

    // intervals stay in whole samples; only the mean is converted to seconds
    let total_samples: usize = peaks.windows(2).map(|w| w[1] - w[0]).sum();
    let mean_interval = total_samples as f64 / (peaks.len() - 1) as f64 / sample_rate as f64;

    Some((60.0 / mean_interval) as u32)
}

/// Beat rate of the reference channel of a `rows x channels` segment.
pub fn segment_beat_rate(segment: ArrayView2<f32>, sample_rate: u32) -> Option<u32> {
    if segment.ncols() == 0 || segment.nrows() == 0 {
        return None;
    }
    let lead = reference_channel(segment.ncols());
    beat_rate(segment.index_axis(Axis(1), lead), sample_rate)
}
