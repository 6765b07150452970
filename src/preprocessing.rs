use log::trace;
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};

/// Native ADC units per millivolt (approximately).
pub const AMPLITUDE_SCALE: f32 = 200.0;

/// Median of a slice; the mean of the two middle values for even lengths.
/// Reorders `values`. Returns 0.0 for an empty slice.
pub fn median(values: &mut [f32]) -> f32 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }

    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = *upper;
    if n % 2 == 0 {
        let lower_max = lower
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        (lower_max + upper) / 2.0
    } else {
        upper
    }
}

/// Removes the median baseline of one channel and rescales it into `out`.
pub fn condition_channel(column: ArrayView1<i16>, mut out: ArrayViewMut1<f32>) {
    let mut values: Vec<f32> = column.iter().map(|&x| x as f32).collect();
    let baseline = median(&mut values);
    trace!("channel baseline {:.1}", baseline);

    for (o, &x) in out.iter_mut().zip(column.iter()) {
        *o = (x as f32 - baseline) / AMPLITUDE_SCALE;
    }
}

/// Scalar conditioning of every channel, one after another.
pub fn condition_scalar(samples: ArrayView2<i16>) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros(samples.raw_dim());
    for (column, out_column) in samples
        .axis_iter(Axis(1))
        .zip(out.axis_iter_mut(Axis(1)))
    {
        condition_channel(column, out_column);
    }
    out
}

/// Scales the unscaled conditioned signal. Always relative to `raw`, never cumulative.
pub fn apply_gain(raw: &Array2<f32>, gain: f32) -> Array2<f32> {
    raw.mapv(|x| x * gain)
}
