use crate::config::{BANDPASS_HIGH_HZ, BANDPASS_LOW_HZ, BANDPASS_ORDER};
use crate::error::FilterError;
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use sci_rs::signal::filter::design::{
    butter_dyn, DigitalFilter, FilterBandType, FilterOutputType, Sos, SosFormatFilter,
};
use sci_rs::signal::filter::sosfiltfilt_dyn;
use std::f64::consts::PI;

/// Design a second-order IIR notch filter.
///
/// - `freq`: frequency to remove, in the same units as `fs`
/// - `q`: quality factor, `freq / bandwidth` at -3 dB
/// - `fs`: sampling frequency
///
/// Returns `(b, a)` with `a[0] == 1`.
fn design_notch_filter(freq: f64, q: f64, fs: f64) -> Result<([f64; 3], [f64; 3]), FilterError> {
    if fs <= 0.0 || q <= 0.0 {
        return Err(FilterError::InvalidDesign(format!(
            "notch needs positive fs and Q (fs = {}, Q = {})",
            fs, q
        )));
    }

    // Normalize so that 1.0 is Nyquist
    let w0 = 2.0 * freq / fs;
    if !(w0 > 0.0 && w0 < 1.0) {
        return Err(FilterError::InvalidDesign(format!(
            "notch frequency {} Hz must lie between 0 and Nyquist ({} Hz)",
            freq,
            fs / 2.0
        )));
    }

    let bw = (w0 / q) * PI;
    let w0 = w0 * PI;

    let beta = (bw / 2.0).tan();
    let gain = 1.0 / (1.0 + beta);

    let b = [gain, -2.0 * gain * w0.cos(), gain];
    let a = [1.0, -2.0 * gain * w0.cos(), 2.0 * gain - 1.0];

    Ok((b, a))
}

/// Samples of odd-extension padding `sosfiltfilt` adds on each side of a cascade.
fn padlen(sections: usize) -> usize {
    3 * (2 * sections + 1)
}

/// Band-pass plus notch coefficients for one sample rate.
///
/// Built fresh for each rate; coefficients designed for one rate must never filter data
/// recorded at another.
pub struct FilterSpec {
    sample_rate: u32,
    mains_hz: f64,
    bandpass: Vec<Sos<f64>>,
    notch: Vec<Sos<f64>>,
}

impl std::fmt::Debug for FilterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterSpec")
            .field("sample_rate", &self.sample_rate)
            .field("mains_hz", &self.mains_hz)
            .field("bandpass_sections", &self.bandpass.len())
            .field("notch_sections", &self.notch.len())
            .finish()
    }
}

impl FilterSpec {
    pub fn design(sample_rate: u32, mains_hz: f64, notch_q: f64) -> Result<Self, FilterError> {
        let fs = sample_rate as f64;
        let nyquist = fs / 2.0;
        if sample_rate == 0 || BANDPASS_HIGH_HZ >= nyquist {
            return Err(FilterError::InvalidDesign(format!(
                "band-pass corner {} Hz must be below Nyquist ({} Hz)",
                BANDPASS_HIGH_HZ, nyquist
            )));
        }

        let filter = butter_dyn(
            BANDPASS_ORDER,
            vec![BANDPASS_LOW_HZ, BANDPASS_HIGH_HZ],
            Some(FilterBandType::Bandpass),
            Some(false),
            Some(FilterOutputType::Sos),
            Some(fs),
        );
        let DigitalFilter::Sos(SosFormatFilter { sos: bandpass }) = filter else {
            return Err(FilterError::InvalidDesign(
                "band-pass design did not produce second-order sections".to_string(),
            ));
        };

        let (b, a) = design_notch_filter(mains_hz, notch_q, fs)?;
        let notch = vec![Sos::new(b, a)];

        debug!(
            "Designed filters for {} Hz: {} band-pass sections, notch at {} Hz (Q {})",
            sample_rate,
            bandpass.len(),
            mains_hz,
            notch_q
        );

        Ok(Self {
            sample_rate,
            mains_hz,
            bandpass,
            notch,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn mains_hz(&self) -> f64 {
        self.mains_hz
    }

    /// Segments must be strictly longer than this to be filtered.
    pub fn min_segment_len(&self) -> usize {
        padlen(self.bandpass.len()).max(padlen(self.notch.len()))
    }

    /// Zero-phase band-pass followed by zero-phase notch on one channel.
    pub fn filter_channel(&self, column: ArrayView1<f32>) -> Result<Vec<f32>, FilterError> {
        let min = self.min_segment_len();
        if column.len() <= min {
            return Err(FilterError::SegmentTooShort {
                len: column.len(),
                min,
            });
        }

        let input: Vec<f64> = column.iter().map(|&x| x as f64).collect();
        let band_limited = sosfiltfilt_dyn(input.iter(), &self.bandpass);
        let filtered = sosfiltfilt_dyn(band_limited.iter(), &self.notch);

        Ok(filtered.into_iter().map(|y| y as f32).collect())
    }
}

/// Filters every channel of `data` in turn.
pub fn filter_scalar(data: ArrayView2<f32>, spec: &FilterSpec) -> Result<Array2<f32>, FilterError> {
    let mut out = Array2::<f32>::zeros(data.raw_dim());
    for (column, mut out_column) in data.axis_iter(Axis(1)).zip(out.axis_iter_mut(Axis(1))) {
        let filtered = spec.filter_channel(column)?;
        for (o, y) in out_column.iter_mut().zip(filtered) {
            *o = y;
        }
    }
    Ok(out)
}
