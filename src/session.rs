use crate::backend::{Acceleration, BackendKind, Dispatched, Dispatcher};
use crate::calibration::{suggest_gain, GainSuggestion};
use crate::config::{parse_time_field, LeadLayout, PipelineConfig};
use crate::data_loading::{HeaderDecision, Recording, WindowRequest};
use crate::error::{BackendError, FilterError, ViewerError, ViewerResult};
use crate::filters::FilterSpec;
use crate::heart_analysis::segment_beat_rate;
use crate::preprocessing::apply_gain;
use log::{debug, info, warn};
use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// The loaded segment: conditioned samples before and after gain.
///
/// Never mutated once built. Reloading or changing the gain produces a new pair, so a
/// reader holding an `Arc<BufferPair>` always sees a complete buffer.
#[derive(Debug, Clone)]
pub struct BufferPair {
    raw: Arc<Array2<f32>>,
    working: Array2<f32>,
    gain: f32,
    sample_rate: u32,
    loaded_start: f64,
    loaded_end: f64,
    total_duration: f64,
}

impl BufferPair {
    fn new(
        raw: Array2<f32>,
        sample_rate: u32,
        loaded_start: f64,
        loaded_end: f64,
        total_duration: f64,
    ) -> Self {
        Self {
            working: raw.clone(),
            raw: Arc::new(raw),
            gain: 1.0,
            sample_rate,
            loaded_start,
            loaded_end,
            total_duration,
        }
    }

    /// A new pair scaled from the unscaled samples.
    fn with_gain(&self, gain: f32) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
            working: apply_gain(&self.raw, gain),
            gain,
            ..*self
        }
    }

    /// Conditioned samples without gain.
    pub fn raw(&self) -> &Array2<f32> {
        &self.raw
    }

    /// Conditioned samples scaled by the current gain.
    pub fn working(&self) -> &Array2<f32> {
        &self.working
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn rows(&self) -> usize {
        self.working.nrows()
    }

    pub fn channels(&self) -> usize {
        self.working.ncols()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Absolute start of the segment within the recording, in seconds.
    pub fn loaded_start(&self) -> f64 {
        self.loaded_start
    }

    pub fn loaded_end(&self) -> f64 {
        self.loaded_end
    }

    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    /// Rows `[start, start + len)` of the working buffer, clipped to its end.
    pub fn window(&self, start: usize, len: usize) -> ArrayView2<f32> {
        let start = start.min(self.rows());
        let end = start.saturating_add(len).min(self.rows());
        self.working.slice(s![start..end, ..])
    }

    /// Every row with its time in seconds from the start of the segment.
    pub fn export_rows(&self) -> impl Iterator<Item = (f64, ArrayView1<f32>)> + '_ {
        let rate = self.sample_rate as f64;
        self.working
            .axis_iter(Axis(0))
            .enumerate()
            .map(move |(i, row)| (i as f64 / rate, row))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub file: String,
    pub header: HeaderDecision,
    pub channels: usize,
    pub sample_rate: u32,
    pub total_duration: f64,
    pub loaded_start: f64,
    pub loaded_end: f64,
    pub rows: usize,
    pub backend: BackendKind,
    pub fallback: Option<String>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone)]
pub enum LoadStatus {
    Loaded(LoadReport),
    /// The request fell outside the recording; the previous buffers are kept
    EmptyWindow { total_duration: f64 },
}

/// What the renderer needs for the current window.
#[derive(Debug, Clone)]
pub struct RenderedWindow {
    pub start_sample: usize,
    pub data: Array2<f32>,
    pub channel_names: Vec<String>,
    pub filtered: bool,
    pub backend: BackendKind,
    /// Fallbacks and degradations that happened while producing `data`
    pub notes: Vec<String>,
    pub beat_rate: Option<u32>,
    /// Seconds from the start of the loaded segment
    pub position_seconds: f64,
    /// Seconds from the start of the recording
    pub absolute_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowRate {
    pub absolute_seconds: f64,
    pub filtered: bool,
    pub beat_rate: Option<u32>,
}

struct Analyzed {
    data: Array2<f32>,
    filtered: bool,
    backend: BackendKind,
    notes: Vec<String>,
    beat_rate: Option<u32>,
}

/// Returns the cached filter bank when it matches the current rate and mains setting,
/// otherwise designs a new one.
fn cached_filter_spec<'a>(
    cache: &'a mut Option<FilterSpec>,
    sample_rate: u32,
    config: &PipelineConfig,
) -> Result<&'a FilterSpec, FilterError> {
    let fresh = cache.as_ref().map_or(false, |spec| {
        spec.sample_rate() == sample_rate && spec.mains_hz() == config.mains_hz
    });
    if !fresh {
        *cache = None;
        let spec = FilterSpec::design(sample_rate, config.mains_hz, config.notch_q)?;
        return Ok(cache.insert(spec));
    }
    cache
        .as_ref()
        .ok_or_else(|| FilterError::InvalidDesign("filter cache is empty".to_string()))
}

/// One opened recording and the segment currently loaded from it.
pub struct Session {
    recording: Recording,
    layout: LeadLayout,
    config: PipelineConfig,
    dispatcher: Dispatcher,
    buffers: Option<Arc<BufferPair>>,
    filter_spec: Option<FilterSpec>,
    last_request: Option<WindowRequest>,
    position: usize,
}

impl Session {
    pub fn new(
        recording: Recording,
        acceleration: &Acceleration,
        config: PipelineConfig,
    ) -> ViewerResult<Self> {
        let dispatcher = Dispatcher::new(acceleration, &config);
        Self::with_dispatcher(recording, dispatcher, config)
    }

    pub fn with_dispatcher(
        recording: Recording,
        dispatcher: Dispatcher,
        config: PipelineConfig,
    ) -> ViewerResult<Self> {
        if !config.window_seconds.is_finite() || config.window_seconds <= 0.0 {
            return Err(ViewerError::InvalidConfig(format!(
                "window length must be positive, got {}",
                config.window_seconds
            )));
        }
        let layout = LeadLayout::from_channel_count(recording.channels())?;
        Ok(Self {
            recording,
            layout,
            config,
            dispatcher,
            buffers: None,
            filter_spec: None,
            last_request: None,
            position: 0,
        })
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.layout.channel_names()
    }

    /// The installed buffer pair, if any.
    pub fn snapshot(&self) -> Option<Arc<BufferPair>> {
        self.buffers.clone()
    }

    fn buffers(&self) -> ViewerResult<Arc<BufferPair>> {
        self.snapshot().ok_or(ViewerError::NoData)
    }

    pub fn active_backend(&self) -> BackendKind {
        self.dispatcher.active_backend()
    }

    pub fn set_acceleration_enabled(&mut self, enabled: bool) {
        self.dispatcher.set_enabled(enabled);
        self.config.use_acceleration = enabled;
        info!(
            "Acceleration {}",
            if enabled && self.dispatcher.accelerated_available() {
                "active"
            } else {
                "inactive"
            }
        );
    }

    pub fn set_filter_enabled(&mut self, enabled: bool) {
        self.config.filter_enabled = enabled;
    }

    pub fn set_mains_hz(&mut self, mains_hz: f64) -> ViewerResult<()> {
        if !mains_hz.is_finite() || mains_hz <= 0.0 {
            return Err(ViewerError::InvalidRequest(format!(
                "mains frequency must be positive, got {}",
                mains_hz
            )));
        }
        self.config.mains_hz = mains_hz;
        Ok(())
    }

    pub fn set_window_seconds(&mut self, seconds: f64) -> ViewerResult<()> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(ViewerError::InvalidRequest(format!(
                "window length must be positive, got {}",
                seconds
            )));
        }
        self.config.window_seconds = seconds;
        Ok(())
    }

    /// Declares a new channel count or sample rate for the same file.
    /// Drops the loaded buffers and the filter coefficients.
    pub fn reconfigure(&mut self, channels: usize, sample_rate: u32) -> ViewerResult<()> {
        let recording = self.recording.reconfigure(channels, sample_rate)?;
        self.layout = LeadLayout::from_channel_count(channels)?;
        self.recording = recording;
        self.buffers = None;
        self.filter_spec = None;
        self.position = 0;
        info!(
            "Reconfigured {}: {} channels at {} Hz",
            self.recording.name(),
            channels,
            sample_rate
        );
        Ok(())
    }

    /// Switches to another file with the same channel count and sample rate.
    /// Nothing changes if the file cannot be opened.
    pub fn open_file(&mut self, path: &Path) -> ViewerResult<()> {
        let recording =
            Recording::open(path, self.recording.channels(), self.recording.sample_rate())?;
        self.recording = recording;
        self.buffers = None;
        self.position = 0;
        Ok(())
    }

    /// Loads and conditions a time range. On error the previous buffers stay installed.
    pub fn load(&mut self, request: WindowRequest) -> ViewerResult<LoadStatus> {
        let started = Instant::now();
        let window = self.recording.load_window(&request)?;

        if window.is_empty() {
            warn!(
                "Requested range {:?} holds no samples ({:.1} s recorded)",
                request,
                window.total_duration()
            );
            return Ok(LoadStatus::EmptyWindow {
                total_duration: window.total_duration(),
            });
        }

        let conditioned = self.dispatcher.condition(window.samples.view())?;
        let pair = BufferPair::new(
            conditioned.value,
            self.recording.sample_rate(),
            window.loaded_start(),
            window.loaded_end(),
            window.total_duration(),
        );
        let rows = pair.rows();
        self.buffers = Some(Arc::new(pair));
        self.last_request = Some(request);
        self.position = 0;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            "Loaded {} rows ({:.1}-{:.1} s of {:.1} s) from {} in {:.1} ms",
            rows,
            window.loaded_start(),
            window.loaded_end(),
            window.total_duration(),
            self.recording.name(),
            elapsed_ms
        );

        Ok(LoadStatus::Loaded(LoadReport {
            file: self.recording.name().to_string(),
            header: self.recording.header().clone(),
            channels: self.recording.channels(),
            sample_rate: self.recording.sample_rate(),
            total_duration: window.total_duration(),
            loaded_start: window.loaded_start(),
            loaded_end: window.loaded_end(),
            rows,
            backend: conditioned.backend,
            fallback: conditioned.fallback,
            elapsed_ms,
        }))
    }

    /// Loads the last successfully loaded range again, e.g. after a reconfigure.
    pub fn reload(&mut self) -> ViewerResult<LoadStatus> {
        let request = self.last_request.ok_or(ViewerError::NoData)?;
        self.load(request)
    }

    /// Loads a range typed as minutes; an empty or missing end means end of file.
    pub fn load_minutes(&mut self, start: &str, end: Option<&str>) -> ViewerResult<LoadStatus> {
        let start = parse_time_field("start", start)?;
        let end = match end.map(str::trim).filter(|s| !s.is_empty()) {
            Some(end) => Some(parse_time_field("end", end)?),
            None => None,
        };
        let request = WindowRequest::new(start, end)?;
        self.load(request)
    }

    /// Rescales the working buffer from the unscaled samples.
    pub fn apply_gain(&mut self, gain: f32) -> ViewerResult<()> {
        if !gain.is_finite() || gain <= 0.0 {
            return Err(ViewerError::InvalidRequest(format!(
                "gain must be a positive number, got {}",
                gain
            )));
        }
        let buffers = self.buffers()?;
        self.buffers = Some(Arc::new(buffers.with_gain(gain)));
        debug!("Applied gain {}x", gain);
        Ok(())
    }

    /// Picks a gain from the unscaled samples and applies it.
    pub fn auto_gain(&mut self) -> ViewerResult<GainSuggestion> {
        let buffers = self.buffers()?;
        let suggestion = suggest_gain(buffers.raw().view());
        self.apply_gain(suggestion.gain)?;
        info!("Auto gain selected {}x", suggestion.gain);
        Ok(suggestion)
    }

    /// Rows shown per window at the current sample rate.
    pub fn window_rows(&self) -> usize {
        ((self.config.window_seconds * self.recording.sample_rate() as f64) as usize).max(1)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn position_seconds(&self) -> f64 {
        self.position as f64 / self.recording.sample_rate() as f64
    }

    pub fn next_window(&mut self) -> ViewerResult<usize> {
        let rows = self.buffers()?.rows();
        let window = self.window_rows();
        self.position = (self.position + window).min(rows.saturating_sub(window));
        Ok(self.position)
    }

    pub fn prev_window(&mut self) -> ViewerResult<usize> {
        self.buffers()?;
        self.position = self.position.saturating_sub(self.window_rows());
        Ok(self.position)
    }

    /// Moves to `seconds` from the start of the loaded segment.
    pub fn jump_to(&mut self, seconds: f64) -> ViewerResult<usize> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ViewerError::InvalidRequest(format!(
                "position must be a non-negative number of seconds, got {}",
                seconds
            )));
        }
        let rows = self.buffers()?.rows();
        let target = (seconds * self.recording.sample_rate() as f64) as usize;
        self.position = target.min(rows.saturating_sub(1));
        Ok(self.position)
    }

    pub fn jump_to_str(&mut self, seconds: &str) -> ViewerResult<usize> {
        let seconds = parse_time_field("position", seconds)?;
        self.jump_to(seconds)
    }

    /// Runs the filter bank on a segment through the dispatcher.
    pub fn filter_segment(
        &mut self,
        segment: ArrayView2<f32>,
    ) -> Result<Dispatched<Array2<f32>>, BackendError> {
        let spec = cached_filter_spec(
            &mut self.filter_spec,
            self.recording.sample_rate(),
            &self.config,
        )?;
        self.dispatcher.filter(segment, spec)
    }

    fn analyze(&mut self, segment: ArrayView2<f32>) -> Analyzed {
        let sample_rate = self.recording.sample_rate();
        let mut notes = Vec::new();

        let (data, filtered, backend) = if self.config.filter_enabled {
            match self.filter_segment(segment) {
                Ok(dispatched) => {
                    notes.extend(dispatched.fallback);
                    (dispatched.value, true, dispatched.backend)
                }
                Err(e) => {
                    warn!("Filtering failed, showing unfiltered data: {}", e);
                    notes.push(format!("unfiltered: {}", e));
                    (segment.to_owned(), false, BackendKind::Scalar)
                }
            }
        } else {
            (segment.to_owned(), false, BackendKind::Scalar)
        };

        let beat_rate = segment_beat_rate(data.view(), sample_rate);
        Analyzed {
            data,
            filtered,
            backend,
            notes,
            beat_rate,
        }
    }

    /// Filters the current window and estimates its beat rate.
    pub fn render_window(&mut self) -> ViewerResult<RenderedWindow> {
        let buffers = self.buffers()?;
        let start = self.position;
        let segment = buffers.window(start, self.window_rows());
        let analyzed = self.analyze(segment);

        let position_seconds = self.position_seconds();
        Ok(RenderedWindow {
            start_sample: start,
            data: analyzed.data,
            channel_names: self.channel_names(),
            filtered: analyzed.filtered,
            backend: analyzed.backend,
            notes: analyzed.notes,
            beat_rate: analyzed.beat_rate,
            position_seconds,
            absolute_seconds: buffers.loaded_start() + position_seconds,
        })
    }

    /// Beat rate of every consecutive window of the loaded segment.
    pub fn scan_rates(&mut self) -> ViewerResult<Vec<WindowRate>> {
        let buffers = self.buffers()?;
        let window = self.window_rows();
        let rate = self.recording.sample_rate() as f64;

        let mut rates = Vec::new();
        for start in (0..buffers.rows()).step_by(window) {
            let analyzed = self.analyze(buffers.window(start, window));
            rates.push(WindowRate {
                absolute_seconds: buffers.loaded_start() + start as f64 / rate,
                filtered: analyzed.filtered,
                beat_rate: analyzed.beat_rate,
            });
        }
        Ok(rates)
    }
}
