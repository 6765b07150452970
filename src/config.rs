use crate::error::{ViewerError, ViewerResult};
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

pub const MAX_CHANNELS: usize = 32;
pub const STANDARD_SAMPLE_RATES: [u32; 6] = [125, 250, 500, 1000, 2000, 4000];

pub const DEFAULT_MAINS_HZ: f64 = 50.0;
pub const NOTCH_Q: f64 = 30.0;
pub const BANDPASS_LOW_HZ: f64 = 0.5;
pub const BANDPASS_HIGH_HZ: f64 = 40.0;
pub const BANDPASS_ORDER: usize = 4;

/// Segments with this many rows or fewer are always filtered on the scalar path.
pub const ACCELERATED_FILTER_MIN_ROWS: usize = 10_000;

/// Which channel layout the recording was captured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadLayout {
    Three,    // 3: I, II, III
    Five,     // 5: I, II, III, aVR, aVL
    Twelve,   // 12: standard 12-lead
    Custom(usize),
}

impl LeadLayout {
    pub fn from_channel_count(channels: usize) -> ViewerResult<Self> {
        match channels {
            0 => Err(ViewerError::InvalidConfig(
                "channel count must be at least 1".to_string(),
            )),
            3 => Ok(LeadLayout::Three),
            5 => Ok(LeadLayout::Five),
            12 => Ok(LeadLayout::Twelve),
            n if n <= MAX_CHANNELS => Ok(LeadLayout::Custom(n)),
            n => Err(ViewerError::InvalidConfig(format!(
                "channel count must be between 1 and {}, got {}",
                MAX_CHANNELS, n
            ))),
        }
    }

    pub fn channel_count(&self) -> usize {
        match self {
            LeadLayout::Three => 3,
            LeadLayout::Five => 5,
            LeadLayout::Twelve => 12,
            LeadLayout::Custom(n) => *n,
        }
    }

    /// Display names in buffer column order.
    pub fn channel_names(&self) -> Vec<String> {
        const TWELVE: [&str; 12] = [
            "I", "II", "III", "aVR", "aVL", "aVF", "V1", "V2", "V3", "V4", "V5", "V6",
        ];
        match self {
            LeadLayout::Three => TWELVE[..3].iter().map(|s| s.to_string()).collect(),
            LeadLayout::Five => TWELVE[..5].iter().map(|s| s.to_string()).collect(),
            LeadLayout::Twelve => TWELVE.iter().map(|s| s.to_string()).collect(),
            LeadLayout::Custom(n) => (1..=*n).map(|i| format!("Ch{}", i)).collect(),
        }
    }
}

impl FromStr for LeadLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let channels: usize = s
            .trim()
            .parse()
            .map_err(|_| format!("Invalid channel count: {}", s))?;
        LeadLayout::from_channel_count(channels).map_err(|e| e.to_string())
    }
}

pub fn validate_sample_rate(rate: u32) -> ViewerResult<u32> {
    if rate == 0 {
        return Err(ViewerError::InvalidConfig(
            "sample rate must be a positive integer".to_string(),
        ));
    }
    if !STANDARD_SAMPLE_RATES.contains(&rate) {
        log::debug!("Using non-standard sample rate {} Hz", rate);
    }
    Ok(rate)
}

/// Parses a minute/second entry typed into a range or position field.
pub fn parse_time_field(field: &str, value: &str) -> ViewerResult<f64> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| ViewerError::InvalidRequest(format!("{} is not a number: {:?}", field, value)))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(ViewerError::InvalidRequest(format!(
            "{} must be a non-negative number, got {}",
            field, value
        )));
    }
    Ok(parsed)
}

/// Settings the pipeline reads on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub mains_hz: f64,
    pub notch_q: f64,
    pub use_acceleration: bool,
    pub accelerated_filter_min_rows: usize,
    pub window_seconds: f64,
    pub filter_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mains_hz: DEFAULT_MAINS_HZ,
            notch_q: NOTCH_Q,
            use_acceleration: true,
            accelerated_filter_min_rows: ACCELERATED_FILTER_MIN_ROWS,
            window_seconds: 10.0,
            filter_enabled: true,
        }
    }
}

/// Inspect raw multi-channel ECG recordings
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Raw recording (16-bit little-endian, channel-interleaved)
    #[arg(help = "Raw recording file (16-bit little-endian, channel-interleaved)")]
    pub input_path: PathBuf,

    /// Number of channels (1 to 32; 3, 5 and 12 get standard lead names)
    #[arg(long, default_value = "12")]
    pub channels: LeadLayout,

    /// Sample rate in Hz
    #[arg(long, default_value = "1000")]
    pub sample_rate: u32,

    /// Start of the window to load, in minutes
    #[arg(long, default_value = "0")]
    pub start_min: String,

    /// End of the window to load, in minutes (defaults to end of file)
    #[arg(long)]
    pub end_min: Option<String>,

    /// Display window length in seconds
    #[arg(long, default_value = "10")]
    pub window_seconds: f64,

    /// Position of the displayed window in seconds from the loaded start
    #[arg(long)]
    pub position: Option<String>,

    /// Disable band-pass and notch filtering of the displayed window
    #[arg(long)]
    pub no_filter: bool,

    /// Mains frequency rejected by the notch filter
    #[arg(long, env = "ECG_MAINS_HZ", default_value = "50")]
    pub mains_hz: f64,

    /// Force the scalar backend
    #[arg(long)]
    pub cpu_only: bool,

    /// Worker threads for the accelerated backend (defaults to available cores)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Fixed display gain; overrides --auto-gain
    #[arg(long)]
    pub gain: Option<f32>,

    /// Pick a display gain from the amplitude of the loaded data
    #[arg(long)]
    pub auto_gain: bool,

    /// CSV output file for the loaded (gain-scaled) buffer
    #[arg(long)]
    pub csv_output: Option<PathBuf>,

    /// Maximum number of rows written to the CSV export
    #[arg(long)]
    pub csv_max_rows: Option<usize>,

    /// Report the beat rate for every window of the loaded buffer
    #[arg(long)]
    pub scan: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl Args {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            mains_hz: self.mains_hz,
            use_acceleration: !self.cpu_only,
            window_seconds: self.window_seconds,
            filter_enabled: !self.no_filter,
            ..PipelineConfig::default()
        }
    }
}
