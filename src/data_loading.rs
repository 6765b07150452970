use crate::config::validate_sample_rate;
use crate::error::{ViewerError, ViewerResult};
use log::{debug, info, trace};
use ndarray::Array2;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Header sizes tried in order when sniffing a recording.
pub const HEADER_CANDIDATES: [u64; 6] = [0, 64, 128, 256, 512, 1024];
pub const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CandidateCheck {
    pub header_bytes: u64,
    /// Number of i16 values left after the header, `None` if the header is longer than the file
    pub payload_values: Option<u64>,
    pub fits: bool,
}

/// Outcome of the header search, kept for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HeaderDecision {
    pub header_bytes: u64,
    /// False when no candidate fitted and the search fell back to a header of 0
    pub matched: bool,
    pub candidates: Vec<CandidateCheck>,
}

impl HeaderDecision {
    pub fn describe(&self) -> String {
        if self.matched {
            format!(
                "{} byte header (candidate {} of {})",
                self.header_bytes,
                self.candidates.len(),
                HEADER_CANDIDATES.len()
            )
        } else {
            "no candidate aligned with the channel count, assuming no header".to_string()
        }
    }
}

/// Finds the first candidate header size whose payload splits evenly into `channels` columns.
pub fn sniff_header(total_bytes: u64, channels: usize) -> HeaderDecision {
    let mut candidates = Vec::with_capacity(HEADER_CANDIDATES.len());

    for &header_bytes in HEADER_CANDIDATES.iter() {
        let payload_values = total_bytes
            .checked_sub(header_bytes)
            .map(|payload| payload / BYTES_PER_SAMPLE as u64);
        let fits = match payload_values {
            Some(values) => channels > 0 && values % channels as u64 == 0,
            None => false,
        };
        trace!(
            "header candidate {} -> payload values {:?}, fits: {}",
            header_bytes,
            payload_values,
            fits
        );
        candidates.push(CandidateCheck {
            header_bytes,
            payload_values,
            fits,
        });

        if fits {
            return HeaderDecision {
                header_bytes,
                matched: true,
                candidates,
            };
        }
    }

    HeaderDecision {
        header_bytes: 0,
        matched: false,
        candidates,
    }
}

/// A requested time range in minutes, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowRequest {
    pub start_minutes: f64,
    pub end_minutes: Option<f64>,
}

impl WindowRequest {
    pub fn new(start_minutes: f64, end_minutes: Option<f64>) -> ViewerResult<Self> {
        if !start_minutes.is_finite() || start_minutes < 0.0 {
            return Err(ViewerError::InvalidRequest(format!(
                "start must be a non-negative number of minutes, got {}",
                start_minutes
            )));
        }
        if let Some(end) = end_minutes {
            if !end.is_finite() {
                return Err(ViewerError::InvalidRequest(format!(
                    "end must be a finite number of minutes, got {}",
                    end
                )));
            }
            if end <= start_minutes {
                return Err(ViewerError::InvalidRequest(format!(
                    "end ({} min) must be after start ({} min)",
                    end, start_minutes
                )));
            }
        }
        Ok(Self {
            start_minutes,
            end_minutes,
        })
    }

    pub fn whole_file() -> Self {
        Self {
            start_minutes: 0.0,
            end_minutes: None,
        }
    }
}

/// Half-open sample index range, already clamped to the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleRange {
    pub start: usize,
    pub end: usize,
}

impl SampleRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Converts a request in minutes to sample indices. An end at or before the start
/// yields an empty range anchored at the start.
pub fn resolve_window(
    request: &WindowRequest,
    samples_per_channel: usize,
    sample_rate: u32,
) -> SampleRange {
    let to_sample = |minutes: f64| (minutes * 60.0 * sample_rate as f64).floor() as usize;

    let start = to_sample(request.start_minutes);
    let end = match request.end_minutes {
        Some(end) => to_sample(end).min(samples_per_channel),
        None => samples_per_channel,
    };

    if end <= start {
        SampleRange { start, end: start }
    } else {
        SampleRange { start, end }
    }
}

/// Decodes channel-interleaved little-endian i16 bytes into a `rows x channels` array.
/// Trailing values that do not fill a whole row are dropped.
pub fn decode_interleaved(bytes: &[u8], channels: usize) -> Array2<i16> {
    let rows = bytes.len() / BYTES_PER_SAMPLE / channels.max(1);
    let values: Vec<i16> = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .take(rows * channels)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();

    Array2::from_shape_vec((rows, channels), values)
        .unwrap_or_else(|_| Array2::zeros((0, channels)))
}

/// The samples extracted for one request, independent of the source bytes.
#[derive(Debug, Clone)]
pub struct LoadedWindow {
    pub samples: Array2<i16>,
    pub range: SampleRange,
    pub sample_rate: u32,
    pub samples_per_channel: usize,
}

impl LoadedWindow {
    pub fn total_duration(&self) -> f64 {
        self.samples_per_channel as f64 / self.sample_rate as f64
    }

    pub fn loaded_start(&self) -> f64 {
        self.range.start as f64 / self.sample_rate as f64
    }

    pub fn loaded_end(&self) -> f64 {
        self.range.end as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

#[derive(Debug, Clone)]
enum ByteSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl ByteSource {
    fn len(&self) -> std::io::Result<u64> {
        match self {
            ByteSource::File(path) => Ok(std::fs::metadata(path)?.len()),
            ByteSource::Memory(bytes) => Ok(bytes.len() as u64),
        }
    }

    fn read_range(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        match self {
            ByteSource::File(path) => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer)?;
                Ok(buffer)
            }
            ByteSource::Memory(bytes) => {
                let start = offset as usize;
                bytes
                    .get(start..start + len)
                    .map(|slice| slice.to_vec())
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "range past end of buffer",
                        )
                    })
            }
        }
    }

    fn path(&self) -> PathBuf {
        match self {
            ByteSource::File(path) => path.clone(),
            ByteSource::Memory(_) => PathBuf::from("<memory>"),
        }
    }
}

/// An opened raw recording. Never mutated; reconfiguring produces a new value.
#[derive(Debug, Clone)]
pub struct Recording {
    source: ByteSource,
    name: String,
    channels: usize,
    sample_rate: u32,
    total_bytes: u64,
    header: HeaderDecision,
    samples_per_channel: usize,
}

impl Recording {
    pub fn open(path: &Path, channels: usize, sample_rate: u32) -> ViewerResult<Self> {
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::with_source(ByteSource::File(path.to_path_buf()), name, channels, sample_rate)
    }

    pub fn from_bytes(
        name: &str,
        bytes: Vec<u8>,
        channels: usize,
        sample_rate: u32,
    ) -> ViewerResult<Self> {
        Self::with_source(
            ByteSource::Memory(Arc::from(bytes)),
            name.to_string(),
            channels,
            sample_rate,
        )
    }

    /// Same bytes, different declared layout.
    pub fn reconfigure(&self, channels: usize, sample_rate: u32) -> ViewerResult<Self> {
        Self::with_source(self.source.clone(), self.name.clone(), channels, sample_rate)
    }

    fn with_source(
        source: ByteSource,
        name: String,
        channels: usize,
        sample_rate: u32,
    ) -> ViewerResult<Self> {
        crate::config::LeadLayout::from_channel_count(channels)?;
        validate_sample_rate(sample_rate)?;

        let total_bytes = source.len().map_err(|e| ViewerError::Io {
            path: source.path(),
            source: e,
        })?;
        let header = sniff_header(total_bytes, channels);
        let payload_bytes = total_bytes - header.header_bytes;
        let samples_per_channel =
            (payload_bytes / BYTES_PER_SAMPLE as u64 / channels as u64) as usize;

        info!(
            "Opened {}: {} bytes, {}, {} samples/channel",
            name,
            total_bytes,
            header.describe(),
            samples_per_channel
        );

        Ok(Self {
            source,
            name,
            channels,
            sample_rate,
            total_bytes,
            header,
            samples_per_channel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn header(&self) -> &HeaderDecision {
        &self.header
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples_per_channel
    }

    pub fn total_duration(&self) -> f64 {
        self.samples_per_channel as f64 / self.sample_rate as f64
    }

    /// The bytes skipped as header, for diagnostics.
    pub fn header_preview(&self, max_bytes: usize) -> ViewerResult<Vec<u8>> {
        let len = (self.header.header_bytes as usize).min(max_bytes);
        self.read(0, len)
    }

    /// Reads only the rows covered by `request`.
    pub fn load_window(&self, request: &WindowRequest) -> ViewerResult<LoadedWindow> {
        let range = resolve_window(request, self.samples_per_channel, self.sample_rate);
        let row_bytes = self.channels * BYTES_PER_SAMPLE;

        let samples = if range.is_empty() {
            debug!(
                "Requested window {:?} is empty for {} samples/channel",
                request, self.samples_per_channel
            );
            Array2::zeros((0, self.channels))
        } else {
            let offset = self.header.header_bytes + (range.start * row_bytes) as u64;
            let bytes = self.read(offset, range.len() * row_bytes)?;
            decode_interleaved(&bytes, self.channels)
        };

        Ok(LoadedWindow {
            samples,
            range,
            sample_rate: self.sample_rate,
            samples_per_channel: self.samples_per_channel,
        })
    }

    fn read(&self, offset: u64, len: usize) -> ViewerResult<Vec<u8>> {
        self.source
            .read_range(offset, len)
            .map_err(|e| ViewerError::Io {
                path: self.source.path(),
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interleaved(rows: usize, channels: usize) -> Vec<u8> {
        (0..rows * channels)
            .flat_map(|i| ((i % 1000) as i16 - 500).to_le_bytes())
            .collect()
    }

    #[test]
    fn sniffer_picks_smallest_fitting_header() {
        // 3 channels, 100 rows, no header
        assert_eq!(sniff_header(600, 3).header_bytes, 0);

        // 600 bytes of payload behind a 64 byte header: 332 values do not split into 3
        let decision = sniff_header(664, 3);
        assert_eq!(decision.header_bytes, 64);
        assert!(decision.matched);
        assert_eq!(decision.candidates.len(), 2);
        assert!(!decision.candidates[0].fits);

        // 512 byte header with 5 channels: 0, 64, 128, 256 all leave a remainder
        let total = 512 + 5 * 2 * 101;
        assert_eq!(sniff_header(total, 5).header_bytes, 512);
    }

    #[test]
    fn sniffer_falls_back_to_zero() {
        // 15 values over 7 channels, every larger header exceeds the file
        let decision = sniff_header(30, 7);
        assert_eq!(decision.header_bytes, 0);
        assert!(!decision.matched);
        assert_eq!(decision.candidates.len(), HEADER_CANDIDATES.len());
    }

    #[test]
    fn sniffer_skips_headers_longer_than_the_file() {
        let decision = sniff_header(40, 32);
        assert!(!decision.matched);
        assert!(decision.candidates[1..]
            .iter()
            .all(|c| c.payload_values.is_none() && !c.fits));
    }

    #[test]
    fn window_request_validation() {
        assert!(WindowRequest::new(-1.0, None).is_err());
        assert!(WindowRequest::new(2.0, Some(1.0)).is_err());
        assert!(WindowRequest::new(2.0, Some(2.0)).is_err());
        assert!(WindowRequest::new(f64::NAN, None).is_err());
        assert!(WindowRequest::new(1.0, Some(2.5)).is_ok());
    }

    #[test]
    fn resolve_clamps_end_to_recording() {
        let request = WindowRequest::new(1.0, Some(10.0)).unwrap();
        let range = resolve_window(&request, 120_000, 500);
        assert_eq!(range, SampleRange { start: 30_000, end: 120_000 });
        assert_eq!(range.len(), 90_000);

        let past_end = WindowRequest::new(5.0, Some(6.0)).unwrap();
        assert!(resolve_window(&past_end, 120_000, 500).is_empty());
    }

    #[test]
    fn load_window_copies_requested_rows() {
        let channels = 2;
        let recording =
            Recording::from_bytes("rows.bin", interleaved(1_000, channels), channels, 100).unwrap();
        assert_eq!(recording.header().header_bytes, 0);
        // 1000 rows at 100 Hz = 10 s; take seconds 3..6
        let request = WindowRequest::new(0.05, Some(0.1)).unwrap();
        let window = recording.load_window(&request).unwrap();

        assert_eq!(window.samples.dim(), (300, 2));
        assert_eq!(window.loaded_start(), 3.0);
        assert_eq!(window.loaded_end(), 6.0);
        assert_eq!(window.total_duration(), 10.0);
        // row 300, channel 1 is flat value index 601
        assert_eq!(window.samples[[0, 1]], (601 % 1000) as i16 - 500);
    }

    #[test]
    fn decode_drops_partial_rows() {
        let mut bytes = interleaved(4, 3);
        bytes.extend_from_slice(&[1, 0, 2, 0]);
        bytes.push(9);
        let decoded = decode_interleaved(&bytes, 3);
        assert_eq!(decoded.dim(), (4, 3));
    }

    #[test]
    fn recording_reads_behind_header() {
        let channels = 3;
        let mut bytes = vec![0xAB; 64];
        bytes.extend(interleaved(100, channels));
        let recording = Recording::from_bytes("test.bin", bytes, channels, 50).unwrap();

        assert_eq!(recording.header().header_bytes, 64);
        assert_eq!(recording.samples_per_channel(), 100);
        assert_eq!(recording.total_duration(), 2.0);
        assert_eq!(recording.header_preview(4).unwrap(), vec![0xAB; 4]);

        let window = recording
            .load_window(&WindowRequest::whole_file())
            .unwrap();
        assert_eq!(window.samples.dim(), (100, 3));
        assert_eq!(window.samples[[0, 0]], -500);
        assert_eq!(window.samples[[99, 2]], 299 - 500);
    }

    #[test]
    fn recording_rejects_bad_layout() {
        assert!(Recording::from_bytes("x", vec![0; 8], 0, 500).is_err());
        assert!(Recording::from_bytes("x", vec![0; 8], 2, 0).is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Recording::open(Path::new("/nonexistent/ecg.bin"), 2, 500).unwrap_err();
        assert!(matches!(err, ViewerError::Io { .. }));
    }
}
