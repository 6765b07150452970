use ecg_decoder::{
    Acceleration, BackendKind, LoadStatus, PipelineConfig, Recording, Session, ViewerError,
};
use std::path::PathBuf;
use std::sync::Arc;

const SAMPLE_RATE: u32 = 500;
const SAMPLES_PER_CHANNEL: usize = 120_000;
const BEAT_PERIOD_SECONDS: f32 = 0.75;

/// Two-lead recording at 80 bpm with 50 Hz hum on lead I and a constant offset
/// on both leads.
fn synthetic_bytes() -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SAMPLES_PER_CHANNEL * 4);
    for i in 0..SAMPLES_PER_CHANNEL {
        let t = i as f32 / SAMPLE_RATE as f32;
        let phase = (t / BEAT_PERIOD_SECONDS).fract() * BEAT_PERIOD_SECONDS;
        let beat = 1_000.0 * (-((phase - 0.4) / 0.015).powi(2)).exp();
        let hum = 30.0 * (2.0 * std::f32::consts::PI * 50.0 * t).sin();
        let lead_i = (beat * 0.5 + hum) as i16 + 200;
        let lead_ii = beat as i16 + 200;
        bytes.extend_from_slice(&lead_i.to_le_bytes());
        bytes.extend_from_slice(&lead_ii.to_le_bytes());
    }
    bytes
}

fn write_recording(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ecg-decoder-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, synthetic_bytes()).unwrap();
    path
}

fn open_session(path: &PathBuf, acceleration: &Acceleration) -> Session {
    let recording = Recording::open(path, 2, SAMPLE_RATE).unwrap();
    Session::new(recording, acceleration, PipelineConfig::default()).unwrap()
}

fn loaded(status: LoadStatus) -> ecg_decoder::LoadReport {
    match status {
        LoadStatus::Loaded(report) => report,
        LoadStatus::EmptyWindow { .. } => panic!("expected samples in the window"),
    }
}

#[test]
fn windows_are_clamped_to_the_recording() {
    let path = write_recording("clamped.bin");
    let mut session = open_session(&path, &Acceleration::unavailable("test"));

    let recording = session.recording();
    assert_eq!(recording.header().header_bytes, 0);
    assert_eq!(recording.samples_per_channel(), SAMPLES_PER_CHANNEL);
    assert_eq!(recording.total_duration(), 240.0);

    let first = loaded(session.load_minutes("0", Some("1")).unwrap());
    assert_eq!(first.rows, 30_000);
    assert_eq!(first.loaded_start, 0.0);
    assert_eq!(first.loaded_end, 60.0);

    let rest = loaded(session.load_minutes("1", Some("10")).unwrap());
    assert_eq!(rest.rows, 90_000);
    assert_eq!(rest.loaded_start, 60.0);
    assert_eq!(rest.loaded_end, 240.0);
    assert_eq!(rest.total_duration, 240.0);

    session.jump_to(30.0).unwrap();
    let window = session.render_window().unwrap();
    assert_eq!(window.absolute_seconds, 90.0);
}

#[test]
fn rendered_window_reports_heart_rate() {
    let path = write_recording("rate.bin");
    let mut session = open_session(&path, &Acceleration::unavailable("test"));
    loaded(session.load_minutes("0", Some("1")).unwrap());

    let window = session.render_window().unwrap();
    assert!(window.filtered);
    assert_eq!(window.data.dim(), (5_000, 2));
    let bpm = window.beat_rate.unwrap();
    assert!((78..=81).contains(&bpm), "bpm {}", bpm);

    session.set_filter_enabled(false);
    let unfiltered = session.render_window().unwrap();
    assert!(!unfiltered.filtered);
    assert_eq!(unfiltered.beat_rate, Some(80));
}

#[test]
fn accelerated_and_scalar_sessions_agree() {
    let path = write_recording("agree.bin");
    let mut scalar = open_session(&path, &Acceleration::unavailable("test"));
    let mut accelerated = open_session(&path, &Acceleration::probe(Some(2)));
    assert_eq!(accelerated.active_backend(), BackendKind::Accelerated);

    loaded(scalar.load_minutes("0", Some("2")).unwrap());
    let report = loaded(accelerated.load_minutes("0", Some("2")).unwrap());
    assert_eq!(report.backend, BackendKind::Accelerated);
    assert!(report.fallback.is_none());

    // 30 s at 500 Hz exceeds the accelerated filtering threshold
    scalar.set_window_seconds(30.0).unwrap();
    accelerated.set_window_seconds(30.0).unwrap();
    let a = scalar.render_window().unwrap();
    let b = accelerated.render_window().unwrap();
    assert_eq!(a.backend, BackendKind::Scalar);
    assert_eq!(b.backend, BackendKind::Accelerated);
    assert_eq!(a.beat_rate, b.beat_rate);
    for (x, y) in a.data.iter().zip(b.data.iter()) {
        assert!((x - y).abs() < 1e-4);
    }

    accelerated.set_acceleration_enabled(false);
    assert_eq!(accelerated.active_backend(), BackendKind::Scalar);
    assert_eq!(accelerated.render_window().unwrap().backend, BackendKind::Scalar);
}

#[test]
fn failures_keep_the_previous_state() {
    let path = write_recording("state.bin");
    let mut session = open_session(&path, &Acceleration::unavailable("test"));
    loaded(session.load_minutes("0", Some("1")).unwrap());
    session.apply_gain(2.0).unwrap();
    let before = session.snapshot().unwrap();

    assert!(matches!(
        session.load_minutes("3", Some("2")),
        Err(ViewerError::InvalidRequest(_))
    ));
    assert!(matches!(
        session.load_minutes("-1", None),
        Err(ViewerError::InvalidRequest(_))
    ));
    let missing = path.with_file_name("does-not-exist.bin");
    assert!(matches!(
        session.open_file(&missing),
        Err(ViewerError::Io { .. })
    ));
    assert!(matches!(
        session.load_minutes("10", None).unwrap(),
        LoadStatus::EmptyWindow { .. }
    ));

    let after = session.snapshot().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.gain(), 2.0);
    assert_eq!(session.recording().name(), "state.bin");
}

#[test]
fn auto_gain_is_stable() {
    let path = write_recording("gain.bin");
    let mut session = open_session(&path, &Acceleration::unavailable("test"));
    loaded(session.load_minutes("0", Some("1")).unwrap());

    let first = session.auto_gain().unwrap();
    let second = session.auto_gain().unwrap();
    assert_eq!(first.gain, second.gain);
    assert!(ecg_decoder::calibration::GAIN_LADDER.contains(&first.gain));
}
