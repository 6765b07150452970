use anyhow::Context;
use clap::Parser;
use ecg_decoder::config::validate_sample_rate;
use ecg_decoder::output::write_buffer_to_csv;
use ecg_decoder::{
    Acceleration, Args, LoadReport, LoadStatus, Recording, RenderedWindow, Session, WindowRate,
};
use log::{debug, info, warn};
use serde::Serialize;

const HEADER_PREVIEW_BYTES: usize = 32;

#[derive(Debug, Serialize)]
struct WindowSummary {
    start_sample: usize,
    position_seconds: f64,
    absolute_seconds: f64,
    rows: usize,
    filtered: bool,
    backend: ecg_decoder::BackendKind,
    beat_rate: Option<u32>,
    notes: Vec<String>,
    channels: Vec<ChannelSummary>,
}

#[derive(Debug, Serialize)]
struct ChannelSummary {
    name: String,
    min: f32,
    max: f32,
}

#[derive(Debug, Serialize)]
struct Summary {
    load: LoadReport,
    gain: f32,
    window: WindowSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    scan: Option<Vec<WindowRate>>,
}

fn summarize_window(window: &RenderedWindow) -> WindowSummary {
    let channels = window
        .channel_names
        .iter()
        .zip(window.data.columns())
        .map(|(name, column)| ChannelSummary {
            name: name.clone(),
            min: column.iter().copied().fold(f32::INFINITY, f32::min),
            max: column.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        })
        .collect();

    WindowSummary {
        start_sample: window.start_sample,
        position_seconds: window.position_seconds,
        absolute_seconds: window.absolute_seconds,
        rows: window.data.nrows(),
        filtered: window.filtered,
        backend: window.backend,
        beat_rate: window.beat_rate,
        notes: window.notes.clone(),
        channels,
    }
}

fn print_summary(summary: &Summary, recording: &Recording) {
    let load = &summary.load;
    println!("File: {}", load.file);
    println!("  {}", load.header.describe());
    println!(
        "  {} channels at {} Hz, {:.1} s recorded",
        load.channels, load.sample_rate, load.total_duration
    );
    println!(
        "  Loaded {:.1}-{:.1} s ({} rows) on {:?} backend in {:.1} ms",
        load.loaded_start, load.loaded_end, load.rows, load.backend, load.elapsed_ms
    );
    if let Some(fallback) = &load.fallback {
        println!("  Fallback: {}", fallback);
    }
    if let Ok(preview) = recording.header_preview(HEADER_PREVIEW_BYTES) {
        if !preview.is_empty() {
            println!("  Header bytes: {}", hex::encode(preview));
        }
    }
    println!("  Gain: {}x", summary.gain);

    let window = &summary.window;
    println!(
        "\nWindow at {:.2} s ({:.2} s into the recording), {} rows, {}",
        window.position_seconds,
        window.absolute_seconds,
        window.rows,
        if window.filtered { "filtered" } else { "unfiltered" }
    );
    match window.beat_rate {
        Some(bpm) => println!("  Heart rate: {} bpm", bpm),
        None => println!("  Heart rate: --"),
    }
    for note in &window.notes {
        println!("  Note: {}", note);
    }
    for channel in &window.channels {
        println!(
            "  {:>4}: {:>9.3} .. {:>9.3} mV",
            channel.name, channel.min, channel.max
        );
    }

    if let Some(scan) = &summary.scan {
        println!("\nBeat rate per window:");
        for entry in scan {
            let rate = entry
                .beat_rate
                .map(|bpm| bpm.to_string())
                .unwrap_or_else(|| "--".to_string());
            println!(
                "  {:>9.1} s  {:>4} bpm{}",
                entry.absolute_seconds,
                rate,
                if entry.filtered { "" } else { "  (unfiltered)" }
            );
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logger with RUST_LOG env var
    env_logger::init();

    let args = Args::parse();
    debug!("{:?}", args);

    let sample_rate = validate_sample_rate(args.sample_rate)?;
    let channels = args.channels.channel_count();
    let recording = Recording::open(&args.input_path, channels, sample_rate)
        .with_context(|| format!("opening {}", args.input_path.display()))?;

    let acceleration = if args.cpu_only {
        Acceleration::unavailable("disabled with --cpu-only")
    } else {
        Acceleration::probe(args.threads)
    };
    match (acceleration.accelerator(), acceleration.reason()) {
        (Some(accelerator), _) => info!(
            "Accelerated backend: {} ({} threads)",
            accelerator.name(),
            accelerator.threads()
        ),
        (None, reason) => info!(
            "Accelerated backend unavailable: {}",
            reason.unwrap_or("unknown")
        ),
    }

    let mut session = Session::new(recording, &acceleration, args.pipeline_config())?;

    let load = match session
        .load_minutes(&args.start_min, args.end_min.as_deref())
        .context("loading window")?
    {
        LoadStatus::Loaded(report) => report,
        LoadStatus::EmptyWindow { total_duration } => {
            anyhow::bail!(
                "the requested range holds no samples; the recording is {:.1} s long",
                total_duration
            );
        }
    };

    if let Some(gain) = args.gain {
        session.apply_gain(gain)?;
    } else if args.auto_gain {
        let suggestion = session.auto_gain()?;
        debug!("{:?}", suggestion);
    }

    if let Some(position) = &args.position {
        session.jump_to_str(position)?;
    }

    let window = session.render_window()?;
    let scan = if args.scan {
        Some(session.scan_rates()?)
    } else {
        None
    };

    let buffers = session
        .snapshot()
        .context("no buffers installed after load")?;

    if let Some(path) = &args.csv_output {
        write_buffer_to_csv(path, &buffers, &session.channel_names(), args.csv_max_rows)
            .with_context(|| format!("exporting to {}", path.display()))?;
    }

    let summary = Summary {
        load,
        gain: buffers.gain(),
        window: summarize_window(&window),
        scan,
    };

    if summary.window.beat_rate.is_none() {
        warn!("No heart rate could be measured in the displayed window");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, session.recording());
    }

    Ok(())
}
