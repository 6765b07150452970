use crate::session::BufferPair;
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

/// Writes the working buffer as `Time(s),<channel names...>`.
///
/// Times are seconds from the start of the loaded segment with three decimals,
/// samples have six. Returns the number of data rows written.
pub fn write_buffer_to_csv(
    path: &Path,
    buffers: &BufferPair,
    channel_names: &[String],
    max_rows: Option<usize>,
) -> Result<usize> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
    }

    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header = Vec::with_capacity(channel_names.len() + 1);
    header.push("Time(s)".to_string());
    header.extend(channel_names.iter().cloned());
    writer.write_record(&header)?;

    let limit = max_rows.unwrap_or(usize::MAX);
    let mut written = 0;
    for (time, row) in buffers.export_rows().take(limit) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(format!("{:.3}", time));
        record.extend(row.iter().map(|v| format!("{:.6}", v)));
        writer.write_record(&record)?;
        written += 1;
    }

    writer.flush()?;
    info!("Wrote {} rows to {}", written, path.display());
    Ok(written)
}
