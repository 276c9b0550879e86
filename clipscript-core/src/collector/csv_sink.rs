//! Append-only CSV output.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use super::record::VideoRecord;
use crate::error::CollectorError;

/// Fixed column order of the output file.
pub const CSV_COLUMNS: [&str; 6] = [
    "id",
    "username",
    "caption",
    "like_count",
    "view_count",
    "transcript",
];

/// Append one row per record to `path`, creating it if needed.
///
/// The header row is written only when the file is empty. Returns the number
/// of data rows written.
pub fn append_records(records: &[VideoRecord], path: &Path) -> Result<usize, CollectorError> {
    let output_err = |source| CollectorError::Output {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(output_err)?;
    let is_empty = file.metadata().map_err(output_err)?.len() == 0;

    let mut buf = String::new();
    if is_empty {
        push_row(&mut buf, CSV_COLUMNS.iter().copied());
    }
    for record in records {
        let cells = record.csv_cells();
        push_row(&mut buf, cells.iter().map(String::as_str));
    }

    file.write_all(buf.as_bytes()).map_err(output_err)?;
    file.flush().map_err(output_err)?;

    tracing::debug!(
        path = %path.display(),
        rows = records.len(),
        header = is_empty,
        "Appended records"
    );
    Ok(records.len())
}

fn push_row<'a>(buf: &mut String, cells: impl Iterator<Item = &'a str>) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            buf.push(',');
        }
        buf.push_str(&csv_escape(cell));
    }
    buf.push('\n');
}

/// Quote a field when it contains a comma, quote, CR or LF, doubling embedded
/// quotes.
pub fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
