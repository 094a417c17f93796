//! Append-only CSV telemetry log

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::error::{TelemetryError, TelemetryResult};
use crate::telemetry::record::{FileRow, LogLayout, TelemetryRecord, VideoRow};

/// Destination for flushed telemetry batches
pub trait TelemetryWriter: Send {
    /// Appends a batch; on error nothing must have been written
    fn append(&mut self, records: &[TelemetryRecord]) -> TelemetryResult<()>;

    /// File backing the writer, if any
    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Output that can be cut back to an earlier length
trait Truncate: Write {
    fn current_len(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for File {
    fn current_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Writes `bytes` completely or not at all
///
/// A failed write is cut back to the original length so the retried batch
/// does not duplicate rows that made it out before the error.
fn append_whole<W: Truncate>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    let original = out.current_len()?;
    let result = out.write_all(bytes).and_then(|_| out.flush());
    if result.is_err() {
        if let Err(e) = out.truncate_to(original) {
            error!(
                "Could not roll back a partial telemetry batch, rows may repeat: {}",
                e
            );
        }
    }
    result
}

/// CSV log that is reopened in append mode for every batch
///
/// The header is written when the file is created (or found empty), so an
/// existing log from an earlier run with the same tag is continued.
#[derive(Debug, Clone)]
pub struct CsvTelemetryLog {
    path: PathBuf,
    layout: LogLayout,
}

impl CsvTelemetryLog {
    pub fn new(path: impl Into<PathBuf>, layout: LogLayout) -> Self {
        Self {
            path: path.into(),
            layout,
        }
    }

    pub fn layout(&self) -> LogLayout {
        self.layout
    }

    fn needs_header(&self) -> bool {
        fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true)
    }

    /// Renders the batch to bytes so a failed append writes nothing
    fn render(&self, records: &[TelemetryRecord], header: bool) -> TelemetryResult<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());

        if header {
            writer.write_record(self.layout.columns())?;
        }
        for record in records {
            match self.layout {
                LogLayout::Files => writer.serialize(FileRow::from(record))?,
                LogLayout::Video => writer.serialize(VideoRow::from(record))?,
            }
        }

        writer
            .into_inner()
            .map_err(|e| TelemetryError::Append(e.to_string()))
    }
}

impl TelemetryWriter for CsvTelemetryLog {
    fn append(&mut self, records: &[TelemetryRecord]) -> TelemetryResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let bytes = self.render(records, self.needs_header())?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| TelemetryError::Open {
                path: self.path.display().to_string(),
                source,
            })?;

        append_whole(&mut file, &bytes).map_err(|e| TelemetryError::Append(e.to_string()))?;

        debug!(
            "Appended {} telemetry rows to {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
