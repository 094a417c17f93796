//! Periodic telemetry flushing
//!
//! The producer pushes one record per tick into a shared [`TelemetryBuffer`].
//! A background thread swaps the buffer out on a fixed period and appends the
//! batch to the log. A failed batch is put back at the front of the buffer
//! and retried on the next tick. Records are lost only when the final flush
//! fails or when failed appends pile up past [`MAX_BUFFERED_RECORDS`]; both
//! losses are counted in the report.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{RecorderError, Result, TelemetryResult};
use crate::pipeline::ticker::Ticker;
use crate::telemetry::log::TelemetryWriter;
use crate::telemetry::record::TelemetryRecord;

/// Default flush period
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Records kept for retry while appends fail; about half an hour at 60 FPS
pub const MAX_BUFFERED_RECORDS: usize = 100_000;

/// Records waiting for the next flush
#[derive(Debug)]
pub struct TelemetryBuffer {
    records: Mutex<Vec<TelemetryRecord>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::with_capacity(MAX_BUFFERED_RECORDS)
    }
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that keeps at most `capacity` records across failed flushes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    /// Appends one record
    pub fn push(&self, record: TelemetryRecord) {
        self.records.lock().push(record);
    }

    /// Takes every buffered record, leaving the buffer empty
    pub fn take(&self) -> Vec<TelemetryRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Puts a failed batch back ahead of anything pushed since
    ///
    /// Beyond the capacity the oldest records are discarded and counted.
    pub fn restore(&self, mut batch: Vec<TelemetryRecord>) {
        let mut records = self.records.lock();
        batch.append(&mut records);

        let excess = batch.len().saturating_sub(self.capacity);
        if excess > 0 {
            batch.drain(..excess);
            let total = self.evicted.fetch_add(excess as u64, Ordering::Relaxed) + excess as u64;
            error!(
                "Telemetry backlog over {} records, discarded the {} oldest ({} so far)",
                self.capacity, excess, total
            );
        }
        *records = batch;
    }

    /// Records discarded because the backlog was full
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Outcome of a batcher's lifetime
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetryReport {
    /// Rows appended to the log
    pub rows_written: u64,
    /// Appends that failed and were retried
    pub failed_appends: u64,
    /// Rows never written: discarded from a full backlog or left over
    /// by a failed final flush
    pub rows_lost: u64,
}

#[derive(Debug, Default)]
struct Counters {
    rows_written: AtomicU64,
    failed_appends: AtomicU64,
}

/// Flushes one batch; a failed batch goes back into the buffer
fn flush_once(
    buffer: &TelemetryBuffer,
    writer: &mut dyn TelemetryWriter,
    counters: &Counters,
) -> TelemetryResult<usize> {
    let batch = buffer.take();
    if batch.is_empty() {
        return Ok(0);
    }

    match writer.append(&batch) {
        Ok(()) => {
            counters
                .rows_written
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            Ok(batch.len())
        }
        Err(e) => {
            counters.failed_appends.fetch_add(1, Ordering::Relaxed);
            buffer.restore(batch);
            Err(e)
        }
    }
}

/// Owns the telemetry flush thread
pub struct TelemetryBatcher {
    buffer: Arc<TelemetryBuffer>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Box<dyn TelemetryWriter>>>,
}

impl TelemetryBatcher {
    /// Starts the `telemetry-flush` thread
    pub fn start(writer: Box<dyn TelemetryWriter>, interval: Duration) -> Result<Self> {
        Self::start_with_buffer(writer, interval, Arc::new(TelemetryBuffer::new()))
    }

    fn start_with_buffer(
        writer: Box<dyn TelemetryWriter>,
        interval: Duration,
        buffer: Arc<TelemetryBuffer>,
    ) -> Result<Self> {
        let counters = Arc::new(Counters::default());
        let running = Arc::new(AtomicBool::new(true));

        let thread_buffer = Arc::clone(&buffer);
        let thread_counters = Arc::clone(&counters);
        let thread_running = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("telemetry-flush".to_string())
            .spawn(move || {
                flush_loop(
                    writer,
                    interval,
                    &thread_buffer,
                    &thread_counters,
                    &thread_running,
                )
            })
            .map_err(|source| RecorderError::ThreadSpawn {
                name: "telemetry-flush".to_string(),
                source,
            })?;

        info!("Telemetry batcher started (flush every {:?})", interval);

        Ok(Self {
            buffer,
            counters,
            running,
            handle: Some(handle),
        })
    }

    /// Shared buffer the producer pushes into
    pub fn buffer(&self) -> Arc<TelemetryBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Rows appended so far
    pub fn rows_written(&self) -> u64 {
        self.counters.rows_written.load(Ordering::Relaxed)
    }

    /// Stops the flush thread and writes whatever is still buffered
    ///
    /// Consumes the batcher, so the final flush runs exactly once.
    pub fn shutdown(mut self) -> TelemetryReport {
        self.stop_and_flush()
    }

    fn stop_and_flush(&mut self) -> TelemetryReport {
        self.running.store(false, Ordering::SeqCst);

        let mut rows_lost = 0;
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(mut writer) => {
                    if let Err(e) = flush_once(&self.buffer, writer.as_mut(), &self.counters) {
                        let lost = self.buffer.take().len() as u64;
                        error!(
                            "Final telemetry flush failed, {} records lost: {}",
                            lost, e
                        );
                        rows_lost = lost;
                    }
                }
                Err(_) => {
                    let lost = self.buffer.take().len() as u64;
                    error!(
                        "Telemetry flush thread panicked, {} buffered records lost",
                        lost
                    );
                    rows_lost = lost;
                }
            }
        }

        let report = TelemetryReport {
            rows_written: self.counters.rows_written.load(Ordering::Relaxed),
            failed_appends: self.counters.failed_appends.load(Ordering::Relaxed),
            rows_lost: rows_lost + self.buffer.evicted(),
        };
        info!(
            "Telemetry batcher stopped: {} rows written, {} lost",
            report.rows_written, report.rows_lost
        );
        report
    }
}

impl Drop for TelemetryBatcher {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop_and_flush();
        }
    }
}

fn flush_loop(
    mut writer: Box<dyn TelemetryWriter>,
    interval: Duration,
    buffer: &TelemetryBuffer,
    counters: &Counters,
    running: &AtomicBool,
) -> Box<dyn TelemetryWriter> {
    let mut ticker = Ticker::new(interval);
    debug!("Telemetry flush loop started");

    loop {
        ticker.begin();
        if !ticker.wait(running) {
            break;
        }

        match flush_once(buffer, writer.as_mut(), counters) {
            Ok(0) => {}
            Ok(count) => debug!("Flushed {} telemetry records", count),
            Err(e) => warn!(
                "Telemetry append failed, {} records kept for retry: {}",
                buffer.len(),
                e
            ),
        }
    }

    debug!("Telemetry flush loop stopped");
    writer
}
