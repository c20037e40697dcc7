//! Buffered bulk writes of classification records.
//!
//! Records are written in batches of [`FLUSH_THRESHOLD`]. A record the store
//! rejects as invalid is replaced by a blank placeholder under the same key,
//! and its key is appended to the [`ErrorLog`] for later repair.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::classify::ClassificationRecord;
use crate::grid::PointKey;

/// Maximum number of records per bulk write.
pub const FLUSH_THRESHOLD: usize = 25;

/// Result of writing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    /// The store refused the record's content.
    ValidationFailed(String),
    /// The record could not be written for any other reason.
    Fatal(String),
}

/// The store could not be reached at all; nothing in the batch was written.
#[derive(Debug, Error)]
#[error("record store failure: {message}")]
pub struct StoreError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// A key-value table accepting bulk writes of up to [`FLUSH_THRESHOLD`] records.
pub trait RecordStore {
    /// Writes `records` in one bulk request.
    ///
    /// Returns exactly one outcome per record, in input order.
    fn write_batch(&mut self, records: &[ClassificationRecord]) -> Result<Vec<WriteOutcome>, StoreError>;
}

impl<S: RecordStore + ?Sized> RecordStore for Box<S> {
    fn write_batch(&mut self, records: &[ClassificationRecord]) -> Result<Vec<WriteOutcome>, StoreError> {
        (**self).write_batch(records)
    }
}

/// Append-only list of keys whose classified record could not be stored.
pub struct ErrorLog {
    out: Box<dyn Write + Send>,
    entries: u64,
}

impl ErrorLog {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    pub fn from_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            entries: 0,
        }
    }

    /// Discards entries; used when no log file is wanted.
    pub fn sink() -> Self {
        Self::from_writer(io::sink())
    }

    /// Appends `key` and flushes it to the file right away, so entries
    /// survive the process being killed mid-run.
    pub fn record(&mut self, key: &PointKey) -> io::Result<()> {
        writeln!(self.out, "{key}")?;
        self.out.flush()?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Running totals kept by a [`BatchWriter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Rows stored, placeholders included.
    pub written: u64,
    pub placeholders: u64,
    /// Records for which no row at all was stored.
    pub dropped: u64,
    pub flushes: u64,
}

/// Buffers records and flushes them to a [`RecordStore`] in fixed-size batches.
pub struct BatchWriter<S> {
    store: S,
    buffer: Vec<ClassificationRecord>,
    error_log: ErrorLog,
    stats: WriterStats,
}

impl<S: RecordStore> BatchWriter<S> {
    pub fn new(store: S, error_log: ErrorLog) -> Self {
        Self {
            store,
            buffer: Vec::with_capacity(FLUSH_THRESHOLD),
            error_log,
            stats: WriterStats::default(),
        }
    }

    /// Buffers `record`, flushing once the buffer is full.
    pub fn add(&mut self, record: ClassificationRecord) -> Result<(), StoreError> {
        self.buffer.push(record);
        if self.buffer.len() >= FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes every buffered record and empties the buffer.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.buffer);
        self.buffer.reserve(FLUSH_THRESHOLD);
        self.stats.flushes += 1;

        let outcomes = self.store.write_batch(&batch)?;
        check_outcome_count(&batch, &outcomes)?;

        let mut placeholders = Vec::new();
        for (record, outcome) in batch.iter().zip(outcomes) {
            match outcome {
                WriteOutcome::Success => self.stats.written += 1,
                WriteOutcome::ValidationFailed(reason) => {
                    warn!(
                        key = %record.lonlat,
                        reason = %reason,
                        record = ?record,
                        "Record rejected by store; writing blank placeholder"
                    );
                    self.log_rejected(&record.lonlat);
                    placeholders.push(record.placeholder());
                }
                WriteOutcome::Fatal(reason) => {
                    error!(key = %record.lonlat, reason = %reason, "Unable to write record");
                    self.log_rejected(&record.lonlat);
                    self.stats.dropped += 1;
                }
            }
        }

        if !placeholders.is_empty() {
            self.write_placeholders(&placeholders)?;
        }

        debug!(records = batch.len(), flushes = self.stats.flushes, "Flushed batch");
        Ok(())
    }

    fn write_placeholders(&mut self, placeholders: &[ClassificationRecord]) -> Result<(), StoreError> {
        let outcomes = self.store.write_batch(placeholders)?;
        check_outcome_count(placeholders, &outcomes)?;

        for (placeholder, outcome) in placeholders.iter().zip(outcomes) {
            match outcome {
                WriteOutcome::Success => {
                    self.stats.written += 1;
                    self.stats.placeholders += 1;
                }
                WriteOutcome::ValidationFailed(reason) | WriteOutcome::Fatal(reason) => {
                    error!(
                        key = %placeholder.lonlat,
                        reason = %reason,
                        "Unable to add blank placeholder record"
                    );
                    self.stats.dropped += 1;
                }
            }
        }
        Ok(())
    }

    fn log_rejected(&mut self, key: &PointKey) {
        if let Err(e) = self.error_log.record(key) {
            error!(key = %key, error = %e, "Failed to append to error log");
        }
    }

    /// Flushes whatever is still buffered and returns the final totals.
    pub fn finish(mut self) -> Result<(WriterStats, S), StoreError> {
        self.flush()?;
        if let Err(e) = self.error_log.flush() {
            error!(error = %e, "Failed to flush error log");
        }
        Ok((self.stats, self.store))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

fn check_outcome_count(records: &[ClassificationRecord], outcomes: &[WriteOutcome]) -> Result<(), StoreError> {
    if records.len() != outcomes.len() {
        return Err(StoreError::new(format!(
            "store returned {} outcomes for {} records",
            outcomes.len(),
            records.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::BLANK;
    use crate::grid::GridPoint;

    /// Rejects records whose water field equals `reject`, and placeholders
    /// for keys listed in `reject_placeholder`.
    #[derive(Default)]
    struct FakeStore {
        batches: Vec<Vec<ClassificationRecord>>,
        reject: Option<String>,
        reject_placeholder: Vec<PointKey>,
        fatal: Option<PointKey>,
    }

    impl RecordStore for FakeStore {
        fn write_batch(&mut self, records: &[ClassificationRecord]) -> Result<Vec<WriteOutcome>, StoreError> {
            self.batches.push(records.to_vec());
            Ok(records
                .iter()
                .map(|r| {
                    if self.fatal.as_ref() == Some(&r.lonlat) {
                        WriteOutcome::Fatal("throttled".into())
                    } else if self.reject.as_deref() == Some(r.water.as_str()) {
                        WriteOutcome::ValidationFailed("bad text".into())
                    } else if r.water == BLANK && self.reject_placeholder.contains(&r.lonlat) {
                        WriteOutcome::ValidationFailed("still bad".into())
                    } else {
                        WriteOutcome::Success
                    }
                })
                .collect())
        }
    }

    fn record(i: i32) -> ClassificationRecord {
        ClassificationRecord::blank(GridPoint::new(i, 0).key())
    }

    #[test]
    fn flushes_at_threshold_and_empties_buffer() {
        let mut writer = BatchWriter::new(FakeStore::default(), ErrorLog::sink());

        for i in 0..FLUSH_THRESHOLD as i32 - 1 {
            writer.add(record(i)).unwrap();
            assert!(writer.buffered() < FLUSH_THRESHOLD);
        }
        assert!(writer.store().batches.is_empty());

        writer.add(record(99)).unwrap();
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.store().batches.len(), 1);
        assert_eq!(writer.store().batches[0].len(), FLUSH_THRESHOLD);
    }

    #[test]
    fn finish_writes_partial_batch() {
        let mut writer = BatchWriter::new(FakeStore::default(), ErrorLog::sink());
        for i in 0..26 {
            writer.add(record(i)).unwrap();
        }

        let (stats, store) = writer.finish().unwrap();
        let sizes: Vec<_> = store.batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![25, 1]);
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.written, 26);
    }

    #[test]
    fn finish_with_empty_buffer_does_not_write() {
        let writer = BatchWriter::new(FakeStore::default(), ErrorLog::sink());
        let (stats, store) = writer.finish().unwrap();
        assert!(store.batches.is_empty());
        assert_eq!(stats, WriterStats::default());
    }

    #[test]
    fn rejected_record_becomes_placeholder_with_same_key() {
        let store = FakeStore {
            reject: Some("Mer d\u{FFFD}Iroise".into()),
            ..Default::default()
        };
        let mut writer = BatchWriter::new(store, ErrorLog::sink());

        let mut bad = record(7);
        bad.water = "Mer d\u{FFFD}Iroise".into();
        writer.add(record(6)).unwrap();
        writer.add(bad.clone()).unwrap();

        let (stats, store) = writer.finish().unwrap();
        assert_eq!(store.batches.len(), 2);
        assert_eq!(store.batches[1], vec![bad.placeholder()]);
        assert_eq!(store.batches[1][0].lonlat, bad.lonlat);
        assert_eq!(stats.written, 2);
        assert_eq!(stats.placeholders, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn failed_placeholder_is_dropped() {
        let mut bad = record(3);
        bad.water = "broken".into();
        let store = FakeStore {
            reject: Some("broken".into()),
            reject_placeholder: vec![bad.lonlat.clone()],
            ..Default::default()
        };
        let mut writer = BatchWriter::new(store, ErrorLog::sink());
        writer.add(bad).unwrap();
        writer.add(record(4)).unwrap();

        let (stats, _) = writer.finish().unwrap();
        assert_eq!(stats.written, 1);
        assert_eq!(stats.placeholders, 0);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn fatal_record_is_logged_and_dropped() {
        let store = FakeStore {
            fatal: Some(record(1).lonlat),
            ..Default::default()
        };
        let mut writer = BatchWriter::new(store, ErrorLog::sink());
        writer.add(record(1)).unwrap();
        writer.add(record(2)).unwrap();
        writer.flush().unwrap();

        assert_eq!(writer.error_log().entries(), 1);
        let (stats, store) = writer.finish().unwrap();
        assert_eq!(store.batches.len(), 1);
        assert_eq!(stats.written, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn error_log_appends_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");

        let mut bad = record(-5);
        bad.water = "x".into();
        let store = FakeStore {
            reject: Some("x".into()),
            ..Default::default()
        };
        let mut writer = BatchWriter::new(store, ErrorLog::open(&path).unwrap());
        writer.add(bad).unwrap();
        writer.finish().unwrap();

        let mut log = ErrorLog::open(&path).unwrap();
        log.record(&GridPoint::new(1, 1).key()).unwrap();
        log.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "lon-0.5lat0.0\nlon0.1lat0.1\n");
    }

    #[test]
    fn error_log_entries_reach_disk_before_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");

        let store = FakeStore {
            reject: Some("bad".into()),
            ..Default::default()
        };
        let mut writer = BatchWriter::new(store, ErrorLog::open(&path).unwrap());
        for i in 0..FLUSH_THRESHOLD as i32 {
            let mut r = record(i);
            if i == 3 {
                r.water = "bad".into();
            }
            writer.add(r).unwrap();
        }
        assert_eq!(writer.error_log().entries(), 1);

        // A killed process never reaches `finish`.
        std::mem::forget(writer);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "lon0.3lat0.0\n");
    }

    #[test]
    fn outcome_count_mismatch_is_an_error() {
        struct Short;
        impl RecordStore for Short {
            fn write_batch(&mut self, _: &[ClassificationRecord]) -> Result<Vec<WriteOutcome>, StoreError> {
                Ok(vec![])
            }
        }

        let mut writer = BatchWriter::new(Short, ErrorLog::sink());
        writer.add(record(0)).unwrap();
        assert!(writer.flush().is_err());
    }
}
