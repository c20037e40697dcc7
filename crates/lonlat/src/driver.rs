use tracing::info;

use crate::catalog::Catalog;
use crate::classify::Classifier;
use crate::grid::GridRegion;
use crate::progress::ProgressReporter;
use crate::writer::{BatchWriter, RecordStore, StoreError};

/// Totals of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    pub processed: u64,
    pub total: u64,
    pub written: u64,
    pub placeholders: u64,
    pub dropped: u64,
    pub flushes: u64,
    pub reports: u64,
    pub final_fraction: f64,
}

/// Walks a [`GridRegion`] and pushes every point through classification,
/// buffered writing and progress reporting, one point at a time.
pub struct Driver<'a, S> {
    region: GridRegion,
    classifier: Classifier<'a>,
    writer: BatchWriter<S>,
    reporter: ProgressReporter,
}

impl<'a, S: RecordStore> Driver<'a, S> {
    pub fn new(
        region: GridRegion,
        catalog: &'a Catalog,
        writer: BatchWriter<S>,
        reporter: ProgressReporter,
    ) -> Self {
        Self {
            region,
            classifier: Classifier::new(catalog),
            writer,
            reporter,
        }
    }

    pub fn run(self) -> Result<RunSummary, StoreError> {
        let Self {
            region,
            classifier,
            mut writer,
            mut reporter,
        } = self;

        info!(%region, total = region.total(), "Spanning the grid");
        reporter.restart_clock();

        for point in region.points() {
            let record = classifier.classify(point);
            writer.add(record)?;
            reporter.record_processed();
        }

        let (stats, _store) = writer.finish()?;
        let last = reporter.finish();

        let summary = RunSummary {
            processed: reporter.processed(),
            total: region.total(),
            written: stats.written,
            placeholders: stats.placeholders,
            dropped: stats.dropped,
            flushes: stats.flushes,
            reports: reporter.reports(),
            final_fraction: last.fraction,
        };

        info!(
            processed = summary.processed,
            written = summary.written,
            placeholders = summary.placeholders,
            dropped = summary.dropped,
            flushes = summary.flushes,
            "Run complete"
        );

        Ok(summary)
    }
}
