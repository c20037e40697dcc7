//! Completion tracking and status notifications.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::grid::GridRegion;

/// A report is always sent at this count so that operators get an early sign
/// of life well before the first full interval.
pub const BOOTSTRAP_REPORT_AT: u64 = 100;

/// Default number of records between reports.
pub const DEFAULT_REPORT_EVERY: u64 = 324_000;

/// Longest subject line the notification channel accepts.
pub const MAX_SUBJECT_LEN: usize = 99;

#[derive(Debug, Error)]
#[error("failed to publish notification: {0}")]
pub struct NotifyError(pub String);

/// An external pub/sub channel for status messages.
pub trait Notifier {
    fn publish(&mut self, subject: &str, message: &str) -> Result<(), NotifyError>;
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
    fn publish(&mut self, subject: &str, message: &str) -> Result<(), NotifyError> {
        (**self).publish(subject, message)
    }
}

/// A snapshot of how far a run has come.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
    pub elapsed: Duration,
    /// Share of the grid done, in `[0, 1]`.
    pub fraction: f64,
    /// `None` until at least one record has been processed.
    pub remaining: Option<Duration>,
}

impl Progress {
    pub fn compute(processed: u64, total: u64, elapsed: Duration) -> Self {
        let fraction = if total == 0 {
            1.0
        } else {
            (processed as f64 / total as f64).min(1.0)
        };

        let remaining = (fraction > 0.0)
            .then(|| elapsed.as_secs_f64() * (1.0 - fraction) / fraction)
            .filter(|secs| secs.is_finite())
            .map(Duration::from_secs_f64);

        Self {
            processed,
            total,
            elapsed,
            fraction,
            remaining,
        }
    }

    /// Percentage rounded to three decimals.
    pub fn percent(&self) -> f64 {
        (self.fraction * 100_000.0).round() / 1000.0
    }

    /// `percent()` as text, always with at least one decimal (`25.0`, `33.333`).
    pub fn percent_text(&self) -> String {
        let pct = self.percent();
        if pct.fract() == 0.0 {
            format!("{pct:.1}")
        } else {
            pct.to_string()
        }
    }

    /// Estimated local wall-clock time of completion.
    pub fn eta(&self, now: chrono::DateTime<chrono::Local>) -> Option<chrono::DateTime<chrono::Local>> {
        let remaining = chrono::Duration::from_std(self.remaining?).ok()?;
        now.checked_add_signed(remaining)
    }
}

/// Decides when to report and renders/publishes the reports.
pub struct ProgressReporter {
    label: String,
    region: GridRegion,
    every: u64,
    started: Instant,
    processed: u64,
    reports: u64,
    notifier: Option<Box<dyn Notifier>>,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, region: GridRegion, every: u64) -> Self {
        Self {
            label: label.into(),
            region,
            every: every.max(1),
            started: Instant::now(),
            processed: 0,
            reports: 0,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Restarts the elapsed-time clock, e.g. after loading reference data.
    pub fn restart_clock(&mut self) {
        self.started = Instant::now();
    }

    /// Whether the `count`th processed record triggers a report.
    pub fn is_due(&self, count: u64) -> bool {
        count % self.every == 0 || count == BOOTSTRAP_REPORT_AT
    }

    /// Counts one processed record, reporting when due.
    pub fn record_processed(&mut self) {
        self.processed += 1;
        if self.is_due(self.processed) {
            self.report();
        }
    }

    pub fn progress(&self) -> Progress {
        Progress::compute(self.processed, self.region.total(), self.started.elapsed())
    }

    /// Logs and, if a channel is configured, publishes the current status.
    pub fn report(&mut self) -> Progress {
        let progress = self.progress();
        self.reports += 1;

        let eta = progress
            .eta(chrono::Local::now())
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_owned());

        info!(
            label = %self.label,
            processed = progress.processed,
            total = progress.total,
            percent = progress.percent(),
            eta = %eta,
            "{}",
            self.status_line(&progress)
        );

        if let Some(notifier) = self.notifier.as_mut() {
            let subject = subject_line(&self.label, &self.region);
            let message = message_body(&self.label, &self.region, &progress, &eta);
            if let Err(e) = notifier.publish(&subject, &message) {
                warn!(error = %e, "Progress notification failed; continuing");
            }
        }

        progress
    }

    /// Final, unconditional report.
    pub fn finish(&mut self) -> Progress {
        self.report()
    }

    pub fn status_line(&self, progress: &Progress) -> String {
        format!(
            "{} {} of {} ({}%) rows completed",
            self.label,
            progress.processed,
            progress.total,
            progress.percent_text()
        )
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn reports(&self) -> u64 {
        self.reports
    }
}

fn subject_line(label: &str, region: &GridRegion) -> String {
    let subject = format!("{label} {region}");
    match subject.char_indices().nth(MAX_SUBJECT_LEN) {
        Some((cut, _)) => subject[..cut].to_owned(),
        None => subject,
    }
}

fn message_body(label: &str, region: &GridRegion, progress: &Progress, eta: &str) -> String {
    format!(
        "{label} Lat/Lon Progress Update: ({}%), {region}\n\
         {} of {} rows completed, estimated completion date/time: {eta}",
        progress.percent_text(),
        progress.processed,
        progress.total,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Rc<RefCell<Vec<(String, String)>>>,
        fail: bool,
    }

    impl Notifier for Recorder {
        fn publish(&mut self, subject: &str, message: &str) -> Result<(), NotifyError> {
            self.sent.borrow_mut().push((subject.to_owned(), message.to_owned()));
            if self.fail {
                return Err(NotifyError("topic unavailable".into()));
            }
            Ok(())
        }
    }

    fn region(lon_end: i32, lat_end: i32) -> GridRegion {
        GridRegion::new(0, lon_end, 0, lat_end).unwrap()
    }

    #[test]
    fn reports_on_bootstrap_and_interval() {
        let reporter = ProgressReporter::new("t", region(10, 10), 30);
        let due: Vec<u64> = (1..=100).filter(|&n| reporter.is_due(n)).collect();
        assert_eq!(due, vec![30, 60, 90, 100]);
    }

    #[test]
    fn fraction_and_remaining() {
        let p = Progress::compute(0, 10, Duration::from_secs(5));
        assert_eq!(p.fraction, 0.0);
        assert_eq!(p.remaining, None);
        assert!(p.eta(chrono::Local::now()).is_none());

        let p = Progress::compute(1, 4, Duration::from_secs(10));
        assert_eq!(p.fraction, 0.25);
        assert_eq!(p.remaining, Some(Duration::from_secs(30)));

        let p = Progress::compute(4, 4, Duration::from_secs(10));
        assert_eq!(p.fraction, 1.0);
        assert_eq!(p.remaining, Some(Duration::ZERO));
    }

    #[test]
    fn empty_region_counts_as_complete() {
        let p = Progress::compute(0, 0, Duration::from_secs(1));
        assert_eq!(p.fraction, 1.0);
    }

    #[test]
    fn fraction_is_monotonic_and_ends_at_one() {
        let total = 37;
        let mut last = 0.0;
        for n in 1..=total {
            let f = Progress::compute(n, total, Duration::from_secs(1)).fraction;
            assert!(f >= last);
            last = f;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn percent_has_three_decimals() {
        let p = Progress::compute(1, 3, Duration::from_secs(1));
        assert_eq!(p.percent(), 33.333);
        assert_eq!(p.percent_text(), "33.333");
    }

    #[test]
    fn whole_percentages_keep_one_decimal() {
        let d = Duration::from_secs(1);
        assert_eq!(Progress::compute(0, 4, d).percent_text(), "0.0");
        assert_eq!(Progress::compute(1, 4, d).percent_text(), "25.0");
        assert_eq!(Progress::compute(4, 4, d).percent_text(), "100.0");
        assert_eq!(Progress::compute(1, 8, d).percent_text(), "12.5");
    }

    #[test]
    fn publishes_subject_with_label_and_bounds() {
        let recorder = Recorder::default();
        let mut reporter = ProgressReporter::new("i01p01", GridRegion::new(-1800, 1800, -900, 0).unwrap(), 5)
            .with_notifier(Box::new(recorder.clone()));

        for _ in 0..5 {
            reporter.record_processed();
        }

        let sent = recorder.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "i01p01 Lon: -1800->1800, Lat:-900->0");
        assert!(sent[0].1.starts_with("i01p01 Lat/Lon Progress Update: (0.0%)"));
        assert!(sent[0].1.contains("5 of 3240000 rows completed"));
    }

    #[test]
    fn publish_failure_does_not_stop_reporting() {
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let mut reporter = ProgressReporter::new("x", region(1, 2), 1).with_notifier(Box::new(recorder.clone()));

        reporter.record_processed();
        reporter.record_processed();
        let last = reporter.finish();

        assert_eq!(reporter.reports(), 3);
        assert_eq!(recorder.sent.borrow().len(), 3);
        assert_eq!(last.fraction, 1.0);
    }

    #[test]
    fn long_subjects_are_truncated() {
        let label = "l".repeat(150);
        let subject = subject_line(&label, &region(1, 1));
        assert_eq!(subject.chars().count(), MAX_SUBJECT_LEN);
    }

    #[test]
    fn status_line_format() {
        let reporter = ProgressReporter::new("run", region(10, 10), 10);
        let p = Progress::compute(25, 100, Duration::from_secs(1));
        assert_eq!(reporter.status_line(&p), "run 25 of 100 (25.0%) rows completed");
    }
}
