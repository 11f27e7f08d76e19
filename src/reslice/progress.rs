//! Progress reporting for reslice passes
//!
//! Reporting is advisory: the engine counts finished output rows and hands the
//! count to an observer from whichever worker thread finished the row.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Receives `(rows_done, rows_total)` as output rows complete.
pub trait ProgressObserver: Send + Sync {
    fn update(&self, rows_done: usize, rows_total: usize);
}

impl std::fmt::Debug for dyn ProgressObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressObserver")
    }
}

/// Logs every tenth of a pass with `tracing::info!`.
#[derive(Debug, Default)]
pub struct LogProgress {
    last_decile: AtomicUsize,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressObserver for LogProgress {
    fn update(&self, rows_done: usize, rows_total: usize) {
        if rows_total == 0 {
            return;
        }
        let decile = rows_done * 10 / rows_total;
        let previous = self.last_decile.fetch_max(decile, Ordering::Relaxed);
        if decile > previous {
            tracing::info!(rows_done, rows_total, "reslice {}% done", decile * 10);
        }
    }
}

/// Row counter shared by the workers of one pass.
pub(crate) struct RowCounter<'a> {
    observer: Option<&'a dyn ProgressObserver>,
    done: AtomicUsize,
    total: usize,
}

impl<'a> RowCounter<'a> {
    pub(crate) fn new(observer: Option<&'a dyn ProgressObserver>, total: usize) -> Self {
        Self {
            observer,
            done: AtomicUsize::new(0),
            total,
        }
    }

    #[inline]
    pub(crate) fn row_done(&self) {
        if let Some(observer) = self.observer {
            let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
            observer.update(done, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Record(Mutex<Vec<(usize, usize)>>);

    impl ProgressObserver for Record {
        fn update(&self, rows_done: usize, rows_total: usize) {
            if let Ok(mut v) = self.0.lock() {
                v.push((rows_done, rows_total));
            }
        }
    }

    #[test]
    fn test_counter_reports_every_row() {
        let record = Record::default();
        let counter = RowCounter::new(Some(&record), 3);
        for _ in 0..3 {
            counter.row_done();
        }
        assert_eq!(*record.0.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn test_log_progress_tracks_deciles() {
        let log = LogProgress::new();
        log.update(5, 100);
        assert_eq!(log.last_decile.load(Ordering::Relaxed), 0);
        log.update(55, 100);
        log.update(31, 100);
        assert_eq!(log.last_decile.load(Ordering::Relaxed), 5);
        log.update(0, 0);
    }
}
