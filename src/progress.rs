//! Build-progress callbacks.
//!
//! The builder reports at block granularity; implementations must be
//! `Sync` because every worker calls `inc` concurrently.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait ProgressReporter: Sync {
    /// A phase of `total` tasks begins.
    fn init(&self, total: u64, label: &str, nthreads: usize);
    /// `delta` tasks finished on worker `worker`.
    fn inc(&self, delta: u64, worker: usize);
    /// The phase completed.
    fn finish(&self);
}

/// Reporter that swallows every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn init(&self, _total: u64, _label: &str, _nthreads: usize) {}
    fn inc(&self, _delta: u64, _worker: usize) {}
    fn finish(&self) {}
}

/// Text bar on stderr, one mark per 2% of the phase.
#[derive(Debug, Default)]
pub struct StderrProgress {
    total: AtomicU64,
    done: AtomicU64,
    marks: AtomicU64,
}

const BAR_WIDTH: u64 = 50;

impl StderrProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for StderrProgress {
    fn init(&self, total: u64, label: &str, nthreads: usize) {
        self.total.store(total.max(1), Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        self.marks.store(0, Ordering::SeqCst);
        eprint!("{label} ({nthreads} workers) [");
        let _ = std::io::stderr().flush();
    }

    fn inc(&self, delta: u64, _worker: usize) {
        let done = self.done.fetch_add(delta, Ordering::SeqCst) + delta;
        let total = self.total.load(Ordering::SeqCst);
        let target = (done.min(total) * BAR_WIDTH) / total;
        loop {
            let printed = self.marks.load(Ordering::SeqCst);
            if printed >= target {
                return;
            }
            if self
                .marks
                .compare_exchange(printed, target, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                for _ in printed..target {
                    eprint!(".");
                }
                let _ = std::io::stderr().flush();
                return;
            }
        }
    }

    fn finish(&self) {
        let printed = self.marks.swap(BAR_WIDTH, Ordering::SeqCst);
        for _ in printed..BAR_WIDTH {
            eprint!(".");
        }
        eprintln!("]");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        inits: AtomicU64,
        done: AtomicU64,
        finishes: AtomicU64,
    }

    impl ProgressReporter for Recording {
        fn init(&self, _total: u64, _label: &str, _nthreads: usize) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }
        fn inc(&self, delta: u64, _worker: usize) {
            self.done.fetch_add(delta, Ordering::SeqCst);
        }
        fn finish(&self) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn builder_reports_block_progress() {
        let keys: Vec<u64> = (0..10_000).collect();
        let progress = Recording::default();
        let mph = crate::Builder::new()
            .build_with_progress(keys, &progress)
            .unwrap();
        assert_eq!(mph.num_keys(), 10_000);
        let inits = progress.inits.load(Ordering::SeqCst);
        assert_eq!(inits as usize, mph.num_levels());
        assert_eq!(inits, progress.finishes.load(Ordering::SeqCst));
        // every level's fill phase counts its whole input
        assert!(progress.done.load(Ordering::SeqCst) >= 10_000);
    }
}
