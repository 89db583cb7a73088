//! Fan-out of independent per-file work onto a sized thread pool.
//!
//! Workers share nothing: each one gets an item and returns an owned value. Combining the
//! values is left to the caller, after the pool is done, in input order.

use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::error::PmpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowProgress {
    Yes,
    No,
}

impl From<bool> for ShowProgress {
    fn from(value: bool) -> Self {
        if value { Self::Yes } else { Self::No }
    }
}

pub struct FilePool {
    pool: rayon::ThreadPool,
    n_workers: usize,
}

impl FilePool {
    /// A pool of `workers` threads, or one per available core if `None`.
    pub fn new(workers: Option<usize>) -> Result<Self, PmpError> {
        let n_workers = workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|i| format!("pmp-worker-{i}"))
            .build()?;
        log::debug!("Started a pool of {n_workers} workers");
        Ok(Self { pool, n_workers })
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Apply `f` to every item on the pool. The results come back in the order of `items`.
    pub fn map<T, R, F>(&self, items: &[T], message: &str, show_progress: ShowProgress, f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        self.pool.install(|| match show_progress {
            ShowProgress::Yes => {
                let pb = progress_bar(items.len(), message);
                let results = items.par_iter()
                    .progress_with(pb.clone())
                    .map(&f)
                    .collect();
                pb.finish_and_clear();
                results
            },
            ShowProgress::No => items.par_iter().map(&f).collect(),
        })
    }
}

fn progress_bar(n: usize, message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template("{msg} {bar} {human_pos}/{human_len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let pb = ProgressBar::new(n as u64);
    pb.set_style(style);
    pb.set_message(message.to_owned());
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_in_input_order() {
        let pool = FilePool::new(Some(3)).unwrap();
        assert_eq!(pool.n_workers(), 3);
        let items: Vec<u64> = (0..100).collect();
        let squares = pool.map(&items, "Squaring", ShowProgress::No, |x| x * x);
        assert_eq!(squares, items.iter().map(|x| x * x).collect::<Vec<_>>());
    }

    #[test]
    fn test_with_progress_bar() {
        let pool = FilePool::new(None).unwrap();
        let items = vec!["a", "bb", "ccc"];
        let lens = pool.map(&items, "Measuring", ShowProgress::Yes, |s| s.len());
        assert_eq!(lens, vec![1, 2, 3]);
    }
}
