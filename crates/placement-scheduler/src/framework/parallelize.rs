//! Bounded parallel fan-out over nodes.

use super::status::Status;
use crate::error::{Result, SchedulerError};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Default number of workers.
pub const DEFAULT_PARALLELISM: usize = 16;

/// Cancellation flag plus the first error reported by any worker.
#[derive(Debug, Default)]
pub struct ErrorChannel {
    cancelled: AtomicBool,
    first: Mutex<Option<Status>>,
}

impl ErrorChannel {
    /// Create an open channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the remaining work without recording an error.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check whether the work was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Record `status` if it is the first error, then cancel.
    pub fn send_error_with_cancel(&self, status: Status) {
        {
            let mut first = self.first.lock();
            if first.is_none() {
                *first = Some(status);
            }
        }
        self.cancel();
    }

    /// Take the first recorded error.
    #[must_use]
    pub fn receive_error(&self) -> Option<Status> {
        self.first.lock().take()
    }
}

/// A fixed-size worker pool.
#[derive(Debug, Clone)]
pub struct Parallelizer {
    pool: Arc<rayon::ThreadPool>,
    parallelism: usize,
}

impl Parallelizer {
    /// Build a pool with `parallelism` workers.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if `parallelism` is zero or the
    /// threads cannot be spawned.
    pub fn new(parallelism: usize) -> Result<Self> {
        if parallelism == 0 {
            return Err(SchedulerError::Config(
                "parallelism must be greater than 0".into(),
            ));
        }
        let counter = AtomicU64::new(0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(move |_| {
                format!("placement-worker-{}", counter.fetch_add(1, Ordering::Relaxed))
            })
            .build()
            .map_err(|e| SchedulerError::Config(format!("building worker pool: {e}")))?;
        Ok(Self {
            pool: Arc::new(pool),
            parallelism,
        })
    }

    /// Number of workers.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Run `piece(i)` for every `i` in `0..pieces` on the pool, skipping the
    /// pieces not yet started once `errors` is cancelled. Blocks until done.
    pub fn until<F>(&self, errors: &ErrorChannel, pieces: usize, piece: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        if pieces == 0 {
            return;
        }
        self.pool.install(|| {
            (0..pieces).into_par_iter().for_each(|i| {
                if !errors.is_cancelled() {
                    piece(i);
                }
            });
        });
    }

    /// Map every index in `0..pieces` on the pool. Pieces skipped after
    /// cancellation, and pieces for which `f` returns `None`, yield `None`.
    pub fn map<T, F>(&self, errors: &ErrorChannel, pieces: usize, f: F) -> Vec<Option<T>>
    where
        T: Send,
        F: Fn(usize) -> Option<T> + Send + Sync,
    {
        self.pool.install(|| {
            (0..pieces)
                .into_par_iter()
                .map(|i| if errors.is_cancelled() { None } else { f(i) })
                .collect()
        })
    }

    /// Run `f` on every item on the pool, with mutable access.
    pub fn for_each_mut<T, F>(&self, errors: &ErrorChannel, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Send + Sync,
    {
        self.pool.install(|| {
            items.par_iter_mut().enumerate().for_each(|(i, item)| {
                if !errors.is_cancelled() {
                    f(i, item);
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_every_piece() {
        let p = Parallelizer::new(4).unwrap();
        let hits = AtomicUsize::new(0);
        p.until(&ErrorChannel::new(), 100, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn cancel_stops_new_pieces() {
        let p = Parallelizer::new(1).unwrap();
        let errors = ErrorChannel::new();
        let hits = AtomicUsize::new(0);
        p.until(&errors, 1000, |i| {
            hits.fetch_add(1, Ordering::Relaxed);
            if i == 0 {
                errors.send_error_with_cancel(Status::error("first"));
                errors.send_error_with_cancel(Status::error("second"));
            }
        });
        assert!(hits.load(Ordering::Relaxed) < 1000);
        assert_eq!(errors.receive_error().unwrap().message(), "first");
    }

    #[test]
    fn map_keeps_order() {
        let p = Parallelizer::new(3).unwrap();
        let out = p.map(&ErrorChannel::new(), 5, |i| (i % 2 == 0).then_some(i * 10));
        assert_eq!(out, [Some(0), None, Some(20), None, Some(40)]);

        let mut items = vec![1, 2, 3];
        p.for_each_mut(&ErrorChannel::new(), &mut items, |i, v| *v += i);
        assert_eq!(items, [1, 3, 5]);
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(matches!(Parallelizer::new(0), Err(SchedulerError::Config(_))));
    }
}
