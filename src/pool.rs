//! ARCHIVIST - Per-Range Worker Pool
//! Fans a list of per-range tasks out over a fixed number of threads.
//!
//! ## Concurrency Model
//! - Workers pull the next task index from a shared atomic counter
//! - A shared [`CancelToken`] stops workers from picking up new tasks
//! - The first terminal failure trips the token so siblings wind down
//! - Results come back in task order once every worker has joined

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{ArchivistError, Result};

/// Cooperative cancellation flag shared by an operation's workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Workers observe it between tasks and
    /// between revisions.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ArchivistError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run `task` over every item using up to `workers` threads.
///
/// The returned vector has one entry per item, in item order. Items never
/// started because the token was tripped report `Err(Cancelled)`.
pub fn run_parallel<I, T, F>(items: &[I], workers: usize, cancel: &CancelToken, task: F) -> Vec<Result<T>>
where
    I: Sync,
    T: Send,
    F: Fn(&I) -> Result<T> + Sync,
{
    let slots: Vec<Mutex<Option<Result<T>>>> = items.iter().map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);
    let workers = workers.max(1).min(items.len().max(1));

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                if idx >= items.len() {
                    break;
                }
                let result = match cancel.check() {
                    Ok(()) => task(&items[idx]),
                    Err(err) => Err(err),
                };
                if let Err(err) = &result {
                    if !matches!(err, ArchivistError::Cancelled) {
                        cancel.cancel();
                    }
                }
                if let Ok(mut slot) = slots[idx].lock() {
                    *slot = Some(result);
                }
            });
        }
    });

    slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .ok()
                .flatten()
                .unwrap_or(Err(ArchivistError::Poisoned("worker pool")))
        })
        .collect()
}

/// The first terminal error in `results`, preferring a real failure over
/// the `Cancelled` errors it caused in sibling tasks.
pub fn first_error<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(results.len());
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(ArchivistError::Cancelled) => cancelled = Some(ArchivistError::Cancelled),
            Err(err) => return Err(err),
        }
    }
    match cancelled {
        Some(err) => Err(err),
        None => Ok(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RangeId;

    #[test]
    fn test_results_keep_item_order() {
        let items: Vec<u64> = (0..50).collect();
        let results = run_parallel(&items, 4, &CancelToken::new(), |n| Ok(n * 2));
        let values = first_error(results).unwrap();
        assert_eq!(values, items.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_failure_trips_token() {
        let items: Vec<u64> = (0..100).collect();
        let cancel = CancelToken::new();
        let results = run_parallel(&items, 1, &cancel, |n| {
            if *n == 3 {
                Err(ArchivistError::Corruption("bad file".into()))
            } else {
                Ok(*n)
            }
        });
        assert!(cancel.is_cancelled());
        // A single worker never starts anything after the failure.
        assert!(matches!(results[4], Err(ArchivistError::Cancelled)));
        assert!(matches!(
            first_error(results),
            Err(ArchivistError::Corruption(_))
        ));
    }

    #[test]
    fn test_pre_cancelled_runs_nothing() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let results = run_parallel(&[RangeId(1), RangeId(2)], 2, &cancel, |_| Ok(()));
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(ArchivistError::Cancelled))));
    }

    #[test]
    fn test_empty_input() {
        let items: Vec<u8> = Vec::new();
        assert!(run_parallel(&items, 8, &CancelToken::new(), |_| Ok(())).is_empty());
    }
}
