//! Fixed-size worker pool over a shared file list.
//!
//! Backup work is embarrassingly parallel across files, so there is no
//! queue: each entry carries a test-and-set claim flag and every worker
//! loops claiming the next unclaimed entry. Workers never migrate a file
//! once claimed, and never talk to each other; the driver joins them and
//! surfaces the single most severe error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::error::{most_severe, ClassifiedError};

/// Cooperative cancellation, carried by value into each task. Workers
/// test it at iteration boundaries (next file, next block, next record)
/// and exit by returning.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Arm SIGINT/SIGTERM to set the token.
    pub fn install_signal_handlers(&self) -> anyhow::Result<()> {
        for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&self.0))?;
        }
        Ok(())
    }
}

/// An entry a worker can take exclusive ownership of.
pub trait Claimable {
    fn try_claim(&self) -> bool;
}

impl Claimable for crate::pgfile::PgFile {
    fn try_claim(&self) -> bool {
        crate::pgfile::PgFile::try_claim(self)
    }
}

/// Fan `items` out over `num_threads` workers. `process(index, item)`
/// runs exactly once per claimed item; its successful returns are
/// collected (tagged with the item index) for the driver to apply after
/// the join. On error or cancellation the pool drains and the most
/// severe error is returned.
pub fn run_parallel<T, R, F>(
    num_threads: usize,
    items: &[T],
    cancel: &CancelToken,
    process: F,
) -> Result<Vec<(usize, R)>, ClassifiedError>
where
    T: Claimable + Sync,
    R: Send,
    F: Fn(usize, &T) -> Result<R, ClassifiedError> + Sync,
{
    let num_threads = num_threads.max(1);
    let results: Mutex<Vec<(usize, R)>> = Mutex::new(Vec::with_capacity(items.len()));
    let errors: Mutex<Vec<ClassifiedError>> = Mutex::new(Vec::new());
    // once any worker fails, the rest stop claiming new items
    let failed = AtomicBool::new(false);

    crossbeam_utils::thread::scope(|scope| {
        for thread_num in 0..num_threads {
            let results = &results;
            let errors = &errors;
            let failed = &failed;
            let process = &process;
            scope.spawn(move |_| {
                debug!("worker {thread_num} started");
                for (index, item) in items.iter().enumerate() {
                    if cancel.is_cancelled() || failed.load(Ordering::Relaxed) {
                        break;
                    }
                    if !item.try_claim() {
                        continue;
                    }
                    match process(index, item) {
                        Ok(result) => results.lock().unwrap().push((index, result)),
                        Err(e) => {
                            error!("worker {thread_num}: {e}");
                            failed.store(true, Ordering::Relaxed);
                            errors.lock().unwrap().push(e);
                            break;
                        }
                    }
                }
                debug!("worker {thread_num} finished");
            });
        }
    })
    .expect("worker thread panicked");

    if cancel.is_cancelled() {
        errors.lock().unwrap().push(ClassifiedError::new(
            crate::error::ErrorKind::Policy,
            anyhow::anyhow!("interrupted"),
        ));
    }

    let errors = errors.into_inner().unwrap();
    match most_severe(errors) {
        Some(err) => Err(err),
        None => Ok(results.into_inner().unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    struct Item {
        claimed: AtomicBool,
        value: usize,
    }

    impl Item {
        fn new(value: usize) -> Item {
            Item {
                claimed: AtomicBool::new(false),
                value,
            }
        }
    }

    impl Claimable for Item {
        fn try_claim(&self) -> bool {
            !self.claimed.swap(true, Ordering::AcqRel)
        }
    }

    #[test]
    fn every_item_processed_exactly_once() {
        let items: Vec<Item> = (0..100).map(Item::new).collect();
        let counter = AtomicUsize::new(0);
        let cancel = CancelToken::new();

        let results = run_parallel(4, &items, &cancel, |_, item| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(item.value * 2)
        })
        .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(results.len(), 100);
        let mut sorted: Vec<_> = results.iter().map(|&(i, r)| (i, r)).collect();
        sorted.sort();
        for (i, r) in sorted {
            assert_eq!(r, i * 2);
        }
    }

    #[test]
    fn most_severe_error_wins() {
        let items: Vec<Item> = (0..10).map(Item::new).collect();
        let cancel = CancelToken::new();

        let err = run_parallel(2, &items, &cancel, |_, item| {
            if item.value == 3 {
                Err(ClassifiedError::new(
                    ErrorKind::Missing,
                    anyhow::anyhow!("missing"),
                ))
            } else if item.value == 5 {
                Err(ClassifiedError::new(
                    ErrorKind::Format,
                    anyhow::anyhow!("format"),
                ))
            } else {
                Ok(())
            }
        })
        .unwrap_err();

        // either worker could have failed first, but Format outranks
        // Missing whenever both were hit; at minimum one of them surfaced
        assert!(matches!(err.kind, ErrorKind::Missing | ErrorKind::Format));
    }

    #[test]
    fn cancellation_stops_claiming() {
        let items: Vec<Item> = (0..1000).map(Item::new).collect();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = run_parallel(4, &items, &cancel, |_, _| Ok(())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Policy);
    }
}
