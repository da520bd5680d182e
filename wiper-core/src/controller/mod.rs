//! Background orchestration of the scan, clean and analysis engines.
//!
//! Each controller owns one worker thread at a time. A worker catches any
//! panic from its engine, publishes the outcome, hands the coordinator back
//! to Idle and only then signals its completion latch, so a caller woken by
//! `wait_for_completion` always observes the final state.

mod analysis;
mod clean;
mod latch;
mod scan;

pub use analysis::{AnalysisController, AnalysisReport, AppSummary};
pub use clean::{CleanController, CleanPreview, CleanReport};
pub use latch::CompletionLatch;
pub use scan::{ScanController, ScanSummary};

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

use crate::events::panic_message;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run `body`, turning a panic into its message.
fn run_guarded<T>(body: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(body)).map_err(|payload| panic_message(payload.as_ref()))
}

/// The single worker slot of a controller.
///
/// Every run gets its own latch, so a run started from inside the previous
/// worker (a subscriber reacting to the return to Idle) is not marked
/// complete when that previous worker finishes.
#[derive(Debug, Default)]
struct Worker {
    latch: Mutex<Arc<CompletionLatch>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Start `body` on a named thread and signal the run's latch after it
    /// returns.
    ///
    /// A previous worker is joined first unless the call comes from that
    /// worker itself; it has already released the state by the time a new
    /// run can start, so the join is short.
    fn spawn<F>(&self, name: &str, body: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handle = lock(&self.handle);
        if let Some(previous) = handle.take() {
            if previous.thread().id() == thread::current().id() {
                debug!("Restarting {} from its own thread, not joining", name);
            } else if previous.join().is_err() {
                error!("Previous {} thread panicked", name);
            }
        }

        let latch = Arc::new(CompletionLatch::new());
        *lock(&self.latch) = Arc::clone(&latch);
        let run_latch = Arc::clone(&latch);
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            body();
            run_latch.signal();
        });
        match spawned {
            Ok(join) => {
                *handle = Some(join);
                Ok(())
            }
            Err(e) => {
                latch.signal();
                Err(e)
            }
        }
    }

    fn current_latch(&self) -> Arc<CompletionLatch> {
        Arc::clone(&lock(&self.latch))
    }

    fn is_complete(&self) -> bool {
        self.current_latch().is_set()
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        self.current_latch().wait(timeout)
    }
}
