use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// One-shot completion signal that can be re-armed between runs.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reset(&self) {
        *self.lock() = false;
    }

    pub fn signal(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Block until signalled. With a timeout, returns false if it elapsed
    /// first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let guard = self.lock();
        match timeout {
            Some(timeout) => {
                let (guard, _) = self
                    .cond
                    .wait_timeout_while(guard, timeout, |done| !*done)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *guard
            }
            None => {
                let guard = self
                    .cond
                    .wait_while(guard, |done| !*done)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *guard
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out_when_unset() {
        let latch = CompletionLatch::new();
        assert!(!latch.is_set());
        assert!(!latch.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let latch = Arc::new(CompletionLatch::new());
        let signaller = Arc::clone(&latch);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal();
        });

        assert!(latch.wait(None));
        handle.join().unwrap();

        latch.reset();
        assert!(!latch.is_set());
    }
}
