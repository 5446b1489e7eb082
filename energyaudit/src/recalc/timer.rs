use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Single-shot timer that restarts on every `schedule` call.
///
/// Must be used from within a Tokio runtime.
#[derive(Debug, Default)]
pub struct DebounceTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DebounceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `on_fire` after `delay`, replacing any pending schedule
    pub fn schedule<F>(&self, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.slot();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        }));
    }

    /// Cancel the pending schedule. Returns true if one was pending.
    pub fn cancel(&self) -> bool {
        match self.slot().take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
