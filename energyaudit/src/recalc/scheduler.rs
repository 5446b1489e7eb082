use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::timer::DebounceTimer;
use super::CircuitRecalculator;
use crate::sync::CircuitChange;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecalcPhase {
    Idle,
    Scheduled,
    Recalculating,
    /// Last batch finished with at least one failure
    Error,
}

/// Progress notification sent to listeners at the start and end of a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalculationEvent {
    pub completed: bool,
    pub circuit_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type RecalculationListener = Arc<dyn Fn(&RecalculationEvent) + Send + Sync>;

#[derive(Debug)]
struct SchedulerState {
    phase: RecalcPhase,
    enabled: bool,
    pending: BTreeSet<String>,
    last_error: Option<String>,
}

struct SchedulerInner {
    recalculator: Arc<dyn CircuitRecalculator>,
    debounce: Duration,
    state: Mutex<SchedulerState>,
    listeners: Mutex<Vec<(u64, RecalculationListener)>>,
    next_listener: AtomicU64,
    timer: DebounceTimer,
}

/// Debounced batch recalculation of edited circuits.
///
/// Edits arriving within the debounce window are coalesced; circuits in a
/// batch are processed one at a time so that disabling takes effect between
/// circuits.
#[derive(Clone)]
pub struct RecalculationScheduler {
    inner: Arc<SchedulerInner>,
}

impl RecalculationScheduler {
    pub fn new(recalculator: Arc<dyn CircuitRecalculator>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                recalculator,
                debounce,
                state: Mutex::new(SchedulerState {
                    phase: RecalcPhase::Idle,
                    enabled: true,
                    pending: BTreeSet::new(),
                    last_error: None,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                timer: DebounceTimer::new(),
            }),
        }
    }

    /// Record edited circuits and restart the debounce window
    pub fn notify_change<I, S>(&self, circuit_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.inner.state();
        state.pending.extend(circuit_ids.into_iter().map(Into::into));
        if !state.enabled {
            debug!("Recalculation disabled, {} circuits pending", state.pending.len());
            return;
        }
        if state.phase == RecalcPhase::Recalculating {
            return;
        }
        if state.pending.is_empty() {
            return;
        }
        state.phase = RecalcPhase::Scheduled;
        drop(state);
        SchedulerInner::arm(&self.inner);
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.inner.state();
        state.enabled = enabled;
        if !enabled {
            if state.phase == RecalcPhase::Scheduled {
                self.inner.timer.cancel();
                state.phase = RecalcPhase::Idle;
            }
            return;
        }
        if !state.pending.is_empty() && state.phase != RecalcPhase::Recalculating {
            state.phase = RecalcPhase::Scheduled;
            drop(state);
            SchedulerInner::arm(&self.inner);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state().enabled
    }

    pub fn phase(&self) -> RecalcPhase {
        self.inner.state().phase.clone()
    }

    pub fn pending(&self) -> Vec<String> {
        self.inner.state().pending.iter().cloned().collect()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state().last_error.clone()
    }

    /// Register a listener. Registering the same `Arc` again returns a
    /// handle to the existing registration.
    pub fn add_listener(&self, listener: RecalculationListener) -> Subscription {
        let mut listeners = self.inner.listeners();
        let id = match listeners.iter().find(|(_, l)| Arc::ptr_eq(l, &listener)) {
            Some((id, _)) => *id,
            None => {
                let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
                listeners.push((id, listener));
                id
            }
        };
        Subscription {
            id,
            scheduler: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }

    /// Forward engine change notifications until the channel closes or the
    /// scheduler is dropped
    pub fn watch(&self, mut changes: broadcast::Receiver<CircuitChange>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let Some(inner) = weak.upgrade() else { break };
                        RecalculationScheduler { inner }.notify_change(change.circuit_ids);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Recalculation watcher lagged, {} change notifications dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, RecalculationListener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        this.timer.schedule(this.debounce, move || {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(SchedulerInner::run_batch(inner));
            }
        });
    }

    fn emit(&self, event: &RecalculationEvent) {
        let listeners: Vec<RecalculationListener> = self.listeners().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(event);
        }
    }

    async fn run_batch(inner: Arc<SchedulerInner>) {
        let batch: Vec<String> = {
            let mut state = inner.state();
            if !state.enabled || state.phase == RecalcPhase::Recalculating {
                return;
            }
            if state.pending.is_empty() {
                state.phase = RecalcPhase::Idle;
                return;
            }
            state.phase = RecalcPhase::Recalculating;
            std::mem::take(&mut state.pending).into_iter().collect()
        };

        info!("Recalculating {} circuits", batch.len());
        inner.emit(&RecalculationEvent {
            completed: false,
            circuit_ids: batch.clone(),
            error: None,
        });

        let mut attempted = Vec::with_capacity(batch.len());
        let mut errors = Vec::new();
        for (idx, circuit_id) in batch.iter().enumerate() {
            let enabled = inner.state().enabled;
            if !enabled {
                let mut state = inner.state();
                state.pending.extend(batch[idx..].iter().cloned());
                debug!("Recalculation disabled mid-batch, {} circuits deferred", batch.len() - idx);
                break;
            }
            if let Err(e) = inner.recalculator.recalculate(circuit_id).await {
                warn!("Recalculation of {} failed: {}", circuit_id, e);
                errors.push(format!("{}: {}", circuit_id, e));
            }
            attempted.push(circuit_id.clone());
        }

        let error = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };
        let reschedule = {
            let mut state = inner.state();
            state.phase = if error.is_some() {
                RecalcPhase::Error
            } else {
                RecalcPhase::Idle
            };
            state.last_error = error.clone();
            if state.enabled && !state.pending.is_empty() {
                state.phase = RecalcPhase::Scheduled;
                true
            } else {
                false
            }
        };

        inner.emit(&RecalculationEvent {
            completed: true,
            circuit_ids: attempted,
            error,
        });

        if reschedule {
            SchedulerInner::arm(&inner);
        }
    }
}

/// Handle to a registered listener; dropping it unregisters the listener
pub struct Subscription {
    id: u64,
    scheduler: Weak<SchedulerInner>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the listener. Returns false if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        let Some(inner) = self.scheduler.upgrade() else {
            return false;
        };
        let mut listeners = inner.listeners();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        listeners.len() != before
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recalc::RecalculationError;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail: Option<String>,
    }

    #[async_trait]
    impl CircuitRecalculator for Recorder {
        async fn recalculate(&self, circuit_id: &str) -> Result<(), RecalculationError> {
            self.calls.lock().unwrap().push(circuit_id.to_string());
            if self.fail.as_deref() == Some(circuit_id) {
                return Err(RecalculationError::UnknownCircuit(circuit_id.to_string()));
            }
            Ok(())
        }
    }

    fn scheduler(recorder: Arc<Recorder>) -> RecalculationScheduler {
        RecalculationScheduler::new(recorder, Duration::from_millis(750))
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_edits() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = scheduler(recorder.clone());

        scheduler.notify_change(["P-1-L1"]);
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.notify_change(["P-1-L2", "P-1-L1"]);
        assert_eq!(scheduler.phase(), RecalcPhase::Scheduled);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(recorder.calls.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["P-1-L1", "P-1-L2"]);
        assert_eq!(scheduler.phase(), RecalcPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_events_and_errors() {
        let recorder = Arc::new(Recorder {
            fail: Some("bad".to_string()),
            ..Recorder::default()
        });
        let scheduler = scheduler(recorder);
        let seen: Arc<Mutex<Vec<RecalculationEvent>>> = Arc::default();
        let sink = seen.clone();
        let listener: RecalculationListener = Arc::new(move |e: &RecalculationEvent| {
            sink.lock().unwrap().push(e.clone());
        });
        let _first = scheduler.add_listener(listener.clone());
        let _second = scheduler.add_listener(listener);
        assert_eq!(scheduler.listener_count(), 1);

        scheduler.notify_change(["bad", "good"]);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].completed);
        assert!(seen[1].completed);
        assert!(seen[1].error.as_deref().unwrap_or_default().contains("bad"));
        assert_eq!(scheduler.phase(), RecalcPhase::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_scheduled_batch() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = scheduler(recorder.clone());

        scheduler.notify_change(["P-1"]);
        scheduler.set_enabled(false);
        assert_eq!(scheduler.phase(), RecalcPhase::Idle);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(recorder.calls.lock().unwrap().is_empty());
        assert_eq!(scheduler.pending(), vec!["P-1"]);

        scheduler.set_enabled(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["P-1"]);
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let scheduler = scheduler(Arc::new(Recorder::default()));
        let sub = scheduler.add_listener(Arc::new(|_: &RecalculationEvent| {}));
        assert_eq!(scheduler.listener_count(), 1);
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert_eq!(scheduler.listener_count(), 0);

        {
            let _sub = scheduler.add_listener(Arc::new(|_: &RecalculationEvent| {}));
            assert_eq!(scheduler.listener_count(), 1);
        }
        assert_eq!(scheduler.listener_count(), 0);
    }
}
