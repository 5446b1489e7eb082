use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

use super::types::{EventSource, SyncEvent, SyncEventKind, SyncEventType};

/// Longest `max_age_days` a configuration may ask for
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Bounds on how much history the log keeps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_events: usize,
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    /// Events older than the returned instant have expired. `None` when
    /// nothing expires.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = self.max_age_days?;
        now.checked_sub_signed(Duration::days(i64::from(days)))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_events: 1000,
            max_age_days: None,
        }
    }
}

/// Query over the event log. An empty filter matches every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventFilter {
    pub types: Vec<SyncEventType>,
    pub sources: Vec<EventSource>,
    /// Inclusive, compared against the event's UTC date
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Case-insensitive substring of the serialized event
    pub search: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = SyncEventType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = EventSource>) -> Self {
        self.sources = sources.into_iter().collect();
        self
    }

    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &SyncEvent, needle: Option<&str>) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type()) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&event.source) {
            return false;
        }
        let day = event.timestamp.date_naive();
        if self.start_date.is_some_and(|start| day < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| day > end) {
            return false;
        }
        match needle {
            Some(needle) => serde_json::to_string(event)
                .map(|json| json.to_lowercase().contains(needle))
                .unwrap_or(false),
            None => true,
        }
    }
}

/// One page of query results plus the filtered total
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<SyncEvent>,
    pub total: usize,
}

#[derive(Debug, Default)]
struct LogInner {
    events: VecDeque<SyncEvent>,
    next_seq: u64,
    pinned: HashSet<u64>,
}

/// Append-only, bounded history of synchronization activity.
///
/// Sequence numbers are assigned under the log lock, so log order is the
/// order in which operations completed.
#[derive(Debug)]
pub struct SyncEventLog {
    inner: Mutex<LogInner>,
    policy: RetentionPolicy,
}

impl Default for SyncEventLog {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl SyncEventLog {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                next_seq: 1,
                ..LogInner::default()
            }),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Record an event and return its sequence number
    pub fn append(&self, source: EventSource, kind: SyncEventKind) -> u64 {
        self.append_at(source, kind, Utc::now())
    }

    fn append_at(&self, source: EventSource, kind: SyncEventKind, timestamp: DateTime<Utc>) -> u64 {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.events.push_back(SyncEvent {
            seq,
            timestamp,
            source,
            kind,
        });
        self.evict(&mut inner, Utc::now());
        seq
    }

    fn evict(&self, inner: &mut LogInner, now: DateTime<Utc>) {
        let max_events = self.policy.max_events.max(1);
        let cutoff = self.policy.cutoff(now);

        let mut idx = 0;
        while idx < inner.events.len() {
            let event = &inner.events[idx];
            let over_count = inner.events.len() > max_events;
            let expired = cutoff.is_some_and(|c| event.timestamp < c);
            if !over_count && !expired {
                break;
            }
            if inner.pinned.contains(&event.seq) {
                idx += 1;
                continue;
            }
            inner.events.remove(idx);
        }

        if inner.events.len() > max_events {
            warn!(
                "Event log holds {} events (limit {}): remaining events are pinned by open conflicts",
                inner.events.len(),
                max_events
            );
        }
    }

    /// Keep `seq` through eviction until unpinned
    pub fn pin(&self, seq: u64) {
        self.lock().pinned.insert(seq);
    }

    pub fn unpin(&self, seq: u64) {
        self.lock().pinned.remove(&seq);
    }

    pub fn query(&self, filter: &EventFilter) -> EventPage {
        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let inner = self.lock();
        let matching: Vec<&SyncEvent> = inner
            .events
            .iter()
            .filter(|e| filter.matches(e, needle.as_deref()))
            .collect();
        let total = matching.len();
        let limit = filter.limit.unwrap_or(usize::MAX);
        let events = matching
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect();

        EventPage { events, total }
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.lock().events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, event_type: SyncEventType) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::UpdateReason;

    fn updated(id: &str) -> SyncEventKind {
        SyncEventKind::CircuitUpdated {
            circuit_id: id.to_string(),
            reason: UpdateReason::Edit,
        }
    }

    #[test]
    fn test_seq_is_monotonic() {
        let log = SyncEventLog::default();
        let a = log.append(EventSource::User, SyncEventKind::SyncRequested { manual: true });
        let b = log.append(EventSource::System, updated("P-1"));
        assert!(b > a);
        let events = log.events();
        assert_eq!(events[0].seq, a);
        assert_eq!(events[1].seq, b);
    }

    #[test]
    fn test_pagination_total() {
        let log = SyncEventLog::default();
        for i in 0..23 {
            log.append(EventSource::ScheduleOfLoads, updated(&format!("P-1-L{}", i)));
        }
        let page = log.query(&EventFilter::new().page(20, 10));
        assert_eq!(page.events.len(), 3);
        assert_eq!(page.total, 23);
    }

    #[test]
    fn test_filter_by_type_source_and_search() {
        let log = SyncEventLog::default();
        log.append(EventSource::User, SyncEventKind::SyncRequested { manual: true });
        log.append(EventSource::ScheduleOfLoads, updated("P-1-L1"));
        log.append(EventSource::VoltageDrop, updated("vd-Feeder"));

        let page = log.query(&EventFilter::new().with_types([SyncEventType::CircuitUpdated]));
        assert_eq!(page.total, 2);

        let page = log.query(&EventFilter::new().with_sources([EventSource::User]));
        assert_eq!(page.total, 1);

        let page = log.query(&EventFilter::new().with_search("VD-FEEDER"));
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].source, EventSource::VoltageDrop);
    }

    #[test]
    fn test_date_bounds_are_inclusive() {
        let log = SyncEventLog::default();
        log.append(EventSource::System, updated("P-1"));
        let today = Utc::now().date_naive();

        let page = log.query(&EventFilter::new().between(Some(today), Some(today)));
        assert_eq!(page.total, 1);

        let tomorrow = today.succ_opt().unwrap();
        let page = log.query(&EventFilter::new().between(Some(tomorrow), None));
        assert_eq!(page.total, 0);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let log = SyncEventLog::new(RetentionPolicy {
            max_events: 5,
            max_age_days: None,
        });
        for i in 0..8 {
            log.append(EventSource::System, updated(&i.to_string()));
        }
        let events = log.events();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].seq, 4);
    }

    #[test]
    fn test_pinned_events_survive_eviction() {
        let log = SyncEventLog::new(RetentionPolicy {
            max_events: 3,
            max_age_days: None,
        });
        let pinned = log.append(EventSource::System, updated("vd-a"));
        log.pin(pinned);
        for i in 0..5 {
            log.append(EventSource::System, updated(&i.to_string()));
        }
        let events = log.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].seq, pinned);

        log.unpin(pinned);
        log.append(EventSource::System, updated("next"));
        assert!(log.events().iter().all(|e| e.seq != pinned));
    }

    #[test]
    fn test_expired_events_are_evicted() {
        let log = SyncEventLog::new(RetentionPolicy {
            max_events: 100,
            max_age_days: Some(30),
        });
        let old = Utc::now() - Duration::days(45);
        log.append_at(EventSource::System, updated("stale"), old);
        log.append_at(EventSource::System, updated("recent"), Utc::now() - Duration::days(2));
        log.append(EventSource::System, updated("now"));

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.timestamp > old));
    }

    #[test]
    fn test_pinned_event_outlives_max_age() {
        let log = SyncEventLog::new(RetentionPolicy {
            max_events: 100,
            max_age_days: Some(30),
        });
        let old = Utc::now() - Duration::days(45);
        let pinned = log.append_at(EventSource::System, updated("vd-a"), old);
        log.pin(pinned);
        log.append_at(EventSource::System, updated("vd-b"), old);
        log.append(EventSource::System, updated("now"));

        let seqs: Vec<u64> = log.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![pinned, 3]);

        log.unpin(pinned);
        log.append(EventSource::System, updated("next"));
        assert!(log.events().iter().all(|e| e.seq != pinned));
    }

    #[test]
    fn test_huge_max_age_never_expires() {
        let policy = RetentionPolicy {
            max_events: 10,
            max_age_days: Some(200_000_000),
        };
        assert_eq!(policy.cutoff(Utc::now()), None);

        let log = SyncEventLog::new(policy);
        log.append(EventSource::System, SyncEventKind::SyncRequested { manual: true });
        log.append(EventSource::System, updated("P-1"));
        assert_eq!(log.len(), 2);
    }
}
