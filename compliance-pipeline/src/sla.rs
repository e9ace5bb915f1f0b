//! SLA tracking
//!
//! The tracker only records deadlines and detects breaches when swept; it
//! never notifies anyone. [`SlaMonitor`] sweeps on a fixed interval and
//! forwards breaches over a channel to whoever escalates them.

use crate::error::{PipelineError, Result};
use crate::types::{InboundEvent, Priority};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of an SLA entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaStatus {
    /// Deadline pending
    Active,
    /// Deadline passed before completion
    Breached,
    /// Completed in time
    Completed,
}

/// Tracked deadline for one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaEntry {
    /// Event ID
    pub event_id: String,
    /// Raw event type
    pub event_type: String,
    /// Priority at classification time
    pub priority: Priority,
    /// Correlation id of the delivery that scheduled the entry
    pub correlation_id: String,
    /// Subject of the event
    pub subject_id: Option<String>,
    /// When tracking started
    pub started_at: DateTime<Utc>,
    /// Deadline
    pub deadline: DateTime<Utc>,
    /// Status
    pub status: SlaStatus,
    /// When the entry stopped needing attention
    pub closed_at: Option<DateTime<Utc>>,
}

impl SlaEntry {
    fn breach(&self, detected_at: DateTime<Utc>) -> SlaBreach {
        SlaBreach {
            event_id: self.event_id.clone(),
            event_type: self.event_type.clone(),
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
            subject_id: self.subject_id.clone(),
            deadline: self.deadline,
            detected_at,
        }
    }
}

/// Breach signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaBreach {
    /// Event ID
    pub event_id: String,
    /// Raw event type
    pub event_type: String,
    /// Priority at classification time
    pub priority: Priority,
    /// Correlation id
    pub correlation_id: String,
    /// Subject of the event
    pub subject_id: Option<String>,
    /// Missed deadline
    pub deadline: DateTime<Utc>,
    /// When the breach was detected
    pub detected_at: DateTime<Utc>,
}

impl SlaBreach {
    /// How far past the deadline the breach was detected
    pub fn overdue(&self) -> ChronoDuration {
        self.detected_at - self.deadline
    }
}

/// Concurrent SLA tracker keyed by event ID
#[derive(Debug)]
pub struct SlaTracker {
    entries: DashMap<String, SlaEntry>,
    closed_retention: ChronoDuration,
}

impl SlaTracker {
    /// Create new tracker; closed entries stay queryable for `closed_retention`
    pub fn new(closed_retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            closed_retention: ChronoDuration::from_std(closed_retention)
                .unwrap_or_else(|_| ChronoDuration::hours(1)),
        }
    }

    /// Start tracking a bare deadline
    pub fn schedule(&self, event_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        self.insert(SlaEntry {
            event_id: event_id.to_string(),
            event_type: String::new(),
            priority: Priority::Low,
            correlation_id: event_id.to_string(),
            subject_id: None,
            started_at: Utc::now(),
            deadline,
            status: SlaStatus::Active,
            closed_at: None,
        })
    }

    /// Start tracking the deadline of a classified event
    pub fn schedule_event(
        &self,
        event: &InboundEvent,
        priority: Priority,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        self.insert(SlaEntry {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            priority,
            correlation_id: event.correlation_id(),
            subject_id: event.subject_id().map(str::to_string),
            started_at: Utc::now(),
            deadline,
            status: SlaStatus::Active,
            closed_at: None,
        })
    }

    /// Track an event whose deadline had already passed on arrival; the entry
    /// starts BREACHED and the breach is returned for immediate escalation.
    /// An existing entry is left untouched.
    pub fn record_overdue(
        &self,
        event: &InboundEvent,
        priority: Priority,
        deadline: DateTime<Utc>,
    ) -> Option<SlaBreach> {
        let now = Utc::now();
        let mut created = None;

        self.entries
            .entry(event.event_id.clone())
            .or_insert_with(|| {
                let entry = SlaEntry {
                    event_id: event.event_id.clone(),
                    event_type: event.event_type.clone(),
                    priority,
                    correlation_id: event.correlation_id(),
                    subject_id: event.subject_id().map(str::to_string),
                    started_at: now,
                    deadline,
                    status: SlaStatus::Breached,
                    closed_at: None,
                };
                created = Some(entry.breach(now));
                entry
            });

        if created.is_some() {
            warn!(event_id = %event.event_id, %deadline, "Event arrived past its SLA deadline");
        }
        created
    }

    fn insert(&self, entry: SlaEntry) -> Result<()> {
        let now = Utc::now();
        if entry.deadline <= now {
            return Err(PipelineError::InvalidDeadline {
                event_id: entry.event_id,
                deadline: entry.deadline,
            });
        }

        let event_id = entry.event_id.clone();
        let deadline = entry.deadline;
        let mut inserted = false;
        self.entries.entry(event_id.clone()).or_insert_with(|| {
            inserted = true;
            entry
        });

        if inserted {
            debug!(event_id = %event_id, %deadline, "SLA scheduled");
        } else {
            debug!(event_id = %event_id, "SLA already tracked, keeping original deadline");
        }
        Ok(())
    }

    /// Mark the event resolved; a breached entry stays breached
    pub fn complete(&self, event_id: &str) -> Result<SlaStatus> {
        let mut entry = self
            .entries
            .get_mut(event_id)
            .ok_or_else(|| PipelineError::SlaNotFound(event_id.to_string()))?;

        let status = entry.status;
        match status {
            SlaStatus::Active => {
                entry.status = SlaStatus::Completed;
                entry.closed_at = Some(Utc::now());
                debug!(event_id, "SLA completed in time");
            }
            SlaStatus::Breached => {
                info!(
                    event_id,
                    deadline = %entry.deadline,
                    "Event resolved after its SLA was breached"
                );
            }
            SlaStatus::Completed => {}
        }
        Ok(entry.status)
    }

    /// Current status
    pub fn status(&self, event_id: &str) -> Option<SlaStatus> {
        self.entries.get(event_id).map(|entry| entry.status)
    }

    /// Snapshot of an entry
    pub fn entry(&self, event_id: &str) -> Option<SlaEntry> {
        self.entries.get(event_id).map(|entry| entry.clone())
    }

    /// Flag overdue entries as breached and purge closed entries past retention
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<SlaBreach> {
        let mut breaches = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if entry.status == SlaStatus::Active && entry.deadline <= now {
                entry.status = SlaStatus::Breached;
                breaches.push(entry.breach(now));
            }
        }

        let retention = self.closed_retention;
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry.closed_at {
            Some(closed_at) => closed_at + retention > now,
            None => true,
        });
        let purged = before.saturating_sub(self.entries.len());

        if !breaches.is_empty() || purged > 0 {
            debug!(breaches = breaches.len(), purged, "SLA sweep");
        }
        breaches
    }

    /// Close a breached entry once its breach was escalated
    pub fn mark_handled(&self, event_id: &str) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(event_id)
            .ok_or_else(|| PipelineError::SlaNotFound(event_id.to_string()))?;

        if entry.status == SlaStatus::Breached && entry.closed_at.is_none() {
            entry.closed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Entries still waiting on their deadline
    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == SlaStatus::Active)
            .count()
    }

    /// Tracked entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Periodic breach detector
pub struct SlaMonitor;

impl SlaMonitor {
    /// Sweep `tracker` every `interval` and forward breaches to `breaches`
    /// until `cancel` fires or the receiver goes away
    pub fn spawn(
        tracker: Arc<SlaTracker>,
        interval: Duration,
        breaches: mpsc::Sender<SlaBreach>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Starting SLA monitor");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for breach in tracker.sweep(Utc::now()) {
                            warn!(
                                event_id = %breach.event_id,
                                priority = breach.priority.as_str(),
                                deadline = %breach.deadline,
                                "SLA breached"
                            );
                            if breaches.send(breach).await.is_err() {
                                warn!("Breach receiver dropped, stopping SLA monitor");
                                return;
                            }
                        }
                    }
                }
            }

            info!("SLA monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn tracker() -> SlaTracker {
        SlaTracker::new(Duration::from_secs(3_600))
    }

    #[test]
    fn test_past_deadline_rejected() {
        let err = tracker()
            .schedule("E1", Utc::now() - ChronoDuration::seconds(1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDeadline { .. }));
    }

    #[test]
    fn test_short_deadline_breaches_on_sweep() {
        let tracker = tracker();
        tracker
            .schedule("E1", Utc::now() + ChronoDuration::milliseconds(10))
            .unwrap();
        assert_eq!(tracker.status("E1"), Some(SlaStatus::Active));

        std::thread::sleep(Duration::from_millis(20));
        let breaches = tracker.sweep(Utc::now());

        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].event_id, "E1");
        assert_eq!(tracker.status("E1"), Some(SlaStatus::Breached));

        // A breach is reported once
        assert!(tracker.sweep(Utc::now()).is_empty());
    }

    #[test]
    fn test_complete_before_deadline() {
        let tracker = tracker();
        tracker
            .schedule("E1", Utc::now() + ChronoDuration::minutes(5))
            .unwrap();

        assert_eq!(tracker.complete("E1").unwrap(), SlaStatus::Completed);
        assert!(tracker.sweep(Utc::now() + ChronoDuration::minutes(10)).is_empty());
    }

    #[test]
    fn test_late_completion_stays_breached() {
        let tracker = tracker();
        tracker
            .schedule("E1", Utc::now() + ChronoDuration::minutes(5))
            .unwrap();
        tracker.sweep(Utc::now() + ChronoDuration::minutes(6));

        assert_eq!(tracker.complete("E1").unwrap(), SlaStatus::Breached);
    }

    #[test]
    fn test_reschedule_keeps_original_deadline() {
        let tracker = tracker();
        let first = Utc::now() + ChronoDuration::minutes(5);
        tracker.schedule("E1", first).unwrap();
        tracker
            .schedule("E1", Utc::now() + ChronoDuration::minutes(60))
            .unwrap();

        assert_eq!(tracker.entry("E1").unwrap().deadline, first);
    }

    #[test]
    fn test_complete_unknown_event() {
        assert!(matches!(
            tracker().complete("missing"),
            Err(PipelineError::SlaNotFound(_))
        ));
    }

    #[test]
    fn test_closed_entries_purged_after_retention() {
        let tracker = SlaTracker::new(Duration::from_secs(60));
        tracker
            .schedule("E1", Utc::now() + ChronoDuration::minutes(5))
            .unwrap();
        tracker
            .schedule("E2", Utc::now() + ChronoDuration::minutes(5))
            .unwrap();
        tracker.complete("E1").unwrap();

        tracker.sweep(Utc::now() + ChronoDuration::seconds(30));
        assert_eq!(tracker.len(), 2);

        // E2 breaches here; it stays until handled
        tracker.sweep(Utc::now() + ChronoDuration::minutes(10));
        assert_eq!(tracker.len(), 1);

        tracker.mark_handled("E2").unwrap();
        tracker.sweep(Utc::now() + ChronoDuration::minutes(10));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_overdue_event_starts_breached() {
        let tracker = tracker();
        let event = InboundEvent::new("E9", "SAR_DEADLINE", Map::new());
        let deadline = Utc::now() - ChronoDuration::hours(1);

        let breach = tracker
            .record_overdue(&event, Priority::High, deadline)
            .unwrap();
        assert_eq!(breach.deadline, deadline);
        assert!(breach.overdue() >= ChronoDuration::hours(1));
        assert_eq!(tracker.status("E9"), Some(SlaStatus::Breached));

        assert!(tracker
            .record_overdue(&event, Priority::High, deadline)
            .is_none());
    }

    #[tokio::test]
    async fn test_monitor_forwards_breaches() {
        let tracker = Arc::new(tracker());
        tracker
            .schedule("E1", Utc::now() + ChronoDuration::milliseconds(10))
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = SlaMonitor::spawn(tracker.clone(), Duration::from_millis(5), tx, cancel.clone());

        let breach = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(breach.event_id, "E1");

        cancel.cancel();
        handle.await.unwrap();
    }
}
