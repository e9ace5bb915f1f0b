//! Collaborator interfaces: dead-letter, audit, notification, ack, enrichment
//!
//! Each trait has an in-memory implementation that records what it received;
//! tests assert on those records and the binary uses them alongside
//! [`JsonLinesSink`].

use crate::error::{PipelineError, Result};
use crate::types::{AuditRecord, Channel, DeadLetterRecord, Enrichment, InboundEvent, Notice};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Terminal store for events that could not be processed
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Publish a dead-letter record
    async fn publish(&self, record: DeadLetterRecord) -> Result<()>;
}

/// Audit trail
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append an audit record
    async fn record(&self, record: AuditRecord) -> Result<()>;
}

/// Notification delivery
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a notice on a logical channel
    async fn notify(&self, channel: Channel, notice: Notice) -> Result<()>;
}

/// Transport acknowledgement
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge a delivery so it is not redelivered
    async fn ack(&self, event: &InboundEvent) -> Result<()>;
}

/// Supplies risk data the classifier uses
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Enrichment for the event's subject
    async fn enrich(&self, event: &InboundEvent) -> Result<Enrichment>;
}

/// Enricher that knows nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnrichment;

#[async_trait]
impl Enricher for NoEnrichment {
    async fn enrich(&self, _event: &InboundEvent) -> Result<Enrichment> {
        Ok(Enrichment::default())
    }
}

/// Enricher backed by a subject → enrichment table
#[derive(Debug, Default)]
pub struct StaticEnricher {
    subjects: DashMap<String, Enrichment>,
}

impl StaticEnricher {
    /// Create empty enricher
    pub fn new() -> Self {
        Self::default()
    }

    /// Set enrichment for a subject
    pub fn insert(&self, subject_id: impl Into<String>, enrichment: Enrichment) {
        self.subjects.insert(subject_id.into(), enrichment);
    }
}

#[async_trait]
impl Enricher for StaticEnricher {
    async fn enrich(&self, event: &InboundEvent) -> Result<Enrichment> {
        Ok(event
            .subject_id()
            .and_then(|subject| self.subjects.get(subject).map(|e| e.clone()))
            .unwrap_or_default())
    }
}

/// Fails the next `n` calls, then succeeds
#[derive(Debug, Default)]
struct FailureBudget(AtomicU32);

impl FailureBudget {
    fn set(&self, n: u32) {
        self.0.store(n, Ordering::SeqCst);
    }

    fn take(&self, sink: &str) -> Result<()> {
        let remaining = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(PipelineError::Sink(format!("{} unavailable", sink))),
            Err(_) => Ok(()),
        }
    }
}

/// Records dead-letter records in memory
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
    failures: FailureBudget,
}

impl InMemoryDeadLetterSink {
    /// Create empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Published records
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }

    /// Fail the next `n` publishes
    pub fn fail_next(&self, n: u32) {
        self.failures.set(n);
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn publish(&self, record: DeadLetterRecord) -> Result<()> {
        self.failures.take("dead-letter sink")?;
        debug!(correlation_id = %record.correlation_id, "Dead-letter record stored");
        self.records.lock().push(record);
        Ok(())
    }
}

/// Records audit entries in memory
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    failures: FailureBudget,
}

impl InMemoryAuditSink {
    /// Create empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded entries
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Fail the next `n` writes
    pub fn fail_next(&self, n: u32) {
        self.failures.set(n);
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        self.failures.take("audit sink")?;
        self.records.lock().push(record);
        Ok(())
    }
}

/// Records notices in memory
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    notices: Mutex<Vec<(Channel, Notice)>>,
    failures: FailureBudget,
}

impl InMemoryNotificationSink {
    /// Create empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivered notices
    pub fn notices(&self) -> Vec<(Channel, Notice)> {
        self.notices.lock().clone()
    }

    /// Notices delivered on one channel
    pub fn on_channel(&self, channel: Channel) -> Vec<Notice> {
        self.notices
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Fail the next `n` deliveries
    pub fn fail_next(&self, n: u32) {
        self.failures.set(n);
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(&self, channel: Channel, notice: Notice) -> Result<()> {
        self.failures.take("notification sink")?;
        self.notices.lock().push((channel, notice));
        Ok(())
    }
}

/// Records acknowledged event ids
#[derive(Debug, Default)]
pub struct InMemoryAcknowledger {
    acked: Mutex<Vec<String>>,
}

impl InMemoryAcknowledger {
    /// Create empty acknowledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledged event ids, in order
    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().clone()
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(&self, event: &InboundEvent) -> Result<()> {
        self.acked.lock().push(event.event_id.clone());
        Ok(())
    }
}

/// Writes every record as one tagged JSON line on stdout
#[derive(Debug)]
pub struct JsonLinesSink {
    out: tokio::sync::Mutex<tokio::io::Stdout>,
}

impl JsonLinesSink {
    /// Sink over the process stdout
    pub fn stdout() -> Self {
        Self {
            out: tokio::sync::Mutex::new(tokio::io::stdout()),
        }
    }

    async fn write<T: Serialize>(&self, kind: &str, body: &T) -> Result<()> {
        let mut line = serde_json::to_vec(&json!({ "kind": kind, "record": body }))
            .map_err(|e| PipelineError::Sink(format!("Failed to encode {}: {}", kind, e)))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| PipelineError::Sink(format!("Failed to write {}: {}", kind, e)))?;
        out.flush()
            .await
            .map_err(|e| PipelineError::Sink(format!("Failed to flush {}: {}", kind, e)))
    }
}

#[async_trait]
impl DeadLetterSink for JsonLinesSink {
    async fn publish(&self, record: DeadLetterRecord) -> Result<()> {
        self.write("dead_letter", &record).await
    }
}

#[async_trait]
impl AuditSink for JsonLinesSink {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        self.write("audit", &record).await
    }
}

#[async_trait]
impl NotificationSink for JsonLinesSink {
    async fn notify(&self, channel: Channel, notice: Notice) -> Result<()> {
        self.write("notification", &json!({ "channel": channel, "notice": notice }))
            .await
    }
}

#[async_trait]
impl Acknowledger for JsonLinesSink {
    async fn ack(&self, event: &InboundEvent) -> Result<()> {
        self.write(
            "ack",
            &json!({
                "eventId": event.event_id,
                "partition": event.partition,
                "offset": event.offset,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Enrichment, Severity};
    use serde_json::{Map, Value};

    fn notice() -> Notice {
        Notice {
            title: "SLA breached".to_string(),
            message: "E1 missed its deadline".to_string(),
            severity: Severity::Critical,
            structured_context: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_notification_failure_injection() {
        let sink = InMemoryNotificationSink::new();
        sink.fail_next(1);

        assert!(sink.notify(Channel::Critical, notice()).await.is_err());
        assert!(sink.notify(Channel::Critical, notice()).await.is_ok());
        assert_eq!(sink.on_channel(Channel::Critical).len(), 1);
        assert!(sink.on_channel(Channel::Standard).is_empty());
    }

    #[tokio::test]
    async fn test_static_enricher_by_subject() {
        let enricher = StaticEnricher::new();
        enricher.insert(
            "C-1",
            Enrichment {
                pep_match: true,
                ..Enrichment::default()
            },
        );

        let mut payload = Map::new();
        payload.insert("customerId".to_string(), Value::from("C-1"));
        let known = InboundEvent::new("E1", "AML_ALERT", payload);
        let unknown = InboundEvent::new("E2", "AML_ALERT", Map::new());

        assert!(enricher.enrich(&known).await.unwrap().pep_match);
        assert_eq!(enricher.enrich(&unknown).await.unwrap(), Enrichment::default());
    }
}
