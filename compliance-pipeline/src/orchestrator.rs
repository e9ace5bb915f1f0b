//! Pipeline orchestrator
//!
//! Drives one delivery through dedup, classification, SLA scheduling and the
//! domain handler, then commits the terminal outcome: ledger mark, SLA
//! completion, notifications, audit and ack on success; dead-letter, routing,
//! emergency notification, audit and ack on failure.
//!
//! The ledger is marked after the effect and before the ack. A crash between
//! effect and mark re-runs the effect on redelivery; a crash between mark and
//! ack skips the redelivery as a duplicate.

use crate::classifier::Classifier;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::escalation::EscalationRouter;
use crate::handlers::{EffectReceipt, HandlerRegistry};
use crate::ledger::IdempotencyLedger;
use crate::metrics::PipelineMetrics;
use crate::sinks::{Acknowledger, AuditSink, DeadLetterSink, Enricher, NoEnrichment, NotificationSink};
use crate::sla::{SlaBreach, SlaTracker};
use crate::types::{
    AuditOutcome, AuditRecord, Channel, ClassificationResult, DeadLetterRecord, Destination,
    Enrichment, EventFamily, EventType, InboundEvent, Notice, Severity,
};
use chrono::{Duration as ChronoDuration, Utc};
use resilience::{RetryCoordinator, StopReason};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Terminal outcome of a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Effect already committed for this dedup key
    Duplicate,
    /// Effect committed now
    Processed {
        /// Handler attempts made
        attempts: u32,
        /// Service receipt
        receipt: EffectReceipt,
    },
    /// Event dead-lettered
    DeadLettered {
        /// Handler attempts made (0 when the handler never ran)
        attempts: u32,
        /// Final error
        error: PipelineError,
    },
}

impl Outcome {
    /// Label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Duplicate => "duplicate",
            Outcome::Processed { .. } => "processed",
            Outcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// What the transport should do with the delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Terminal outcome reached; the delivery was acknowledged
    Ack(Outcome),
    /// Shutdown interrupted processing; leave unacknowledged for redelivery
    Redeliver,
}

impl Disposition {
    /// Outcome, when acknowledged
    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            Disposition::Ack(outcome) => Some(outcome),
            Disposition::Redeliver => None,
        }
    }
}

/// Failure that ends processing of a delivery
struct Terminal {
    error: PipelineError,
    attempts: u32,
    max_attempts: u32,
}

impl Terminal {
    fn before_handler(error: PipelineError) -> Self {
        Self {
            error,
            attempts: 0,
            max_attempts: 0,
        }
    }
}

/// Compliance event pipeline
pub struct Pipeline {
    config: PipelineConfig,
    ledger: IdempotencyLedger,
    classifier: Classifier,
    sla: Arc<SlaTracker>,
    coordinator: RetryCoordinator,
    router: EscalationRouter,
    handlers: HandlerRegistry,
    enricher: Arc<dyn Enricher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    audit: Arc<dyn AuditSink>,
    notifications: Arc<dyn NotificationSink>,
    acknowledger: Arc<dyn Acknowledger>,
    metrics: Option<PipelineMetrics>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Start building a pipeline
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Process one delivery to a terminal outcome (or back to the transport)
    pub async fn process(&self, event: InboundEvent) -> Disposition {
        let started = Instant::now();
        let correlation_id = event.correlation_id();
        debug!(
            event_id = %event.event_id,
            correlation_id = %correlation_id,
            attempt_count = event.attempt_count,
            "Processing event"
        );

        let dedup_key = IdempotencyLedger::dedup_key(&event);
        if self.ledger.has_processed(&dedup_key) {
            info!(
                event_id = %event.event_id,
                correlation_id = %correlation_id,
                "Duplicate event, already processed"
            );
            self.ack(&event).await;
            self.record_outcome(&event, &Outcome::Duplicate, started);
            return Disposition::Ack(Outcome::Duplicate);
        }

        let event_type = match event.parsed_type() {
            Ok(event_type) => event_type,
            Err(e) => {
                let classification = self.classifier.fallback(None);
                let outcome = self
                    .fail(&event, &classification, Terminal::before_handler(e))
                    .await;
                self.record_outcome(&event, &outcome, started);
                return Disposition::Ack(outcome);
            }
        };
        let family = event_type.family();

        let enrichment = match self.enricher.enrich(&event).await {
            Ok(enrichment) => enrichment,
            Err(e) => {
                warn!(
                    event_id = %event.event_id,
                    "Enrichment unavailable, classifying on payload only: {}",
                    e
                );
                Enrichment::default()
            }
        };

        let classification = match self.classifier.classify(&event, &enrichment) {
            Ok(classification) => classification,
            Err(e) => {
                let classification = self.classifier.fallback(Some(event_type));
                let outcome = self
                    .fail(&event, &classification, Terminal::before_handler(e))
                    .await;
                self.record_outcome(&event, &outcome, started);
                return Disposition::Ack(outcome);
            }
        };

        self.schedule_sla(&event, family, &classification).await;

        let outcome = match self.run_handler(&event, family, &classification).await {
            Ok((receipt, attempts)) => {
                self.succeed(&event, family, &dedup_key, &classification, receipt, attempts)
                    .await
            }
            Err(None) => {
                info!(
                    event_id = %event.event_id,
                    correlation_id = %correlation_id,
                    "Shutdown during retries, leaving event for redelivery"
                );
                return Disposition::Redeliver;
            }
            Err(Some(terminal)) => self.fail(&event, &classification, terminal).await,
        };

        self.record_outcome(&event, &outcome, started);
        Disposition::Ack(outcome)
    }

    /// Dead-letter and audit an envelope that could not be parsed
    ///
    /// The record carries a salvaged envelope with the raw input in its
    /// payload. A recognisable critical type is still escalated as critical.
    pub async fn reject(&self, raw: &[u8], error: PipelineError) -> Outcome {
        let started = Instant::now();
        let event = InboundEvent::salvage(raw);
        let classification = self.classifier.fallback(event.parsed_type().ok());
        let outcome = self
            .fail(&event, &classification, Terminal::before_handler(error))
            .await;
        self.record_outcome(&event, &outcome, started);
        outcome
    }

    /// Re-enter a dead-lettered event (manual replay)
    pub async fn replay(&self, record: DeadLetterRecord) -> Disposition {
        let event = record.original_event.redelivered();
        info!(
            event_id = %event.event_id,
            previous_error = %record.failure_reason,
            attempt_count = event.attempt_count,
            "Replaying dead-lettered event"
        );
        self.process(event).await
    }

    /// Escalate and audit an SLA breach, then close its entry
    pub async fn handle_breach(&self, breach: SlaBreach) {
        let overdue_secs = breach.overdue().num_seconds();
        warn!(
            event_id = %breach.event_id,
            correlation_id = %breach.correlation_id,
            priority = breach.priority.as_str(),
            overdue_secs,
            "Escalating SLA breach"
        );

        let context = json!({
            "eventId": breach.event_id,
            "eventType": breach.event_type,
            "priority": breach.priority,
            "deadline": breach.deadline,
            "detectedAt": breach.detected_at,
            "correlationId": breach.correlation_id,
        });

        for destination in self.router.route_breach(&breach) {
            let channel = match destination.channel() {
                Some(channel) => channel,
                None => continue,
            };
            let severity = match channel {
                Channel::Standard => Severity::Warning,
                Channel::Critical | Channel::Executive => Severity::Critical,
            };
            let notice = Notice {
                title: format!("SLA breached: {} {}", breach.event_type, breach.event_id),
                message: format!(
                    "{} priority event missed its deadline {} ({}s overdue)",
                    breach.priority.as_str(),
                    breach.deadline,
                    overdue_secs
                ),
                severity,
                structured_context: context.clone(),
            };
            self.notify(channel, notice, &breach.correlation_id).await;
        }

        let mut extra = Map::new();
        extra.insert("priority".to_string(), Value::from(breach.priority.as_str()));
        extra.insert("deadline".to_string(), Value::from(breach.deadline.to_rfc3339()));
        extra.insert("overdueSeconds".to_string(), Value::from(overdue_secs));
        self.emit_audit(AuditRecord {
            record_id: Uuid::now_v7(),
            event_type: breach.event_type.clone(),
            subject_id: breach.subject_id.clone(),
            outcome: AuditOutcome::SlaBreached,
            correlation_id: breach.correlation_id.clone(),
            timestamp: Utc::now(),
            extra,
        })
        .await;

        if let Some(metrics) = &self.metrics {
            let family = breach
                .event_type
                .parse::<EventType>()
                .map(|t| t.family().domain())
                .unwrap_or("unknown");
            metrics.record_sla_breach(family);
        }

        if let Err(e) = self.sla.mark_handled(&breach.event_id) {
            debug!(event_id = %breach.event_id, "Breach entry already gone: {}", e);
        }
    }

    /// Consume breaches from the SLA monitor until its channel closes
    pub fn spawn_breach_escalation(
        self: Arc<Self>,
        mut breaches: mpsc::Receiver<SlaBreach>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(breach) = breaches.recv().await {
                self.handle_breach(breach).await;
            }
            debug!("Breach channel closed");
        })
    }

    /// SLA tracker
    pub fn sla(&self) -> &Arc<SlaTracker> {
        &self.sla
    }

    /// Idempotency ledger
    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Retry coordinator (breaker state)
    pub fn coordinator(&self) -> &RetryCoordinator {
        &self.coordinator
    }

    /// Metrics, when enabled
    pub fn metrics(&self) -> Option<&PipelineMetrics> {
        self.metrics.as_ref()
    }

    /// Configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Token that stops retries when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn schedule_sla(
        &self,
        event: &InboundEvent,
        family: EventFamily,
        classification: &ClassificationResult,
    ) {
        if !self.config.sla.table_for(family).enabled {
            return;
        }

        let now = Utc::now();
        let mut deadline = now + ChronoDuration::minutes(i64::from(classification.sla_minutes));
        if family == EventFamily::SarDeadline {
            if let Ok(Some(filing_deadline)) = event.timestamp_field("filingDeadline") {
                deadline = deadline.min(filing_deadline);
            }
        }

        if deadline <= now {
            if let Some(breach) = self
                .sla
                .record_overdue(event, classification.priority, deadline)
            {
                self.handle_breach(breach).await;
            }
            return;
        }

        if let Err(e) = self
            .sla
            .schedule_event(event, classification.priority, deadline)
        {
            warn!(event_id = %event.event_id, "SLA not scheduled: {}", e);
        }
    }

    /// `Err(None)` means cancelled
    async fn run_handler(
        &self,
        event: &InboundEvent,
        family: EventFamily,
        classification: &ClassificationResult,
    ) -> std::result::Result<(EffectReceipt, u32), Option<Terminal>> {
        let handler = self.handlers.get(family).ok_or_else(|| {
            Some(Terminal::before_handler(PipelineError::Config(format!(
                "No handler registered for {} events",
                family.domain()
            ))))
        })?;

        handler
            .validate(event)
            .map_err(|e| Some(Terminal::before_handler(e)))?;

        let dependency = handler.dependency().to_string();
        let policy = self.config.retry.policy_for(family);
        let handler_ref = &handler;

        let result = self
            .coordinator
            .execute(&dependency, policy, &self.cancel, move |attempt| {
                debug!(event_id = %event.event_id, attempt, "Invoking handler");
                handler_ref.handle(event, classification)
            })
            .await;

        if let Some(metrics) = &self.metrics {
            let attempts = match &result {
                Ok(success) => success.attempts,
                Err(failure) => failure.attempts,
            };
            metrics.record_retries(&dependency, attempts);
            metrics.set_circuit_state(&dependency, self.coordinator.circuit_state(&dependency));
        }

        match result {
            Ok(success) => Ok((success.value, success.attempts)),
            Err(failure) if failure.stop == StopReason::Cancelled => Err(None),
            Err(failure) => Err(Some(Terminal {
                error: failure.error,
                attempts: failure.attempts,
                max_attempts: failure.max_attempts,
            })),
        }
    }

    async fn succeed(
        &self,
        event: &InboundEvent,
        family: EventFamily,
        dedup_key: &str,
        classification: &ClassificationResult,
        receipt: EffectReceipt,
        attempts: u32,
    ) -> Outcome {
        let correlation_id = event.correlation_id();

        self.ledger.mark_processed(dedup_key, family);
        if let Some(metrics) = &self.metrics {
            metrics.set_ledger_entries(self.ledger.len());
        }

        if self.config.sla.table_for(family).enabled {
            if let Err(e) = self.sla.complete(&event.event_id) {
                debug!(event_id = %event.event_id, "No SLA to complete: {}", e);
            }
        }

        let context = Self::event_context(event, classification);
        for destination in self.router.route(event, classification, None) {
            let channel = match destination.channel() {
                Some(channel) => channel,
                None => continue,
            };
            let notice = Notice {
                title: format!(
                    "{} {} for {}",
                    classification.priority.as_str(),
                    event.event_type,
                    classification.escalation_target
                ),
                message: format!(
                    "Event {} processed (ref {}), actions: {}",
                    event.event_id,
                    receipt.reference,
                    Self::actions_label(classification)
                ),
                severity: Severity::from(classification.priority),
                structured_context: context.clone(),
            };
            self.notify(channel, notice, &correlation_id).await;
        }

        self.emit_audit(
            AuditRecord::for_event(event, AuditOutcome::Success)
                .with("priority", classification.priority.as_str())
                .with("escalationTarget", classification.escalation_target.clone())
                .with("attempts", attempts)
                .with("reference", receipt.reference.clone())
                .with("matchedRules", classification.matched_rules.clone()),
        )
        .await;

        self.ack(event).await;

        info!(
            event_id = %event.event_id,
            correlation_id = %correlation_id,
            priority = classification.priority.as_str(),
            attempts,
            "Event processed"
        );
        Outcome::Processed { attempts, receipt }
    }

    async fn fail(
        &self,
        event: &InboundEvent,
        classification: &ClassificationResult,
        terminal: Terminal,
    ) -> Outcome {
        let correlation_id = event.correlation_id();
        let Terminal {
            error: failure,
            attempts,
            max_attempts,
        } = terminal;

        let record = DeadLetterRecord {
            original_event: event.clone(),
            failure_reason: failure.to_string(),
            failure_kind: failure.kind().to_string(),
            correlation_id: correlation_id.clone(),
            retry_count: attempts,
            max_retries: max_attempts,
            emergency_level: classification.emergency_level(),
            timestamp: Utc::now(),
        };

        error!(
            event_id = %event.event_id,
            correlation_id = %correlation_id,
            priority = classification.priority.as_str(),
            attempts,
            kind = failure.kind(),
            "Dead-lettering event: {}",
            failure
        );

        let destinations = self.router.route(event, classification, Some(&record));

        if destinations.contains(&Destination::DeadLetter) {
            if let Err(e) = self.dead_letters.publish(record.clone()).await {
                error!(
                    event_id = %event.event_id,
                    correlation_id = %correlation_id,
                    "Dead-letter publish failed: {}",
                    e
                );
            }
        }

        self.notify_failure(event, classification, &record, &destinations)
            .await;

        self.emit_audit(
            AuditRecord::for_event(event, AuditOutcome::Failed)
                .with("priority", classification.priority.as_str())
                .with("failureReason", record.failure_reason.clone())
                .with("failureKind", record.failure_kind.clone())
                .with("retryCount", attempts)
                .with("emergencyLevel", record.emergency_level.as_str()),
        )
        .await;

        self.ack(event).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_dead_letter(
                Self::family_label(event),
                record.emergency_level.as_str(),
            );
        }

        Outcome::DeadLettered {
            attempts,
            error: failure,
        }
    }

    async fn notify_failure(
        &self,
        event: &InboundEvent,
        classification: &ClassificationResult,
        record: &DeadLetterRecord,
        destinations: &BTreeSet<Destination>,
    ) {
        let context = Self::event_context(event, classification);

        if classification.is_critical() {
            let emergency = PipelineError::CriticalCompliance {
                event_id: event.event_id.clone(),
                reason: record.failure_reason.clone(),
            };
            let notice = Notice {
                title: format!("EMERGENCY: {} processing failed", event.event_type),
                message: emergency.to_string(),
                severity: Severity::Emergency,
                structured_context: context.clone(),
            };
            // The emergency notice is the delivery to the critical channel
            self.notify(Channel::Critical, notice, &record.correlation_id)
                .await;
        }

        for destination in destinations {
            let channel = match destination.channel() {
                Some(Channel::Critical) if classification.is_critical() => continue,
                Some(channel) => channel,
                None => continue,
            };
            let notice = match channel {
                Channel::Executive => Notice {
                    title: format!("Manual intervention required: {}", event.event_id),
                    message: format!(
                        "{} event dead-lettered after {} attempts: {}",
                        event.event_type, record.retry_count, record.failure_reason
                    ),
                    severity: Severity::Critical,
                    structured_context: context.clone(),
                },
                Channel::Critical | Channel::Standard => Notice {
                    title: format!("{} processing failed", event.event_type),
                    message: format!(
                        "Event {} dead-lettered: {}",
                        event.event_id, record.failure_reason
                    ),
                    severity: Severity::from(classification.priority).max(Severity::Warning),
                    structured_context: context.clone(),
                },
            };
            self.notify(channel, notice, &record.correlation_id).await;
        }
    }

    async fn notify(&self, channel: Channel, notice: Notice, correlation_id: &str) {
        if let Err(e) = self.notifications.notify(channel, notice).await {
            error!(
                correlation_id,
                channel = ?channel,
                "Notification delivery failed: {}",
                e
            );
        }
    }

    async fn emit_audit(&self, record: AuditRecord) {
        let correlation_id = record.correlation_id.clone();
        if let Err(e) = self.audit.record(record).await {
            error!(correlation_id = %correlation_id, "Audit write failed: {}", e);
        }
    }

    async fn ack(&self, event: &InboundEvent) {
        if let Err(e) = self.acknowledger.ack(event).await {
            warn!(
                event_id = %event.event_id,
                "Ack failed, transport will redeliver: {}",
                e
            );
        }
    }

    fn record_outcome(&self, event: &InboundEvent, outcome: &Outcome, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(
                Self::family_label(event),
                outcome.label(),
                started.elapsed().as_secs_f64(),
            );
        }
    }

    fn family_label(event: &InboundEvent) -> &'static str {
        event
            .parsed_type()
            .map(|t| t.family().domain())
            .unwrap_or("unknown")
    }

    fn actions_label(classification: &ClassificationResult) -> String {
        classification
            .required_actions
            .iter()
            .map(|a| format!("{:?}", a).to_uppercase())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn event_context(event: &InboundEvent, classification: &ClassificationResult) -> Value {
        json!({
            "eventId": event.event_id,
            "eventType": event.event_type,
            "subjectId": event.subject_id(),
            "correlationId": event.correlation_id(),
            "priority": classification.priority,
            "escalationTarget": classification.escalation_target,
            "requiredActions": classification.required_actions,
            "slaMinutes": classification.sla_minutes,
        })
    }
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    handlers: Option<HandlerRegistry>,
    enricher: Arc<dyn Enricher>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    audit: Option<Arc<dyn AuditSink>>,
    notifications: Option<Arc<dyn NotificationSink>>,
    acknowledger: Option<Arc<dyn Acknowledger>>,
    metrics: Option<PipelineMetrics>,
    cancel: CancellationToken,
}

impl PipelineBuilder {
    /// Create builder with no collaborators set
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            handlers: None,
            enricher: Arc::new(NoEnrichment),
            dead_letters: None,
            audit: None,
            notifications: None,
            acknowledger: None,
            metrics: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Handler table
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Enrichment source (defaults to none)
    pub fn enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = enricher;
        self
    }

    /// Dead-letter sink
    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Audit sink
    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Notification sink
    pub fn notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }

    /// Transport acknowledger
    pub fn acknowledger(mut self, acknowledger: Arc<dyn Acknowledger>) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }

    /// Metrics
    pub fn metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shutdown token observed by the retry loop
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate configuration and assemble the pipeline
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let missing = |what: &str| PipelineError::Config(format!("Pipeline requires {}", what));
        let handlers = self.handlers.ok_or_else(|| missing("a handler registry"))?;
        let dead_letters = self.dead_letters.ok_or_else(|| missing("a dead-letter sink"))?;
        let audit = self.audit.ok_or_else(|| missing("an audit sink"))?;
        let notifications = self
            .notifications
            .ok_or_else(|| missing("a notification sink"))?;
        let acknowledger = self.acknowledger.ok_or_else(|| missing("an acknowledger"))?;

        let config = self.config;
        let closed_retention = Duration::from_secs(config.sla.closed_retention_secs);

        Ok(Pipeline {
            ledger: IdempotencyLedger::new(config.ledger.clone()),
            classifier: Classifier::new(
                config.classifier.clone(),
                config.sla.clone(),
                config.escalation.clone(),
            ),
            sla: Arc::new(SlaTracker::new(closed_retention)),
            coordinator: RetryCoordinator::new(config.circuit_breaker.clone()),
            router: EscalationRouter::new(config.escalation.clone()),
            handlers,
            enricher: self.enricher,
            dead_letters,
            audit,
            notifications,
            acknowledger,
            metrics: self.metrics,
            cancel: self.cancel,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{DomainCommand, DomainService, RecordingDomainService};
    use crate::sinks::{
        InMemoryAcknowledger, InMemoryAuditSink, InMemoryDeadLetterSink,
        InMemoryNotificationSink,
    };
    use crate::sla::SlaStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        pipeline: Pipeline,
        dead_letters: Arc<InMemoryDeadLetterSink>,
        audit: Arc<InMemoryAuditSink>,
        notifications: Arc<InMemoryNotificationSink>,
        acks: Arc<InMemoryAcknowledger>,
    }

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.retry.default.initial_delay_ms = 1;
        config.retry.default.max_delay_ms = 2;
        for policy in config.retry.families.values_mut() {
            policy.initial_delay_ms = 1;
            policy.max_delay_ms = 2;
        }
        config
    }

    fn harness(service: Arc<dyn DomainService>) -> Harness {
        let dead_letters = Arc::new(InMemoryDeadLetterSink::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let notifications = Arc::new(InMemoryNotificationSink::new());
        let acks = Arc::new(InMemoryAcknowledger::new());

        let pipeline = Pipeline::builder(fast_config())
            .handlers(HandlerRegistry::standard(service))
            .dead_letters(dead_letters.clone())
            .audit(audit.clone())
            .notifications(notifications.clone())
            .acknowledger(acks.clone())
            .metrics(PipelineMetrics::new().unwrap())
            .build()
            .unwrap();

        Harness {
            pipeline,
            dead_letters,
            audit,
            notifications,
            acks,
        }
    }

    fn event(id: &str, event_type: &str, payload: Value) -> InboundEvent {
        let payload: Map<String, Value> = payload.as_object().cloned().unwrap_or_default();
        InboundEvent::new(id, event_type, payload).at("compliance-alerts", 0, 1)
    }

    /// Fails with `error` for the first `failures` calls
    struct FlakyService {
        failures: u32,
        error: PipelineError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DomainService for FlakyService {
        async fn apply(&self, _command: DomainCommand) -> Result<EffectReceipt> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(self.error.clone());
            }
            Ok(EffectReceipt {
                reference: "CASE-1".to_string(),
                applied_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_builder_requires_sinks() {
        let result = Pipeline::builder(PipelineConfig::default())
            .handlers(HandlerRegistry::new())
            .build();
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_success_path_commits_in_order() {
        let h = harness(Arc::new(RecordingDomainService::new()));
        let e = event("E1", "AML_ALERT", json!({"subjectId": "C-1", "riskScore": 75}));

        let disposition = h.pipeline.process(e.clone()).await;
        assert!(matches!(
            disposition,
            Disposition::Ack(Outcome::Processed { attempts: 1, .. })
        ));

        assert!(h
            .pipeline
            .ledger()
            .has_processed(&IdempotencyLedger::dedup_key(&e)));
        assert_eq!(h.pipeline.sla().status("E1"), Some(SlaStatus::Completed));
        assert_eq!(h.acks.acked(), vec!["E1".to_string()]);

        let audit = h.audit.records();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].outcome, AuditOutcome::Success);

        // HIGH, not always-escalate: standard channel
        assert_eq!(h.notifications.on_channel(Channel::Standard).len(), 1);
        assert!(h.dead_letters.records().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_dead_letters_without_retry() {
        let h = harness(Arc::new(RecordingDomainService::new()));

        let disposition = h
            .pipeline
            .process(event("E1", "WIRE_TRANSFER", json!({})))
            .await;

        match disposition {
            Disposition::Ack(Outcome::DeadLettered { attempts, error }) => {
                assert_eq!(attempts, 0);
                assert!(matches!(error, PipelineError::Validation(_)));
            }
            other => panic!("unexpected disposition {:?}", other),
        }
        assert_eq!(h.dead_letters.records()[0].failure_kind, "validation");
        assert_eq!(h.audit.records()[0].outcome, AuditOutcome::Failed);
        assert_eq!(h.acks.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_tried_once() {
        let service = Arc::new(FlakyService {
            failures: u32::MAX,
            error: PipelineError::Validation("case rejected".into()),
            calls: AtomicU32::new(0),
        });
        let h = harness(service.clone());

        h.pipeline
            .process(event("E1", "KYC_VIOLATION", json!({"subjectId": "C-1"})))
            .await;

        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.dead_letters.records()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_sink_failures_never_skip_audit_or_ack() {
        let service = Arc::new(FlakyService {
            failures: u32::MAX,
            error: PipelineError::Unavailable("case service".into()),
            calls: AtomicU32::new(0),
        });
        let h = harness(service);
        h.dead_letters.fail_next(1);
        h.notifications.fail_next(10);

        let disposition = h
            .pipeline
            .process(event("E1", "SANCTIONS_HIT", json!({"subjectId": "C-1"})))
            .await;

        assert!(matches!(
            disposition,
            Disposition::Ack(Outcome::DeadLettered { .. })
        ));
        assert_eq!(h.audit.records().len(), 1);
        assert_eq!(h.acks.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_retries_leave_event_unacked() {
        let service = Arc::new(FlakyService {
            failures: u32::MAX,
            error: PipelineError::Unavailable("case service".into()),
            calls: AtomicU32::new(0),
        });
        let h = harness(service);
        h.pipeline.shutdown_token().cancel();

        let disposition = h
            .pipeline
            .process(event("E1", "AML_ALERT", json!({"subjectId": "C-1"})))
            .await;

        assert_eq!(disposition, Disposition::Redeliver);
        assert!(h.acks.acked().is_empty());
        assert!(h.audit.records().is_empty());
        assert!(h.dead_letters.records().is_empty());
    }

    #[tokio::test]
    async fn test_replay_processes_dead_letter() {
        // Violations retry 3 times; the breaker opens only after 5 failures
        let service = Arc::new(FlakyService {
            failures: 3,
            error: PipelineError::Unavailable("case service".into()),
            calls: AtomicU32::new(0),
        });
        let h = harness(service);
        let e = event("E1", "KYC_VIOLATION", json!({"subjectId": "C-1"}));

        h.pipeline.process(e).await;
        let record = h.dead_letters.records().remove(0);

        let disposition = h.pipeline.replay(record).await;
        assert!(matches!(
            disposition,
            Disposition::Ack(Outcome::Processed { .. })
        ));
    }

    #[tokio::test]
    async fn test_overdue_sar_deadline_escalates_immediately() {
        let h = harness(Arc::new(RecordingDomainService::new()));
        let e = event(
            "S1",
            "SAR_DEADLINE",
            json!({"caseId": "SAR-1", "filingDeadline": "2020-01-01T00:00:00Z"}),
        );

        h.pipeline.process(e).await;

        assert_eq!(h.pipeline.sla().status("S1"), Some(SlaStatus::Breached));
        let outcomes: Vec<AuditOutcome> =
            h.audit.records().iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![AuditOutcome::SlaBreached, AuditOutcome::Success]);
    }
}
