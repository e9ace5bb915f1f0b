//! Regulatory Compliance Event Pipeline
//!
//! Consumes compliance events (AML alerts, sanctions hits, violations,
//! due-diligence triggers, SAR deadlines, sanctions list updates), classifies
//! them, tracks response SLAs and hands them to domain handlers with
//! exactly-once-effect semantics over an at-least-once transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────────────────────────────────────────┐
//! │  Transport   │    │                    Pipeline                      │
//! │ (partitions) │───▶│ ledger ─▶ classifier ─▶ SLA ─▶ RetryCoordinator  │
//! └──────────────┘    │   │                              │      │        │
//!        ▲            │   └ duplicate           success  │      │ failure│
//!        │            │                         ▼        │      ▼        │
//!        │            │             mark ─▶ complete ─▶ notify  DLQ ─▶   │
//!        │            │                                  route ─▶ notify │
//!        │            │                 audit (every terminal outcome)   │
//!        └── ack ─────┴──────────────────────────────────────────────────┘
//!
//!   SlaMonitor (interval task) ──breaches──▶ Pipeline::handle_breach
//! ```
//!
//! # Guarantees
//!
//! - **Idempotency**: an event whose dedup key is in the ledger is acked
//!   without re-running its effect
//! - **Bounded retries**: attempts never exceed the family policy; permanent
//!   failures are tried once
//! - **Terminal accountability**: every processed event ends in exactly one
//!   audit record and an ack; failures also produce a dead-letter record
//! - **Partition ordering**: one worker owns each partition

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod classifier;
pub mod config;
pub mod error;
pub mod escalation;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod sinks;
pub mod sla;
pub mod types;
pub mod worker;

pub use classifier::Classifier;
pub use config::{LogFormat, PipelineConfig, SlaTable};
pub use error::{PipelineError, Result};
pub use escalation::{EscalationRouter, EscalationTable};
pub use handlers::{
    DomainCommand, DomainService, EffectReceipt, EventHandler, FamilyHandler, HandlerRegistry,
    RecordingDomainService,
};
pub use ledger::IdempotencyLedger;
pub use metrics::PipelineMetrics;
pub use orchestrator::{Disposition, Outcome, Pipeline, PipelineBuilder};
pub use sinks::{
    Acknowledger, AuditSink, DeadLetterSink, Enricher, InMemoryAcknowledger, InMemoryAuditSink,
    InMemoryDeadLetterSink, InMemoryNotificationSink, JsonLinesSink, NoEnrichment,
    NotificationSink, StaticEnricher,
};
pub use sla::{SlaBreach, SlaEntry, SlaMonitor, SlaStatus, SlaTracker};
pub use types::*;
pub use worker::{lane_for, WorkerPool};

/// Topic carrying alert events
pub const TOPIC_ALERTS: &str = "compliance-alerts";

/// Topic carrying violation events
pub const TOPIC_VIOLATIONS: &str = "compliance-violations";

/// Topic carrying due-diligence triggers
pub const TOPIC_DUE_DILIGENCE: &str = "due-diligence-triggers";

/// Topic carrying SAR filing deadlines
pub const TOPIC_SAR_DEADLINES: &str = "sar-deadlines";

/// Topic carrying sanctions list updates
pub const TOPIC_SANCTIONS_UPDATES: &str = "sanctions-list-updates";
