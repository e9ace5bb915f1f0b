//! Domain handlers
//!
//! One handler per event family, registered once in a [`HandlerRegistry`].
//! Handlers validate the payload and translate the event into a
//! [`DomainCommand`] for the external compliance service; retries, timeouts
//! and circuit breaking are applied around them by the orchestrator.

use crate::error::{PipelineError, Result};
use crate::types::{
    ClassificationResult, EventFamily, EventType, InboundEvent, Priority, RequiredAction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Command sent to the external compliance service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainCommand {
    /// Open or update an alert case
    ProcessAlert {
        /// Event ID (downstream idempotency key)
        event_id: String,
        /// Alert type
        event_type: EventType,
        /// Subject of the alert
        subject_id: Option<String>,
        /// Classified priority
        priority: Priority,
        /// Owning team
        escalation_target: String,
        /// Actions the case must carry
        actions: BTreeSet<RequiredAction>,
    },
    /// Record a violation against a subject
    RecordViolation {
        /// Event ID
        event_id: String,
        /// Violation type
        event_type: EventType,
        /// Subject
        subject_id: String,
        /// Classified priority
        priority: Priority,
    },
    /// Open a due-diligence review
    OpenDueDiligence {
        /// Event ID
        event_id: String,
        /// Trigger type
        event_type: EventType,
        /// Subject
        subject_id: String,
    },
    /// Track a SAR filing obligation
    TrackSarFiling {
        /// Event ID
        event_id: String,
        /// SAR case
        case_id: String,
        /// Regulatory filing deadline
        filing_deadline: DateTime<Utc>,
    },
    /// Reload a sanctions list
    RefreshSanctionsList {
        /// Event ID
        event_id: String,
        /// List name
        list_name: String,
        /// Published version, if given
        version: Option<String>,
    },
}

/// Proof that the service applied a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectReceipt {
    /// Service-side reference (case id, filing id, ...)
    pub reference: String,
    /// When the effect was committed
    pub applied_at: DateTime<Utc>,
}

/// External compliance service
#[async_trait]
pub trait DomainService: Send + Sync {
    /// Apply a command; must be idempotent per `event_id`
    async fn apply(&self, command: DomainCommand) -> Result<EffectReceipt>;
}

/// Domain service that records commands and always succeeds
#[derive(Debug, Default)]
pub struct RecordingDomainService {
    applied: Mutex<Vec<DomainCommand>>,
}

impl RecordingDomainService {
    /// Create new service
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands applied so far
    pub fn applied(&self) -> Vec<DomainCommand> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl DomainService for RecordingDomainService {
    async fn apply(&self, command: DomainCommand) -> Result<EffectReceipt> {
        let mut applied = self.applied.lock();
        applied.push(command);
        Ok(EffectReceipt {
            reference: format!("REF-{:06}", applied.len()),
            applied_at: Utc::now(),
        })
    }
}

/// Handler for one event family
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Dependency name used for circuit breaking
    fn dependency(&self) -> &str;

    /// Reject payloads that can never succeed
    fn validate(&self, event: &InboundEvent) -> Result<()>;

    /// Perform the business effect
    async fn handle(
        &self,
        event: &InboundEvent,
        classification: &ClassificationResult,
    ) -> Result<EffectReceipt>;
}

/// Standard handler: validates per family and delegates to a [`DomainService`]
pub struct FamilyHandler {
    family: EventFamily,
    dependency: String,
    service: Arc<dyn DomainService>,
}

impl FamilyHandler {
    /// Create handler for `family` calling `service`
    pub fn new(
        family: EventFamily,
        dependency: impl Into<String>,
        service: Arc<dyn DomainService>,
    ) -> Self {
        Self {
            family,
            dependency: dependency.into(),
            service,
        }
    }

    fn required<'a>(event: &'a InboundEvent, key: &str) -> Result<&'a str> {
        event.str_field(key).ok_or_else(|| {
            PipelineError::Validation(format!(
                "{} event {} is missing {}",
                event.event_type, event.event_id, key
            ))
        })
    }

    fn subject(event: &InboundEvent) -> Result<&str> {
        event.subject_id().ok_or_else(|| {
            PipelineError::Validation(format!(
                "{} event {} has no subject",
                event.event_type, event.event_id
            ))
        })
    }

    fn command(
        &self,
        event: &InboundEvent,
        classification: &ClassificationResult,
    ) -> Result<DomainCommand> {
        let event_type = event.parsed_type()?;
        let event_id = event.event_id.clone();

        let command = match self.family {
            EventFamily::Alert => DomainCommand::ProcessAlert {
                event_id,
                event_type,
                subject_id: event.subject_id().map(str::to_string),
                priority: classification.priority,
                escalation_target: classification.escalation_target.clone(),
                actions: classification.required_actions.clone(),
            },
            EventFamily::Violation => DomainCommand::RecordViolation {
                event_id,
                event_type,
                subject_id: Self::subject(event)?.to_string(),
                priority: classification.priority,
            },
            EventFamily::DueDiligence => DomainCommand::OpenDueDiligence {
                event_id,
                event_type,
                subject_id: Self::subject(event)?.to_string(),
            },
            EventFamily::SarDeadline => DomainCommand::TrackSarFiling {
                event_id,
                case_id: Self::required(event, "caseId")?.to_string(),
                filing_deadline: event.timestamp_field("filingDeadline")?.ok_or_else(|| {
                    PipelineError::Validation(format!(
                        "SAR event {} is missing filingDeadline",
                        event.event_id
                    ))
                })?,
            },
            EventFamily::SanctionsList => DomainCommand::RefreshSanctionsList {
                event_id,
                list_name: Self::required(event, "listName")?.to_string(),
                version: event.str_field("version").map(str::to_string),
            },
        };
        Ok(command)
    }
}

#[async_trait]
impl EventHandler for FamilyHandler {
    fn dependency(&self) -> &str {
        &self.dependency
    }

    fn validate(&self, event: &InboundEvent) -> Result<()> {
        let event_type = event.parsed_type()?;
        if event_type.family() != self.family {
            return Err(PipelineError::Validation(format!(
                "{} handler cannot process {}",
                self.family.domain(),
                event_type
            )));
        }

        match self.family {
            EventFamily::Alert => {
                event.number_field("riskScore")?;
                event.decimal_field("amount")?;
            }
            EventFamily::Violation | EventFamily::DueDiligence => {
                Self::subject(event)?;
            }
            EventFamily::SarDeadline => {
                Self::required(event, "caseId")?;
                Self::required(event, "filingDeadline")?;
                event.timestamp_field("filingDeadline")?;
            }
            EventFamily::SanctionsList => {
                Self::required(event, "listName")?;
            }
        }
        Ok(())
    }

    async fn handle(
        &self,
        event: &InboundEvent,
        classification: &ClassificationResult,
    ) -> Result<EffectReceipt> {
        let command = self.command(event, classification)?;
        debug!(
            event_id = %event.event_id,
            dependency = %self.dependency,
            "Applying domain command"
        );
        self.service.apply(command).await
    }
}

/// Family → handler dispatch table, built once at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventFamily, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a [`FamilyHandler`] for every family
    pub fn standard(service: Arc<dyn DomainService>) -> Self {
        let mut registry = Self::new();
        for family in EventFamily::ALL {
            let dependency = format!("{}-service", family.domain());
            registry.register(
                family,
                Arc::new(FamilyHandler::new(family, dependency, service.clone())),
            );
        }
        registry
    }

    /// Register (or replace) the handler for a family
    pub fn register(&mut self, family: EventFamily, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(family, handler);
    }

    /// Handler for a family
    pub fn get(&self, family: EventFamily) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&family).cloned()
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
