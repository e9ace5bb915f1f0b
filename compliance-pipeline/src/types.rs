//! Core types for the compliance pipeline

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Compliance event types understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Party matched a sanctions list
    SanctionsHit,
    /// OFAC rule violated
    OfacViolation,
    /// Terrorist-financing indicator
    TerroristFinancing,
    /// Money-laundering indicator
    MoneyLaundering,
    /// Fraud confirmed by investigation
    FraudConfirmed,
    /// Generic AML monitoring alert
    AmlAlert,
    /// Regulatory obligation breached
    RegulatoryBreach,
    /// Internal compliance policy violated
    ComplianceViolation,
    /// KYC rule violated
    KycViolation,
    /// Enhanced due diligence required
    DueDiligenceTrigger,
    /// KYC documentation expired
    KycExpiration,
    /// Suspicious activity report filing deadline
    SarDeadline,
    /// Sanctions list published a change
    SanctionsListUpdate,
}

impl EventType {
    /// Every supported event type
    pub const ALL: [EventType; 13] = [
        EventType::SanctionsHit,
        EventType::OfacViolation,
        EventType::TerroristFinancing,
        EventType::MoneyLaundering,
        EventType::FraudConfirmed,
        EventType::AmlAlert,
        EventType::RegulatoryBreach,
        EventType::ComplianceViolation,
        EventType::KycViolation,
        EventType::DueDiligenceTrigger,
        EventType::KycExpiration,
        EventType::SarDeadline,
        EventType::SanctionsListUpdate,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SanctionsHit => "SANCTIONS_HIT",
            EventType::OfacViolation => "OFAC_VIOLATION",
            EventType::TerroristFinancing => "TERRORIST_FINANCING",
            EventType::MoneyLaundering => "MONEY_LAUNDERING",
            EventType::FraudConfirmed => "FRAUD_CONFIRMED",
            EventType::AmlAlert => "AML_ALERT",
            EventType::RegulatoryBreach => "REGULATORY_BREACH",
            EventType::ComplianceViolation => "COMPLIANCE_VIOLATION",
            EventType::KycViolation => "KYC_VIOLATION",
            EventType::DueDiligenceTrigger => "DUE_DILIGENCE_TRIGGER",
            EventType::KycExpiration => "KYC_EXPIRATION",
            EventType::SarDeadline => "SAR_DEADLINE",
            EventType::SanctionsListUpdate => "SANCTIONS_LIST_UPDATE",
        }
    }

    /// Family the type belongs to
    pub fn family(&self) -> EventFamily {
        match self {
            EventType::SanctionsHit
            | EventType::OfacViolation
            | EventType::TerroristFinancing
            | EventType::MoneyLaundering
            | EventType::FraudConfirmed
            | EventType::AmlAlert => EventFamily::Alert,
            EventType::RegulatoryBreach
            | EventType::ComplianceViolation
            | EventType::KycViolation => EventFamily::Violation,
            EventType::DueDiligenceTrigger | EventType::KycExpiration => EventFamily::DueDiligence,
            EventType::SarDeadline => EventFamily::SarDeadline,
            EventType::SanctionsListUpdate => EventFamily::SanctionsList,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PipelineError::Validation(format!("Unsupported event type: {:?}", s)))
    }
}

/// Event family: keys retry policies, SLA tables and idempotency TTLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    /// AML/fraud/sanctions alerts
    Alert,
    /// Regulatory and policy violations
    Violation,
    /// Due-diligence triggers
    DueDiligence,
    /// SAR filing deadlines
    SarDeadline,
    /// Sanctions list changes
    SanctionsList,
}

impl EventFamily {
    /// Every family
    pub const ALL: [EventFamily; 5] = [
        EventFamily::Alert,
        EventFamily::Violation,
        EventFamily::DueDiligence,
        EventFamily::SarDeadline,
        EventFamily::SanctionsList,
    ];

    /// Domain segment of correlation ids and metric label
    pub fn domain(&self) -> &'static str {
        match self {
            EventFamily::Alert => "alert",
            EventFamily::Violation => "violation",
            EventFamily::DueDiligence => "due-diligence",
            EventFamily::SarDeadline => "sar",
            EventFamily::SanctionsList => "sanctions-list",
        }
    }

    /// Topic this family is consumed from
    pub fn topic(&self) -> &'static str {
        match self {
            EventFamily::Alert => crate::TOPIC_ALERTS,
            EventFamily::Violation => crate::TOPIC_VIOLATIONS,
            EventFamily::DueDiligence => crate::TOPIC_DUE_DILIGENCE,
            EventFamily::SarDeadline => crate::TOPIC_SAR_DEADLINES,
            EventFamily::SanctionsList => crate::TOPIC_SANCTIONS_UPDATES,
        }
    }
}

/// Inbound event envelope, immutable once read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Unique per occurrence
    pub event_id: String,
    /// Raw event type discriminator
    pub event_type: String,
    /// Topic the event was read from
    #[serde(default)]
    pub source_topic: String,
    /// Log partition, absent for unpartitioned sources
    #[serde(default)]
    pub partition: Option<u32>,
    /// Offset within the partition
    #[serde(default)]
    pub offset: u64,
    /// Ordering key
    #[serde(default)]
    pub partition_key: String,
    /// When the event occurred
    #[serde(rename = "timestamp", alias = "occurredAt")]
    pub occurred_at: DateTime<Utc>,
    /// Domain payload
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Deliveries so far (0 on first delivery)
    #[serde(default)]
    pub attempt_count: u32,
}

/// Payload keys identifying the subject of an event, in lookup order
const SUBJECT_KEYS: [&str; 5] = ["subjectId", "customerId", "accountId", "caseId", "listName"];

impl InboundEvent {
    /// Build an unpartitioned event occurring now
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            source_topic: String::new(),
            partition: None,
            offset: 0,
            partition_key: String::new(),
            occurred_at: Utc::now(),
            payload,
            attempt_count: 0,
        }
    }

    /// Set log position (topic, partition, offset)
    pub fn at(mut self, topic: impl Into<String>, partition: u32, offset: u64) -> Self {
        self.source_topic = topic.into();
        self.partition = Some(partition);
        self.offset = offset;
        self
    }

    /// Set occurrence time
    pub fn occurred(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    /// Set ordering key
    pub fn keyed(mut self, key: impl Into<String>) -> Self {
        self.partition_key = key.into();
        self
    }

    /// Parse from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Best-effort envelope for bytes that failed to parse
    ///
    /// Recovers whatever envelope fields are well-formed and keeps the raw
    /// input under `rawEnvelope` in the payload. Without an `eventId` the id
    /// is derived from the bytes, so the same input maps to the same id.
    pub fn salvage(bytes: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(bytes).into_owned();
        let fields = match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        };
        let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);

        let event_id = text("eventId").unwrap_or_else(|| {
            let hash = blake3::hash(bytes).to_hex();
            format!("rejected-{}", &hash.as_str()[..16])
        });
        let mut payload = match fields.get("payload") {
            Some(Value::Object(payload)) => payload.clone(),
            _ => Map::new(),
        };
        payload.insert("rawEnvelope".to_string(), Value::String(raw));

        Self {
            event_id,
            event_type: text("eventType").unwrap_or_default(),
            source_topic: text("sourceTopic").unwrap_or_default(),
            partition: fields
                .get("partition")
                .and_then(Value::as_u64)
                .and_then(|p| u32::try_from(p).ok()),
            offset: fields.get("offset").and_then(Value::as_u64).unwrap_or(0),
            partition_key: text("partitionKey").unwrap_or_default(),
            occurred_at: Utc::now(),
            payload,
            attempt_count: 0,
        }
    }

    /// Copy for another delivery of the same occurrence
    pub fn redelivered(&self) -> Self {
        let mut next = self.clone();
        next.attempt_count += 1;
        next
    }

    /// Parsed event type
    pub fn parsed_type(&self) -> Result<EventType> {
        self.event_type.parse()
    }

    /// `<domain>-<eventId>-p<partition>-o<offset>`
    pub fn correlation_id(&self) -> String {
        let domain = self
            .parsed_type()
            .map(|t| t.family().domain())
            .unwrap_or("unknown");
        format!(
            "{}-{}-p{}-o{}",
            domain,
            self.event_id,
            self.partition.unwrap_or(0),
            self.offset
        )
    }

    /// First subject identifier present in the payload
    pub fn subject_id(&self) -> Option<&str> {
        SUBJECT_KEYS.iter().find_map(|key| self.str_field(key))
    }

    /// Non-empty string field
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Numeric field (JSON number or numeric string)
    pub fn number_field(&self, key: &str) -> Result<Option<f64>> {
        match self.payload.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| {
                PipelineError::Validation(format!("Field {} is not numeric: {:?}", key, s))
            }),
            Some(other) => Err(PipelineError::Validation(format!(
                "Field {} is not numeric: {}",
                key, other
            ))),
        }
    }

    /// Monetary field, kept exact
    pub fn decimal_field(&self, key: &str) -> Result<Option<Decimal>> {
        let raw = match self.payload.get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.trim().to_string(),
            Some(other) => {
                return Err(PipelineError::Validation(format!(
                    "Field {} is not an amount: {}",
                    key, other
                )))
            }
        };
        Decimal::from_str(&raw)
            .or_else(|_| Decimal::from_scientific(&raw))
            .map(Some)
            .map_err(|_| PipelineError::Validation(format!("Field {} is not an amount: {}", key, raw)))
    }

    /// Timestamp field (RFC 3339)
    pub fn timestamp_field(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match self.str_field(key) {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| {
                    PipelineError::Validation(format!("Field {} is not RFC 3339: {}", key, e))
                }),
        }
    }
}

/// Priority assigned by the classifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Routine
    Low,
    /// Needs attention within the working day
    Medium,
    /// Needs attention within hours
    High,
    /// Needs attention within minutes
    Critical,
}

impl Priority {
    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Priority {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "MEDIUM" => Ok(Priority::Medium),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            other => Err(PipelineError::Validation(format!(
                "Unknown severity: {:?}",
                other
            ))),
        }
    }
}

/// Action a classified event requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequiredAction {
    /// Route to human attention
    Escalate,
    /// Open an investigation
    Investigate,
    /// Inform the owning team
    Notify,
    /// Block the subject
    Block,
    /// File a regulatory report
    Report,
}

/// Data from external services that sharpens classification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    /// Risk score computed upstream (0-100)
    pub risk_score: Option<f64>,
    /// Incidents previously recorded for the subject
    pub prior_incidents: u32,
    /// Subject matched a sanctions list
    pub sanctions_list_match: bool,
    /// Subject is a politically exposed person
    pub pep_match: bool,
}

/// Classifier output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    /// Highest priority among matching rules
    pub priority: Priority,
    /// Actions required
    pub required_actions: BTreeSet<RequiredAction>,
    /// Minutes until the SLA deadline
    pub sla_minutes: u32,
    /// Team owning the escalation
    pub escalation_target: String,
    /// Rules that matched, for audit
    pub matched_rules: Vec<String>,
    /// Inconsistencies noticed while classifying
    pub anomalies: Vec<String>,
}

impl ClassificationResult {
    /// Whether `action` is required
    pub fn requires(&self, action: RequiredAction) -> bool {
        self.required_actions.contains(&action)
    }

    /// Whether the event is CRITICAL
    pub fn is_critical(&self) -> bool {
        self.priority == Priority::Critical
    }

    /// Emergency level carried by dead-letter records
    pub fn emergency_level(&self) -> EmergencyLevel {
        match self.priority {
            Priority::Critical => EmergencyLevel::Emergency,
            Priority::High => EmergencyLevel::Elevated,
            Priority::Medium | Priority::Low => EmergencyLevel::Standard,
        }
    }
}

/// Urgency of a dead-lettered event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyLevel {
    /// Routine follow-up
    Standard,
    /// Same-day follow-up
    Elevated,
    /// Immediate human intervention
    Emergency,
}

impl EmergencyLevel {
    /// Label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyLevel::Standard => "STANDARD",
            EmergencyLevel::Elevated => "ELEVATED",
            EmergencyLevel::Emergency => "EMERGENCY",
        }
    }
}

/// Terminal record of an event that could not be processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// Event as received
    pub original_event: InboundEvent,
    /// Final error message
    #[serde(rename = "error")]
    pub failure_reason: String,
    /// Error kind (validation, timeout, ...)
    pub failure_kind: String,
    /// Correlation id of the delivery
    pub correlation_id: String,
    /// Attempts made
    pub retry_count: u32,
    /// Attempt cap that applied
    pub max_retries: u32,
    /// Urgency
    pub emergency_level: EmergencyLevel,
    /// When the record was created
    pub timestamp: DateTime<Utc>,
}

/// Outcome recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    /// Business effect committed
    Success,
    /// Event dead-lettered
    Failed,
    /// SLA deadline passed before resolution
    SlaBreached,
}

/// Audit trail entry, emitted for every terminal outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Record id
    pub record_id: Uuid,
    /// Raw event type
    pub event_type: String,
    /// Subject of the event, when known
    pub subject_id: Option<String>,
    /// Outcome
    pub outcome: AuditOutcome,
    /// Correlation id
    pub correlation_id: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Outcome-specific fields
    pub extra: Map<String, Value>,
}

impl AuditRecord {
    /// Record for `event` with the given outcome
    pub fn for_event(event: &InboundEvent, outcome: AuditOutcome) -> Self {
        Self {
            record_id: Uuid::now_v7(),
            event_type: event.event_type.clone(),
            subject_id: event.subject_id().map(str::to_string),
            outcome,
            correlation_id: event.correlation_id(),
            timestamp: Utc::now(),
            extra: Map::new(),
        }
    }

    /// Attach an extra field
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Logical notification endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Routine compliance notifications
    Standard,
    /// Critical/emergency on-call channel
    Critical,
    /// Executive / manual-intervention channel
    Executive,
}

/// Notice severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational
    Info,
    /// Needs attention
    Warning,
    /// Needs attention now
    Critical,
    /// Regulatory exposure, wake people up
    Emergency,
}

impl From<Priority> for Severity {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Low | Priority::Medium => Severity::Info,
            Priority::High => Severity::Warning,
            Priority::Critical => Severity::Critical,
        }
    }
}

/// Notification payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    /// Title
    pub title: String,
    /// Body
    pub message: String,
    /// Severity
    pub severity: Severity,
    /// Structured context
    pub structured_context: Value,
}

/// Where the escalation router sends an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Destination {
    /// Audit trail
    AuditLog,
    /// Dead-letter sink
    DeadLetter,
    /// Standard notification channel
    StandardNotification,
    /// Critical/human notification channel
    CriticalNotification,
    /// Executive / manual-intervention channel
    ExecutiveIntervention,
}

impl Destination {
    /// Notification channel behind this destination, if any
    pub fn channel(&self) -> Option<Channel> {
        match self {
            Destination::StandardNotification => Some(Channel::Standard),
            Destination::CriticalNotification => Some(Channel::Critical),
            Destination::ExecutiveIntervention => Some(Channel::Executive),
            Destination::AuditLog | Destination::DeadLetter => None,
        }
    }
}
