//! Configuration for the compliance pipeline

use crate::error::{PipelineError, Result};
use crate::escalation::EscalationTable;
use crate::types::{EventFamily, EventType, Priority};
use resilience::{CircuitBreakerConfig, RetryPolicy, MAX_TTL};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Service name (log field, metrics namespace)
    pub service_name: String,

    /// Log output format
    pub log_format: LogFormat,

    /// Idempotency ledger
    pub ledger: LedgerConfig,

    /// Retry policies
    pub retry: RetryConfig,

    /// Circuit breaker shared by every dependency
    pub circuit_breaker: CircuitBreakerConfig,

    /// SLA tables and monitor
    pub sla: SlaConfig,

    /// Classification thresholds
    pub classifier: ClassifierConfig,

    /// Escalation team table
    pub escalation: EscalationTable,

    /// Worker pool
    pub workers: WorkerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            service_name: "compliance-pipeline".to_string(),
            log_format: LogFormat::Pretty,
            ledger: LedgerConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            sla: SlaConfig::default(),
            classifier: ClassifierConfig::default(),
            escalation: EscalationTable::default(),
            workers: WorkerConfig::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    Pretty,
    /// One JSON object per line
    Json,
}

/// Idempotency ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// TTL for families without an override (seconds)
    pub default_ttl_secs: u64,

    /// Per-family TTL overrides (seconds)
    pub family_ttl_secs: HashMap<EventFamily, u64>,

    /// Entry count that triggers an eager sweep
    pub sweep_threshold: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let mut family_ttl_secs = HashMap::new();
        family_ttl_secs.insert(EventFamily::Alert, 72 * 3_600);
        family_ttl_secs.insert(EventFamily::SarDeadline, 72 * 3_600);
        family_ttl_secs.insert(EventFamily::Violation, 48 * 3_600);

        Self {
            default_ttl_secs: 24 * 3_600,
            family_ttl_secs,
            sweep_threshold: 10_000,
        }
    }
}

impl LedgerConfig {
    /// TTL applied to a family's entries
    pub fn ttl_for(&self, family: EventFamily) -> Duration {
        Duration::from_secs(
            self.family_ttl_secs
                .get(&family)
                .copied()
                .unwrap_or(self.default_ttl_secs),
        )
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Policy for families without an override
    pub default: RetryPolicy,

    /// Per-family policies
    pub families: HashMap<EventFamily, RetryPolicy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut families = HashMap::new();
        families.insert(
            EventFamily::Alert,
            RetryPolicy {
                max_attempts: 5,
                max_unclassified_attempts: 3,
                initial_delay_ms: 500,
                multiplier: 2.0,
                max_delay_ms: 5_000,
                attempt_timeout_ms: 5_000,
            },
        );
        families.insert(
            EventFamily::SarDeadline,
            RetryPolicy {
                max_attempts: 3,
                max_unclassified_attempts: 2,
                initial_delay_ms: 2_000,
                multiplier: 2.0,
                max_delay_ms: 30_000,
                attempt_timeout_ms: 10_000,
            },
        );
        families.insert(
            EventFamily::DueDiligence,
            RetryPolicy {
                max_attempts: 3,
                max_unclassified_attempts: 2,
                initial_delay_ms: 3_000,
                multiplier: 1.5,
                max_delay_ms: 30_000,
                attempt_timeout_ms: 10_000,
            },
        );
        families.insert(
            EventFamily::SanctionsList,
            RetryPolicy {
                max_attempts: 4,
                max_unclassified_attempts: 2,
                initial_delay_ms: 1_000,
                multiplier: 2.0,
                max_delay_ms: 15_000,
                attempt_timeout_ms: 20_000,
            },
        );

        Self {
            default: RetryPolicy::default(),
            families,
        }
    }
}

impl RetryConfig {
    /// Policy applied to a family
    pub fn policy_for(&self, family: EventFamily) -> &RetryPolicy {
        self.families.get(&family).unwrap_or(&self.default)
    }
}

/// Priority → SLA duration table for one family (minutes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaTable {
    /// Whether events of this family get an SLA entry
    pub enabled: bool,
    /// CRITICAL events of a critical type
    pub critical_type: u32,
    /// Other CRITICAL events
    pub critical: u32,
    /// HIGH events
    pub high: u32,
    /// MEDIUM events
    pub medium: u32,
    /// LOW events
    pub low: u32,
}

impl SlaTable {
    /// Minutes allowed for an event of `priority`
    pub fn minutes_for(&self, priority: Priority, critical_type: bool) -> u32 {
        match priority {
            Priority::Critical if critical_type => self.critical_type,
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    fn is_monotonic(&self) -> bool {
        self.critical_type <= self.critical
            && self.critical <= self.high
            && self.high <= self.medium
            && self.medium <= self.low
    }
}

impl Default for SlaTable {
    fn default() -> Self {
        Self {
            enabled: true,
            critical_type: 5,
            critical: 15,
            high: 60,
            medium: 240,
            low: 1_440,
        }
    }
}

/// SLA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    /// Breach sweep period (milliseconds)
    pub sweep_interval_ms: u64,

    /// How long closed entries stay queryable (seconds)
    pub closed_retention_secs: u64,

    /// Table for families without an override
    pub default_table: SlaTable,

    /// Per-family tables
    pub tables: HashMap<EventFamily, SlaTable>,
}

impl Default for SlaConfig {
    fn default() -> Self {
        let mut tables = HashMap::new();
        tables.insert(
            EventFamily::Violation,
            SlaTable {
                enabled: true,
                critical_type: 15,
                critical: 60,
                high: 240,
                medium: 1_440,
                low: 4_320,
            },
        );
        tables.insert(
            EventFamily::DueDiligence,
            SlaTable {
                enabled: true,
                critical_type: 60,
                critical: 240,
                high: 1_440,
                medium: 4_320,
                low: 10_080,
            },
        );
        // SAR filings: urgent 3 days, standard 30 days
        tables.insert(
            EventFamily::SarDeadline,
            SlaTable {
                enabled: true,
                critical_type: 4_320,
                critical: 4_320,
                high: 10_080,
                medium: 43_200,
                low: 43_200,
            },
        );
        tables.insert(
            EventFamily::SanctionsList,
            SlaTable {
                enabled: false,
                ..SlaTable::default()
            },
        );

        Self {
            sweep_interval_ms: 1_000,
            closed_retention_secs: 3_600,
            default_table: SlaTable::default(),
            tables,
        }
    }
}

impl SlaConfig {
    /// Table applied to a family
    pub fn table_for(&self, family: EventFamily) -> &SlaTable {
        self.tables.get(&family).unwrap_or(&self.default_table)
    }

    /// Breach sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Types that are always CRITICAL
    pub critical_types: BTreeSet<EventType>,

    /// Score at or above which an event is CRITICAL
    pub critical_score: f64,
    /// Score at or above which an event is HIGH
    pub high_score: f64,
    /// Score at or above which an event is MEDIUM
    pub medium_score: f64,

    /// Score at or above which escalation is required
    pub escalate_score: f64,
    /// Score at or above which investigation is required
    pub investigate_score: f64,
    /// Score at or above which the subject is blocked
    pub block_score: f64,

    /// Amount above which an event is HIGH
    pub high_amount: Decimal,
    /// Amount above which an event is MEDIUM
    pub medium_amount: Decimal,

    /// Prior incidents above which an event is HIGH
    pub high_incidents: u32,
    /// Prior incidents above which an event is MEDIUM
    pub medium_incidents: u32,

    /// ISO country codes under comprehensive sanctions
    pub sanctioned_countries: BTreeSet<String>,
    /// ISO country codes rated high risk
    pub high_risk_countries: BTreeSet<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let critical_types = [
            EventType::SanctionsHit,
            EventType::TerroristFinancing,
            EventType::MoneyLaundering,
            EventType::FraudConfirmed,
            EventType::RegulatoryBreach,
            EventType::OfacViolation,
        ]
        .into_iter()
        .collect();

        let sanctioned_countries = ["CU", "IR", "KP", "SY", "RU"]
            .into_iter()
            .map(String::from)
            .collect();
        let high_risk_countries = ["AF", "MM", "YE", "VE", "SD", "SO", "LY", "IQ"]
            .into_iter()
            .map(String::from)
            .collect();

        Self {
            critical_types,
            critical_score: 90.0,
            high_score: 70.0,
            medium_score: 50.0,
            escalate_score: 85.0,
            investigate_score: 60.0,
            block_score: 90.0,
            high_amount: Decimal::new(50_000, 0),
            medium_amount: Decimal::new(10_000, 0),
            high_incidents: 2,
            medium_incidents: 0,
            sanctioned_countries,
            high_risk_countries,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Workers per topic
    pub workers_per_topic: usize,

    /// Buffered events per worker
    pub queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers_per_topic: 3,
            queue_depth: 256,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: PipelineConfig = toml::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `PIPELINE_CONFIG` (if set) and apply environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("PIPELINE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(name) = std::env::var("PIPELINE_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Ok(workers) = std::env::var("PIPELINE_WORKERS") {
            config.workers.workers_per_topic = parse_env("PIPELINE_WORKERS", &workers)?;
        }

        if let Ok(threshold) = std::env::var("PIPELINE_LEDGER_SWEEP_THRESHOLD") {
            config.ledger.sweep_threshold =
                parse_env("PIPELINE_LEDGER_SWEEP_THRESHOLD", &threshold)?;
        }

        if let Ok(interval) = std::env::var("PIPELINE_SLA_SWEEP_INTERVAL_MS") {
            config.sla.sweep_interval_ms = parse_env("PIPELINE_SLA_SWEEP_INTERVAL_MS", &interval)?;
        }

        if let Ok(format) = std::env::var("PIPELINE_LOG_FORMAT") {
            config.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(PipelineError::Config(format!(
                        "PIPELINE_LOG_FORMAT must be json or pretty, got {}",
                        other
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        self.retry.default.validate()?;
        for (family, policy) in &self.retry.families {
            policy
                .validate()
                .map_err(|e| PipelineError::Config(format!("retry.{}: {}", family.domain(), e)))?;
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(PipelineError::Config(
                "circuit_breaker.failure_threshold must be >= 1".to_string(),
            ));
        }

        if self.sla.sweep_interval_ms == 0 {
            return Err(PipelineError::Config(
                "sla.sweep_interval_ms must be > 0".to_string(),
            ));
        }
        for family in EventFamily::ALL {
            let table = self.sla.table_for(family);
            if table.enabled && !table.is_monotonic() {
                return Err(PipelineError::Config(format!(
                    "sla table for {} must not grant more time to higher priorities",
                    family.domain()
                )));
            }
            if table.enabled && table.critical_type == 0 {
                return Err(PipelineError::Config(format!(
                    "sla table for {} has a zero-minute deadline",
                    family.domain()
                )));
            }
        }

        let c = &self.classifier;
        if !(c.medium_score <= c.high_score && c.high_score <= c.critical_score) {
            return Err(PipelineError::Config(
                "classifier score thresholds must satisfy medium <= high <= critical".to_string(),
            ));
        }
        if c.medium_amount > c.high_amount {
            return Err(PipelineError::Config(
                "classifier.medium_amount must not exceed high_amount".to_string(),
            ));
        }
        if c.medium_incidents > c.high_incidents {
            return Err(PipelineError::Config(
                "classifier.medium_incidents must not exceed high_incidents".to_string(),
            ));
        }

        if self.workers.workers_per_topic == 0 || self.workers.queue_depth == 0 {
            return Err(PipelineError::Config(
                "workers_per_topic and queue_depth must be > 0".to_string(),
            ));
        }

        let max_ttl_secs = MAX_TTL.as_secs();
        let ttls = std::iter::once(("default", self.ledger.default_ttl_secs)).chain(
            self.ledger
                .family_ttl_secs
                .iter()
                .map(|(family, secs)| (family.domain(), *secs)),
        );
        for (scope, secs) in ttls {
            if secs == 0 || secs > max_ttl_secs {
                return Err(PipelineError::Config(format!(
                    "ledger ttl for {} must be between 1 and {} seconds, got {}",
                    scope, max_ttl_secs, secs
                )));
            }
        }

        if self.ledger.sweep_threshold == 0 {
            return Err(PipelineError::Config(
                "ledger.sweep_threshold must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| PipelineError::Config(format!("{} has invalid value {:?}", name, raw)))
}
