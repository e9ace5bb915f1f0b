//! Escalation routing
//!
//! One table-driven router decides where an event (or an SLA breach) goes.
//! The team map and the always-escalate set are configuration, so the
//! routing rules never hard-code event types.

use crate::sla::SlaBreach;
use crate::types::{
    ClassificationResult, DeadLetterRecord, Destination, EventType, InboundEvent, Priority,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Event type → owning team, plus the types that always reach a human
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationTable {
    /// Owning team per event type
    pub teams: HashMap<EventType, String>,

    /// Team for types without an entry
    pub default_team: String,

    /// Types routed to the critical channel regardless of priority
    pub always_escalate: BTreeSet<EventType>,
}

impl Default for EscalationTable {
    fn default() -> Self {
        let teams = [
            (EventType::SanctionsHit, "SANCTIONS_TEAM"),
            (EventType::OfacViolation, "SANCTIONS_TEAM"),
            (EventType::SanctionsListUpdate, "SANCTIONS_TEAM"),
            (EventType::MoneyLaundering, "AML_TEAM"),
            (EventType::TerroristFinancing, "AML_TEAM"),
            (EventType::AmlAlert, "AML_TEAM"),
            (EventType::FraudConfirmed, "FRAUD_TEAM"),
            (EventType::KycViolation, "KYC_TEAM"),
            (EventType::KycExpiration, "KYC_TEAM"),
            (EventType::DueDiligenceTrigger, "KYC_TEAM"),
            (EventType::RegulatoryBreach, "COMPLIANCE_TEAM"),
            (EventType::SarDeadline, "SAR_FILING_TEAM"),
        ]
        .into_iter()
        .map(|(t, team)| (t, team.to_string()))
        .collect();

        let always_escalate = [
            EventType::SanctionsHit,
            EventType::OfacViolation,
            EventType::TerroristFinancing,
            EventType::RegulatoryBreach,
        ]
        .into_iter()
        .collect();

        Self {
            teams,
            default_team: "COMPLIANCE_TEAM".to_string(),
            always_escalate,
        }
    }
}

impl EscalationTable {
    /// Team owning `event_type`
    pub fn team_for(&self, event_type: EventType) -> &str {
        self.teams
            .get(&event_type)
            .map(String::as_str)
            .unwrap_or(&self.default_team)
    }

    /// Whether `event_type` always reaches the critical channel
    pub fn always_escalates(&self, event_type: EventType) -> bool {
        self.always_escalate.contains(&event_type)
    }
}

/// Table-driven router
#[derive(Debug, Clone)]
pub struct EscalationRouter {
    table: EscalationTable,
}

impl EscalationRouter {
    /// Create new router
    pub fn new(table: EscalationTable) -> Self {
        Self { table }
    }

    /// Escalation table in use
    pub fn table(&self) -> &EscalationTable {
        &self.table
    }

    /// Destinations for a processed (or failed) event
    pub fn route(
        &self,
        event: &InboundEvent,
        classification: &ClassificationResult,
        failure: Option<&DeadLetterRecord>,
    ) -> BTreeSet<Destination> {
        let mut destinations = BTreeSet::new();
        destinations.insert(Destination::AuditLog);

        let escalates = classification.is_critical()
            || event
                .parsed_type()
                .map(|t| self.table.always_escalates(t))
                .unwrap_or(false);

        if escalates {
            destinations.insert(Destination::CriticalNotification);
            if failure.is_some() {
                destinations.insert(Destination::ExecutiveIntervention);
            }
        } else {
            destinations.insert(Destination::StandardNotification);
        }

        if failure.is_some() {
            destinations.insert(Destination::DeadLetter);
        }

        destinations
    }

    /// Destinations for an SLA breach
    pub fn route_breach(&self, breach: &SlaBreach) -> BTreeSet<Destination> {
        let mut destinations = BTreeSet::new();
        destinations.insert(Destination::AuditLog);

        let always = breach
            .event_type
            .parse::<EventType>()
            .map(|t| self.table.always_escalates(t))
            .unwrap_or(false);

        match breach.priority {
            Priority::Critical => {
                destinations.insert(Destination::CriticalNotification);
                destinations.insert(Destination::ExecutiveIntervention);
            }
            Priority::High => {
                destinations.insert(Destination::CriticalNotification);
            }
            Priority::Medium | Priority::Low if always => {
                destinations.insert(Destination::CriticalNotification);
            }
            Priority::Medium | Priority::Low => {
                destinations.insert(Destination::StandardNotification);
            }
        }

        destinations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EmergencyLevel, RequiredAction};
    use chrono::Utc;
    use serde_json::Map;

    fn classification(priority: Priority) -> ClassificationResult {
        ClassificationResult {
            priority,
            required_actions: [RequiredAction::Notify].into_iter().collect(),
            sla_minutes: 60,
            escalation_target: "AML_TEAM".to_string(),
            matched_rules: vec![],
            anomalies: vec![],
        }
    }

    fn dead_letter(event: &InboundEvent) -> DeadLetterRecord {
        DeadLetterRecord {
            original_event: event.clone(),
            failure_reason: "Downstream unavailable".to_string(),
            failure_kind: "unavailable".to_string(),
            correlation_id: event.correlation_id(),
            retry_count: 3,
            max_retries: 3,
            emergency_level: EmergencyLevel::Emergency,
            timestamp: Utc::now(),
        }
    }

    fn breach(event_type: &str, priority: Priority) -> SlaBreach {
        SlaBreach {
            event_id: "E1".to_string(),
            event_type: event_type.to_string(),
            priority,
            correlation_id: "alert-E1-p0-o0".to_string(),
            subject_id: None,
            deadline: Utc::now(),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_team_lookup() {
        let table = EscalationTable::default();
        assert_eq!(table.team_for(EventType::SanctionsHit), "SANCTIONS_TEAM");
        assert_eq!(table.team_for(EventType::MoneyLaundering), "AML_TEAM");
        assert_eq!(table.team_for(EventType::ComplianceViolation), "COMPLIANCE_TEAM");
    }

    #[test]
    fn test_routine_event_goes_to_standard_channel() {
        let router = EscalationRouter::new(EscalationTable::default());
        let event = InboundEvent::new("E1", "AML_ALERT", Map::new());

        let routes = router.route(&event, &classification(Priority::Medium), None);
        assert_eq!(
            routes,
            [Destination::AuditLog, Destination::StandardNotification]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn test_always_escalate_type_reaches_critical_channel() {
        let router = EscalationRouter::new(EscalationTable::default());
        let event = InboundEvent::new("E1", "OFAC_VIOLATION", Map::new());

        let routes = router.route(&event, &classification(Priority::Low), None);
        assert!(routes.contains(&Destination::CriticalNotification));
        assert!(!routes.contains(&Destination::StandardNotification));
        assert!(!routes.contains(&Destination::ExecutiveIntervention));
    }

    #[test]
    fn test_failed_critical_event_reaches_executive() {
        let router = EscalationRouter::new(EscalationTable::default());
        let event = InboundEvent::new("E1", "SANCTIONS_HIT", Map::new());
        let record = dead_letter(&event);

        let routes = router.route(&event, &classification(Priority::Critical), Some(&record));
        assert_eq!(
            routes,
            [
                Destination::AuditLog,
                Destination::DeadLetter,
                Destination::CriticalNotification,
                Destination::ExecutiveIntervention,
            ]
            .into_iter()
            .collect()
        );
    }

    #[test]
    fn test_failed_routine_event_is_dead_lettered_only() {
        let router = EscalationRouter::new(EscalationTable::default());
        let event = InboundEvent::new("E1", "KYC_EXPIRATION", Map::new());
        let record = dead_letter(&event);

        let routes = router.route(&event, &classification(Priority::Low), Some(&record));
        assert!(routes.contains(&Destination::DeadLetter));
        assert!(routes.contains(&Destination::StandardNotification));
        assert!(!routes.contains(&Destination::ExecutiveIntervention));
    }

    #[test]
    fn test_breach_routing() {
        let router = EscalationRouter::new(EscalationTable::default());

        let critical = router.route_breach(&breach("AML_ALERT", Priority::Critical));
        assert!(critical.contains(&Destination::ExecutiveIntervention));

        let low = router.route_breach(&breach("KYC_EXPIRATION", Priority::Low));
        assert!(low.contains(&Destination::StandardNotification));

        let escalated = router.route_breach(&breach("REGULATORY_BREACH", Priority::Low));
        assert!(escalated.contains(&Destination::CriticalNotification));
    }
}
