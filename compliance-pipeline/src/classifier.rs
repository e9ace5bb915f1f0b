//! Event classification
//!
//! Every rule is evaluated and the highest matching priority wins, so adding
//! evidence (a higher score, a sanctions match) can only raise the priority.

use crate::config::{ClassifierConfig, SlaConfig};
use crate::error::Result;
use crate::escalation::EscalationTable;
use crate::types::{
    ClassificationResult, Enrichment, EventFamily, EventType, InboundEvent, Priority,
    RequiredAction,
};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Rule-based classifier; deterministic and side-effect free
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    sla: SlaConfig,
    escalation: EscalationTable,
}

/// Facts extracted from an event before rules are applied
struct Facts {
    event_type: EventType,
    critical_type: bool,
    score: Option<f64>,
    incidents: u32,
    sanctioned_country: bool,
}

impl Classifier {
    /// Create new classifier
    pub fn new(config: ClassifierConfig, sla: SlaConfig, escalation: EscalationTable) -> Self {
        Self {
            config,
            sla,
            escalation,
        }
    }

    /// Classify an event
    pub fn classify(
        &self,
        event: &InboundEvent,
        enrichment: &Enrichment,
    ) -> Result<ClassificationResult> {
        let event_type = event.parsed_type()?;
        let family = event_type.family();
        let c = &self.config;

        let payload_score = event.number_field("riskScore")?;
        let score = match (payload_score, enrichment.risk_score) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let amount = event.decimal_field("amount")?;
        let country = event.str_field("country").map(str::to_ascii_uppercase);
        let payload_incidents = event
            .number_field("priorIncidents")?
            .map(|n| n.max(0.0) as u32)
            .unwrap_or(0);
        let incidents = payload_incidents.saturating_add(enrichment.prior_incidents);

        let facts = Facts {
            event_type,
            critical_type: c.critical_types.contains(&event_type),
            score,
            incidents,
            sanctioned_country: country
                .as_ref()
                .map(|code| c.sanctioned_countries.contains(code))
                .unwrap_or(false),
        };

        let mut matched: Vec<(&'static str, Priority)> = Vec::new();
        let mut anomalies = Vec::new();

        if facts.critical_type {
            matched.push(("critical_type", Priority::Critical));
        }

        if let Some(score) = facts.score {
            if score >= c.critical_score {
                matched.push(("risk_score_critical", Priority::Critical));
            } else if score >= c.high_score {
                matched.push(("risk_score_high", Priority::High));
            } else if score >= c.medium_score {
                matched.push(("risk_score_medium", Priority::Medium));
            }
        }

        if let Some(amount) = amount {
            if amount > c.high_amount {
                matched.push(("amount_high", Priority::High));
            } else if amount > c.medium_amount {
                matched.push(("amount_medium", Priority::Medium));
            }
        }

        if facts.sanctioned_country {
            matched.push(("sanctioned_country", Priority::Critical));
        } else if country
            .as_ref()
            .map(|code| c.high_risk_countries.contains(code))
            .unwrap_or(false)
        {
            matched.push(("high_risk_country", Priority::High));
        }

        if enrichment.sanctions_list_match {
            matched.push(("sanctions_match", Priority::Critical));
        }
        if enrichment.pep_match {
            matched.push(("pep", Priority::High));
        }

        if facts.incidents > c.high_incidents {
            matched.push(("incidents_high", Priority::High));
        } else if facts.incidents > c.medium_incidents {
            matched.push(("incidents_medium", Priority::Medium));
        }

        if let Some(raw) = event.str_field("severity") {
            match raw.parse::<Priority>() {
                Ok(declared) => matched.push(("declared_severity", declared)),
                Err(_) => anomalies.push(format!("unrecognised severity {:?} ignored", raw)),
            }
        }

        if facts.critical_type {
            if let Some(score) = facts.score.filter(|s| *s < c.medium_score) {
                anomalies.push(format!(
                    "{} carries risk score {} below the medium threshold",
                    event_type, score
                ));
            }
        }

        let priority = matched
            .iter()
            .map(|(_, p)| *p)
            .max()
            .unwrap_or(Priority::Low);

        let required_actions = self.required_actions(&facts, family, priority);
        let sla_minutes = self
            .sla
            .table_for(family)
            .minutes_for(priority, facts.critical_type);

        for anomaly in &anomalies {
            warn!(
                event_id = %event.event_id,
                event_type = %event_type,
                "Classification anomaly: {}",
                anomaly
            );
        }

        let result = ClassificationResult {
            priority,
            required_actions,
            sla_minutes,
            escalation_target: self.escalation.team_for(facts.event_type).to_string(),
            matched_rules: matched.iter().map(|(rule, _)| rule.to_string()).collect(),
            anomalies,
        };

        debug!(
            event_id = %event.event_id,
            priority = result.priority.as_str(),
            sla_minutes = result.sla_minutes,
            target = %result.escalation_target,
            "Event classified"
        );

        Ok(result)
    }

    /// Classification used when an event cannot be classified from its payload
    ///
    /// A known critical type stays CRITICAL whatever the payload holds.
    pub fn fallback(&self, event_type: Option<EventType>) -> ClassificationResult {
        let anomalies = vec!["event could not be classified".to_string()];

        let Some(event_type) = event_type else {
            return ClassificationResult {
                priority: Priority::Low,
                required_actions: [RequiredAction::Notify].into_iter().collect(),
                sla_minutes: self.sla.default_table.low,
                escalation_target: self.escalation.default_team.clone(),
                matched_rules: vec![],
                anomalies,
            };
        };

        let family = event_type.family();
        let critical_type = self.config.critical_types.contains(&event_type);
        let (priority, matched_rules) = if critical_type {
            (Priority::Critical, vec!["critical_type".to_string()])
        } else {
            (Priority::Low, vec![])
        };
        let facts = Facts {
            event_type,
            critical_type,
            score: None,
            incidents: 0,
            sanctioned_country: false,
        };

        ClassificationResult {
            priority,
            required_actions: self.required_actions(&facts, family, priority),
            sla_minutes: self
                .sla
                .table_for(family)
                .minutes_for(priority, critical_type),
            escalation_target: self.escalation.team_for(event_type).to_string(),
            matched_rules,
            anomalies,
        }
    }

    fn required_actions(
        &self,
        facts: &Facts,
        family: EventFamily,
        priority: Priority,
    ) -> BTreeSet<RequiredAction> {
        let c = &self.config;
        let score_at_least = |threshold: f64| facts.score.map(|s| s >= threshold).unwrap_or(false);

        let mut actions = BTreeSet::new();
        actions.insert(RequiredAction::Notify);

        if priority == Priority::Critical || facts.critical_type || score_at_least(c.escalate_score)
        {
            actions.insert(RequiredAction::Escalate);
        }
        if priority >= Priority::Medium || score_at_least(c.investigate_score) || facts.incidents > 1
        {
            actions.insert(RequiredAction::Investigate);
        }
        if facts.critical_type || facts.sanctioned_country || score_at_least(c.block_score) {
            actions.insert(RequiredAction::Block);
        }
        if priority == Priority::Critical || family == EventFamily::SarDeadline {
            actions.insert(RequiredAction::Report);
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use serde_json::{json, Map, Value};

    fn classifier() -> Classifier {
        Classifier::new(
            ClassifierConfig::default(),
            SlaConfig::default(),
            EscalationTable::default(),
        )
    }

    fn event(event_type: &str, payload: Value) -> InboundEvent {
        let payload: Map<String, Value> = payload.as_object().cloned().unwrap_or_default();
        InboundEvent::new("E1", event_type, payload)
    }

    #[test]
    fn test_sanctions_hit_is_critical() {
        let result = classifier()
            .classify(
                &event("SANCTIONS_HIT", json!({"riskScore": 95, "subjectId": "C-1"})),
                &Enrichment::default(),
            )
            .unwrap();

        assert_eq!(result.priority, Priority::Critical);
        assert_eq!(result.sla_minutes, 5);
        assert_eq!(result.escalation_target, "SANCTIONS_TEAM");
        assert!(result.requires(RequiredAction::Escalate));
        assert!(result.requires(RequiredAction::Block));
        assert!(result.requires(RequiredAction::Report));
        assert!(result.anomalies.is_empty());
    }

    #[test]
    fn test_highest_matching_rule_wins() {
        // Score alone says MEDIUM, amount says HIGH
        let result = classifier()
            .classify(
                &event("AML_ALERT", json!({"riskScore": 55, "amount": "75000.00"})),
                &Enrichment::default(),
            )
            .unwrap();

        assert_eq!(result.priority, Priority::High);
        assert_eq!(result.sla_minutes, 60);
        assert!(result.matched_rules.contains(&"risk_score_medium".to_string()));
        assert!(result.matched_rules.contains(&"amount_high".to_string()));
    }

    #[test]
    fn test_no_signals_is_low() {
        let result = classifier()
            .classify(&event("AML_ALERT", json!({})), &Enrichment::default())
            .unwrap();

        assert_eq!(result.priority, Priority::Low);
        assert_eq!(result.sla_minutes, 1_440);
        assert_eq!(
            result.required_actions,
            [RequiredAction::Notify].into_iter().collect()
        );
    }

    #[test]
    fn test_low_score_on_critical_type_is_anomaly() {
        let result = classifier()
            .classify(
                &event("MONEY_LAUNDERING", json!({"riskScore": 10})),
                &Enrichment::default(),
            )
            .unwrap();

        assert_eq!(result.priority, Priority::Critical);
        assert_eq!(result.anomalies.len(), 1);
    }

    #[test]
    fn test_enrichment_raises_priority() {
        let c = classifier();
        let base = event("AML_ALERT", json!({"subjectId": "C-1"}));

        let pep = c
            .classify(
                &base,
                &Enrichment {
                    pep_match: true,
                    ..Enrichment::default()
                },
            )
            .unwrap();
        assert_eq!(pep.priority, Priority::High);

        let sanctions = c
            .classify(
                &base,
                &Enrichment {
                    sanctions_list_match: true,
                    ..Enrichment::default()
                },
            )
            .unwrap();
        assert_eq!(sanctions.priority, Priority::Critical);
    }

    #[test]
    fn test_country_and_incidents() {
        let c = classifier();

        let sanctioned = c
            .classify(&event("AML_ALERT", json!({"country": "kp"})), &Enrichment::default())
            .unwrap();
        assert_eq!(sanctioned.priority, Priority::Critical);
        assert!(sanctioned.requires(RequiredAction::Block));

        let repeat = c
            .classify(
                &event("KYC_VIOLATION", json!({"priorIncidents": 3})),
                &Enrichment::default(),
            )
            .unwrap();
        assert_eq!(repeat.priority, Priority::High);
        assert!(repeat.requires(RequiredAction::Investigate));
    }

    #[test]
    fn test_sar_deadline_requires_report() {
        let result = classifier()
            .classify(&event("SAR_DEADLINE", json!({"caseId": "S-1"})), &Enrichment::default())
            .unwrap();
        assert!(result.requires(RequiredAction::Report));
        assert_eq!(result.escalation_target, "SAR_FILING_TEAM");
    }

    #[test]
    fn test_unknown_type_is_validation_error() {
        let err = classifier()
            .classify(&event("WIRE_TRANSFER", json!({})), &Enrichment::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_malformed_score_is_validation_error() {
        let err = classifier()
            .classify(
                &event("AML_ALERT", json!({"riskScore": "very high"})),
                &Enrichment::default(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_fallback_keeps_critical_type_critical() {
        let c = classifier();

        let critical = c.fallback(Some(EventType::SanctionsHit));
        assert_eq!(critical.priority, Priority::Critical);
        assert_eq!(critical.sla_minutes, 5);
        assert_eq!(critical.escalation_target, "SANCTIONS_TEAM");
        assert!(critical.requires(RequiredAction::Escalate));
        assert!(critical.requires(RequiredAction::Report));

        let ordinary = c.fallback(Some(EventType::AmlAlert));
        assert_eq!(ordinary.priority, Priority::Low);
        assert_eq!(ordinary.sla_minutes, 1440);

        let unknown = c.fallback(None);
        assert_eq!(unknown.priority, Priority::Low);
        assert_eq!(unknown.escalation_target, "COMPLIANCE_TEAM");
    }
}
