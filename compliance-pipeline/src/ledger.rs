//! Idempotency ledger
//!
//! Remembers which events already produced their business effect so that
//! redeliveries are acknowledged without running the effect again.

use crate::config::LedgerConfig;
use crate::types::{EventFamily, InboundEvent};
use chrono::{DateTime, Utc};
use resilience::TtlCache;
use tracing::debug;

/// Ledger of processed dedup keys with per-family TTLs
#[derive(Debug)]
pub struct IdempotencyLedger {
    entries: TtlCache<String, DateTime<Utc>>,
    config: LedgerConfig,
}

impl IdempotencyLedger {
    /// Create new ledger
    pub fn new(config: LedgerConfig) -> Self {
        let default_ttl = std::time::Duration::from_secs(config.default_ttl_secs);
        Self {
            entries: TtlCache::new(default_ttl, config.sweep_threshold),
            config,
        }
    }

    /// Dedup key: `<EVENT_TYPE>:<blake3(event_type|subject|occurred_at)>`
    ///
    /// Redeliveries of one occurrence share the key; distinct occurrences for
    /// the same subject differ by timestamp.
    pub fn dedup_key(event: &InboundEvent) -> String {
        let subject = event.subject_id().unwrap_or(&event.event_id);

        let mut hasher = blake3::Hasher::new();
        hasher.update(event.event_type.as_bytes());
        hasher.update(b"|");
        hasher.update(subject.as_bytes());
        hasher.update(b"|");
        hasher.update(event.occurred_at.to_rfc3339().as_bytes());

        format!("{}:{}", event.event_type, hasher.finalize().to_hex())
    }

    /// Whether the key's effect was already committed
    pub fn has_processed(&self, key: &str) -> bool {
        self.entries.contains(&key.to_string())
    }

    /// Record the key; call only after the effect committed
    pub fn mark_processed(&self, key: &str, family: EventFamily) {
        let swept = self.entries.insert_with_ttl(
            key.to_string(),
            Utc::now(),
            self.config.ttl_for(family),
        );
        if swept > 0 {
            debug!(swept, "Ledger swept expired keys");
        }
    }

    /// When the key was marked, if still live
    pub fn marked_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(&key.to_string())
    }

    /// Drop expired keys
    pub fn sweep(&self) -> usize {
        self.entries.sweep()
    }

    /// Stored keys (expired-but-unswept included)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;

    fn event(id: &str, subject: &str, second: u32) -> InboundEvent {
        let payload: Map<String, Value> = json!({ "subjectId": subject })
            .as_object()
            .cloned()
            .unwrap_or_default();
        InboundEvent::new(id, "SANCTIONS_HIT", payload)
            .occurred(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, second).unwrap())
    }

    #[test]
    fn test_dedup_key_shape_and_stability() {
        let first = event("E1", "C-1", 0);
        let key = IdempotencyLedger::dedup_key(&first);

        assert!(key.starts_with("SANCTIONS_HIT:"));
        assert_eq!(key.len(), "SANCTIONS_HIT:".len() + 64);
        assert_eq!(key, IdempotencyLedger::dedup_key(&first.redelivered()));
        assert_ne!(key, IdempotencyLedger::dedup_key(&event("E1", "C-1", 1)));
        assert_ne!(key, IdempotencyLedger::dedup_key(&event("E1", "C-2", 0)));
    }

    #[test]
    fn test_lookup_has_no_side_effect() {
        let ledger = IdempotencyLedger::new(LedgerConfig::default());
        let key = IdempotencyLedger::dedup_key(&event("E1", "C-1", 0));

        assert!(!ledger.has_processed(&key));
        assert!(!ledger.has_processed(&key));
        assert!(ledger.is_empty());

        ledger.mark_processed(&key, EventFamily::Alert);
        assert!(ledger.has_processed(&key));
        assert!(ledger.marked_at(&key).is_some());
    }

    #[test]
    fn test_expired_keys_are_absent_and_swept() {
        let mut family_ttl_secs = HashMap::new();
        family_ttl_secs.insert(EventFamily::Alert, 0);
        let ledger = IdempotencyLedger::new(LedgerConfig {
            default_ttl_secs: 3_600,
            family_ttl_secs,
            sweep_threshold: 100,
        });

        ledger.mark_processed("SANCTIONS_HIT:a", EventFamily::Alert);
        ledger.mark_processed("KYC_VIOLATION:b", EventFamily::Violation);

        assert!(!ledger.has_processed("SANCTIONS_HIT:a"));
        assert!(ledger.has_processed("KYC_VIOLATION:b"));
        assert_eq!(ledger.sweep(), 1);
        assert_eq!(ledger.len(), 1);
    }
}
