//! Append-only record of rules that fired during a transaction.

use serde::Serialize;

/// One matched-rule record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    /// Identifier of the rule that fired.
    pub id: i64,

    /// The rule's severity score.
    pub score: i32,

    /// The rule's message.
    pub message: String,

    /// The parameter captured by the rule's predicate, or empty.
    pub parameter: String,
}

/// Ordered snapshot of all matched-rule records.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RulesInfo {
    /// Records in firing order.
    pub items: Vec<RuleInfo>,
}

impl RulesInfo {
    /// Number of records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.items.len()
    }
}

/// The matched-rule ledger.
///
/// Records are appended in evaluation order and never reordered or
/// deduplicated: a rule that fires twice (for example through a `skip-to`
/// loop) records once per firing.
#[derive(Debug, Clone, Default)]
pub struct MatchedRuleLedger {
    records: Vec<RuleInfo>,
}

impl MatchedRuleLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one firing record.
    pub fn record(&mut self, id: i64, score: i32, message: &str, parameter: &str) {
        self.records.push(RuleInfo {
            id,
            score,
            message: message.to_string(),
            parameter: parameter.to_string(),
        });
    }

    /// Full ordered snapshot for audit.
    #[must_use]
    pub fn snapshot(&self) -> RulesInfo {
        RulesInfo {
            items: self.records.clone(),
        }
    }

    /// Iterate records in firing order.
    pub fn iter(&self) -> impl Iterator<Item = &RuleInfo> {
        self.records.iter()
    }

    /// Number of firing records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no rule has fired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all records.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let mut ledger = MatchedRuleLedger::new();
        ledger.record(942100, 10, "SQL injection", "1' OR '1'='1");
        ledger.record(941100, 5, "XSS", "<script>");

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.count(), 2);
        assert_eq!(snapshot.items[0].id, 942100);
        assert_eq!(snapshot.items[1].id, 941100);
    }

    #[test]
    fn test_no_deduplication() {
        let mut ledger = MatchedRuleLedger::new();
        ledger.record(100, 1, "repeat", "a");
        ledger.record(100, 1, "repeat", "b");

        assert_eq!(ledger.len(), 2);
        let params: Vec<&str> = ledger.iter().map(|r| r.parameter.as_str()).collect();
        assert_eq!(params, vec!["a", "b"]);
    }

    #[test]
    fn test_order_is_firing_order() {
        let mut ledger = MatchedRuleLedger::new();
        // Fired out of id order via a backward skip-to
        ledger.record(300, 0, "third first", "");
        ledger.record(100, 0, "first second", "");

        let ids: Vec<i64> = ledger.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![300, 100]);
    }

    #[test]
    fn test_clear() {
        let mut ledger = MatchedRuleLedger::new();
        ledger.record(1, 0, "m", "");
        assert!(!ledger.is_empty());
        ledger.clear();
        assert!(ledger.is_empty());
    }
}
