//! Rule units and phase-partitioned rule sets.
//!
//! A rule unit is an opaque compiled predicate bound to one inspection phase,
//! together with the actions to execute when it matches. Rule sets are
//! immutable once handed to a transaction and may be shared read-only across
//! any number of concurrent transactions.

use crate::error::{EngineError, EngineResult};
use crate::variables::{Collection, VariableStore};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

/// The ordered inspection phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Connection metadata inspection.
    Connection,
    /// Request header inspection.
    RequestHeaders,
    /// Request body inspection.
    RequestBody,
    /// Response header inspection.
    ResponseHeaders,
    /// Response body inspection.
    ResponseBody,
    /// Audit-only rules evaluated at the end of the exchange.
    Logging,
}

impl Phase {
    /// All phases in evaluation order.
    pub const ALL: [Phase; 6] = [
        Phase::Connection,
        Phase::RequestHeaders,
        Phase::RequestBody,
        Phase::ResponseHeaders,
        Phase::ResponseBody,
        Phase::Logging,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Connection => 0,
            Self::RequestHeaders => 1,
            Self::RequestBody => 2,
            Self::ResponseHeaders => 3,
            Self::ResponseBody => 4,
            Self::Logging => 5,
        }
    }

    /// Stable name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::RequestHeaders => "request-headers",
            Self::RequestBody => "request-body",
            Self::ResponseHeaders => "response-headers",
            Self::ResponseBody => "response-body",
            Self::Logging => "logging",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An action executed when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Record the firing in the matched-rule ledger.
    Log,
    /// Stop evaluating the remainder of the current phase.
    Allow,
    /// Disrupt the exchange with a forced status code.
    Block {
        /// HTTP status code to force.
        status: i32,
    },
    /// Disrupt the exchange by redirecting the client.
    Redirect {
        /// HTTP status code to force, typically 302.
        status: i32,
        /// Redirect target.
        url: String,
    },
    /// Delay the response.
    Pause {
        /// Milliseconds to add to the current phase's accumulated delay.
        ms: i32,
    },
    /// Jump to the rule with the given id within the same phase.
    SkipTo {
        /// Target rule id.
        target: i64,
    },
    /// Defer this rule's actions until the next rule in order also matches.
    Chain,
    /// Write a transaction-local variable.
    SetVar {
        /// Variable key in the `Tx` collection.
        key: String,
        /// Value to store.
        value: String,
    },
}

impl Action {
    /// Check if the action alters the HTTP response or flow.
    #[must_use]
    pub fn is_disruptive(&self) -> bool {
        matches!(self, Self::Block { .. } | Self::Redirect { .. })
    }
}

/// A successful predicate evaluation.
#[derive(Debug, Clone, Default)]
pub struct RuleMatch {
    /// The parameter the predicate matched against, or empty.
    pub parameter: String,
}

/// The evaluation contract a compiled predicate must satisfy.
///
/// The store passed in reflects only variables populated up to and including
/// the current phase. Evaluation must be deterministic given identical store
/// contents and must not mutate the store; writes happen only through
/// [`Action::SetVar`].
pub trait RulePredicate: Send + Sync {
    /// Evaluate against the current variable store snapshot.
    fn evaluate(&self, store: &VariableStore) -> Option<RuleMatch>;
}

impl<F> RulePredicate for F
where
    F: Fn(&VariableStore) -> Option<RuleMatch> + Send + Sync,
{
    fn evaluate(&self, store: &VariableStore) -> Option<RuleMatch> {
        self(store)
    }
}

/// Operator for the built-in pattern predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchOperator {
    /// Regex match.
    #[default]
    Regex,
    /// Contains substring.
    Contains,
    /// Equals exactly.
    Equals,
    /// Starts with.
    StartsWith,
    /// Ends with.
    EndsWith,
}

/// Built-in predicate matching variable values against a pattern.
///
/// With a key the predicate inspects that variable only; without one it scans
/// every value of the collection in stable order and reports the first hit.
#[derive(Debug)]
pub struct PatternPredicate {
    collection: Collection,
    key: Option<String>,
    operator: MatchOperator,
    pattern: String,
    regex: Option<Regex>,
}

impl PatternPredicate {
    /// Compile a predicate over a whole collection.
    pub fn collection(
        collection: Collection,
        operator: MatchOperator,
        pattern: impl Into<String>,
    ) -> EngineResult<Self> {
        Self::build(collection, None, operator, pattern.into())
    }

    /// Compile a predicate over a single variable.
    pub fn variable(
        collection: Collection,
        key: impl Into<String>,
        operator: MatchOperator,
        pattern: impl Into<String>,
    ) -> EngineResult<Self> {
        Self::build(collection, Some(key.into()), operator, pattern.into())
    }

    fn build(
        collection: Collection,
        key: Option<String>,
        operator: MatchOperator,
        pattern: String,
    ) -> EngineResult<Self> {
        let regex = match operator {
            MatchOperator::Regex => Some(
                Regex::new(&pattern)
                    .map_err(|e| EngineError::RuleCompilation(format!("invalid pattern: {e}")))?,
            ),
            _ => None,
        };

        Ok(Self {
            collection,
            key,
            operator,
            pattern,
            regex,
        })
    }

    fn matches_value(&self, value: &str) -> Option<String> {
        match self.operator {
            MatchOperator::Regex => self
                .regex
                .as_ref()
                .and_then(|re| re.find(value))
                .map(|m| m.as_str().to_string()),
            MatchOperator::Contains => value
                .contains(self.pattern.as_str())
                .then(|| value.to_string()),
            MatchOperator::Equals => (value == self.pattern).then(|| value.to_string()),
            MatchOperator::StartsWith => value
                .starts_with(self.pattern.as_str())
                .then(|| value.to_string()),
            MatchOperator::EndsWith => value
                .ends_with(self.pattern.as_str())
                .then(|| value.to_string()),
        }
    }
}

impl RulePredicate for PatternPredicate {
    fn evaluate(&self, store: &VariableStore) -> Option<RuleMatch> {
        if let Some(key) = &self.key {
            let values = store.get(self.collection, key)?;
            values
                .iter()
                .find_map(|v| self.matches_value(v))
                .map(|parameter| RuleMatch { parameter })
        } else {
            store
                .iter_collection(self.collection)
                .find_map(|(_, v)| self.matches_value(v))
                .map(|parameter| RuleMatch { parameter })
        }
    }
}

/// An opaque compiled rule: a predicate bound to a phase, an id, a severity
/// score, a message and an action list. Immutable once constructed.
pub struct RuleUnit {
    /// Unique caller-assigned identifier.
    pub id: i64,

    /// The phase this rule is evaluated in.
    pub phase: Phase,

    /// Severity score.
    pub score: i32,

    /// Human-readable message template.
    pub message: String,

    /// Actions executed in declared order when the predicate matches.
    pub actions: Vec<Action>,

    predicate: Box<dyn RulePredicate>,
}

impl std::fmt::Debug for RuleUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleUnit")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("score", &self.score)
            .field("message", &self.message)
            .field("actions", &self.actions)
            .finish()
    }
}

impl RuleUnit {
    /// Create a rule with no score, message or actions.
    pub fn new(id: i64, phase: Phase, predicate: impl RulePredicate + 'static) -> Self {
        Self {
            id,
            phase,
            score: 0,
            message: String::new(),
            actions: Vec::new(),
            predicate: Box::new(predicate),
        }
    }

    /// Builder: set the severity score.
    #[must_use]
    pub fn with_score(mut self, score: i32) -> Self {
        self.score = score;
        self
    }

    /// Builder: set the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Builder: append an action.
    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Evaluate the predicate against the store.
    pub fn evaluate(&self, store: &VariableStore) -> Option<RuleMatch> {
        self.predicate.evaluate(store)
    }

    /// Check if this rule chains onto the next rule in order.
    #[must_use]
    pub fn is_chained(&self) -> bool {
        self.actions.contains(&Action::Chain)
    }

    /// Check if a firing should be recorded in the ledger.
    ///
    /// A record is made for rules that fire at least one logging, disruptive
    /// or flow-altering action; pure variable writes stay off the ledger.
    #[must_use]
    pub fn is_recordable(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.is_disruptive() || matches!(a, Action::Log | Action::Allow))
    }
}

/// Compiles a rule-text blob into executable rule units.
///
/// Rule-language parsing lives outside this engine; embedders supply a
/// compiler for whatever dialect their rule files use. A textual error from
/// the compiler is propagated as [`EngineError::RuleCompilation`] and leaves
/// the target rule set unchanged.
pub trait RuleCompiler {
    /// Compile rule text into units, or report a textual error.
    fn compile(&self, source: &str) -> Result<Vec<RuleUnit>, String>;
}

/// An ordered, phase-partitioned collection of rule units.
///
/// Within a phase rules are kept in ascending id order, which is the
/// evaluation order unless a `skip-to` action reorders execution. Once a set
/// is shared with transactions it must no longer change; `merge` therefore
/// produces a new set instead of mutating in place.
#[derive(Debug, Default)]
pub struct RuleSet {
    phases: [Vec<Arc<RuleUnit>>; 6],
}

impl RuleSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single compiled rule, keeping ascending id order in its phase.
    pub fn add(&mut self, unit: RuleUnit) -> EngineResult<()> {
        if self.contains_id(unit.id) {
            return Err(EngineError::RuleCompilation(format!(
                "duplicate rule id {}",
                unit.id
            )));
        }

        let rules = &mut self.phases[unit.phase.index()];
        let position = rules
            .binary_search_by_key(&unit.id, |r| r.id)
            .unwrap_or_else(|p| p);
        rules.insert(position, Arc::new(unit));
        Ok(())
    }

    /// Add rules compiled from an in-memory rule-text blob.
    ///
    /// Atomic: on any compilation or id-collision failure the set is left
    /// unchanged. Returns the number of rules added.
    pub fn add_rules(&mut self, compiler: &dyn RuleCompiler, source: &str) -> EngineResult<usize> {
        let units = compiler
            .compile(source)
            .map_err(EngineError::RuleCompilation)?;
        self.add_batch(units)
    }

    /// Add rules compiled from a file on disk.
    pub fn add_rules_file(
        &mut self,
        compiler: &dyn RuleCompiler,
        path: impl AsRef<Path>,
    ) -> EngineResult<usize> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| EngineError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        self.add_rules(compiler, &source)
    }

    /// Boundary stub for remote rule sets keyed by name.
    ///
    /// Fetching rules over the network is a collaborator concern; this engine
    /// reports the request as unsupported rather than guessing at transport.
    pub fn add_rules_remote(&mut self, _key: &str, uri: &str) -> EngineResult<usize> {
        Err(EngineError::RemoteRulesUnsupported {
            uri: uri.to_string(),
        })
    }

    fn add_batch(&mut self, units: Vec<RuleUnit>) -> EngineResult<usize> {
        // Validate the whole batch before touching the set
        let mut batch_ids = std::collections::BTreeSet::new();
        for unit in &units {
            if self.contains_id(unit.id) || !batch_ids.insert(unit.id) {
                return Err(EngineError::RuleCompilation(format!(
                    "duplicate rule id {}",
                    unit.id
                )));
            }
        }

        let count = units.len();
        for unit in units {
            let rules = &mut self.phases[unit.phase.index()];
            let position = rules
                .binary_search_by_key(&unit.id, |r| r.id)
                .unwrap_or_else(|p| p);
            rules.insert(position, Arc::new(unit));
        }
        Ok(count)
    }

    /// Produce a new set holding this set's rules followed by `other`'s.
    ///
    /// Fails without side effects if `other` contains an id already present
    /// here. Copy-on-merge keeps transactions reading the original sets safe.
    pub fn merge(&self, other: &RuleSet) -> EngineResult<RuleSet> {
        for rule in other.iter() {
            if self.contains_id(rule.id) {
                return Err(EngineError::RuleCompilation(format!(
                    "merge collision on rule id {}",
                    rule.id
                )));
            }
        }

        let mut merged = RuleSet::new();
        for (index, rules) in self.phases.iter().enumerate() {
            merged.phases[index] = rules.clone();
        }
        for rule in other.iter() {
            let rules = &mut merged.phases[rule.phase.index()];
            let position = rules
                .binary_search_by_key(&rule.id, |r| r.id)
                .unwrap_or_else(|p| p);
            rules.insert(position, rule.clone());
        }
        Ok(merged)
    }

    /// Check if a rule id is present in any phase.
    #[must_use]
    pub fn contains_id(&self, id: i64) -> bool {
        self.phases
            .iter()
            .any(|rules| rules.binary_search_by_key(&id, |r| r.id).is_ok())
    }

    /// Look up a rule by id.
    #[must_use]
    pub fn get(&self, id: i64) -> Option<&Arc<RuleUnit>> {
        self.phases.iter().find_map(|rules| {
            rules
                .binary_search_by_key(&id, |r| r.id)
                .ok()
                .map(|i| &rules[i])
        })
    }

    /// Rules of one phase in ascending id order.
    #[must_use]
    pub fn rules_for_phase(&self, phase: Phase) -> &[Arc<RuleUnit>] {
        &self.phases[phase.index()]
    }

    /// Iterate all rules, phase by phase.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RuleUnit>> {
        self.phases.iter().flatten()
    }

    /// Total rule count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    /// Check if the set holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize rule ids grouped by phase for diagnostics.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for phase in Phase::ALL {
            let rules = self.rules_for_phase(phase);
            out.push_str(&format!("phase {} ({} rules)\n", phase, rules.len()));
            for rule in rules {
                out.push_str(&format!(
                    "  {} score={} {}\n",
                    rule.id, rule.score, rule.message
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_match(id: i64, phase: Phase) -> RuleUnit {
        RuleUnit::new(id, phase, |_: &VariableStore| Some(RuleMatch::default()))
    }

    #[test]
    fn test_phase_order() {
        assert!(Phase::Connection < Phase::RequestHeaders);
        assert!(Phase::RequestBody < Phase::ResponseHeaders);
        assert!(Phase::ResponseBody < Phase::Logging);
        assert_eq!(Phase::ALL.len(), 6);
    }

    #[test]
    fn test_action_disruptive() {
        assert!(Action::Block { status: 403 }.is_disruptive());
        assert!(Action::Redirect {
            status: 302,
            url: "https://example.com".to_string(),
        }
        .is_disruptive());

        assert!(!Action::Log.is_disruptive());
        assert!(!Action::Pause { ms: 100 }.is_disruptive());
        assert!(!Action::Allow.is_disruptive());
    }

    #[test]
    fn test_pattern_predicate_regex() {
        let mut store = VariableStore::new();
        store.append(Collection::RequestHeaders, "user-agent", "sqlmap/1.5");

        let predicate = PatternPredicate::collection(
            Collection::RequestHeaders,
            MatchOperator::Regex,
            r"(?i)sqlmap",
        )
        .unwrap();

        let matched = predicate.evaluate(&store).unwrap();
        assert_eq!(matched.parameter, "sqlmap");
    }

    #[test]
    fn test_pattern_predicate_keyed() {
        let mut store = VariableStore::new();
        store.append(Collection::RequestHeaders, "x-attack", "1");
        store.append(Collection::RequestHeaders, "x-clean", "1");

        let predicate = PatternPredicate::variable(
            Collection::RequestHeaders,
            "x-attack",
            MatchOperator::Equals,
            "1",
        )
        .unwrap();
        assert!(predicate.evaluate(&store).is_some());

        let predicate = PatternPredicate::variable(
            Collection::RequestHeaders,
            "missing",
            MatchOperator::Equals,
            "1",
        )
        .unwrap();
        assert!(predicate.evaluate(&store).is_none());
    }

    #[test]
    fn test_pattern_predicate_operators() {
        let mut store = VariableStore::new();
        store.append(Collection::Uri, "uri", "/admin/panel");

        let contains =
            PatternPredicate::collection(Collection::Uri, MatchOperator::Contains, "admin")
                .unwrap();
        assert!(contains.evaluate(&store).is_some());

        let starts =
            PatternPredicate::collection(Collection::Uri, MatchOperator::StartsWith, "/admin")
                .unwrap();
        assert!(starts.evaluate(&store).is_some());

        let ends = PatternPredicate::collection(Collection::Uri, MatchOperator::EndsWith, "panel")
            .unwrap();
        assert!(ends.evaluate(&store).is_some());

        let equals = PatternPredicate::collection(Collection::Uri, MatchOperator::Equals, "/admin")
            .unwrap();
        assert!(equals.evaluate(&store).is_none());
    }

    #[test]
    fn test_pattern_predicate_invalid_regex() {
        let result =
            PatternPredicate::collection(Collection::Uri, MatchOperator::Regex, "([unclosed");
        assert!(matches!(result, Err(EngineError::RuleCompilation(_))));
    }

    #[test]
    fn test_rule_unit_builder() {
        let rule = always_match(100, Phase::RequestHeaders)
            .with_score(5)
            .with_message("test rule")
            .with_action(Action::Log)
            .with_action(Action::Block { status: 403 });

        assert_eq!(rule.id, 100);
        assert_eq!(rule.score, 5);
        assert_eq!(rule.actions.len(), 2);
        assert!(rule.is_recordable());
        assert!(!rule.is_chained());
    }

    #[test]
    fn test_rule_unit_recordable() {
        let setvar_only = always_match(1, Phase::RequestHeaders).with_action(Action::SetVar {
            key: "score".to_string(),
            value: "1".to_string(),
        });
        assert!(!setvar_only.is_recordable());

        let log = always_match(2, Phase::RequestHeaders).with_action(Action::Log);
        assert!(log.is_recordable());

        let allow = always_match(3, Phase::RequestHeaders).with_action(Action::Allow);
        assert!(allow.is_recordable());
    }

    #[test]
    fn test_ruleset_add_ordering() {
        let mut set = RuleSet::new();
        set.add(always_match(300, Phase::RequestHeaders)).unwrap();
        set.add(always_match(100, Phase::RequestHeaders)).unwrap();
        set.add(always_match(200, Phase::RequestHeaders)).unwrap();

        let ids: Vec<i64> = set
            .rules_for_phase(Phase::RequestHeaders)
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![100, 200, 300]);
    }

    #[test]
    fn test_ruleset_duplicate_id() {
        let mut set = RuleSet::new();
        set.add(always_match(100, Phase::RequestHeaders)).unwrap();

        let result = set.add(always_match(100, Phase::ResponseHeaders));
        assert!(matches!(result, Err(EngineError::RuleCompilation(_))));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ruleset_merge() {
        let mut a = RuleSet::new();
        a.add(always_match(1, Phase::RequestHeaders)).unwrap();
        a.add(always_match(2, Phase::RequestBody)).unwrap();

        let mut b = RuleSet::new();
        b.add(always_match(3, Phase::RequestHeaders)).unwrap();

        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.len(), 3);
        // Originals untouched
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_ruleset_merge_collision_is_atomic() {
        let mut a = RuleSet::new();
        a.add(always_match(1, Phase::RequestHeaders)).unwrap();
        a.add(always_match(2, Phase::RequestHeaders)).unwrap();

        let mut b = RuleSet::new();
        b.add(always_match(2, Phase::RequestHeaders)).unwrap();
        b.add(always_match(3, Phase::RequestHeaders)).unwrap();

        assert!(a.merge(&b).is_err());
        assert_eq!(a.len(), 2);
        assert!(a.contains_id(1));
        assert!(a.contains_id(2));
        assert!(!a.contains_id(3));
    }

    #[test]
    fn test_ruleset_remote_unsupported() {
        let mut set = RuleSet::new();
        let result = set.add_rules_remote("crs", "https://rules.example/crs.conf");
        assert!(matches!(
            result,
            Err(EngineError::RemoteRulesUnsupported { .. })
        ));
    }

    struct FixedCompiler(Vec<i64>);

    impl RuleCompiler for FixedCompiler {
        fn compile(&self, source: &str) -> Result<Vec<RuleUnit>, String> {
            if source.contains("syntax-error") {
                return Err("unparseable directive".to_string());
            }
            Ok(self
                .0
                .iter()
                .map(|&id| always_match(id, Phase::RequestHeaders))
                .collect())
        }
    }

    #[test]
    fn test_ruleset_add_rules() {
        let mut set = RuleSet::new();
        let added = set
            .add_rules(&FixedCompiler(vec![10, 20]), "rule text")
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_ruleset_add_rules_error_is_atomic() {
        let mut set = RuleSet::new();
        set.add(always_match(10, Phase::RequestHeaders)).unwrap();

        // Compiler failure
        let result = set.add_rules(&FixedCompiler(vec![20]), "syntax-error here");
        assert!(matches!(result, Err(EngineError::RuleCompilation(_))));
        assert_eq!(set.len(), 1);

        // Batch collides with an existing id; nothing from the batch lands
        let result = set.add_rules(&FixedCompiler(vec![30, 10]), "rule text");
        assert!(result.is_err());
        assert_eq!(set.len(), 1);
        assert!(!set.contains_id(30));
    }

    #[test]
    fn test_ruleset_dump() {
        let mut set = RuleSet::new();
        set.add(
            always_match(100, Phase::RequestHeaders)
                .with_score(5)
                .with_message("header rule"),
        )
        .unwrap();

        let dump = set.dump();
        assert!(dump.contains("phase request-headers (1 rules)"));
        assert!(dump.contains("100 score=5 header rule"));
        assert!(dump.contains("phase logging (0 rules)"));
    }
}
