//! # Phalanx
//!
//! An embeddable Web-Application-Firewall transaction processing engine.
//! For each inbound/outbound HTTP exchange it evaluates a compiled rule set
//! across ordered inspection phases and produces a deterministic intervention
//! decision (allow, block, redirect or pause) plus a record of which rules
//! matched.
//!
//! ## Architecture
//!
//! - A [`rules::RuleSet`] is an immutable, phase-partitioned collection of
//!   opaque compiled rules, shared read-only by any number of transactions.
//! - A [`transaction::Transaction`] is the per-exchange state machine:
//!   callers feed connection info, headers and body chunks, advance phase by
//!   phase and query the current [`intervention::Intervention`] after each.
//! - At the logging phase the matched-rule ledger is flushed through the
//!   engine's registered [`logging::LogSink`].
//!
//! Rule-language parsing, remote rule fetching and the audit sink itself are
//! collaborator concerns; this crate defines the engine that executes
//! compiled rules and computes the resulting security decision.
//!
//! ## Example
//!
//! ```
//! use phalanx::engine::Engine;
//! use phalanx::rules::{Action, MatchOperator, PatternPredicate, Phase, RuleSet, RuleUnit};
//! use phalanx::variables::Collection;
//! use std::sync::Arc;
//!
//! let mut rules = RuleSet::new();
//! rules.add(
//!     RuleUnit::new(
//!         942001,
//!         Phase::RequestHeaders,
//!         PatternPredicate::variable(
//!             Collection::RequestHeaders,
//!             "x-attack",
//!             MatchOperator::Equals,
//!             "1",
//!         )?,
//!     )
//!     .with_score(10)
//!     .with_message("attack marker header")
//!     .with_action(Action::Block { status: 403 }),
//! )?;
//!
//! let engine = Engine::new();
//! let mut tx = engine.new_transaction(Arc::new(rules));
//! tx.add_request_header("X-Attack", "1")?;
//! let intervention = tx.process_request_headers()?;
//! assert!(intervention.disruptive);
//! assert_eq!(intervention.status, 403);
//! # Ok::<(), phalanx::error::EngineError>(())
//! ```

pub mod body;
pub mod config;
pub mod engine;
pub mod error;
pub mod intervention;
pub mod ledger;
pub mod logging;
pub mod rules;
pub mod transaction;
pub mod variables;

pub use config::{BodyLimitAction, EngineConfig};
pub use engine::{Engine, BuildInfo, BUILD_INFO};
pub use error::{EngineError, EngineResult};
pub use intervention::Intervention;
pub use ledger::{RuleInfo, RulesInfo};
pub use logging::{AuditEvent, LogSink};
pub use rules::{Action, Phase, RuleCompiler, RulePredicate, RuleSet, RuleUnit};
pub use transaction::Transaction;
pub use variables::{Collection, VariableStore};
