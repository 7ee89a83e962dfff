//! Engine handle: log sink registration, connector identity and
//! transaction creation.

use crate::config::EngineConfig;
use crate::logging::{LogDispatcher, LogSink};
use crate::rules::RuleSet;
use crate::transaction::Transaction;
use std::sync::Arc;
use tracing::info;

/// Build metadata, constructed once and read-only thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    /// Crate name.
    pub name: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Target operating system.
    pub platform: &'static str,
}

/// This build's metadata record.
pub const BUILD_INFO: BuildInfo = BuildInfo {
    name: env!("CARGO_PKG_NAME"),
    version: env!("CARGO_PKG_VERSION"),
    platform: std::env::consts::OS,
};

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{} ({})", self.name, self.version, self.platform)
    }
}

/// The engine instance transactions are created from.
///
/// Holds the configuration, the registered audit sink and the connector
/// identity string. Rule sets are passed in per transaction so one engine can
/// serve several independent policies.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    dispatcher: LogDispatcher,
    connector: Option<String>,
}

impl Engine {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with custom configuration.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        info!(version = %BUILD_INFO, "engine created");
        Self {
            config,
            dispatcher: LogDispatcher::new(),
            connector: None,
        }
    }

    /// Register the sink that receives audit events at the logging phase.
    ///
    /// Transactions already created keep the sink they were created with.
    pub fn set_log_sink(&mut self, sink: impl LogSink + 'static) {
        self.dispatcher.set_sink(Arc::new(sink));
    }

    /// Set the connector identity used in diagnostic reporting. Has no
    /// behavioral effect on evaluation.
    pub fn set_connector_info(&mut self, connector: &str) {
        self.connector = Some(connector.to_string());
    }

    /// Version and platform information, plus the connector identity if set.
    #[must_use]
    pub fn who_am_i(&self) -> String {
        match &self.connector {
            Some(connector) => format!("{BUILD_INFO}; connector: {connector}"),
            None => BUILD_INFO.to_string(),
        }
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a transaction bound to a shared, immutable rule set.
    #[must_use]
    pub fn new_transaction(&self, rules: Arc<RuleSet>) -> Transaction {
        Transaction::new(
            rules,
            self.config.clone(),
            self.dispatcher.clone(),
            self.who_am_i(),
        )
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info_display() {
        let formatted = BUILD_INFO.to_string();
        assert!(formatted.contains(BUILD_INFO.name));
        assert!(formatted.contains(BUILD_INFO.version));
    }

    #[test]
    fn test_who_am_i() {
        let mut engine = Engine::new();
        let plain = engine.who_am_i();
        assert!(plain.contains(BUILD_INFO.version));

        engine.set_connector_info("TestConnector v1.0.0 (integration)");
        let with_connector = engine.who_am_i();
        assert!(with_connector.starts_with(&plain));
        assert!(with_connector.contains("TestConnector"));
    }

    #[test]
    fn test_new_transaction_binds_ruleset() {
        let engine = Engine::new();
        let rules = Arc::new(RuleSet::new());

        let mut tx = engine.new_transaction(Arc::clone(&rules));
        let intervention = tx.process_request_headers().unwrap();
        assert!(!intervention.disruptive);

        // Several transactions can share the same set
        let mut other = engine.new_transaction(rules);
        assert!(other.process_request_headers().is_ok());
    }
}
