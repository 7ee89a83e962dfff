//! Intervention value type and precedence resolution.

use serde::Serialize;

/// The engine's current security decision for a transaction.
///
/// A default intervention (`status` 0, `disruptive` false) means the exchange
/// may proceed untouched. Callers copy fields out after each phase; the value
/// is recomputed by the resolver, never patched in place by rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Intervention {
    /// HTTP status code to force, or 0 for none.
    pub status: i32,

    /// Milliseconds to delay the response.
    pub pause: i32,

    /// Redirect target, or empty for none.
    pub url: String,

    /// Message describing the decision, or empty.
    pub log: String,

    /// Whether the exchange should be disrupted (blocked or redirected).
    pub disruptive: bool,
}

impl Default for Intervention {
    fn default() -> Self {
        Self {
            status: 0,
            pause: 0,
            url: String::new(),
            log: String::new(),
            disruptive: false,
        }
    }
}

impl Intervention {
    /// Check if this intervention leaves the exchange untouched.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.disruptive && self.pause == 0
    }
}

/// Computes the single effective intervention from all fired actions.
///
/// Precedence: the first disruptive action wins `status`, `url`, `log` and
/// `disruptive` for the remainder of the transaction; `pause` values sum
/// across all pause actions fired within the same phase and reset when a new
/// phase begins.
#[derive(Debug, Default)]
pub struct InterventionResolver {
    current: Intervention,
}

impl InterventionResolver {
    /// Create a resolver with an untouched intervention.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a phase, resetting the accumulated pause.
    pub fn begin_phase(&mut self) {
        self.current.pause = 0;
    }

    /// Record a disruptive action. The first one wins; later calls keep the
    /// established decision.
    pub fn disrupt(&mut self, status: i32, url: &str, log: &str) {
        if self.current.disruptive {
            return;
        }
        self.current.status = status;
        self.current.url = url.to_string();
        self.current.log = log.to_string();
        self.current.disruptive = true;
    }

    /// Accumulate a pause delay for the current phase.
    pub fn add_pause(&mut self, ms: i32) {
        self.current.pause = self.current.pause.saturating_add(ms);
    }

    /// The current effective intervention.
    #[must_use]
    pub fn intervention(&self) -> Intervention {
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_noop() {
        let intervention = Intervention::default();
        assert_eq!(intervention.status, 0);
        assert_eq!(intervention.pause, 0);
        assert!(intervention.url.is_empty());
        assert!(!intervention.disruptive);
        assert!(intervention.is_noop());
    }

    #[test]
    fn test_first_disruptive_wins() {
        let mut resolver = InterventionResolver::new();
        resolver.begin_phase();
        resolver.disrupt(403, "", "blocked by rule 1");
        resolver.disrupt(302, "https://quarantine.example", "redirect by rule 2");

        let intervention = resolver.intervention();
        assert_eq!(intervention.status, 403);
        assert!(intervention.url.is_empty());
        assert_eq!(intervention.log, "blocked by rule 1");
        assert!(intervention.disruptive);
    }

    #[test]
    fn test_pause_accumulates_within_phase() {
        let mut resolver = InterventionResolver::new();
        resolver.begin_phase();
        resolver.add_pause(100);
        resolver.add_pause(100);
        assert_eq!(resolver.intervention().pause, 200);
    }

    #[test]
    fn test_pause_resets_per_phase() {
        let mut resolver = InterventionResolver::new();
        resolver.begin_phase();
        resolver.add_pause(150);
        resolver.begin_phase();
        assert_eq!(resolver.intervention().pause, 0);

        resolver.add_pause(50);
        assert_eq!(resolver.intervention().pause, 50);
    }

    #[test]
    fn test_disruption_survives_phase_change() {
        let mut resolver = InterventionResolver::new();
        resolver.begin_phase();
        resolver.disrupt(403, "", "early block");
        resolver.begin_phase();

        let intervention = resolver.intervention();
        assert!(intervention.disruptive);
        assert_eq!(intervention.status, 403);
    }

    #[test]
    fn test_pause_and_disrupt_compose() {
        let mut resolver = InterventionResolver::new();
        resolver.begin_phase();
        resolver.add_pause(100);
        resolver.disrupt(403, "", "block");

        let intervention = resolver.intervention();
        assert_eq!(intervention.pause, 100);
        assert_eq!(intervention.status, 403);
        assert!(!intervention.is_noop());
    }
}
