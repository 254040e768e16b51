//! Per-rule cooldown

use chrono::{DateTime, Utc};
use homectl_core::RuleId;
use std::collections::HashMap;
use std::time::Duration;

/// Default minimum spacing between two firings of the same rule
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Tracks when each rule last fired
///
/// Holds one timestamp per rule that has fired; entries are dropped with
/// [`CooldownTracker::forget`] when the rule is deleted.
#[derive(Debug, Clone)]
pub struct CooldownTracker {
    window: Duration,
    last_fired: HashMap<RuleId, DateTime<Utc>>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether `rule_id` may fire at `now`
    ///
    /// A `now` earlier than the last firing counts as inside the window.
    pub fn should_fire(&self, rule_id: RuleId, now: DateTime<Utc>) -> bool {
        match self.last_fired.get(&rule_id) {
            None => true,
            Some(last) => (now - *last)
                .to_std()
                .map(|elapsed| elapsed >= self.window)
                .unwrap_or(false),
        }
    }

    pub fn record_fired(&mut self, rule_id: RuleId, now: DateTime<Utc>) {
        self.last_fired.insert(rule_id, now);
    }

    pub fn forget(&mut self, rule_id: RuleId) {
        self.last_fired.remove(&rule_id);
    }

    /// Drop state of every rule not accepted by `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(RuleId) -> bool) {
        self.last_fired.retain(|id, _| keep(*id));
    }

    pub fn last_fired(&self, rule_id: RuleId) -> Option<DateTime<Utc>> {
        self.last_fired.get(&rule_id).copied()
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
