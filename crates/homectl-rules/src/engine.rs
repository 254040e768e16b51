//! Rule engine
//!
//! The `RuleEngine` owns the in-memory rule set and the cooldown state. It
//! consumes inbound messages from a transport channel, matches them against
//! the enabled rules in ascending id order and dispatches the action of the
//! first candidate.
//!
//! Every operation, event handling and rule mutation alike, runs under one
//! async mutex for its whole critical section (store calls included), so an
//! event never sees a half-applied mutation.

use chrono::{DateTime, Utc};
use homectl_core::{Event, RuleDefinition, RuleId};
use homectl_store::{RuleStore, StoreError};
use homectl_transport::{Inbound, Qos, Transport};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

use crate::cooldown::{CooldownTracker, DEFAULT_COOLDOWN};
use crate::dispatch::ActionDispatcher;
use crate::rule::Rule;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("rule store failed: {0}")]
    Persistence(#[from] StoreError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine tuning
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Minimum spacing between two firings of the same rule
    pub cooldown: Duration,
    /// QoS used for device commands
    pub qos: Qos,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            qos: Qos::AtLeastOnce,
        }
    }
}

/// What happened to one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// `rule_id` fired; `dispatched` is false when the transport rejected the command
    Fired { rule_id: RuleId, dispatched: bool },
    /// The first candidate was inside its cooldown window
    Suppressed { rule_id: RuleId },
    /// No enabled rule matched
    NoMatch,
    /// The message could not be decoded
    Dropped,
}

struct EngineState {
    rules: BTreeMap<RuleId, Rule>,
    cooldown: CooldownTracker,
}

/// Evaluates telemetry against rules and dispatches device commands
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    dispatcher: ActionDispatcher,
    state: Mutex<EngineState>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn RuleStore>, transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            store,
            dispatcher: ActionDispatcher::new(transport, config.qos),
            state: Mutex::new(EngineState {
                rules: BTreeMap::new(),
                cooldown: CooldownTracker::new(config.cooldown),
            }),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Replace the in-memory rule set with the store's content
    ///
    /// Cooldown state survives for rules that still exist.
    pub async fn load_rules(&self) -> EngineResult<usize> {
        let mut state = self.state.lock().await;

        let rows = self.store.all_rules().await?;
        let mut rules = BTreeMap::new();
        for row in rows {
            let rule = Rule::resolve(row, self.store.as_ref()).await?;
            rules.insert(rule.id, rule);
        }

        state.cooldown.retain(|id| rules.contains_key(&id));
        state.rules = rules;

        info!(count = state.rules.len(), "Loaded rules");
        Ok(state.rules.len())
    }

    /// Persist a new, enabled rule and start evaluating it
    ///
    /// Nothing changes in memory if the store rejects the rule.
    pub async fn add_rule(&self, definition: RuleDefinition) -> EngineResult<RuleId> {
        let mut state = self.state.lock().await;

        let sensor_category = self.store.sensor_category(definition.sensor_id).await?;
        let device_category = self.store.device_category(definition.device_id).await?;
        let id = self.store.add_rule(&definition).await?;

        let rule = Rule::from_definition(id, definition, &sensor_category, &device_category, true);
        info!(
            rule_id = id,
            name = %rule.name,
            source = %rule.source.topic,
            target = %rule.target.topic,
            "Added rule"
        );
        state.rules.insert(id, rule);
        Ok(id)
    }

    /// Delete a rule from the store and from memory
    ///
    /// Returns whether the rule was loaded. Unknown ids are a no-op.
    pub async fn delete_rule(&self, id: RuleId) -> EngineResult<bool> {
        let mut state = self.state.lock().await;

        self.store.delete_rule(id).await?;
        state.cooldown.forget(id);
        let existed = state.rules.remove(&id).is_some();
        if existed {
            info!(rule_id = id, "Deleted rule");
        }
        Ok(existed)
    }

    /// Enable or disable a rule
    ///
    /// Returns `false` without touching the store for unknown ids.
    pub async fn set_enabled(&self, id: RuleId, enabled: bool) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        self.apply_enabled(&mut state, id, enabled).await
    }

    /// Flip a rule's enabled flag, returning the new value
    pub async fn toggle(&self, id: RuleId) -> EngineResult<Option<bool>> {
        let mut state = self.state.lock().await;

        let Some(enabled) = state.rules.get(&id).map(|r| !r.enabled) else {
            return Ok(None);
        };
        self.apply_enabled(&mut state, id, enabled).await?;
        Ok(Some(enabled))
    }

    async fn apply_enabled(&self, state: &mut EngineState, id: RuleId, enabled: bool) -> EngineResult<bool> {
        if !state.rules.contains_key(&id) {
            debug!(rule_id = id, "Ignoring enable change for unknown rule");
            return Ok(false);
        }

        self.store.set_enabled(id, enabled).await?;
        if let Some(rule) = state.rules.get_mut(&id) {
            rule.enabled = enabled;
        }
        info!(rule_id = id, enabled, "Changed rule state");
        Ok(true)
    }

    /// Re-resolve the topics of every rule after category changes
    ///
    /// Returns the number of rules whose topics changed.
    pub async fn refresh_topics(&self) -> EngineResult<usize> {
        let mut state = self.state.lock().await;

        let mut changed = 0;
        for rule in state.rules.values_mut() {
            if rule.refresh_topics(self.store.as_ref()).await? {
                debug!(rule_id = rule.id, source = %rule.source.topic, target = %rule.target.topic, "Rule topics changed");
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Snapshot of all rules in ascending id order
    pub async fn rules(&self) -> Vec<Rule> {
        self.state.lock().await.rules.values().cloned().collect()
    }

    pub async fn rule(&self, id: RuleId) -> Option<Rule> {
        self.state.lock().await.rules.get(&id).cloned()
    }

    /// When `id` last fired, if it has
    pub async fn last_fired(&self, id: RuleId) -> Option<DateTime<Utc>> {
        self.state.lock().await.cooldown.last_fired(id)
    }

    /// Evaluate one event against the enabled rules
    ///
    /// Matching rules are tried in ascending id order; those still cooling
    /// down are skipped and the first one past its cooldown fires. The event
    /// is suppressed only when every matching rule is cooling down.
    pub async fn handle_event(&self, event: &Event) -> EventOutcome {
        let mut guard = self.state.lock().await;
        let EngineState { rules, cooldown } = &mut *guard;

        let now = event.received_at;
        let mut suppressed = None;
        let mut selected = None;
        for rule in rules.values().filter(|r| r.enabled && r.matches(event)) {
            if cooldown.should_fire(rule.id, now) {
                selected = Some(rule);
                break;
            }
            debug!(rule_id = rule.id, name = %rule.name, "Rule in cooldown, skipped");
            suppressed.get_or_insert(rule.id);
        }

        let Some(rule) = selected else {
            return match suppressed {
                Some(rule_id) => EventOutcome::Suppressed { rule_id },
                None => {
                    trace!(topic = %event.topic, "No rule matched");
                    EventOutcome::NoMatch
                }
            };
        };

        let dispatched = match self.dispatcher.dispatch(rule).await {
            Ok(()) => {
                info!(
                    rule_id = rule.id,
                    name = %rule.name,
                    device_id = rule.target.device_id,
                    topic = %rule.target.topic,
                    "Rule fired"
                );
                true
            }
            Err(e) => {
                warn!(rule_id = rule.id, error = %e, "Dispatch failed");
                false
            }
        };

        cooldown.record_fired(rule.id, now);
        if let Err(e) = self.store.log_execution(rule.id, now).await {
            warn!(rule_id = rule.id, error = %e, "Failed to log rule execution");
        }

        EventOutcome::Fired {
            rule_id: rule.id,
            dispatched,
        }
    }

    /// Decode raw message bytes and evaluate the event
    pub async fn handle_message(&self, topic: &str, payload: &[u8], received_at: DateTime<Utc>) -> EventOutcome {
        match Event::decode(topic, payload, received_at) {
            Ok(event) => self.handle_event(&event).await,
            Err(e) => {
                debug!(error = %e, "Dropping malformed message");
                EventOutcome::Dropped
            }
        }
    }

    /// Process inbound messages in delivery order
    ///
    /// Returns when the channel closes or [`RuleEngine::stop`] is called.
    pub async fn run(&self, mut inbound: Inbound) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Rule engine already running");
            return;
        }

        info!("Starting rule engine");

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    match message {
                        Some(message) => {
                            self.handle_message(&message.topic, &message.payload, message.received_at).await;
                        }
                        None => {
                            info!("Inbound channel closed, stopping rule engine");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Rule engine stopped");
    }

    /// Stop a running [`RuleEngine::run`] loop after its current event
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        info!("Stopping rule engine");
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
