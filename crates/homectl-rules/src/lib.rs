//! Rule engine for homectl
//!
//! Rules connect one sensor's telemetry to one device's commands:
//!
//! ```text
//! RULE = SOURCE (sensor topic + id) → CONDITIONS → ACTION (device command)
//! ```
//!
//! - [`evaluate`] - AND of typed clauses against an event payload
//! - [`CooldownTracker`] - minimum spacing between firings of a rule
//! - [`ActionDispatcher`] - turns a rule action into a published command
//! - [`RuleEngine`] - owns the rule set and processes inbound messages
//!
//! At most one rule fires per event: the enabled candidate with the lowest id.

pub mod cooldown;
pub mod dispatch;
pub mod engine;
pub mod evaluator;
pub mod rule;

pub use cooldown::{CooldownTracker, DEFAULT_COOLDOWN};
pub use dispatch::{ActionDispatcher, DispatchError};
pub use engine::{EngineConfig, EngineError, EngineResult, EventOutcome, RuleEngine};
pub use evaluator::evaluate;
pub use rule::{Rule, SourceSelector, Target};
