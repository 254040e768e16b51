//! Topic grammar
//!
//! Sensors publish telemetry on `{category}/get`; devices take commands on
//! `{category}/send`.

/// Suffix of telemetry topics
pub const TELEMETRY_SUFFIX: &str = "get";

/// Suffix of command topics
pub const COMMAND_SUFFIX: &str = "send";

/// Filter matching every telemetry topic
pub const ALL_TELEMETRY: &str = "+/get";

/// Filter matching every command topic
pub const ALL_COMMANDS: &str = "+/send";

/// Telemetry topic for a sensor category
pub fn telemetry_topic(category: &str) -> String {
    format!("{}/{}", category, TELEMETRY_SUFFIX)
}

/// Command topic for a device category
pub fn command_topic(category: &str) -> String {
    format!("{}/{}", category, COMMAND_SUFFIX)
}

/// Category part of a `{category}/{suffix}` topic
pub fn category_of(topic: &str) -> Option<&str> {
    topic
        .rsplit_once('/')
        .map(|(category, _)| category)
        .filter(|c| !c.is_empty())
}
