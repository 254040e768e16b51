//! Condition evaluation
//!
//! Conditions are checked against the scalar payload of a single event. The
//! check is total: a field that is missing or cannot be compared makes the
//! clause fail, it never raises.

use homectl_core::{Comparator, Condition, Conditions, Payload, Scalar};
use tracing::trace;

/// Whether every condition holds for `payload`
///
/// An empty condition list matches any payload.
pub fn evaluate(conditions: &Conditions, payload: &Payload) -> bool {
    conditions.iter().all(|condition| holds(condition, payload))
}

/// Whether a single clause holds for `payload`
pub fn holds(condition: &Condition, payload: &Payload) -> bool {
    let Some(value) = payload.get(&condition.field) else {
        trace!(field = %condition.field, "Field missing from payload");
        return false;
    };

    let result = compare(value, condition.comparator, &condition.threshold);
    trace!(
        field = %condition.field,
        value = %value,
        clause = %condition.clause(),
        result,
        "Evaluated clause"
    );
    result
}

fn compare(value: &Scalar, comparator: Comparator, threshold: &Scalar) -> bool {
    if let (Some(lhs), Some(rhs)) = (value.as_f64(), threshold.as_f64()) {
        return comparator.compare_f64(lhs, rhs);
    }

    // Non-numeric operands only support (in)equality
    match comparator {
        Comparator::Eq => value.as_text() == threshold.as_text(),
        Comparator::Ne => value.as_text() != threshold.as_text(),
        _ => false,
    }
}
