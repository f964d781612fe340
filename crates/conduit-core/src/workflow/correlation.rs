//! Event matching for suspended `listen` tasks.
//!
//! [`match_event`] offers one inbound event to one correlation context. It
//! never mutates its input: a match returns an updated copy, so a rejected
//! event leaves the stored context exactly as it was.

use std::collections::BTreeMap;

use conduit_types::correlation::{
    CloudEvent, ConsumptionStrategy, CorrelationContext, CorrelationStatus, EventFilter,
};
use conduit_types::task::ListenTask;
use serde_json::{json, Value};

use super::expression::{evaluate_condition, evaluate_expression, runtime_expression, ExpressionEvaluator};

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    NoMatch,
    /// The event was consumed. `satisfied` means the listen is complete.
    Matched {
        context: CorrelationContext,
        satisfied: bool,
    },
}

/// Offer `event` to `context` under the listen configuration `listen`.
pub fn match_event(
    context: &CorrelationContext,
    event: &CloudEvent,
    listen: &ListenTask,
    evaluator: &dyn ExpressionEvaluator,
) -> MatchOutcome {
    if !context.is_active() {
        return MatchOutcome::NoMatch;
    }

    let streaming = listen.until.is_some();
    let filters = listen.to.filters();
    let matched = if filters.is_empty() {
        // `any: []` accepts every event
        Some((0, BTreeMap::new()))
    } else {
        filters.iter().enumerate().find_map(|(index, filter)| {
            let already = matches!(listen.to, ConsumptionStrategy::All(_))
                && context.events.contains_key(&index);
            if already && !streaming {
                return None;
            }
            filter_matches(filter, event, &context.keys, evaluator).map(|b| (index, b))
        })
    };

    let Some((index, bindings)) = matched else {
        return MatchOutcome::NoMatch;
    };

    let mut updated = context.clone();
    updated.keys.extend(bindings);
    updated.events.insert(index, event.clone());

    let satisfied = match &listen.until {
        Some(until) => {
            updated.stream.push(event.clone());
            updated.offset = Some(updated.offset.unwrap_or(0) + 1);
            let data = json!({
                "events": updated.stream,
                "keys": updated.keys,
                "event": event,
            });
            evaluate_condition(evaluator, until, &data).unwrap_or_else(|e| {
                tracing::warn!(task_id = %context.task_id, error = %e, "until condition failed");
                false
            })
        }
        None => match &listen.to {
            ConsumptionStrategy::One(_) | ConsumptionStrategy::Any(_) => true,
            ConsumptionStrategy::All(filters) => updated.events.len() >= filters.len(),
        },
    };

    if satisfied {
        updated.status = CorrelationStatus::Satisfied;
    }
    MatchOutcome::Matched {
        context: updated,
        satisfied,
    }
}

/// The listen task output for a satisfied context.
///
/// Streaming listens and `all` produce an array of events (stream order or
/// filter order); `one` and `any` produce the matched event itself.
pub fn listen_output(context: &CorrelationContext, listen: &ListenTask) -> Value {
    if listen.until.is_some() {
        return json!(context.stream);
    }
    match &listen.to {
        ConsumptionStrategy::All(_) => {
            Value::Array(context.events.values().map(CloudEvent::to_value).collect())
        }
        _ => context
            .events
            .values()
            .next()
            .map(CloudEvent::to_value)
            .unwrap_or(Value::Null),
    }
}

/// New key bindings if `event` satisfies `filter` under the bound `keys`.
fn filter_matches(
    filter: &EventFilter,
    event: &CloudEvent,
    keys: &BTreeMap<String, Value>,
    evaluator: &dyn ExpressionEvaluator,
) -> Option<BTreeMap<String, Value>> {
    let data = json!({ "event": event, "keys": keys });

    for (attribute, expected) in &filter.with {
        let actual = event.attribute(attribute)?;
        let expected = match expected {
            Value::String(s) => match runtime_expression(s) {
                Some(expression) => evaluator.evaluate(expression, &data).ok()?,
                None => expected.clone(),
            },
            other => other.clone(),
        };
        if !same_value(&actual, &expected) {
            return None;
        }
    }

    let mut bindings = BTreeMap::new();
    for (name, key) in &filter.correlate {
        let derived = match evaluate_expression(evaluator, &key.from, &data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(key = %name, error = %e, "correlation key not derivable");
                return None;
            }
        };
        if let Some(expect) = &key.expect {
            if !same_value(&derived, expect) {
                return None;
            }
        }
        match keys.get(name) {
            Some(bound) if !same_value(bound, &derived) => return None,
            Some(_) => {}
            None => {
                bindings.insert(name.clone(), derived);
            }
        }
    }
    Some(bindings)
}

/// JSON equality that treats numbers and numeric strings alike.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
