//! Inbound events, event filters and correlation state for `listen` tasks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

fn generate_event_id() -> String {
    Uuid::now_v7().to_string()
}

/// A CloudEvents-shaped event, either inbound (matched by `listen`) or
/// outbound (built by `emit`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    #[serde(default = "generate_event_id")]
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Extension attributes.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl CloudEvent {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: generate_event_id(),
            source: source.into(),
            event_type: event_type.into(),
            subject: None,
            time: Some(Utc::now()),
            data,
            extensions: Map::new(),
        }
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    /// Value of a context attribute (`id`, `source`, `type`, `subject`,
    /// `time`, `data`) or extension.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "source" => Some(Value::String(self.source.clone())),
            "type" => Some(Value::String(self.event_type.clone())),
            "subject" => self.subject.clone().map(Value::String),
            "time" => self.time.map(|t| Value::String(t.to_rfc3339())),
            "data" => Some(self.data.clone()),
            other => self.extensions.get(other).cloned(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Filters and strategies
// ---------------------------------------------------------------------------

/// Derives a correlation key value from a matching event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationKey {
    /// Expression evaluated against `{ event }`.
    pub from: String,
    /// Literal the derived value must equal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Value>,
}

/// Attribute requirements an event must satisfy.
///
/// `with` values are literals or `${ }` expressions evaluated against the
/// correlation keys bound so far (`keys`) and the event (`event`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub with: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub correlate: BTreeMap<String, CorrelationKey>,
}

/// How many filters must match before a `listen` is satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionStrategy {
    /// A single filter.
    One(EventFilter),
    /// First match against any filter; an empty list accepts every event.
    Any(Vec<EventFilter>),
    /// Every filter needs one recorded match.
    All(Vec<EventFilter>),
}

impl ConsumptionStrategy {
    pub fn filters(&self) -> &[EventFilter] {
        match self {
            ConsumptionStrategy::One(filter) => std::slice::from_ref(filter),
            ConsumptionStrategy::Any(filters) | ConsumptionStrategy::All(filters) => filters,
        }
    }
}

// ---------------------------------------------------------------------------
// Correlation context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStatus {
    Active,
    Satisfied,
    Cancelled,
}

/// Accumulated matching state of one suspended `listen` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub id: Uuid,
    /// The listen task this context belongs to.
    pub task_id: Uuid,
    pub status: CorrelationStatus,
    /// Bound correlation keys; a bound key never changes value.
    #[serde(default)]
    pub keys: BTreeMap<String, Value>,
    /// Matched event per filter index.
    #[serde(default)]
    pub events: BTreeMap<usize, CloudEvent>,
    /// Every event consumed while streaming (`until` set).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream: Vec<CloudEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl CorrelationContext {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            status: CorrelationStatus::Active,
            keys: BTreeMap::new(),
            events: BTreeMap::new(),
            stream: Vec::new(),
            offset: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CorrelationStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_reads_context_and_extensions() {
        let event = CloudEvent::new("shop/orders", "order.paid", json!({"total": 12}))
            .with_extension("orderid", json!("o-17"));
        assert_eq!(event.attribute("type"), Some(json!("order.paid")));
        assert_eq!(event.attribute("source"), Some(json!("shop/orders")));
        assert_eq!(event.attribute("orderid"), Some(json!("o-17")));
        assert_eq!(event.attribute("data"), Some(json!({"total": 12})));
        assert_eq!(event.attribute("subject"), None);
        assert_eq!(event.attribute("missing"), None);
    }

    #[test]
    fn test_event_extensions_flatten_in_json() {
        let raw = json!({
            "source": "billing",
            "type": "invoice.created",
            "tenant": "acme"
        });
        let event: CloudEvent = serde_json::from_value(raw).unwrap();
        assert!(!event.id.is_empty());
        assert_eq!(event.extensions.get("tenant"), Some(&json!("acme")));
        assert_eq!(event.to_value()["tenant"], json!("acme"));
    }

    #[test]
    fn test_strategy_parses_externally_tagged() {
        let yaml = r#"
all:
  - with:
      type: order.paid
    correlate:
      order:
        from: "event.orderid"
  - with:
      type: order.shipped
"#;
        let strategy: ConsumptionStrategy = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(matches!(strategy, ConsumptionStrategy::All(ref f) if f.len() == 2));
        assert_eq!(strategy.filters()[0].correlate["order"].from, "event.orderid");

        let one: ConsumptionStrategy =
            serde_json::from_value(json!({"one": {"with": {"type": "ping"}}})).unwrap();
        assert_eq!(one.filters().len(), 1);
    }

    #[test]
    fn test_context_starts_active_and_empty() {
        let ctx = CorrelationContext::new(Uuid::now_v7());
        assert!(ctx.is_active());
        assert!(ctx.keys.is_empty());
        assert!(ctx.offset.is_none());
    }
}
