use crate::{now_millis, MetricEvent, MetricKind};
use serde_json::{Map, Value};

pub struct MetricEventBuilder {
    kind: MetricKind,
    timestamp: i64,
    fields: Map<String, Value>,
}

impl MetricEventBuilder {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            timestamp: now_millis(),
            fields: Map::new(),
        }
    }

    pub fn tx() -> Self {
        Self::new(MetricKind::Tx)
    }

    pub fn block() -> Self {
        Self::new(MetricKind::Block)
    }

    pub fn vote() -> Self {
        Self::new(MetricKind::Vote)
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn build(self) -> MetricEvent {
        MetricEvent {
            kind: self.kind,
            timestamp: self.timestamp,
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_kind_timestamp_and_fields() {
        let event = MetricEventBuilder::vote()
            .at(42)
            .with_field("validator", "val-1")
            .with_field("height", 7u64)
            .with_field("signed", false)
            .build();

        assert_eq!(event.kind, MetricKind::Vote);
        assert_eq!(event.timestamp, 42);
        assert_eq!(event.field_str("validator"), Some("val-1"));
        assert_eq!(event.field_u64("height"), Some(7));
        assert_eq!(event.field_bool("signed"), Some(false));
    }
}
