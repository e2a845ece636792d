//! Closed filter type for selecting events.
//!
//! A [`Filter`] is either everything, a single condition on one envelope
//! attribute, or an AND/OR composition of other filters. The file-backed
//! store evaluates filters in-process with [`Filter::matches`]; that is its
//! translation of the filter into "query language".

use crate::types::{EventEnvelope, Timestamp};
use std::cmp::Ordering;

/// Envelope attribute a condition applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Id,
    Source,
    Type,
    Subject,
    StreamId,
    StreamVersion,
    DataContentType,
    Time,
}

impl Field {
    fn extract(self, event: &EventEnvelope) -> Option<FieldValue> {
        match self {
            Field::Id => Some(FieldValue::Text(event.id.clone())),
            Field::Source => Some(FieldValue::Text(event.source.clone())),
            Field::Type => Some(FieldValue::Text(event.event_type.clone())),
            Field::Subject => event.subject.clone().map(FieldValue::Text),
            Field::StreamId => Some(FieldValue::Text(event.stream_id.clone())),
            Field::StreamVersion => Some(FieldValue::Version(event.stream_version.0)),
            Field::DataContentType => event.data_content_type.clone().map(FieldValue::Text),
            Field::Time => event.time.map(FieldValue::Time),
        }
    }
}

/// A value to compare an attribute against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Time(Timestamp),
    Version(u64),
}

impl FieldValue {
    /// Values of different kinds are incomparable.
    fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (FieldValue::Time(a), FieldValue::Time(b)) => Some(a.cmp(b)),
            (FieldValue::Version(a), FieldValue::Version(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<Timestamp> for FieldValue {
    fn from(t: Timestamp) -> Self {
        FieldValue::Time(t)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Version(v)
    }
}

/// Condition on a single attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    Eq(FieldValue),
    Ne(FieldValue),
    Lt(FieldValue),
    Lte(FieldValue),
    Gt(FieldValue),
    Gte(FieldValue),
    In(Vec<FieldValue>),
}

impl Condition {
    /// Evaluate against an attribute value (`None` when the attribute is unset).
    fn evaluate(&self, actual: Option<&FieldValue>) -> bool {
        let Some(actual) = actual else {
            // An unset attribute is only "not equal" to something.
            return matches!(self, Condition::Ne(_));
        };

        match self {
            Condition::Eq(v) => actual == v,
            Condition::Ne(v) => actual != v,
            Condition::Lt(v) => actual.compare(v) == Some(Ordering::Less),
            Condition::Lte(v) => matches!(
                actual.compare(v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Condition::Gt(v) => actual.compare(v) == Some(Ordering::Greater),
            Condition::Gte(v) => matches!(
                actual.compare(v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Condition::In(values) => values.iter().any(|v| v == actual),
        }
    }
}

/// Logical operator of a composition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Composition {
    And,
    Or,
}

/// Selects events.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Filter {
    /// Every event.
    #[default]
    All,

    /// One condition on one attribute.
    Single { field: Field, condition: Condition },

    /// Several filters joined by AND or OR.
    Composition {
        op: Composition,
        filters: Vec<Filter>,
    },
}

impl Filter {
    pub fn all() -> Self {
        Filter::All
    }

    pub fn field(field: Field, condition: Condition) -> Self {
        Filter::Single { field, condition }
    }

    /// Events of one of the given types.
    pub fn event_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = types
            .into_iter()
            .map(|t| FieldValue::Text(t.into()))
            .collect();
        Filter::field(Field::Type, Condition::In(values))
    }

    /// Events of a single stream.
    pub fn stream(stream_id: impl Into<String>) -> Self {
        Filter::field(Field::StreamId, Condition::Eq(FieldValue::Text(stream_id.into())))
    }

    /// Events from a single source.
    pub fn source(source: impl Into<String>) -> Self {
        Filter::field(Field::Source, Condition::Eq(FieldValue::Text(source.into())))
    }

    pub fn and(self, other: Filter) -> Self {
        Self::compose(Composition::And, self, other)
    }

    pub fn or(self, other: Filter) -> Self {
        Self::compose(Composition::Or, self, other)
    }

    /// Flattens nested compositions with the same operator.
    fn compose(op: Composition, left: Filter, right: Filter) -> Self {
        let mut filters = Vec::new();
        for f in [left, right] {
            match f {
                Filter::Composition { op: inner, filters: nested } if inner == op => {
                    filters.extend(nested)
                }
                other => filters.push(other),
            }
        }
        Filter::Composition { op, filters }
    }

    /// Check whether an event is selected by this filter.
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        match self {
            Filter::All => true,
            Filter::Single { field, condition } => {
                condition.evaluate(field.extract(event).as_ref())
            }
            Filter::Composition {
                op: Composition::And,
                filters,
            } => filters.iter().all(|f| f.matches(event)),
            Filter::Composition {
                op: Composition::Or,
                filters,
            } => filters.iter().any(|f| f.matches(event)),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Filter::All)
    }
}
