//! Row representation and the runtime variable scope chain.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use rill_common::Value;

/// An immutable streaming row.
///
/// `values` and `fields` are parallel; field names are unique within a
/// record. `retraction == true` marks the semantic undo of a previously
/// produced record with identical payload.
#[derive(Debug, Clone)]
pub struct Record {
    values: Vec<Value>,
    fields: Arc<[String]>,
    /// Event time used for watermark comparisons.
    pub event_time: DateTime<Utc>,
    /// Insert (`false`) or retraction (`true`).
    pub retraction: bool,
    /// Optional stable identifier. Not part of record equality.
    pub id: Option<String>,
    /// Name of the field designated as event time, when known.
    pub event_time_field: Option<String>,
}

impl Record {
    /// Insert record with epoch event time.
    pub fn new(fields: Arc<[String]>, values: Vec<Value>) -> Self {
        Record {
            values,
            fields,
            event_time: DateTime::<Utc>::UNIX_EPOCH,
            retraction: false,
            id: None,
            event_time_field: None,
        }
    }

    /// Convenience constructor taking field names as string slices.
    pub fn from_slices(fields: &[&str], values: Vec<Value>) -> Self {
        let fields: Arc<[String]> = fields.iter().map(|s| s.to_string()).collect();
        Record::new(fields, values)
    }

    /// Same record with the retraction flag set.
    pub fn as_retraction(mut self) -> Self {
        self.retraction = true;
        self
    }

    /// Same record with the given event time.
    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = event_time;
        self
    }

    /// Same record with a designated event-time field name.
    pub fn with_event_time_field(mut self, field: impl Into<String>) -> Self {
        self.event_time_field = Some(field.into());
        self
    }

    /// Same record with an identifier attached.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Field names, parallel to [`Record::values`].
    pub fn fields(&self) -> &Arc<[String]> {
        &self.fields
    }

    /// Values, parallel to [`Record::fields`].
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of the named field, if present.
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .position(|name| name == field)
            .map(|i| &self.values[i])
    }

    /// All values as a positional tuple.
    pub fn as_tuple(&self) -> Value {
        Value::Tuple(self.values.clone())
    }

    /// Consume into the parallel `(fields, values)` pair.
    pub fn into_parts(self) -> (Arc<[String]>, Vec<Value>) {
        (self.fields, self.values)
    }
}

impl PartialEq for Record {
    /// Records compare equal iff fields, values, retraction flag and event
    /// time all match. The identifier is metadata and excluded.
    fn eq(&self, other: &Self) -> bool {
        self.retraction == other.retraction
            && self.event_time == other.event_time
            && *self.fields == *other.fields
            && self.values == other.values
    }
}

impl Eq for Record {}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.retraction { "-" } else { "+" };
        write!(f, "{{{sign}| ")?;
        for (i, (name, value)) in self.fields.iter().zip(&self.values).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        write!(f, " |}}")
    }
}

/// A parent-linked scope chain mapping names to values.
///
/// The child scope shadows its parent; each frame also carries the record's
/// event time so time-dependent expressions observe consistent semantics.
/// Frames are immutable and shared via `Arc`, never cyclic.
#[derive(Debug)]
pub struct VariableContext {
    parent: Option<Arc<VariableContext>>,
    fields: Arc<[String]>,
    values: Vec<Value>,
    /// Event time of the record this frame was created from.
    pub event_time: DateTime<Utc>,
}

impl VariableContext {
    /// The empty root scope.
    pub fn empty() -> Arc<Self> {
        Arc::new(VariableContext {
            parent: None,
            fields: Arc::from(Vec::<String>::new()),
            values: vec![],
            event_time: DateTime::<Utc>::UNIX_EPOCH,
        })
    }

    /// A root scope holding explicit bindings.
    pub fn with_bindings(fields: Arc<[String]>, values: Vec<Value>) -> Arc<Self> {
        Arc::new(VariableContext {
            parent: None,
            fields,
            values,
            event_time: DateTime::<Utc>::UNIX_EPOCH,
        })
    }

    /// New innermost frame holding the record's fields.
    pub fn with_record(self: &Arc<Self>, record: &Record) -> Arc<VariableContext> {
        Arc::new(VariableContext {
            parent: Some(Arc::clone(self)),
            fields: Arc::clone(record.fields()),
            values: record.values().to_vec(),
            event_time: record.event_time,
        })
    }

    /// Look the name up through the scope chain.
    ///
    /// Returns the value together with the frame depth it was found at;
    /// level 0 is the innermost frame.
    pub fn get(&self, name: &str) -> Option<(&Value, usize)> {
        let mut frame = self;
        let mut level = 0;
        loop {
            if let Some(i) = frame.fields.iter().position(|f| f == name) {
                return Some((&frame.values[i], level));
            }
            match &frame.parent {
                Some(parent) => {
                    frame = parent;
                    level += 1;
                }
                None => return None,
            }
        }
    }
}
