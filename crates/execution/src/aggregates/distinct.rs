//! Deduplicating aggregate wrapper.

use std::collections::BTreeMap;

use rill_common::{Result, Value};

use super::Aggregate;

/// Wraps any aggregate behind an ordered map of value refcounts.
///
/// The wrapped aggregate observes exactly one insert per distinct value
/// while that value's refcount is positive, and exactly one retraction
/// when it returns to zero.
pub struct Distinct {
    counts: BTreeMap<Value, i64>,
    wrapped: Box<dyn Aggregate>,
}

impl Distinct {
    /// Deduplicate in front of `wrapped`.
    pub fn new(wrapped: Box<dyn Aggregate>) -> Self {
        Distinct {
            counts: BTreeMap::new(),
            wrapped,
        }
    }
}

impl Aggregate for Distinct {
    fn add(&mut self, retraction: bool, value: Value) -> Result<bool> {
        let count = self.counts.entry(value.clone()).or_insert(0);
        if retraction {
            *count -= 1;
        } else {
            *count += 1;
        }
        if !retraction && *count == 1 {
            self.wrapped.add(false, value)?;
        } else if *count == 0 {
            self.counts.remove(&value);
            self.wrapped.add(true, value)?;
        }
        Ok(self.counts.is_empty())
    }

    fn trigger(&self) -> Result<Value> {
        self.wrapped.trigger()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forwards every delta it sees, for observing the wrapper contract.
    #[derive(Default)]
    struct Recording {
        deltas: std::sync::Arc<std::sync::Mutex<Vec<(bool, Value)>>>,
    }

    impl Aggregate for Recording {
        fn add(&mut self, retraction: bool, value: Value) -> Result<bool> {
            self.deltas.lock().unwrap().push((retraction, value));
            Ok(false)
        }

        fn trigger(&self) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    /// The +x +x -x +y -x -y sequence: the wrapped aggregate sees exactly
    /// +x, +y, -x, -y.
    #[test]
    fn wrapped_aggregate_sees_only_refcount_edges() {
        let recording = Recording::default();
        let deltas = std::sync::Arc::clone(&recording.deltas);
        let mut distinct = Distinct::new(Box::new(recording));

        let x = Value::String("x".to_string());
        let y = Value::String("y".to_string());

        distinct.add(false, x.clone()).unwrap();
        distinct.add(false, x.clone()).unwrap();
        distinct.add(true, x.clone()).unwrap();
        distinct.add(false, y.clone()).unwrap();
        distinct.add(true, x.clone()).unwrap();
        let empty = distinct.add(true, y.clone()).unwrap();

        assert!(empty);
        assert_eq!(
            *deltas.lock().unwrap(),
            vec![
                (false, x.clone()),
                (false, y.clone()),
                (true, x),
                (true, y),
            ]
        );
    }

    #[test]
    fn trigger_delegates_to_the_wrapped_aggregate() {
        let mut distinct = Distinct::new(Box::new(super::super::Count::default()));
        distinct.add(false, Value::Int(1)).unwrap();
        distinct.add(false, Value::Int(1)).unwrap();
        distinct.add(false, Value::Int(2)).unwrap();
        assert_eq!(distinct.trigger().unwrap(), Value::Int(2));
    }
}
