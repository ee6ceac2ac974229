//! The built-in scalar aggregates.

use std::collections::BTreeMap;

use rill_common::{Result, RillError, Value};

use super::Aggregate;

/// Record count.
#[derive(Default)]
pub struct Count {
    count: i64,
}

impl Aggregate for Count {
    fn add(&mut self, retraction: bool, _value: Value) -> Result<bool> {
        self.count += if retraction { -1 } else { 1 };
        Ok(self.count == 0)
    }

    fn trigger(&self) -> Result<Value> {
        Ok(Value::Int(self.count))
    }
}

/// Typed sum. Mixing value types within one group is a runtime error.
#[derive(Default)]
pub struct Sum {
    state: SumState,
    count: i64,
}

#[derive(Default)]
enum SumState {
    #[default]
    Empty,
    Int(i64),
    Float(f64),
    Duration(chrono::Duration),
}

impl Aggregate for Sum {
    fn add(&mut self, retraction: bool, value: Value) -> Result<bool> {
        let sign = if retraction { -1 } else { 1 };
        self.count += sign;
        self.state = match (std::mem::take(&mut self.state), &value) {
            (SumState::Empty, Value::Int(v)) => SumState::Int(sign * v),
            (SumState::Empty, Value::Float(v)) => SumState::Float(sign as f64 * v),
            (SumState::Empty, Value::Duration(v)) => SumState::Duration(*v * (sign as i32)),
            (SumState::Int(acc), Value::Int(v)) => SumState::Int(acc + sign * v),
            (SumState::Float(acc), Value::Float(v)) => SumState::Float(acc + sign as f64 * v),
            (SumState::Duration(acc), Value::Duration(v)) => {
                SumState::Duration(acc + *v * (sign as i32))
            }
            (_, other) => {
                return Err(RillError::Runtime(format!(
                    "sum cannot accept {} after a differently typed value",
                    other.type_of()
                )))
            }
        };
        if self.count == 0 {
            self.state = SumState::Empty;
            return Ok(true);
        }
        Ok(false)
    }

    fn trigger(&self) -> Result<Value> {
        Ok(match &self.state {
            SumState::Empty => Value::Null,
            SumState::Int(v) => Value::Int(*v),
            SumState::Float(v) => Value::Float(*v),
            SumState::Duration(v) => Value::Duration(*v),
        })
    }
}

/// Numeric average as a (sum, count) pair; retractions subtract.
#[derive(Default)]
pub struct Avg {
    sum: f64,
    count: i64,
}

impl Aggregate for Avg {
    fn add(&mut self, retraction: bool, value: Value) -> Result<bool> {
        let v = match value {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
            other => {
                return Err(RillError::Runtime(format!(
                    "avg expects a numeric value, got {}",
                    other.type_of()
                )))
            }
        };
        if retraction {
            self.sum -= v;
            self.count -= 1;
        } else {
            self.sum += v;
            self.count += 1;
        }
        Ok(self.count == 0)
    }

    fn trigger(&self) -> Result<Value> {
        if self.count == 0 {
            return Ok(Value::Null);
        }
        Ok(Value::Float(self.sum / self.count as f64))
    }
}

/// Retractable minimum over an ordered refcounted multiset.
#[derive(Default)]
pub struct Min {
    values: BTreeMap<Value, i64>,
}

/// Retractable maximum over an ordered refcounted multiset.
#[derive(Default)]
pub struct Max {
    values: BTreeMap<Value, i64>,
}

fn multiset_add(values: &mut BTreeMap<Value, i64>, retraction: bool, value: Value) -> bool {
    let count = values.entry(value.clone()).or_insert(0);
    *count += if retraction { -1 } else { 1 };
    if *count == 0 {
        values.remove(&value);
    }
    values.is_empty()
}

impl Aggregate for Min {
    fn add(&mut self, retraction: bool, value: Value) -> Result<bool> {
        Ok(multiset_add(&mut self.values, retraction, value))
    }

    fn trigger(&self) -> Result<Value> {
        Ok(self
            .values
            .keys()
            .next()
            .cloned()
            .unwrap_or(Value::Null))
    }
}

impl Aggregate for Max {
    fn add(&mut self, retraction: bool, value: Value) -> Result<bool> {
        Ok(multiset_add(&mut self.values, retraction, value))
    }

    fn trigger(&self) -> Result<Value> {
        Ok(self
            .values
            .keys()
            .next_back()
            .cloned()
            .unwrap_or(Value::Null))
    }
}

/// Earliest surviving value in arrival order.
///
/// A retraction removes the most recent buffered occurrence of its value;
/// retracting the current first therefore promotes the next arrival rather
/// than restoring nothing.
#[derive(Default)]
pub struct First {
    values: Vec<Value>,
}

impl Aggregate for First {
    fn add(&mut self, retraction: bool, value: Value) -> Result<bool> {
        if retraction {
            if let Some(i) = self.values.iter().rposition(|v| *v == value) {
                self.values.remove(i);
            }
        } else {
            self.values.push(value);
        }
        Ok(self.values.is_empty())
    }

    fn trigger(&self) -> Result<Value> {
        Ok(self.values.first().cloned().unwrap_or(Value::Null))
    }
}

/// The grouping key column: all arriving values are equal within a group,
/// so the aggregate only tracks liveness.
#[derive(Default)]
pub struct Key {
    value: Option<Value>,
    count: i64,
}

impl Aggregate for Key {
    fn add(&mut self, retraction: bool, value: Value) -> Result<bool> {
        self.count += if retraction { -1 } else { 1 };
        if !retraction {
            self.value.get_or_insert(value);
        }
        Ok(self.count == 0)
    }

    fn trigger(&self) -> Result<Value> {
        Ok(self.value.clone().unwrap_or(Value::Null))
    }
}
