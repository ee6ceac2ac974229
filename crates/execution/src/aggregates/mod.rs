//! Incremental aggregates with retraction support.

use rill_common::{Result, Value};
use rill_planner::AggregateKind;

mod basic;
mod distinct;

pub use basic::{Avg, Count, First, Key, Max, Min, Sum};
pub use distinct::Distinct;

/// Incremental aggregate state for one group.
///
/// `add` applies one insert (`retraction == false`) or one retraction of a
/// previously added value, and reports whether the state became empty so
/// the group can be collected. `trigger` computes the current aggregated
/// value; it is never called on an empty state by the group-by operator.
pub trait Aggregate: Send {
    /// Apply a delta. Returns true when the state is now empty.
    fn add(&mut self, retraction: bool, value: Value) -> Result<bool>;

    /// Current aggregated value for the group.
    fn trigger(&self) -> Result<Value>;
}

/// Instantiate the aggregate for a plan-level selector.
pub fn build_aggregate(kind: &AggregateKind) -> Box<dyn Aggregate> {
    match kind {
        AggregateKind::Count => Box::new(Count::default()),
        AggregateKind::Sum => Box::new(Sum::default()),
        AggregateKind::Avg => Box::new(Avg::default()),
        AggregateKind::Min => Box::new(Min::default()),
        AggregateKind::Max => Box::new(Max::default()),
        AggregateKind::First => Box::new(First::default()),
        AggregateKind::Key => Box::new(Key::default()),
        AggregateKind::Distinct(inner) => Box::new(Distinct::new(build_aggregate(inner))),
    }
}
