//! Source adapter contract.

use std::sync::Arc;

use rill_common::{Result, Schema};
use rill_planner::{Expression, SourceDescription};

use crate::exec_node::ExecNode;
use crate::materialize::MaterializationContext;

/// A registered data source, as execution needs it.
///
/// Implementations expose their scannable stream and their pushdown
/// capability; the optimizer works off the [`SourceDescription`] capability
/// map, and materialization consults `push_down_predicates` to split the
/// builder's filter into natively evaluated and residual parts.
pub trait SourceExecutor: Send + Sync {
    /// Planner-facing description (capability map, keys, cardinality).
    fn description(&self) -> SourceDescription;

    /// Field list exposed by a scan, with unqualified names.
    fn schema(&self) -> Result<Schema>;

    /// Build the executable scan node.
    ///
    /// `pushed` holds the predicates accepted by `push_down_predicates`;
    /// `alias` qualifies all emitted field names.
    fn materialize(
        &self,
        ctx: &MaterializationContext,
        pushed: &[Expression],
        alias: &str,
    ) -> Result<Arc<dyn ExecNode>>;

    /// Report which of the new predicates the source can evaluate.
    ///
    /// Returns `(rejected, new_pushed, changed)`: predicates the source
    /// cannot evaluate, the full accepted set including the previously
    /// pushed ones, and whether the accepted set grew.
    fn push_down_predicates(
        &self,
        new: Vec<Expression>,
        pushed: Vec<Expression>,
    ) -> (Vec<Expression>, Vec<Expression>, bool);
}
