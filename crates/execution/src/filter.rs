//! Predicate filter operator.

use std::sync::Arc;

use rill_common::Result;

use crate::exec_node::{ExecNode, ExecutionContext, MetaSendFn, ProduceFn};
use crate::expression::CompiledExpr;

/// Emits the records its formula evaluates to true for.
///
/// The formula sees the record's fields merged over the outer variables.
/// Retractions pass through unchanged when they match, so the operator is
/// stateless under the retraction algebra. Watermarks pass through.
pub struct FilterExec {
    predicate: CompiledExpr,
    source: Arc<dyn ExecNode>,
}

impl FilterExec {
    /// Filter `source` by `predicate`.
    pub fn new(predicate: CompiledExpr, source: Arc<dyn ExecNode>) -> Self {
        FilterExec { predicate, source }
    }
}

impl ExecNode for FilterExec {
    fn name(&self) -> &'static str {
        "Filter"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        self.source.produce(
            ctx,
            &mut |pctx, record| {
                let scoped = ctx.with_record(&record);
                if self.predicate.evaluate_boolean(&scoped)? {
                    on_record(pctx, record)?;
                }
                Ok(())
            },
            on_meta,
        )
    }
}
