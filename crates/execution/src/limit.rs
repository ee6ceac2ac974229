//! Limit operator.

use std::sync::Arc;

use rill_common::{CancelToken, Result, RillError, Value};

use crate::exec_node::{ExecNode, ExecutionContext, MetaSendFn, ProduceFn};
use crate::expression::CompiledExpr;

/// Emits at most `count` insert records from the single merged stream of
/// its child, then stops the child.
///
/// The count expression is evaluated once per scan against the outer
/// variables and must yield a non-negative integer. Retractions of already
/// emitted records pass through without counting.
pub struct LimitExec {
    count: CompiledExpr,
    source: Arc<dyn ExecNode>,
}

impl LimitExec {
    /// Limit `source` to `count` records.
    pub fn new(count: CompiledExpr, source: Arc<dyn ExecNode>) -> Self {
        LimitExec { count, source }
    }
}

/// Evaluate a limit/offset count expression to a non-negative amount.
pub(crate) fn evaluate_count(expr: &CompiledExpr, ctx: &ExecutionContext) -> Result<usize> {
    match expr.evaluate(ctx)? {
        Value::Int(n) if n >= 0 => Ok(n as usize),
        Value::Int(n) => Err(RillError::Runtime(format!(
            "count must be non-negative, got {n}"
        ))),
        other => Err(RillError::Runtime(format!(
            "count must be an integer, got {other}"
        ))),
    }
}

impl ExecNode for LimitExec {
    fn name(&self) -> &'static str {
        "Limit"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        let limit = evaluate_count(&self.count, ctx)?;
        if limit == 0 {
            return Ok(());
        }

        // The child is stopped through a dedicated token once the quota is
        // reached; that stop is not a query-level cancellation.
        let gate = CancelToken::new();
        let child_ctx = ExecutionContext {
            cancel: gate.clone(),
            variables: Arc::clone(&ctx.variables),
        };
        let mut emitted = 0usize;

        let result = self.source.produce(
            &child_ctx,
            &mut |pctx, record| {
                ctx.cancel.check()?;
                let counts = !record.retraction;
                on_record(pctx, record)?;
                if counts {
                    emitted += 1;
                    if emitted >= limit {
                        gate.cancel();
                        return Err(RillError::Cancelled);
                    }
                }
                Ok(())
            },
            on_meta,
        );

        match result {
            Err(RillError::Cancelled) if gate.is_cancelled() && !ctx.cancel.is_cancelled() => {
                Ok(())
            }
            other => other,
        }
    }
}
