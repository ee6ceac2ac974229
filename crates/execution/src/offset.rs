//! Offset operator.

use std::sync::Arc;

use rill_common::Result;

use crate::exec_node::{ExecNode, ExecutionContext, MetaSendFn, ProduceFn};
use crate::expression::CompiledExpr;
use crate::limit::evaluate_count;

/// Skips the first `count` insert records of the single merged stream of
/// its child, then passes everything through.
///
/// The count expression is evaluated once per scan against the outer
/// variables and must yield a non-negative integer. Retractions arriving
/// while still skipping are dropped along with their inserts.
pub struct OffsetExec {
    count: CompiledExpr,
    source: Arc<dyn ExecNode>,
}

impl OffsetExec {
    /// Skip `count` records of `source`.
    pub fn new(count: CompiledExpr, source: Arc<dyn ExecNode>) -> Self {
        OffsetExec { count, source }
    }
}

impl ExecNode for OffsetExec {
    fn name(&self) -> &'static str {
        "Offset"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        let offset = evaluate_count(&self.count, ctx)?;
        let mut skipped = 0usize;

        self.source.produce(
            ctx,
            &mut |pctx, record| {
                if skipped < offset {
                    if !record.retraction {
                        skipped += 1;
                    }
                    return Ok(());
                }
                on_record(pctx, record)
            },
            on_meta,
        )
    }
}

#[cfg(test)]
mod tests {
    use rill_common::{CancelToken, Value};

    use super::*;
    use crate::exec_node::run_collect;
    use crate::in_memory::InMemoryStream;
    use crate::record::Record;

    #[test]
    fn skips_the_first_records() {
        let source = Arc::new(InMemoryStream::new(
            (0..5)
                .map(|i| Record::from_slices(&["t.n"], vec![Value::Int(i)]))
                .collect(),
        ));
        let offset = OffsetExec::new(CompiledExpr::Constant(Value::Int(2)), source);
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = run_collect(&offset, &ctx).unwrap();
        assert_eq!(
            out.iter().map(|r| r.values()[0].clone()).collect::<Vec<_>>(),
            vec![Value::Int(2), Value::Int(3), Value::Int(4)]
        );
    }
}
