//! Expression projection operator.

use std::sync::Arc;

use rill_common::{Result, RillError};

use crate::exec_node::{ExecNode, ExecutionContext, MetaSendFn, ProduceFn};
use crate::expression::CompiledExpr;
use crate::record::Record;

/// Computes output expressions per record.
///
/// With `keep`, the source fields follow the computed ones. The designated
/// event-time field of the output was decided at plan time and is stamped
/// onto every emitted record.
pub struct MapExec {
    exprs: Vec<(CompiledExpr, String)>,
    keep: bool,
    output_event_time_field: Option<String>,
    source: Arc<dyn ExecNode>,
}

impl MapExec {
    /// Project `source` through `exprs`.
    pub fn new(
        exprs: Vec<(CompiledExpr, String)>,
        keep: bool,
        output_event_time_field: Option<String>,
        source: Arc<dyn ExecNode>,
    ) -> Self {
        MapExec {
            exprs,
            keep,
            output_event_time_field,
            source,
        }
    }
}

impl ExecNode for MapExec {
    fn name(&self) -> &'static str {
        "Map"
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

                let mut fields: Vec<String> =
                    self.exprs.iter().map(|(_, name)| name.clone()).collect();
                let mut values = Vec::with_capacity(self.exprs.len());
                for (expr, _) in &self.exprs {
                    values.push(expr.evaluate(&scoped)?);
                }

                if self.keep {
                    fields.extend(record.fields().iter().cloned());
                    values.extend(record.values().iter().cloned());
                }
                if let Some(duplicate) = first_duplicate(&fields) {
                    return Err(RillError::Runtime(format!(
                        "duplicate output field: {duplicate}"
                    )));
                }

                let mut out = Record::new(fields.into(), values)
                    .with_event_time(record.event_time);
                out.retraction = record.retraction;
                out.event_time_field = self.output_event_time_field.clone();
                on_record(pctx, out)
            },
            on_meta,
        )
    }
}

fn first_duplicate(fields: &[String]) -> Option<&String> {
    fields.iter().enumerate().find_map(|(i, name)| {
        if fields[..i].contains(name) {
            Some(name)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use rill_common::{CancelToken, Value};

    use super::*;
    use crate::exec_node::run_collect;
    use crate::expression::resolve_function;
    use crate::in_memory::InMemoryStream;

    fn source() -> Arc<InMemoryStream> {
        Arc::new(InMemoryStream::new(vec![Record::from_slices(
            &["c.a", "c.b"],
            vec![Value::Int(2), Value::Int(3)],
        )]))
    }

    #[test]
    fn computes_aliased_expressions() {
        let map = MapExec::new(
            vec![(
                CompiledExpr::FunctionCall {
                    descriptor: resolve_function("+", 2).unwrap(),
                    args: vec![
                        CompiledExpr::Variable("c.a".to_string()),
                        CompiledExpr::Variable("c.b".to_string()),
                    ],
                },
                "c.total".to_string(),
            )],
            false,
            None,
            source(),
        );
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = run_collect(&map, &ctx).unwrap();
        assert_eq!(
            out,
            vec![Record::from_slices(&["c.total"], vec![Value::Int(5)])]
        );
    }

    #[test]
    fn keep_appends_source_fields() {
        let map = MapExec::new(
            vec![(
                CompiledExpr::Variable("c.a".to_string()),
                "c.first".to_string(),
            )],
            true,
            None,
            source(),
        );
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = run_collect(&map, &ctx).unwrap();
        assert_eq!(
            out,
            vec![Record::from_slices(
                &["c.first", "c.a", "c.b"],
                vec![Value::Int(2), Value::Int(2), Value::Int(3)],
            )]
        );
    }
}
