//! Alias prefix rewrite operator.

use std::sync::Arc;

use rill_common::Result;

use rill_planner::physical::requalify_name;

use crate::exec_node::{ExecNode, ExecutionContext, MetaSendFn, ProduceFn};
use crate::record::Record;

/// Rewrites the qualifier of every emitted field to a fixed alias.
///
/// `a.age` becomes `q.age`; an unqualified `age` becomes `q.age` as well.
/// The designated event-time field name is rewritten along with the data
/// fields. Otherwise the record passes through untouched.
pub struct RequalifierExec {
    qualifier: String,
    source: Arc<dyn ExecNode>,
}

impl RequalifierExec {
    /// Requalify `source` fields under `qualifier`.
    pub fn new(qualifier: String, source: Arc<dyn ExecNode>) -> Self {
        RequalifierExec { qualifier, source }
    }
}

impl ExecNode for RequalifierExec {
    fn name(&self) -> &'static str {
        "Requalifier"
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
                let fields: Vec<String> = record
                    .fields()
                    .iter()
                    .map(|name| requalify_name(&self.qualifier, name))
                    .collect();
                let mut out = Record::new(fields.into(), record.values().to_vec())
                    .with_event_time(record.event_time);
                out.retraction = record.retraction;
                out.event_time_field = record
                    .event_time_field
                    .as_deref()
                    .map(|etf| requalify_name(&self.qualifier, etf));
                on_record(pctx, out)
            },
            on_meta,
        )
    }
}
