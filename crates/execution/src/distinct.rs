//! Whole-record deduplication operator.

use std::collections::BTreeMap;
use std::sync::Arc;

use rill_common::{Result, Value};

use crate::exec_node::{ExecNode, ExecutionContext, MetaSendFn, ProduceFn};
use crate::record::Record;

/// Refcounted set semantics over the input multiset.
///
/// Only the 0 -> 1 transition of a payload is forwarded as an insert and
/// only the 1 -> 0 transition as a retraction; every other arrival merely
/// moves the refcount. Watermarks pass through.
pub struct DistinctExec {
    source: Arc<dyn ExecNode>,
}

impl DistinctExec {
    /// Deduplicate `source`.
    pub fn new(source: Arc<dyn ExecNode>) -> Self {
        DistinctExec { source }
    }
}

fn payload_key(record: &Record) -> Value {
    Value::Struct(
        record
            .fields()
            .iter()
            .cloned()
            .zip(record.values().iter().cloned())
            .collect(),
    )
}

impl ExecNode for DistinctExec {
    fn name(&self) -> &'static str {
        "Distinct"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        let mut counts: BTreeMap<Value, i64> = BTreeMap::new();

        self.source.produce(
            ctx,
            &mut |pctx, record| {
                let key = payload_key(&record);
                let count = counts.entry(key.clone()).or_insert(0);
                if record.retraction {
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(&key);
                        return on_record(pctx, record);
                    }
                } else {
                    *count += 1;
                    if *count == 1 {
                        return on_record(pctx, record);
                    }
                }
                Ok(())
            },
            on_meta,
        )
    }
}
