//! Incremental grouped aggregation.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use rill_common::{Result, RillError, Value};
use rill_planner::{AggregateKind, TriggerSpec};

use crate::aggregates::{build_aggregate, Aggregate};
use crate::exec_node::{
    ExecNode, ExecutionContext, MetaSendFn, MetadataMessage, ProduceContext, ProduceFn,
};
use crate::expression::CompiledExpr;
use crate::record::Record;
use crate::trigger::{build_trigger, Trigger};

/// Per-key aggregate state.
struct GroupState {
    aggregates: Vec<Box<dyn Aggregate>>,
    /// Net insert count of the group; the group dies at zero.
    record_count: i64,
    /// Values of the previously emitted row, if any.
    last_emitted: Option<Vec<Value>>,
}

/// Mutable state of one produce call.
struct GroupByRun {
    groups: BTreeMap<Value, GroupState>,
    trigger: Box<dyn Trigger>,
    watermark: DateTime<Utc>,
}

/// Grouped aggregation with retraction compensation.
///
/// Per key the operator holds one state per aggregate prototype. Arriving
/// inserts and retractions feed every aggregate; the trigger decides when a
/// key's current values are emitted. A re-emission first retracts the
/// previously emitted row, then inserts the new one; an unchanged row emits
/// nothing. A group whose net count returned to zero emits only the
/// retraction and is collected.
pub struct GroupByExec {
    source: Arc<dyn ExecNode>,
    key: Vec<CompiledExpr>,
    fields: Vec<String>,
    aggregate_protos: Vec<AggregateKind>,
    output_fields: Arc<[String]>,
    trigger_spec: TriggerSpec,
    /// Index into `key` of the expression carrying event time, if any.
    time_key_index: Option<usize>,
    /// Designated event-time field of the output rows.
    output_event_time_field: Option<String>,
}

impl GroupByExec {
    /// Group `source` by `key`, feeding `fields` into the aggregates.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn ExecNode>,
        key: Vec<CompiledExpr>,
        fields: Vec<String>,
        aggregate_protos: Vec<AggregateKind>,
        output_fields: Vec<String>,
        trigger_spec: TriggerSpec,
        time_key_index: Option<usize>,
        output_event_time_field: Option<String>,
    ) -> Self {
        GroupByExec {
            source,
            key,
            fields,
            aggregate_protos,
            output_fields: output_fields.into(),
            trigger_spec,
            time_key_index,
            output_event_time_field,
        }
    }

    fn new_group(&self) -> GroupState {
        GroupState {
            aggregates: self.aggregate_protos.iter().map(build_aggregate).collect(),
            record_count: 0,
            last_emitted: None,
        }
    }

    /// Event time stamped onto output rows of the given key.
    fn output_event_time(&self, key: &Value) -> DateTime<Utc> {
        if let (Some(i), Value::Tuple(parts)) = (self.time_key_index, key) {
            if let Some(Value::Timestamp(t)) = parts.get(i) {
                return *t;
            }
        }
        DateTime::<Utc>::UNIX_EPOCH
    }

    fn emit_row(
        &self,
        pctx: &ProduceContext,
        key: &Value,
        values: Vec<Value>,
        retraction: bool,
        on_record: ProduceFn,
    ) -> Result<()> {
        let mut record = Record::new(Arc::clone(&self.output_fields), values)
            .with_event_time(self.output_event_time(key));
        record.retraction = retraction;
        record.event_time_field = self.output_event_time_field.clone();
        on_record(pctx, record)
    }

    fn process_record(
        &self,
        ctx: &ExecutionContext,
        pctx: &ProduceContext,
        record: Record,
        run: &mut GroupByRun,
        on_record: ProduceFn,
    ) -> Result<()> {
        let scoped = ctx.with_record(&record);

        let mut key_parts = Vec::with_capacity(self.key.len());
        for expr in &self.key {
            key_parts.push(expr.evaluate(&scoped)?);
        }
        // A keyless group-by aggregates everything under the phantom
        // singleton key.
        if key_parts.is_empty() {
            key_parts.push(Value::Phantom);
        }
        let key = Value::Tuple(key_parts);

        let state = run
            .groups
            .entry(key.clone())
            .or_insert_with(|| self.new_group());
        state.record_count += if record.retraction { -1 } else { 1 };
        for (i, aggregate) in state.aggregates.iter_mut().enumerate() {
            let value = record
                .value(&self.fields[i])
                .cloned()
                .unwrap_or(Value::Null);
            aggregate.add(record.retraction, value).map_err(|err| {
                RillError::Runtime(format!(
                    "aggregate {} over {} failed: {err}",
                    self.aggregate_protos[i].name(),
                    self.fields[i],
                ))
            })?;
        }

        // Windowed keys register under their window time so the trigger
        // fires when the watermark passes the window, not the record.
        let trigger_time = match self.time_key_index {
            Some(_) => self.output_event_time(&key),
            None => record.event_time,
        };
        run.trigger.record_received(&key, trigger_time);
        let ready = run.trigger.poll();
        self.emit_keys(pctx, ready, &mut run.groups, on_record)
    }

    /// Fire the trigger-selected keys: retract stale rows, emit fresh ones.
    fn emit_keys(
        &self,
        pctx: &ProduceContext,
        keys: Vec<Value>,
        groups: &mut BTreeMap<Value, GroupState>,
        on_record: ProduceFn,
    ) -> Result<()> {
        for key in keys {
            let Some(state) = groups.get_mut(&key) else {
                continue;
            };
            if state.record_count <= 0 {
                if let Some(old) = state.last_emitted.take() {
                    self.emit_row(pctx, &key, old, true, on_record)?;
                }
                groups.remove(&key);
                continue;
            }
            let mut values = Vec::with_capacity(state.aggregates.len());
            for aggregate in &state.aggregates {
                values.push(aggregate.trigger()?);
            }
            if state.last_emitted.as_ref() == Some(&values) {
                continue;
            }
            if let Some(old) = state.last_emitted.take() {
                self.emit_row(pctx, &key, old, true, on_record)?;
            }
            self.emit_row(pctx, &key, values.clone(), false, on_record)?;
            state.last_emitted = Some(values);
        }
        Ok(())
    }
}

impl ExecNode for GroupByExec {
    fn name(&self) -> &'static str {
        "GroupBy"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        // Record and metadata callbacks both touch the group state and the
        // downstream sink; execution within a partition is single-threaded,
        // so cells resolve the shared-capture aliasing.
        let run = RefCell::new(GroupByRun {
            groups: BTreeMap::new(),
            trigger: build_trigger(&self.trigger_spec),
            watermark: DateTime::<Utc>::UNIX_EPOCH,
        });
        let sink = RefCell::new(on_record);

        let result = self.source.produce(
            ctx,
            &mut |pctx, record| {
                ctx.cancel.check()?;
                let mut run = run.borrow_mut();
                let mut sink = sink.borrow_mut();
                self.process_record(ctx, pctx, record, &mut run, &mut **sink)
            },
            &mut |pctx, msg| {
                let MetadataMessage::Watermark(t) = msg;
                let mut run = run.borrow_mut();
                if t < run.watermark {
                    warn!("ignoring non-monotonic watermark");
                    return Ok(());
                }
                run.watermark = t;
                run.trigger.watermark_received(t);
                let ready = run.trigger.poll();
                let GroupByRun { groups, .. } = &mut *run;
                let mut sink = sink.borrow_mut();
                self.emit_keys(pctx, ready, groups, &mut **sink)?;
                on_meta(pctx, MetadataMessage::Watermark(t))
            },
        );

        // Errors discard partial state without emitting.
        result?;

        // Source exhausted: fire a final synthetic trigger for all live
        // groups that still have pending updates.
        let pctx = ctx.produce_context();
        let mut run = run.into_inner();
        let on_record = sink.into_inner();
        let remaining = run.trigger.end_of_stream();
        debug!(groups = remaining.len(), "final group-by emission");
        self.emit_keys(&pctx, remaining, &mut run.groups, on_record)
    }
}

#[cfg(test)]
mod tests {
    use rill_common::CancelToken;

    use super::*;
    use crate::exec_node::run_collect;
    use crate::in_memory::InMemoryStream;

    fn cat(name: &str, livesleft: i64, ownerid: i64) -> Record {
        Record::from_slices(
            &["c.cat", "c.livesleft", "c.ownerid"],
            vec![
                Value::String(name.to_string()),
                Value::Int(livesleft),
                Value::Int(ownerid),
            ],
        )
    }

    fn owners_group_by(records: Vec<Record>, trigger: TriggerSpec) -> GroupByExec {
        GroupByExec::new(
            Arc::new(InMemoryStream::new(records)),
            vec![CompiledExpr::Variable("c.ownerid".to_string())],
            vec![
                "c.ownerid".to_string(),
                "c.livesleft".to_string(),
                "c.livesleft".to_string(),
            ],
            vec![AggregateKind::Key, AggregateKind::Avg, AggregateKind::Count],
            vec![
                "ownerid".to_string(),
                "livesleft_avg".to_string(),
                "livesleft_count".to_string(),
            ],
            trigger,
            None,
            None,
        )
    }

    fn row(ownerid: i64, avg: f64, count: i64) -> Record {
        Record::from_slices(
            &["ownerid", "livesleft_avg", "livesleft_count"],
            vec![Value::Int(ownerid), Value::Float(avg), Value::Int(count)],
        )
    }

    fn sorted_by_key(mut records: Vec<Record>) -> Vec<Record> {
        records.sort_by_key(|r| r.values()[0].clone());
        records
    }

    #[test]
    fn simple_batch_aggregation() {
        let records = vec![
            cat("Buster", 9, 5),
            cat("Precious", 6, 4),
            cat("Nala", 5, 3),
            cat("Tiger", 4, 3),
            cat("Lucy", 3, 3),
        ];
        let node = owners_group_by(records, TriggerSpec::Watermark);
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = sorted_by_key(run_collect(&node, &ctx).unwrap());
        assert_eq!(out, vec![row(3, 4.0, 3), row(4, 6.0, 1), row(5, 9.0, 1)]);
    }

    /// The retraction-heavy batch: repeated insert/retract cycles of the
    /// same row must cancel out before the final emission.
    #[test]
    fn batch_with_retractions() {
        let records = vec![
            cat("Buster", 9, 5),
            cat("Precious", 6, 4),
            cat("Precious", 6, 4).as_retraction(),
            cat("Precious", 6, 4),
            cat("Precious", 6, 4).as_retraction(),
            cat("Precious", 6, 4),
            cat("Precious", 6, 4).as_retraction(),
            cat("Precious", 5, 4),
            cat("Nala", 6, 3),
            cat("Tiger", 4, 3),
            cat("Tiger", 4, 3).as_retraction(),
            cat("Lucy", 4, 3),
        ];
        let node = owners_group_by(records, TriggerSpec::Watermark);
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = sorted_by_key(run_collect(&node, &ctx).unwrap());
        assert_eq!(out, vec![row(3, 5.0, 2), row(4, 5.0, 1), row(5, 9.0, 1)]);
    }

    /// With a counting trigger firing on every update, a changed key emits
    /// a retraction of its old row before the new row.
    #[test]
    fn counting_trigger_emits_retract_then_insert_pairs() {
        let records = vec![cat("Nala", 6, 3), cat("Tiger", 4, 3)];
        let node = owners_group_by(records, TriggerSpec::Counting(1));
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = run_collect(&node, &ctx).unwrap();
        assert_eq!(
            out,
            vec![
                row(3, 6.0, 1),
                row(3, 6.0, 1).as_retraction(),
                row(3, 5.0, 2),
            ]
        );
    }

    /// A group fully retracted after emission leaves only its retraction.
    #[test]
    fn fully_retracted_group_emits_final_retraction() {
        let records = vec![
            cat("Tiger", 4, 3),
            cat("Tiger", 4, 3).as_retraction(),
        ];
        let node = owners_group_by(records, TriggerSpec::Counting(1));
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = run_collect(&node, &ctx).unwrap();
        assert_eq!(out, vec![row(3, 4.0, 1), row(3, 4.0, 1).as_retraction()]);
    }

    #[test]
    fn keyless_group_by_uses_the_phantom_key() {
        let node = GroupByExec::new(
            Arc::new(InMemoryStream::new(vec![
                cat("Buster", 9, 5),
                cat("Nala", 5, 3),
            ])),
            vec![],
            vec!["c.livesleft".to_string()],
            vec![AggregateKind::Count],
            vec!["livesleft_count".to_string()],
            TriggerSpec::EndOfStream,
            None,
            None,
        );
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = run_collect(&node, &ctx).unwrap();
        assert_eq!(
            out,
            vec![Record::from_slices(
                &["livesleft_count"],
                vec![Value::Int(2)],
            )]
        );
    }
}
