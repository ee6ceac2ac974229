//! Symmetric stream join operator.

use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use tracing::warn;

use rill_common::{Result, RillError, Value};

use crate::exec_node::{
    ExecNode, ExecutionContext, MetaSendFn, MetadataMessage, ProduceFn,
};
use crate::expression::CompiledExpr;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

enum JoinMessage {
    Record(Side, Record),
    Watermark(Side, DateTime<Utc>),
    Done(Side),
    Failed(RillError),
}

/// Per-key multisets of both sides.
#[derive(Default)]
struct KeyState {
    left: Vec<(Record, i64)>,
    right: Vec<(Record, i64)>,
}

/// Equi-join of two streams under the retraction algebra.
///
/// Both inputs run on their own threads and feed one bounded channel. For
/// every arriving delta the opposite side's multiset is probed; matches
/// emit one combined record per unit of opposite multiplicity, with the
/// incoming retraction flag. The output watermark is the minimum of both
/// input watermarks.
pub struct StreamJoinExec {
    left: Arc<dyn ExecNode>,
    right: Arc<dyn ExecNode>,
    left_key: Vec<CompiledExpr>,
    right_key: Vec<CompiledExpr>,
    channel_capacity: usize,
}

impl StreamJoinExec {
    /// Join `left` and `right` on positionally matching key expressions.
    pub fn new(
        left: Arc<dyn ExecNode>,
        right: Arc<dyn ExecNode>,
        left_key: Vec<CompiledExpr>,
        right_key: Vec<CompiledExpr>,
        channel_capacity: usize,
    ) -> Self {
        StreamJoinExec {
            left,
            right,
            left_key,
            right_key,
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn run_side(
        side: Side,
        source: &dyn ExecNode,
        ctx: &ExecutionContext,
        tx: &SyncSender<JoinMessage>,
    ) {
        let result = source.produce(
            ctx,
            &mut |_pctx, record| {
                ctx.cancel.check()?;
                tx.send(JoinMessage::Record(side, record))
                    .map_err(|_| RillError::Cancelled)
            },
            &mut |_pctx, msg| {
                let MetadataMessage::Watermark(t) = msg;
                tx.send(JoinMessage::Watermark(side, t))
                    .map_err(|_| RillError::Cancelled)
            },
        );
        let message = match result {
            Ok(()) => JoinMessage::Done(side),
            Err(RillError::Cancelled) if ctx.cancel.is_cancelled() => {
                JoinMessage::Failed(RillError::Cancelled)
            }
            Err(err) => JoinMessage::Failed(err),
        };
        let _ = tx.send(message);
    }

    fn key_of(&self, ctx: &ExecutionContext, side: Side, record: &Record) -> Result<Value> {
        let exprs = match side {
            Side::Left => &self.left_key,
            Side::Right => &self.right_key,
        };
        let scoped = ctx.with_record(record);
        let mut key = Vec::with_capacity(exprs.len());
        for expr in exprs {
            key.push(expr.evaluate(&scoped)?);
        }
        Ok(Value::Tuple(key))
    }
}

fn combine(left: &Record, right: &Record, retraction: bool) -> Record {
    let fields: Vec<String> = left
        .fields()
        .iter()
        .chain(right.fields().iter())
        .cloned()
        .collect();
    let values: Vec<Value> = left
        .values()
        .iter()
        .chain(right.values().iter())
        .cloned()
        .collect();
    let mut out = Record::new(fields.into(), values)
        .with_event_time(left.event_time.max(right.event_time));
    out.retraction = retraction;
    out
}

fn apply_delta(multiset: &mut Vec<(Record, i64)>, record: &Record, weight: i64) {
    let payload_matches = |candidate: &Record| {
        candidate.values() == record.values() && *candidate.fields() == *record.fields()
    };
    match multiset.iter_mut().find(|(r, _)| payload_matches(r)) {
        Some((_, count)) => {
            *count += weight;
            multiset.retain(|(_, count)| *count != 0);
        }
        None => {
            let mut stored = record.clone();
            stored.retraction = false;
            multiset.push((stored, weight));
        }
    }
}

impl ExecNode for StreamJoinExec {
    fn name(&self) -> &'static str {
        "StreamJoin"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        let pctx = ctx.produce_context();
        let mut state: BTreeMap<Value, KeyState> = BTreeMap::new();
        let mut watermarks = [DateTime::<Utc>::UNIX_EPOCH; 2];
        let mut emitted_watermark = DateTime::<Utc>::UNIX_EPOCH;
        let mut open = 2usize;

        thread::scope(|scope| -> Result<()> {
            let (tx, rx) = sync_channel::<JoinMessage>(self.channel_capacity);
            for (side, source) in [(Side::Left, &self.left), (Side::Right, &self.right)] {
                let tx = tx.clone();
                let ctx = ctx.clone();
                let source = Arc::clone(source);
                scope.spawn(move || Self::run_side(side, source.as_ref(), &ctx, &tx));
            }
            drop(tx);

            while open > 0 {
                let Ok(message) = rx.recv() else { break };
                ctx.cancel.check()?;
                match message {
                    JoinMessage::Record(side, record) => {
                        let key = self.key_of(ctx, side, &record)?;
                        let weight = if record.retraction { -1 } else { 1 };
                        let entry = state.entry(key.clone()).or_default();

                        let (own, other) = match side {
                            Side::Left => (&mut entry.left, &entry.right),
                            Side::Right => (&mut entry.right, &entry.left),
                        };
                        let mut matches = Vec::new();
                        for (opposite, count) in other.iter() {
                            if *count <= 0 {
                                continue;
                            }
                            let combined = match side {
                                Side::Left => combine(&record, opposite, record.retraction),
                                Side::Right => combine(opposite, &record, record.retraction),
                            };
                            for _ in 0..*count {
                                matches.push(combined.clone());
                            }
                        }
                        apply_delta(own, &record, weight);
                        if entry.left.is_empty() && entry.right.is_empty() {
                            state.remove(&key);
                        }
                        for combined in matches {
                            on_record(&pctx, combined)?;
                        }
                    }
                    JoinMessage::Watermark(side, t) => {
                        let index = match side {
                            Side::Left => 0,
                            Side::Right => 1,
                        };
                        if t < watermarks[index] {
                            warn!(?side, "ignoring non-monotonic watermark");
                            continue;
                        }
                        watermarks[index] = t;
                        let merged = watermarks[0].min(watermarks[1]);
                        if merged > emitted_watermark {
                            emitted_watermark = merged;
                            on_meta(&pctx, MetadataMessage::Watermark(merged))?;
                        }
                    }
                    JoinMessage::Done(side) => {
                        let index = match side {
                            Side::Left => 0,
                            Side::Right => 1,
                        };
                        watermarks[index] = DateTime::<Utc>::MAX_UTC;
                        open -= 1;
                    }
                    JoinMessage::Failed(err) => return Err(err),
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use rill_common::CancelToken;

    use super::*;
    use crate::exec_node::{resolve_retractions, run_collect};
    use crate::in_memory::InMemoryStream;

    fn owner(id: i64, name: &str) -> Record {
        Record::from_slices(
            &["o.id", "o.name"],
            vec![Value::Int(id), Value::String(name.to_string())],
        )
    }

    fn cat(owner_id: i64, cat_name: &str) -> Record {
        Record::from_slices(
            &["c.ownerid", "c.name"],
            vec![Value::Int(owner_id), Value::String(cat_name.to_string())],
        )
    }

    fn join(left: Vec<Record>, right: Vec<Record>) -> StreamJoinExec {
        StreamJoinExec::new(
            Arc::new(InMemoryStream::new(left)),
            Arc::new(InMemoryStream::new(right)),
            vec![CompiledExpr::Variable("o.id".to_string())],
            vec![CompiledExpr::Variable("c.ownerid".to_string())],
            16,
        )
    }

    #[test]
    fn matches_on_equal_keys() {
        let node = join(
            vec![owner(1, "alice"), owner(2, "bob")],
            vec![cat(1, "buster"), cat(3, "tiger")],
        );
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = run_collect(&node, &ctx).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].value("o.name"),
            Some(&Value::String("alice".to_string()))
        );
        assert_eq!(
            out[0].value("c.name"),
            Some(&Value::String("buster".to_string()))
        );
    }

    #[test]
    fn retraction_of_one_side_retracts_the_joined_rows() {
        let node = join(
            vec![owner(1, "alice")],
            vec![cat(1, "buster"), cat(1, "buster").as_retraction()],
        );
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = run_collect(&node, &ctx).unwrap();
        // Insert then retraction of the same combined payload; nothing
        // survives the collapse.
        assert_eq!(out.len(), 2);
        assert!(resolve_retractions(out).is_empty());
    }

    #[test]
    fn multiplicities_multiply() {
        let node = join(
            vec![owner(1, "alice"), owner(1, "alice")],
            vec![cat(1, "buster")],
        );
        let ctx = ExecutionContext::new(CancelToken::new());
        let out = run_collect(&node, &ctx).unwrap();
        assert_eq!(out.len(), 2);
    }
}
