//! Partition/merge boundary.
//!
//! Each upstream shard runs on its own thread and feeds a bounded channel;
//! a full channel blocks the producing partition, which is the engine's
//! backpressure mechanism. The merge side emits records as they arrive and
//! watermarks as the minimum across all shards.

use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use rill_common::{Result, RillError, Value};

use crate::exec_node::{
    ExecNode, ExecutionContext, MetaSendFn, MetadataMessage, ProduceFn,
};
use crate::expression::CompiledExpr;
use crate::record::Record;

/// Routing strategy across downstream partitions.
pub enum ShuffleStrategy {
    /// Every record goes to the given partition.
    Constant(usize),
    /// Records route by the hash of their key expressions.
    Hash(Vec<CompiledExpr>),
}

impl ShuffleStrategy {
    /// Destination partition for a record.
    pub fn route(
        &self,
        ctx: &ExecutionContext,
        record: &Record,
        partitions: usize,
    ) -> Result<usize> {
        match self {
            ShuffleStrategy::Constant(partition) => Ok(partition % partitions.max(1)),
            ShuffleStrategy::Hash(exprs) => {
                let scoped = ctx.with_record(record);
                let mut key = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    key.push(expr.evaluate(&scoped)?);
                }
                Ok((Value::Tuple(key).hash64() % partitions.max(1) as u64) as usize)
            }
        }
    }
}

enum ShuffleMessage {
    Record(Record),
    Watermark(usize, DateTime<Utc>),
    Done(usize),
    Failed(RillError),
}

/// Merges its upstream shards into one ordered-per-shard stream.
///
/// The runtime drives a single downstream partition, so routing collapses
/// to partition zero; the strategy is still evaluated so key errors
/// surface identically in sharded deployments. Grouped operators route by
/// the group key, which keeps retractions on the partition of their
/// original insert.
pub struct ShuffleExec {
    strategy: ShuffleStrategy,
    sources: Vec<Arc<dyn ExecNode>>,
    channel_capacity: usize,
}

impl ShuffleExec {
    /// Merge `sources` with the given routing strategy.
    pub fn new(
        strategy: ShuffleStrategy,
        sources: Vec<Arc<dyn ExecNode>>,
        channel_capacity: usize,
    ) -> Self {
        ShuffleExec {
            strategy,
            sources,
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn run_shard(
        &self,
        index: usize,
        source: &dyn ExecNode,
        ctx: &ExecutionContext,
        tx: &SyncSender<ShuffleMessage>,
    ) {
        let result = source.produce(
            ctx,
            &mut |_pctx, record| {
                ctx.cancel.check()?;
                self.strategy.route(ctx, &record, 1)?;
                tx.send(ShuffleMessage::Record(record))
                    .map_err(|_| RillError::Cancelled)
            },
            &mut |_pctx, msg| {
                let MetadataMessage::Watermark(t) = msg;
                tx.send(ShuffleMessage::Watermark(index, t))
                    .map_err(|_| RillError::Cancelled)
            },
        );
        let message = match result {
            Ok(()) => ShuffleMessage::Done(index),
            // The merge side dropped the receiver; it already has an error.
            Err(RillError::Cancelled) if ctx.cancel.is_cancelled() => {
                ShuffleMessage::Failed(RillError::Cancelled)
            }
            Err(err) => ShuffleMessage::Failed(err),
        };
        let _ = tx.send(message);
    }
}

impl ExecNode for ShuffleExec {
    fn name(&self) -> &'static str {
        "Shuffle"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        let pctx = ctx.produce_context();
        let shard_count = self.sources.len();
        let mut shard_watermarks: Vec<DateTime<Utc>> =
            vec![DateTime::<Utc>::UNIX_EPOCH; shard_count];
        let mut emitted_watermark = DateTime::<Utc>::UNIX_EPOCH;
        let mut open = shard_count;

        thread::scope(|scope| -> Result<()> {
            let (tx, rx) = sync_channel::<ShuffleMessage>(self.channel_capacity);
            for (index, source) in self.sources.iter().enumerate() {
                let tx = tx.clone();
                let ctx = ctx.clone();
                scope.spawn(move || self.run_shard(index, source.as_ref(), &ctx, &tx));
            }
            drop(tx);

            while open > 0 {
                let Ok(message) = rx.recv() else { break };
                ctx.cancel.check()?;
                match message {
                    ShuffleMessage::Record(record) => on_record(&pctx, record)?,
                    ShuffleMessage::Watermark(index, t) => {
                        if t < shard_watermarks[index] {
                            warn!(shard = index, "ignoring non-monotonic watermark");
                            continue;
                        }
                        shard_watermarks[index] = t;
                        let merged = shard_watermarks
                            .iter()
                            .min()
                            .copied()
                            .unwrap_or(emitted_watermark);
                        if merged > emitted_watermark {
                            emitted_watermark = merged;
                            on_meta(&pctx, MetadataMessage::Watermark(merged))?;
                        }
                    }
                    ShuffleMessage::Done(index) => {
                        trace!(shard = index, "shard exhausted");
                        // An exhausted shard no longer holds the merged
                        // watermark back.
                        shard_watermarks[index] = DateTime::<Utc>::MAX_UTC;
                        open -= 1;
                    }
                    ShuffleMessage::Failed(err) => return Err(err),
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
    use crate::exec_node::{run_collect, watermark_max_value};
    use crate::in_memory::{InMemoryStream, StreamElement};

    fn rec(v: i64) -> Record {
        Record::from_slices(&["t.v"], vec![Value::Int(v)])
    }

    #[test]
    fn merges_all_shards() {
        let shuffle = ShuffleExec::new(
            ShuffleStrategy::Constant(0),
            vec![
                Arc::new(InMemoryStream::new(vec![rec(1), rec(2)])),
                Arc::new(InMemoryStream::new(vec![rec(3)])),
            ],
            16,
        );
        let ctx = ExecutionContext::new(CancelToken::new());
        let mut out = run_collect(&shuffle, &ctx).unwrap();
        out.sort_by_key(|r| r.values()[0].clone());
        assert_eq!(out, vec![rec(1), rec(2), rec(3)]);
    }

    #[test]
    fn merged_watermark_is_the_minimum_across_shards() {
        use chrono::TimeZone;
        let t1 = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 10).unwrap();
        let t2 = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 20).unwrap();

        let fast = InMemoryStream::with_elements(vec![StreamElement::Watermark(t2)], true);
        let slow = InMemoryStream::with_elements(vec![StreamElement::Watermark(t1)], true);
        let shuffle = ShuffleExec::new(
            ShuffleStrategy::Constant(0),
            vec![Arc::new(fast), Arc::new(slow)],
            16,
        );

        let ctx = ExecutionContext::new(CancelToken::new());
        let mut watermarks = Vec::new();
        shuffle
            .produce(
                &ctx,
                &mut |_p, _r| Ok(()),
                &mut |_p, msg| {
                    let MetadataMessage::Watermark(t) = msg;
                    watermarks.push(t);
                    Ok(())
                },
            )
            .unwrap();

        // min(t2, epoch) stays epoch until the slow shard advances; the
        // merge therefore first surfaces t1, then the max sentinel once
        // both shards are exhausted.
        assert_eq!(watermarks, vec![t1, watermark_max_value()]);

        // Monotonicity across the emitted sequence.
        assert!(watermarks.windows(2).all(|w| w[0] <= w[1]));
    }
}
