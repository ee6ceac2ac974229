//! Executable operator contract.
//!
//! Operators are push-based: `produce` drives the node, invoking the record
//! callback for every emitted record and the metadata callback for every
//! watermark. Returning normally means the bounded input is exhausted;
//! unbounded nodes block until cancellation.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use rill_common::{CancelToken, Result};

use crate::record::{Record, VariableContext};

/// Maximum timestamp, emitted as the final watermark of bounded sources to
/// signal end-of-stream to event-time operators.
pub fn watermark_max_value() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

/// Context threaded down the operator tree while producing.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Root cancellation signal, propagated to every operator and I/O call.
    pub cancel: CancelToken,
    /// Outer variable scope visible to expressions.
    pub variables: Arc<VariableContext>,
}

impl ExecutionContext {
    /// Fresh context with an empty scope.
    pub fn new(cancel: CancelToken) -> Self {
        ExecutionContext {
            cancel,
            variables: VariableContext::empty(),
        }
    }

    /// Same context with the record's fields pushed as the innermost scope.
    pub fn with_record(&self, record: &Record) -> ExecutionContext {
        ExecutionContext {
            cancel: self.cancel.clone(),
            variables: self.variables.with_record(record),
        }
    }

    /// The context handed to produce callbacks.
    pub fn produce_context(&self) -> ProduceContext {
        ProduceContext {
            cancel: self.cancel.clone(),
        }
    }
}

/// Context available inside produce callbacks.
#[derive(Debug, Clone)]
pub struct ProduceContext {
    /// Root cancellation signal.
    pub cancel: CancelToken,
}

/// Out-of-band messages flowing alongside records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    /// No future record will arrive with an event time below this.
    Watermark(DateTime<Utc>),
}

/// Callback receiving produced records.
pub type ProduceFn<'a> = &'a mut dyn FnMut(&ProduceContext, Record) -> Result<()>;

/// Callback receiving metadata messages.
pub type MetaSendFn<'a> = &'a mut dyn FnMut(&ProduceContext, MetadataMessage) -> Result<()>;

/// A materialized operator instance.
pub trait ExecNode: Send + Sync {
    /// Stable operator name for logging.
    fn name(&self) -> &'static str;

    /// Drive the node to completion (bounded) or cancellation (unbounded).
    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()>;
}

/// Metadata callback that drops every message.
pub fn discard_meta(_ctx: &ProduceContext, _msg: MetadataMessage) -> Result<()> {
    Ok(())
}

/// Run a bounded node to completion, collecting every produced record.
///
/// Watermarks are discarded. Used by sub-query evaluation and tests.
pub fn run_collect(node: &dyn ExecNode, ctx: &ExecutionContext) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    node.produce(
        ctx,
        &mut |_pctx, record| {
            records.push(record);
            Ok(())
        },
        &mut discard_meta,
    )?;
    Ok(records)
}

/// Collapse a bounded record sequence into its surviving inserts.
///
/// Each retraction removes one earlier matching insert. The order of the
/// surviving records is preserved.
pub fn resolve_retractions(records: Vec<Record>) -> Vec<Record> {
    let mut live: Vec<Record> = Vec::new();
    for record in records {
        if record.retraction {
            let position = live.iter().position(|candidate| {
                candidate.values() == record.values()
                    && *candidate.fields() == *record.fields()
            });
            if let Some(i) = position {
                live.remove(i);
            }
        } else {
            live.push(record);
        }
    }
    live
}
