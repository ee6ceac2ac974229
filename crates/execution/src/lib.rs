//! Streaming execution runtime for rill queries.
//!
//! Architecture role:
//! - the [`Record`]/[`VariableContext`] row model
//! - the push-based [`ExecNode`] operator contract with records and
//!   watermark metadata
//! - the streaming operators (filter, map, requalifier, group-by with
//!   triggers, distinct, stream join, limit, offset, shuffle)
//! - incremental [`aggregates`] with retraction support
//! - physical-to-executable [`materialize`] lowering
//!
//! Within a partition execution is single-threaded and cooperative; shuffle
//! and join boundaries run their inputs on parallel threads connected by
//! bounded channels with backpressure.

pub mod aggregates;
pub mod distinct;
pub mod exec_node;
pub mod expression;
pub mod filter;
pub mod group_by;
pub mod in_memory;
pub mod join;
pub mod limit;
pub mod map;
pub mod materialize;
pub mod offset;
pub mod record;
pub mod requalifier;
pub mod shuffle;
pub mod source;
pub mod trigger;

pub use aggregates::{build_aggregate, Aggregate};
pub use exec_node::{
    discard_meta, resolve_retractions, run_collect, watermark_max_value, ExecNode,
    ExecutionContext, MetaSendFn, MetadataMessage, ProduceContext, ProduceFn,
};
pub use expression::{compare_values, resolve_function, CompiledExpr, FunctionDescriptor};
pub use in_memory::{InMemoryStream, StreamElement};
pub use materialize::{compile_expr, materialize, MaterializationContext};
pub use record::{Record, VariableContext};
pub use source::SourceExecutor;
pub use trigger::{build_trigger, Trigger};
