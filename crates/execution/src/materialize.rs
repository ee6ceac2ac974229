//! Physical plan to executable node lowering.
//!
//! This is the only layer that can fail with "unknown function", "unknown
//! source" or a plan-time type mismatch; once materialization succeeds,
//! execution failures are runtime conditions.

use std::collections::HashMap;
use std::sync::Arc;

use rill_common::{EngineConfig, Result, RillError};
use rill_planner::physical::{self, Expression, Node};

use crate::distinct::DistinctExec;
use crate::exec_node::ExecNode;
use crate::expression::{resolve_function, CompiledExpr};
use crate::filter::FilterExec;
use crate::group_by::GroupByExec;
use crate::join::StreamJoinExec;
use crate::limit::LimitExec;
use crate::map::MapExec;
use crate::offset::OffsetExec;
use crate::requalifier::RequalifierExec;
use crate::shuffle::{ShuffleExec, ShuffleStrategy};
use crate::source::SourceExecutor;

/// Everything the materializer needs: the source registry and the engine
/// configuration.
pub struct MaterializationContext {
    /// Registered sources by name.
    pub sources: HashMap<String, Arc<dyn SourceExecutor>>,
    /// Engine configuration (channel capacities).
    pub config: EngineConfig,
}

impl MaterializationContext {
    /// Context over the given source registry with default configuration.
    pub fn new(sources: HashMap<String, Arc<dyn SourceExecutor>>) -> Self {
        MaterializationContext {
            sources,
            config: EngineConfig::default(),
        }
    }

    fn source(&self, name: &str) -> Result<&Arc<dyn SourceExecutor>> {
        self.sources
            .get(name)
            .ok_or_else(|| RillError::Plan(format!("unknown source: {name}")))
    }
}

/// Compile a physical expression.
pub fn compile_expr(expr: &Expression, ctx: &MaterializationContext) -> Result<CompiledExpr> {
    match expr {
        Expression::Variable { name } => Ok(CompiledExpr::Variable(name.clone())),
        Expression::Constant(value) => Ok(CompiledExpr::Constant(value.clone())),
        Expression::FunctionCall { name, args } => {
            let descriptor = resolve_function(name, args.len())?;
            let args = args
                .iter()
                .map(|arg| compile_expr(arg, ctx))
                .collect::<Result<Vec<_>>>()?;
            Ok(CompiledExpr::FunctionCall { descriptor, args })
        }
        Expression::Subquery(node) => Ok(CompiledExpr::Subquery(materialize(node, ctx)?)),
        Expression::Tuple(items) => {
            let items = items
                .iter()
                .map(|item| compile_expr(item, ctx))
                .collect::<Result<Vec<_>>>()?;
            Ok(CompiledExpr::Tuple(items))
        }
    }
}

/// Recursively lower the physical tree into executable nodes.
pub fn materialize(node: &Node, ctx: &MaterializationContext) -> Result<Arc<dyn ExecNode>> {
    match node {
        Node::DataSourceBuilder(dsb) => {
            let source = ctx.source(&dsb.source_name)?;
            let conjuncts = dsb
                .filter
                .clone()
                .map(Expression::split_conjuncts)
                .unwrap_or_default();
            // The optimizer pushed what the capability map allows; the
            // source has the final say and rejects anything it cannot
            // translate, which we then evaluate in a residual filter.
            let (rejected, pushed, _changed) = source.push_down_predicates(conjuncts, vec![]);
            let scan = source.materialize(ctx, &pushed, &dsb.alias)?;
            match Expression::combine_conjuncts(rejected) {
                Some(residual) => Ok(Arc::new(FilterExec::new(
                    compile_expr(&residual, ctx)?,
                    scan,
                ))),
                None => Ok(scan),
            }
        }
        Node::Filter { predicate, source } => Ok(Arc::new(FilterExec::new(
            compile_expr(predicate, ctx)?,
            materialize(source, ctx)?,
        ))),
        Node::Map { exprs, keep, source } => {
            let output_event_time_field = node.metadata().event_time_field;
            let compiled = exprs
                .iter()
                .map(|named| Ok((compile_expr(&named.expr, ctx)?, named.name.clone())))
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(MapExec::new(
                compiled,
                *keep,
                output_event_time_field,
                materialize(source, ctx)?,
            )))
        }
        Node::GroupBy(group_by) => {
            let source_meta = group_by.source.metadata();
            // The key column holding the child's event time makes the
            // output rows inherit that window boundary as event time.
            let time_key_index = source_meta.event_time_field.as_ref().and_then(|etf| {
                group_by.key.iter().position(
                    |expr| matches!(expr, Expression::Variable { name } if name == etf),
                )
            });
            let output_event_time_field = node.metadata().event_time_field;
            let key = group_by
                .key
                .iter()
                .map(|expr| compile_expr(expr, ctx))
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(GroupByExec::new(
                materialize(&group_by.source, ctx)?,
                key,
                group_by.fields.clone(),
                group_by.aggregates.clone(),
                group_by.output_names.clone(),
                group_by.trigger.clone(),
                time_key_index,
                output_event_time_field,
            )))
        }
        Node::StreamJoin {
            left,
            right,
            left_key,
            right_key,
        } => {
            let left_key = left_key
                .iter()
                .map(|expr| compile_expr(expr, ctx))
                .collect::<Result<Vec<_>>>()?;
            let right_key = right_key
                .iter()
                .map(|expr| compile_expr(expr, ctx))
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(StreamJoinExec::new(
                materialize(left, ctx)?,
                materialize(right, ctx)?,
                left_key,
                right_key,
                ctx.config.channel_capacity,
            )))
        }
        Node::Requalifier { qualifier, source } => Ok(Arc::new(RequalifierExec::new(
            qualifier.clone(),
            materialize(source, ctx)?,
        ))),
        Node::Distinct { source } => Ok(Arc::new(DistinctExec::new(materialize(source, ctx)?))),
        Node::Limit { count, source } => Ok(Arc::new(LimitExec::new(
            compile_expr(count, ctx)?,
            materialize(source, ctx)?,
        ))),
        Node::Offset { count, source } => Ok(Arc::new(OffsetExec::new(
            compile_expr(count, ctx)?,
            materialize(source, ctx)?,
        ))),
        Node::Shuffle(shuffle) => {
            let strategy = match &shuffle.strategy {
                physical::ShuffleStrategy::Constant(partition) => {
                    ShuffleStrategy::Constant(*partition)
                }
                physical::ShuffleStrategy::Hash(exprs) => ShuffleStrategy::Hash(
                    exprs
                        .iter()
                        .map(|expr| compile_expr(expr, ctx))
                        .collect::<Result<Vec<_>>>()?,
                ),
            };
            let sources = shuffle
                .sources
                .iter()
                .map(|source| materialize(source, ctx))
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(ShuffleExec::new(
                strategy,
                sources,
                ctx.config.channel_capacity,
            )))
        }
    }
}
