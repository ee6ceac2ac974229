use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use rill_common::{Result, RillError, Value};

use crate::physical::{
    self, Cardinality, FilterCapabilities, ShuffleStrategy, TriggerSpec,
};

pub use crate::physical::AggregateKind;

/// Description of a registered source, as the planner needs it.
///
/// Field names are unaliased; lowering qualifies them with the query alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescription {
    /// Primary key field names.
    pub primary_keys: Vec<String>,
    /// Relations the source can evaluate natively, per field class.
    pub available_filters: FilterCapabilities,
    /// Scan cardinality.
    pub cardinality: Cardinality,
    /// Field carrying event time, if any.
    pub time_field: Option<String>,
}

/// Resolves data source names during logical-to-physical lowering.
pub trait SourceResolver {
    /// Describe the named source, or fail with a plan error.
    fn describe(&self, name: &str) -> Result<SourceDescription>;
}

/// Context threaded through lowering.
pub struct PlanContext<'a> {
    /// Source name resolution.
    pub resolver: &'a dyn SourceResolver,
}

/// A logical scalar expression, as produced by the query frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Reference to a named field or outer variable.
    Variable(String),
    /// Literal value.
    Constant(Value),
    /// Call of a named function or operator.
    FunctionCall {
        /// Function name.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// A sub-query lifted into an expression.
    Subquery(Box<LogicalPlan>),
    /// Positional tuple constructor.
    Tuple(Vec<Expr>),
}

impl Expr {
    /// Binary relation shorthand.
    pub fn relation(left: Expr, rel: &str, right: Expr) -> Expr {
        Expr::FunctionCall {
            name: rel.to_string(),
            args: vec![left, right],
        }
    }

    fn to_physical(&self, ctx: &PlanContext) -> Result<(physical::Expression, BTreeSet<String>)> {
        match self {
            Expr::Variable(name) => Ok((
                physical::Expression::Variable { name: name.clone() },
                BTreeSet::from([name.clone()]),
            )),
            Expr::Constant(value) => {
                Ok((physical::Expression::Constant(value.clone()), BTreeSet::new()))
            }
            Expr::FunctionCall { name, args } => {
                let mut variables = BTreeSet::new();
                let mut physical_args = Vec::with_capacity(args.len());
                for arg in args {
                    let (expr, vars) = arg.to_physical(ctx)?;
                    physical_args.push(expr);
                    variables.extend(vars);
                }
                Ok((
                    physical::Expression::FunctionCall {
                        name: name.clone(),
                        args: physical_args,
                    },
                    variables,
                ))
            }
            Expr::Subquery(plan) => {
                let (node, variables) = plan.to_physical_merged(ctx)?;
                Ok((physical::Expression::Subquery(Box::new(node)), variables))
            }
            Expr::Tuple(items) => {
                let mut variables = BTreeSet::new();
                let mut physical_items = Vec::with_capacity(items.len());
                for item in items {
                    let (expr, vars) = item.to_physical(ctx)?;
                    physical_items.push(expr);
                    variables.extend(vars);
                }
                Ok((physical::Expression::Tuple(physical_items), variables))
            }
        }
    }
}

/// An output expression with an optional alias.
///
/// Plain variables default to their own name; any other expression must be
/// aliased explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedExpr {
    /// The computed expression.
    pub expr: Expr,
    /// Output name; defaults to the variable name for plain variables.
    pub alias: Option<String>,
}

impl NamedExpr {
    /// Unaliased output expression.
    pub fn new(expr: Expr) -> Self {
        NamedExpr { expr, alias: None }
    }

    /// Aliased output expression.
    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        NamedExpr {
            expr,
            alias: Some(alias.into()),
        }
    }

    fn output_name(&self) -> Result<String> {
        if let Some(alias) = &self.alias {
            return Ok(alias.clone());
        }
        match &self.expr {
            Expr::Variable(name) => Ok(name.clone()),
            other => Err(RillError::Plan(format!(
                "map expression {other:?} requires an alias"
            ))),
        }
    }
}

/// One aggregate column of a group-by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Aggregate selector.
    pub kind: AggregateKind,
    /// Source field the aggregate consumes.
    pub field: String,
    /// Output name; defaults to `<field>_<aggregate>`.
    pub output_name: Option<String>,
}

impl AggregateSpec {
    /// Aggregate column with the default output name.
    pub fn new(kind: AggregateKind, field: impl Into<String>) -> Self {
        AggregateSpec {
            kind,
            field: field.into(),
            output_name: None,
        }
    }

    /// Aggregate column with an explicit output name.
    pub fn named(kind: AggregateKind, field: impl Into<String>, output: impl Into<String>) -> Self {
        AggregateSpec {
            kind,
            field: field.into(),
            output_name: Some(output.into()),
        }
    }
}

/// The logical algebra tree produced by the query frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    /// Scan of a registered source under an alias.
    DataSource {
        /// Registered source name.
        name: String,
        /// Alias qualifying all emitted fields.
        alias: String,
    },
    /// Predicate filter.
    Filter {
        /// Boolean formula.
        predicate: Expr,
        /// Input plan.
        source: Box<LogicalPlan>,
    },
    /// Expression projection.
    Map {
        /// Output expressions.
        exprs: Vec<NamedExpr>,
        /// Whether source fields follow the computed ones.
        keep: bool,
        /// Input plan.
        source: Box<LogicalPlan>,
    },
    /// Grouped aggregation.
    GroupBy {
        /// Input plan.
        source: Box<LogicalPlan>,
        /// Grouping key expressions; empty means one global group.
        key: Vec<Expr>,
        /// Aggregate columns.
        aggregates: Vec<AggregateSpec>,
        /// Emission policy.
        trigger: TriggerSpec,
    },
    /// Emit at most `count` records.
    Limit {
        /// Count expression.
        count: Expr,
        /// Input plan.
        source: Box<LogicalPlan>,
    },
    /// Skip the first `count` records.
    Offset {
        /// Count expression.
        count: Expr,
        /// Input plan.
        source: Box<LogicalPlan>,
    },
    /// Alias prefix rewrite of all emitted fields.
    Requalifier {
        /// New qualifier.
        qualifier: String,
        /// Input plan.
        source: Box<LogicalPlan>,
    },
    /// Equi-join of two inputs.
    Join {
        /// Left input.
        left: Box<LogicalPlan>,
        /// Right input.
        right: Box<LogicalPlan>,
        /// Positional key pairs `(left_key, right_key)`.
        on: Vec<(Expr, Expr)>,
    },
    /// Whole-record deduplication.
    Distinct {
        /// Input plan.
        source: Box<LogicalPlan>,
    },
}

impl LogicalPlan {
    /// Lower this subtree into physical shards plus the set of free
    /// variables referenced by its expressions.
    ///
    /// A node may expand into several parallel shards; operators that need a
    /// single merged stream go through [`LogicalPlan::to_physical_merged`],
    /// which inserts an explicit shuffle boundary.
    pub fn to_physical(
        &self,
        ctx: &PlanContext,
    ) -> Result<(Vec<physical::Node>, BTreeSet<String>)> {
        match self {
            LogicalPlan::DataSource { name, alias } => {
                let description = ctx.resolver.describe(name)?;
                let qualified = |field: &String| format!("{alias}.{field}");
                Ok((
                    vec![physical::Node::DataSourceBuilder(
                        physical::DataSourceBuilder {
                            source_name: name.clone(),
                            alias: alias.clone(),
                            primary_keys: description.primary_keys.iter().map(qualified).collect(),
                            available_filters: description.available_filters,
                            filter: None,
                            cardinality: description.cardinality,
                            time_field: description.time_field.as_ref().map(qualified),
                        },
                    )],
                    BTreeSet::new(),
                ))
            }
            LogicalPlan::Filter { predicate, source } => {
                let (shards, mut variables) = source.to_physical(ctx)?;
                let (predicate, predicate_vars) = predicate.to_physical(ctx)?;
                variables.extend(predicate_vars);
                let shards = shards
                    .into_iter()
                    .map(|shard| physical::Node::Filter {
                        predicate: predicate.clone(),
                        source: Box::new(shard),
                    })
                    .collect();
                Ok((shards, variables))
            }
            LogicalPlan::Map { exprs, keep, source } => {
                let (shards, mut variables) = source.to_physical(ctx)?;
                let mut named = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    let name = expr.output_name()?;
                    let (physical_expr, expr_vars) = expr.expr.to_physical(ctx)?;
                    variables.extend(expr_vars);
                    named.push(physical::NamedExpression {
                        expr: physical_expr,
                        name,
                    });
                }
                let shards = shards
                    .into_iter()
                    .map(|shard| physical::Node::Map {
                        exprs: named.clone(),
                        keep: *keep,
                        source: Box::new(shard),
                    })
                    .collect();
                Ok((shards, variables))
            }
            LogicalPlan::GroupBy {
                source,
                key,
                aggregates,
                trigger,
            } => {
                let (shards, mut variables) = source.to_physical(ctx)?;
                let mut physical_key = Vec::with_capacity(key.len());
                for expr in key {
                    let (physical_expr, expr_vars) = expr.to_physical(ctx)?;
                    variables.extend(expr_vars);
                    physical_key.push(physical_expr);
                }
                // Retractions must land on the partition of their original
                // insert, so groupers route by the group key.
                let strategy = if physical_key.is_empty() {
                    ShuffleStrategy::Constant(0)
                } else {
                    ShuffleStrategy::Hash(physical_key.clone())
                };
                let merged = physical::Node::Shuffle(physical::Shuffle {
                    strategy,
                    sources: shards,
                });
                let mut fields = Vec::with_capacity(aggregates.len());
                let mut kinds = Vec::with_capacity(aggregates.len());
                let mut output_names = Vec::with_capacity(aggregates.len());
                for spec in aggregates {
                    output_names.push(match &spec.output_name {
                        Some(name) => name.clone(),
                        None => format!("{}_{}", spec.field, spec.kind.name()),
                    });
                    fields.push(spec.field.clone());
                    kinds.push(spec.kind.clone());
                }
                Ok((
                    vec![physical::Node::GroupBy(physical::GroupBy {
                        source: Box::new(merged),
                        key: physical_key,
                        fields,
                        aggregates: kinds,
                        output_names,
                        trigger: trigger.clone(),
                    })],
                    variables,
                ))
            }
            LogicalPlan::Limit { count, source } => {
                let (merged, mut variables) = source.to_physical_merged(ctx)?;
                let (count, count_vars) = count.to_physical(ctx)?;
                variables.extend(count_vars);
                Ok((
                    vec![physical::Node::Limit {
                        count,
                        source: Box::new(merged),
                    }],
                    variables,
                ))
            }
            LogicalPlan::Offset { count, source } => {
                let (merged, mut variables) = source.to_physical_merged(ctx)?;
                let (count, count_vars) = count.to_physical(ctx)?;
                variables.extend(count_vars);
                Ok((
                    vec![physical::Node::Offset {
                        count,
                        source: Box::new(merged),
                    }],
                    variables,
                ))
            }
            LogicalPlan::Requalifier { qualifier, source } => {
                let (shards, variables) = source.to_physical(ctx)?;
                let shards = shards
                    .into_iter()
                    .map(|shard| physical::Node::Requalifier {
                        qualifier: qualifier.clone(),
                        source: Box::new(shard),
                    })
                    .collect();
                Ok((shards, variables))
            }
            LogicalPlan::Join { left, right, on } => {
                let (left_shards, mut variables) = left.to_physical(ctx)?;
                let (right_shards, right_vars) = right.to_physical(ctx)?;
                variables.extend(right_vars);
                let mut left_key = Vec::with_capacity(on.len());
                let mut right_key = Vec::with_capacity(on.len());
                for (l, r) in on {
                    let (l, l_vars) = l.to_physical(ctx)?;
                    let (r, r_vars) = r.to_physical(ctx)?;
                    variables.extend(l_vars);
                    variables.extend(r_vars);
                    left_key.push(l);
                    right_key.push(r);
                }
                // Both sides route by their join key so matching rows (and
                // later retractions) meet on the same partition.
                let shuffle_by = |key: &[physical::Expression], sources: Vec<physical::Node>| {
                    physical::Node::Shuffle(physical::Shuffle {
                        strategy: if key.is_empty() {
                            ShuffleStrategy::Constant(0)
                        } else {
                            ShuffleStrategy::Hash(key.to_vec())
                        },
                        sources,
                    })
                };
                Ok((
                    vec![physical::Node::StreamJoin {
                        left: Box::new(shuffle_by(&left_key, left_shards)),
                        right: Box::new(shuffle_by(&right_key, right_shards)),
                        left_key,
                        right_key,
                    }],
                    variables,
                ))
            }
            LogicalPlan::Distinct { source } => {
                let (merged, variables) = source.to_physical_merged(ctx)?;
                Ok((
                    vec![physical::Node::Distinct {
                        source: Box::new(merged),
                    }],
                    variables,
                ))
            }
        }
    }

    /// Lower and merge all shards into one stream behind an explicit
    /// shuffle boundary.
    pub fn to_physical_merged(
        &self,
        ctx: &PlanContext,
    ) -> Result<(physical::Node, BTreeSet<String>)> {
        let (shards, variables) = self.to_physical(ctx)?;
        Ok((
            physical::Node::Shuffle(physical::Shuffle {
                strategy: ShuffleStrategy::Constant(0),
                sources: shards,
            }),
            variables,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet as Set};

    struct FixedResolver;

    impl SourceResolver for FixedResolver {
        fn describe(&self, name: &str) -> Result<SourceDescription> {
            if name != "cats" {
                return Err(RillError::Plan(format!("unknown source: {name}")));
            }
            Ok(SourceDescription {
                primary_keys: vec!["id".to_string()],
                available_filters: BTreeMap::new(),
                cardinality: Cardinality::BoundedFitsInLocalStorage,
                time_field: None,
            })
        }
    }

    #[test]
    fn data_source_lowering_qualifies_keys_with_alias() {
        let plan = LogicalPlan::DataSource {
            name: "cats".to_string(),
            alias: "c".to_string(),
        };
        let ctx = PlanContext {
            resolver: &FixedResolver,
        };
        let (shards, variables) = plan.to_physical(&ctx).unwrap();
        assert!(variables.is_empty());
        assert_eq!(shards.len(), 1);
        match &shards[0] {
            physical::Node::DataSourceBuilder(dsb) => {
                assert_eq!(dsb.alias, "c");
                assert_eq!(dsb.primary_keys, vec!["c.id".to_string()]);
            }
            other => panic!("expected DataSourceBuilder, got {other:?}"),
        }
    }

    #[test]
    fn group_by_goes_through_a_shuffle_boundary() {
        let plan = LogicalPlan::GroupBy {
            source: Box::new(LogicalPlan::DataSource {
                name: "cats".to_string(),
                alias: "c".to_string(),
            }),
            key: vec![Expr::Variable("c.ownerid".to_string())],
            aggregates: vec![AggregateSpec::new(AggregateKind::Count, "c.ownerid")],
            trigger: TriggerSpec::EndOfStream,
        };
        let ctx = PlanContext {
            resolver: &FixedResolver,
        };
        let (shards, variables) = plan.to_physical(&ctx).unwrap();
        assert_eq!(variables, Set::from(["c.ownerid".to_string()]));
        match &shards[0] {
            physical::Node::GroupBy(group_by) => {
                assert_eq!(group_by.output_names, vec!["c.ownerid_count".to_string()]);
                assert!(matches!(*group_by.source, physical::Node::Shuffle(_)));
            }
            other => panic!("expected GroupBy, got {other:?}"),
        }
    }

    #[test]
    fn unaliased_computed_map_expression_is_a_plan_error() {
        let plan = LogicalPlan::Map {
            exprs: vec![NamedExpr::new(Expr::FunctionCall {
                name: "+".to_string(),
                args: vec![
                    Expr::Variable("c.a".to_string()),
                    Expr::Constant(Value::Int(1)),
                ],
            })],
            keep: false,
            source: Box::new(LogicalPlan::DataSource {
                name: "cats".to_string(),
                alias: "c".to_string(),
            }),
        };
        let ctx = PlanContext {
            resolver: &FixedResolver,
        };
        assert!(matches!(plan.to_physical(&ctx), Err(RillError::Plan(_))));
    }
}
