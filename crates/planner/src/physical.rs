use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use rill_common::Value;

/// How much data a subtree may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Cardinality {
    /// Bounded and small enough to buffer locally.
    BoundedFitsInLocalStorage,
    /// Bounded but too large to buffer locally.
    BoundedDoesntFitInLocalStorage,
    /// Never ends.
    Unbounded,
}

impl Cardinality {
    /// Combined cardinality of two inputs feeding one operator.
    pub fn join(self, other: Cardinality) -> Cardinality {
        self.max(other)
    }
}

/// Whether a filtered field is part of the source's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldType {
    /// Primary-key field.
    Primary,
    /// Any other field.
    Secondary,
}

/// Relations a source may be able to evaluate natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Relation {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `>`
    MoreThan,
    /// `<`
    LessThan,
    /// `>=`
    GreaterEqual,
    /// `<=`
    LessEqual,
    /// `like`
    Like,
    /// `in`
    In,
}

impl Relation {
    /// The function name this relation appears as in expressions.
    pub fn function_name(self) -> &'static str {
        match self {
            Relation::Equal => "=",
            Relation::NotEqual => "!=",
            Relation::MoreThan => ">",
            Relation::LessThan => "<",
            Relation::GreaterEqual => ">=",
            Relation::LessEqual => "<=",
            Relation::Like => "like",
            Relation::In => "in",
        }
    }

    /// Reverse mapping from a function name.
    pub fn from_function_name(name: &str) -> Option<Relation> {
        match name {
            "=" => Some(Relation::Equal),
            "!=" => Some(Relation::NotEqual),
            ">" => Some(Relation::MoreThan),
            "<" => Some(Relation::LessThan),
            ">=" => Some(Relation::GreaterEqual),
            "<=" => Some(Relation::LessEqual),
            "like" => Some(Relation::Like),
            "in" => Some(Relation::In),
            _ => None,
        }
    }
}

/// Capability map advertised by a source: which relations it can evaluate
/// natively, per field class.
pub type FilterCapabilities = BTreeMap<FieldType, BTreeSet<Relation>>;

/// A physical scalar expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// Reference to a named field or outer variable.
    Variable {
        /// Qualified name, e.g. `cats.ownerid`.
        name: String,
    },
    /// A captured literal.
    Constant(Value),
    /// Call of a named function (operators included: `=`, `and`, `+`, ...).
    FunctionCall {
        /// Function name as resolved at materialization.
        name: String,
        /// Argument expressions.
        args: Vec<Expression>,
    },
    /// A sub-query lifted into an expression.
    Subquery(Box<Node>),
    /// Positional tuple constructor.
    Tuple(Vec<Expression>),
}

impl Expression {
    /// `a AND b`.
    pub fn and(a: Expression, b: Expression) -> Expression {
        Expression::FunctionCall {
            name: "and".to_string(),
            args: vec![a, b],
        }
    }

    /// Binary relation shorthand.
    pub fn relation(left: Expression, rel: Relation, right: Expression) -> Expression {
        Expression::FunctionCall {
            name: rel.function_name().to_string(),
            args: vec![left, right],
        }
    }

    /// All variable names referenced anywhere in the expression, including
    /// inside nested calls (sub-queries are opaque and skipped).
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expression::Variable { name } => {
                out.insert(name.clone());
            }
            Expression::Constant(_) | Expression::Subquery(_) => {}
            Expression::FunctionCall { args, .. } | Expression::Tuple(args) => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
        }
    }

    /// Split a formula on top-level `and` boundaries.
    pub fn split_conjuncts(self) -> Vec<Expression> {
        match self {
            Expression::FunctionCall { name, args } if name == "and" => args
                .into_iter()
                .flat_map(Expression::split_conjuncts)
                .collect(),
            other => vec![other],
        }
    }

    /// Right-fold conjuncts back into a single formula.
    pub fn combine_conjuncts(mut conjuncts: Vec<Expression>) -> Option<Expression> {
        let last = conjuncts.pop()?;
        Some(
            conjuncts
                .into_iter()
                .rev()
                .fold(last, |acc, c| Expression::and(c, acc)),
        )
    }
}

/// An output expression with its output field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedExpression {
    /// The computed expression.
    pub expr: Expression,
    /// Output field name.
    pub name: String,
}

impl NamedExpression {
    /// Whether this output is the given variable, possibly under an alias.
    pub fn is_variable_named(&self, name: &str) -> bool {
        matches!(&self.expr, Expression::Variable { name: n } if n == name)
    }
}

/// Emission policy of a group-by operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSpec {
    /// Emit keys whose event time has passed the watermark.
    Watermark,
    /// Emit a key after every n updates to it.
    Counting(u64),
    /// Emit everything once, at source exhaustion.
    EndOfStream,
}

/// Aggregate function selector, composable with a distinct wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    /// Record count.
    Count,
    /// Numeric sum.
    Sum,
    /// Numeric average.
    Avg,
    /// Retractable minimum.
    Min,
    /// Retractable maximum.
    Max,
    /// Earliest surviving value.
    First,
    /// The grouping key itself.
    Key,
    /// Deduplicating wrapper around another aggregate.
    Distinct(Box<AggregateKind>),
}

impl AggregateKind {
    /// Short name used in default output field names.
    pub fn name(&self) -> String {
        match self {
            AggregateKind::Count => "count".to_string(),
            AggregateKind::Sum => "sum".to_string(),
            AggregateKind::Avg => "avg".to_string(),
            AggregateKind::Min => "min".to_string(),
            AggregateKind::Max => "max".to_string(),
            AggregateKind::First => "first".to_string(),
            AggregateKind::Key => "key".to_string(),
            AggregateKind::Distinct(inner) => format!("{}_distinct", inner.name()),
        }
    }
}

/// Routing strategy of a shuffle boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShuffleStrategy {
    /// Route every record to the given partition.
    Constant(usize),
    /// Route by hash of the given key expressions.
    Hash(Vec<Expression>),
}

/// Data source scan with pushdown surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceBuilder {
    /// Registered source name.
    pub source_name: String,
    /// Alias all emitted fields are qualified with.
    pub alias: String,
    /// Alias-qualified primary key fields.
    pub primary_keys: Vec<String>,
    /// Which relations the source can evaluate, per field class.
    pub available_filters: FilterCapabilities,
    /// Predicate pushed into the source by the optimizer.
    pub filter: Option<Expression>,
    /// Scan cardinality.
    pub cardinality: Cardinality,
    /// Alias-qualified event-time field, when the source has one.
    pub time_field: Option<String>,
}

/// Group-by with incremental aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBy {
    /// Input (single merged stream).
    pub source: Box<Node>,
    /// Grouping key expressions; empty means one global group.
    pub key: Vec<Expression>,
    /// Source field consumed by each aggregate, parallel to `aggregates`.
    pub fields: Vec<String>,
    /// Aggregate selectors, parallel to `fields`.
    pub aggregates: Vec<AggregateKind>,
    /// Output field names, parallel to `aggregates`.
    pub output_names: Vec<String>,
    /// Emission policy.
    pub trigger: TriggerSpec,
}

/// Shuffle boundary merging (and routing) its source shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shuffle {
    /// Routing strategy.
    pub strategy: ShuffleStrategy,
    /// Upstream shards.
    pub sources: Vec<Node>,
}

/// The physical operator tree.
///
/// Same shape as the logical algebra plus pushdown metadata; optimizer
/// scenarios rewrite this tree to fixpoint before materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// Source scan with pushdown surface.
    DataSourceBuilder(DataSourceBuilder),
    /// Predicate filter.
    Filter {
        /// Boolean formula.
        predicate: Expression,
        /// Input plan.
        source: Box<Node>,
    },
    /// Expression projection.
    Map {
        /// Output expressions.
        exprs: Vec<NamedExpression>,
        /// Whether source fields are appended after the computed ones.
        keep: bool,
        /// Input plan.
        source: Box<Node>,
    },
    /// Incremental grouped aggregation.
    GroupBy(GroupBy),
    /// Symmetric equi-join of two streams.
    StreamJoin {
        /// Left input.
        left: Box<Node>,
        /// Right input.
        right: Box<Node>,
        /// Left key expressions.
        left_key: Vec<Expression>,
        /// Right key expressions, positionally matching `left_key`.
        right_key: Vec<Expression>,
    },
    /// Alias prefix rewrite of all emitted fields.
    Requalifier {
        /// New qualifier.
        qualifier: String,
        /// Input plan.
        source: Box<Node>,
    },
    /// Whole-record deduplication with refcounts.
    Distinct {
        /// Input plan.
        source: Box<Node>,
    },
    /// Emit at most `count` records.
    Limit {
        /// Count expression, evaluated once per scan.
        count: Expression,
        /// Input plan (single merged stream).
        source: Box<Node>,
    },
    /// Skip the first `count` records.
    Offset {
        /// Count expression, evaluated once per scan.
        count: Expression,
        /// Input plan (single merged stream).
        source: Box<Node>,
    },
    /// Partition/merge boundary.
    Shuffle(Shuffle),
}

/// Propagated plan metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Output cardinality.
    pub cardinality: Cardinality,
    /// Field carrying event time in output records, if any.
    pub event_time_field: Option<String>,
    /// Qualifiers present in output field names.
    pub namespace: BTreeSet<String>,
}

impl Node {
    /// Compute propagated metadata for this subtree.
    pub fn metadata(&self) -> NodeMetadata {
        match self {
            Node::DataSourceBuilder(dsb) => NodeMetadata {
                cardinality: dsb.cardinality,
                event_time_field: dsb.time_field.clone(),
                namespace: BTreeSet::from([dsb.alias.clone()]),
            },
            Node::Filter { source, .. } | Node::Distinct { source } => source.metadata(),
            Node::Map { exprs, keep, source } => {
                let inner = source.metadata();
                if *keep {
                    return inner;
                }
                // Without keep, the event-time field survives only when some
                // output expression is that variable; the new field name is
                // the output alias.
                let event_time_field = inner.event_time_field.as_ref().and_then(|etf| {
                    exprs
                        .iter()
                        .find(|e| e.is_variable_named(etf))
                        .map(|e| e.name.clone())
                });
                NodeMetadata {
                    cardinality: inner.cardinality,
                    event_time_field,
                    namespace: inner.namespace,
                }
            }
            Node::GroupBy(group_by) => {
                let inner = group_by.source.metadata();
                // The key column that carries the child's event time keeps
                // carrying it downstream, under its output name.
                let event_time_field = inner.event_time_field.as_ref().and_then(|etf| {
                    group_by
                        .aggregates
                        .iter()
                        .enumerate()
                        .find(|(i, kind)| {
                            **kind == AggregateKind::Key && group_by.fields[*i] == *etf
                        })
                        .map(|(i, _)| group_by.output_names[i].clone())
                });
                NodeMetadata {
                    cardinality: inner.cardinality,
                    event_time_field,
                    namespace: BTreeSet::new(),
                }
            }
            Node::StreamJoin { left, right, .. } => {
                let l = left.metadata();
                let r = right.metadata();
                NodeMetadata {
                    cardinality: l.cardinality.join(r.cardinality),
                    event_time_field: None,
                    namespace: l.namespace.union(&r.namespace).cloned().collect(),
                }
            }
            Node::Requalifier { qualifier, source } => {
                let inner = source.metadata();
                NodeMetadata {
                    cardinality: inner.cardinality,
                    event_time_field: inner
                        .event_time_field
                        .map(|etf| requalify_name(qualifier, &etf)),
                    namespace: BTreeSet::from([qualifier.clone()]),
                }
            }
            Node::Limit { source, .. } | Node::Offset { source, .. } => {
                let inner = source.metadata();
                NodeMetadata {
                    cardinality: Cardinality::BoundedFitsInLocalStorage,
                    event_time_field: inner.event_time_field,
                    namespace: inner.namespace,
                }
            }
            Node::Shuffle(shuffle) => {
                let metas: Vec<NodeMetadata> =
                    shuffle.sources.iter().map(Node::metadata).collect();
                let cardinality = metas
                    .iter()
                    .map(|m| m.cardinality)
                    .max()
                    .unwrap_or(Cardinality::BoundedFitsInLocalStorage);
                let first_etf = metas.first().and_then(|m| m.event_time_field.clone());
                let event_time_field = if metas
                    .iter()
                    .all(|m| m.event_time_field == first_etf)
                {
                    first_etf
                } else {
                    None
                };
                NodeMetadata {
                    cardinality,
                    event_time_field,
                    namespace: metas.into_iter().flat_map(|m| m.namespace).collect(),
                }
            }
        }
    }
}

/// Rewrite `some.field` (or bare `field`) to `qualifier.field`.
pub fn requalify_name(qualifier: &str, name: &str) -> String {
    match name.split_once('.') {
        Some((_, suffix)) => format!("{qualifier}.{suffix}"),
        None => format!("{qualifier}.{name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsb(alias: &str, time_field: Option<&str>) -> Node {
        Node::DataSourceBuilder(DataSourceBuilder {
            source_name: "cats".to_string(),
            alias: alias.to_string(),
            primary_keys: vec![],
            available_filters: FilterCapabilities::new(),
            filter: None,
            cardinality: Cardinality::BoundedFitsInLocalStorage,
            time_field: time_field.map(str::to_string),
        })
    }

    #[test]
    fn map_without_keep_drops_event_time_unless_projected() {
        let source = dsb("c", Some("c.t"));

        let dropped = Node::Map {
            exprs: vec![NamedExpression {
                expr: Expression::Variable {
                    name: "c.name".to_string(),
                },
                name: "c.name".to_string(),
            }],
            keep: false,
            source: Box::new(source.clone()),
        };
        assert_eq!(dropped.metadata().event_time_field, None);

        let aliased = Node::Map {
            exprs: vec![NamedExpression {
                expr: Expression::Variable {
                    name: "c.t".to_string(),
                },
                name: "out.when".to_string(),
            }],
            keep: false,
            source: Box::new(source.clone()),
        };
        assert_eq!(
            aliased.metadata().event_time_field,
            Some("out.when".to_string())
        );

        let kept = Node::Map {
            exprs: vec![],
            keep: true,
            source: Box::new(source),
        };
        assert_eq!(kept.metadata().event_time_field, Some("c.t".to_string()));
    }

    #[test]
    fn requalifier_rewrites_event_time_field() {
        let plan = Node::Requalifier {
            qualifier: "q".to_string(),
            source: Box::new(dsb("c", Some("c.t"))),
        };
        let meta = plan.metadata();
        assert_eq!(meta.event_time_field, Some("q.t".to_string()));
        assert_eq!(meta.namespace, BTreeSet::from(["q".to_string()]));
    }

    #[test]
    fn conjunct_splitting_roundtrips() {
        let a = Expression::Constant(Value::Boolean(true));
        let b = Expression::Constant(Value::Boolean(false));
        let c = Expression::Variable {
            name: "x.y".to_string(),
        };
        let formula = Expression::and(a.clone(), Expression::and(b.clone(), c.clone()));
        let conjuncts = formula.clone().split_conjuncts();
        assert_eq!(conjuncts, vec![a, b, c]);
        assert_eq!(Expression::combine_conjuncts(conjuncts), Some(formula));
    }
}
