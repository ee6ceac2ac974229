use tracing::debug;

use crate::physical::{
    DataSourceBuilder, Expression, FieldType, GroupBy, Node, Relation, Shuffle,
};

/// One rewrite scenario: a pattern and its rewrite, fused into a single
/// function that returns the replacement subtree when the pattern matches.
#[derive(Clone, Copy)]
pub struct Scenario {
    /// Stable name for logs and tie-break documentation.
    pub name: &'static str,
    /// Returns `Some(replacement)` when the scenario applies at this node.
    pub rewrite: fn(&Node) -> Option<Node>,
}

/// `Requalifier(q1, Requalifier(q2, x)) -> Requalifier(q1, x)`.
///
/// The outer qualifier dominates, so the inner one is redundant.
pub const MERGE_REQUALIFIERS: Scenario = Scenario {
    name: "MergeRequalifiers",
    rewrite: |node| match node {
        Node::Requalifier { qualifier, source } => match source.as_ref() {
            Node::Requalifier { source: inner, .. } => Some(Node::Requalifier {
                qualifier: qualifier.clone(),
                source: inner.clone(),
            }),
            _ => None,
        },
        _ => None,
    },
};

/// `Filter(f1, Filter(f2, x)) -> Filter(f1 AND f2, x)`.
pub const MERGE_FILTERS: Scenario = Scenario {
    name: "MergeFilters",
    rewrite: |node| match node {
        Node::Filter { predicate, source } => match source.as_ref() {
            Node::Filter {
                predicate: inner_predicate,
                source: inner_source,
            } => Some(Node::Filter {
                predicate: Expression::and(predicate.clone(), inner_predicate.clone()),
                source: inner_source.clone(),
            }),
            _ => None,
        },
        _ => None,
    },
};

/// `Requalifier(q, DataSourceBuilder{alias}) -> DataSourceBuilder{alias: q}`.
pub const MERGE_DATA_SOURCE_BUILDER_WITH_REQUALIFIER: Scenario = Scenario {
    name: "MergeDataSourceBuilderWithRequalifier",
    rewrite: |node| match node {
        Node::Requalifier { qualifier, source } => match source.as_ref() {
            Node::DataSourceBuilder(dsb) => {
                let mut merged = dsb.clone();
                merged.alias = qualifier.clone();
                Some(Node::DataSourceBuilder(merged))
            }
            _ => None,
        },
        _ => None,
    },
};

/// Push filter conjuncts the source can evaluate into the builder.
///
/// The formula splits on conjunction boundaries; a conjunct moves into the
/// builder when [`pushable_conjunct`] accepts it. Residual conjuncts stay in
/// the outer filter; the filter node disappears when nothing remains.
pub const MERGE_DATA_SOURCE_BUILDER_WITH_FILTER: Scenario = Scenario {
    name: "MergeDataSourceBuilderWithFilter",
    rewrite: |node| match node {
        Node::Filter { predicate, source } => match source.as_ref() {
            Node::DataSourceBuilder(dsb) => {
                let mut pushed = Vec::new();
                let mut residual = Vec::new();
                for conjunct in predicate.clone().split_conjuncts() {
                    if pushable_conjunct(&conjunct, dsb) {
                        pushed.push(conjunct);
                    } else {
                        residual.push(conjunct);
                    }
                }
                if pushed.is_empty() {
                    return None;
                }
                let mut merged = dsb.clone();
                for conjunct in pushed {
                    merged.filter = Some(match merged.filter.take() {
                        Some(existing) => Expression::and(conjunct, existing),
                        None => conjunct,
                    });
                }
                let merged = Node::DataSourceBuilder(merged);
                match Expression::combine_conjuncts(residual) {
                    Some(rest) => Some(Node::Filter {
                        predicate: rest,
                        source: Box::new(merged),
                    }),
                    None => Some(merged),
                }
            }
            _ => None,
        },
        _ => None,
    },
};

/// The shipped scenario list, in tie-break order.
pub fn default_scenarios() -> Vec<Scenario> {
    vec![
        MERGE_REQUALIFIERS,
        MERGE_FILTERS,
        MERGE_DATA_SOURCE_BUILDER_WITH_REQUALIFIER,
        MERGE_DATA_SOURCE_BUILDER_WITH_FILTER,
    ]
}

/// Run the scenario list to fixpoint.
///
/// Traversal is bottom-up; the first scenario matching a node fires and the
/// traversal restarts from the root. Every shipped rewrite strictly shrinks
/// the tree (node count, or filter nesting for the pushdown), so the loop
/// terminates.
pub fn optimize(scenarios: &[Scenario], mut root: Node) -> Node {
    let mut passes = 0usize;
    while let Some(rewritten) = rewrite_once(scenarios, &root) {
        passes += 1;
        root = rewritten;
    }
    debug!(passes, "optimizer reached fixpoint");
    root
}

/// Apply the first matching rewrite in bottom-up order, if any.
fn rewrite_once(scenarios: &[Scenario], node: &Node) -> Option<Node> {
    if let Some(with_new_child) = rewrite_children(scenarios, node) {
        return Some(with_new_child);
    }
    for scenario in scenarios {
        if let Some(rewritten) = (scenario.rewrite)(node) {
            debug!(scenario = scenario.name, "rewrite fired");
            return Some(rewritten);
        }
    }
    None
}

fn rewrite_children(scenarios: &[Scenario], node: &Node) -> Option<Node> {
    match node {
        Node::DataSourceBuilder(_) => None,
        Node::Filter { predicate, source } => {
            rewrite_once(scenarios, source).map(|source| Node::Filter {
                predicate: predicate.clone(),
                source: Box::new(source),
            })
        }
        Node::Map { exprs, keep, source } => {
            rewrite_once(scenarios, source).map(|source| Node::Map {
                exprs: exprs.clone(),
                keep: *keep,
                source: Box::new(source),
            })
        }
        Node::GroupBy(group_by) => rewrite_once(scenarios, &group_by.source).map(|source| {
            Node::GroupBy(GroupBy {
                source: Box::new(source),
                ..group_by.clone()
            })
        }),
        Node::StreamJoin {
            left,
            right,
            left_key,
            right_key,
        } => {
            if let Some(new_left) = rewrite_once(scenarios, left) {
                return Some(Node::StreamJoin {
                    left: Box::new(new_left),
                    right: right.clone(),
                    left_key: left_key.clone(),
                    right_key: right_key.clone(),
                });
            }
            rewrite_once(scenarios, right).map(|new_right| Node::StreamJoin {
                left: left.clone(),
                right: Box::new(new_right),
                left_key: left_key.clone(),
                right_key: right_key.clone(),
            })
        }
        Node::Requalifier { qualifier, source } => {
            rewrite_once(scenarios, source).map(|source| Node::Requalifier {
                qualifier: qualifier.clone(),
                source: Box::new(source),
            })
        }
        Node::Distinct { source } => rewrite_once(scenarios, source).map(|source| Node::Distinct {
            source: Box::new(source),
        }),
        Node::Limit { count, source } => {
            rewrite_once(scenarios, source).map(|source| Node::Limit {
                count: count.clone(),
                source: Box::new(source),
            })
        }
        Node::Offset { count, source } => {
            rewrite_once(scenarios, source).map(|source| Node::Offset {
                count: count.clone(),
                source: Box::new(source),
            })
        }
        Node::Shuffle(shuffle) => {
            for (i, source) in shuffle.sources.iter().enumerate() {
                if let Some(rewritten) = rewrite_once(scenarios, source) {
                    let mut sources = shuffle.sources.clone();
                    sources[i] = rewritten;
                    return Some(Node::Shuffle(Shuffle {
                        strategy: shuffle.strategy.clone(),
                        sources,
                    }));
                }
            }
            None
        }
    }
}

/// Decide whether the builder can evaluate a conjunct natively.
///
/// A conjunct is pushable when:
/// - it is a binary relation present in the builder's capability map;
/// - each operand is either a variable qualified with the builder's alias,
///   or an expression free of such variables (the source evaluates it as a
///   per-scan placeholder);
/// - for every alias-local operand, the relation is available under the
///   operand's field class (`Primary` when it is a primary-key field).
fn pushable_conjunct(conjunct: &Expression, dsb: &DataSourceBuilder) -> bool {
    let Expression::FunctionCall { name, args } = conjunct else {
        return false;
    };
    let Some(relation) = Relation::from_function_name(name) else {
        return false;
    };
    let [left, right] = args.as_slice() else {
        return false;
    };

    let alias_prefix = format!("{}.", dsb.alias);
    let is_local = |expr: &Expression| {
        matches!(expr, Expression::Variable { name } if name.starts_with(&alias_prefix))
    };
    let contains_local = |expr: &Expression| {
        expr.variables()
            .iter()
            .any(|name| name.starts_with(&alias_prefix))
    };

    let mut local_fields = Vec::new();
    for operand in [left, right] {
        if is_local(operand) {
            if let Expression::Variable { name } = operand {
                local_fields.push(name.clone());
            }
        } else if contains_local(operand) {
            // The source cannot compute derived values of its own fields.
            return false;
        }
    }
    if local_fields.is_empty() {
        return false;
    }

    local_fields.iter().all(|field| {
        let field_type = if dsb.primary_keys.contains(field) {
            FieldType::Primary
        } else {
            FieldType::Secondary
        };
        dsb.available_filters
            .get(&field_type)
            .is_some_and(|relations| relations.contains(&relation))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use rill_common::Value;

    use super::*;
    use crate::physical::Cardinality;

    fn capabilities(
        primary: &[Relation],
        secondary: &[Relation],
    ) -> BTreeMap<FieldType, BTreeSet<Relation>> {
        BTreeMap::from([
            (FieldType::Primary, primary.iter().copied().collect()),
            (FieldType::Secondary, secondary.iter().copied().collect()),
        ])
    }

    fn builder(alias: &str, primary_keys: &[&str]) -> DataSourceBuilder {
        DataSourceBuilder {
            source_name: "people".to_string(),
            alias: alias.to_string(),
            primary_keys: primary_keys.iter().map(|s| s.to_string()).collect(),
            available_filters: capabilities(
                &[
                    Relation::Equal,
                    Relation::NotEqual,
                    Relation::MoreThan,
                    Relation::LessThan,
                ],
                &[Relation::Equal],
            ),
            filter: Some(Expression::Constant(Value::Boolean(true))),
            cardinality: Cardinality::BoundedFitsInLocalStorage,
            time_field: None,
        }
    }

    fn var(name: &str) -> Expression {
        Expression::Variable {
            name: name.to_string(),
        }
    }

    #[test]
    fn local_to_local_equality_is_pushed() {
        let plan = Node::Filter {
            predicate: Expression::relation(var("a.name"), Relation::Equal, var("a.surname")),
            source: Box::new(Node::DataSourceBuilder(builder("a", &[]))),
        };
        let optimized = optimize(&[MERGE_DATA_SOURCE_BUILDER_WITH_FILTER], plan);
        match optimized {
            Node::DataSourceBuilder(dsb) => {
                assert_eq!(
                    dsb.filter,
                    Some(Expression::and(
                        Expression::relation(var("a.name"), Relation::Equal, var("a.surname")),
                        Expression::Constant(Value::Boolean(true)),
                    ))
                );
            }
            other => panic!("expected bare DataSourceBuilder, got {other:?}"),
        }
    }

    #[test]
    fn function_over_local_field_is_rejected() {
        let predicate = Expression::relation(
            Expression::FunctionCall {
                name: "test".to_string(),
                args: vec![var("a.name")],
            },
            Relation::Equal,
            var("b.test"),
        );
        let plan = Node::Filter {
            predicate: predicate.clone(),
            source: Box::new(Node::DataSourceBuilder(builder("a", &[]))),
        };
        let optimized = optimize(&[MERGE_DATA_SOURCE_BUILDER_WITH_FILTER], plan.clone());
        assert_eq!(optimized, plan);
    }

    #[test]
    fn outer_expression_side_becomes_a_placeholder() {
        let predicate = Expression::relation(
            Expression::FunctionCall {
                name: "test".to_string(),
                args: vec![var("b.name")],
            },
            Relation::Equal,
            var("a.test"),
        );
        let plan = Node::Filter {
            predicate,
            source: Box::new(Node::DataSourceBuilder(builder("a", &[]))),
        };
        let optimized = optimize(&[MERGE_DATA_SOURCE_BUILDER_WITH_FILTER], plan);
        assert!(matches!(optimized, Node::DataSourceBuilder(_)));
    }

    #[test]
    fn partial_merge_keeps_the_residual_filter() {
        let pushable = Expression::relation(var("a.name"), Relation::Equal, var("a.surname"));
        let residual = Expression::relation(var("b.test"), Relation::MoreThan, var("a.surname"));
        let plan = Node::Filter {
            predicate: Expression::and(pushable.clone(), residual.clone()),
            source: Box::new(Node::DataSourceBuilder(builder("a", &["a.name"]))),
        };
        let optimized = optimize(&[MERGE_DATA_SOURCE_BUILDER_WITH_FILTER], plan);
        match optimized {
            Node::Filter { predicate, source } => {
                assert_eq!(predicate, residual);
                match *source {
                    Node::DataSourceBuilder(dsb) => {
                        assert_eq!(
                            dsb.filter,
                            Some(Expression::and(
                                pushable,
                                Expression::Constant(Value::Boolean(true)),
                            ))
                        );
                    }
                    other => panic!("expected DataSourceBuilder, got {other:?}"),
                }
            }
            other => panic!("expected residual Filter, got {other:?}"),
        }
    }
}
