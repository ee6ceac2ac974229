use std::fmt::Write as _;

use crate::logical::{Expr, LogicalPlan};
use crate::physical::{Expression, Node, ShuffleStrategy};

/// Render a logical plan as indented text, one node per line.
pub fn explain_logical(plan: &LogicalPlan) -> String {
    let mut out = String::new();
    logical_node(plan, 0, &mut out);
    out
}

/// Render a physical plan as indented text, one node per line.
pub fn explain_physical(node: &Node) -> String {
    let mut out = String::new();
    physical_node(node, 0, &mut out);
    out
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn logical_node(plan: &LogicalPlan, depth: usize, out: &mut String) {
    indent(depth, out);
    match plan {
        LogicalPlan::DataSource { name, alias } => {
            let _ = writeln!(out, "DataSource: {name} AS {alias}");
        }
        LogicalPlan::Filter { predicate, source } => {
            let _ = writeln!(out, "Filter: {}", logical_expr(predicate));
            logical_node(source, depth + 1, out);
        }
        LogicalPlan::Map { exprs, keep, source } => {
            let rendered: Vec<String> = exprs
                .iter()
                .map(|e| match &e.alias {
                    Some(alias) => format!("{} AS {alias}", logical_expr(&e.expr)),
                    None => logical_expr(&e.expr),
                })
                .collect();
            let _ = writeln!(out, "Map(keep={keep}): {}", rendered.join(", "));
            logical_node(source, depth + 1, out);
        }
        LogicalPlan::GroupBy {
            source,
            key,
            aggregates,
            trigger,
        } => {
            let keys: Vec<String> = key.iter().map(logical_expr).collect();
            let aggs: Vec<String> = aggregates
                .iter()
                .map(|a| format!("{}({})", a.kind.name(), a.field))
                .collect();
            let _ = writeln!(
                out,
                "GroupBy[{}] agg[{}] trigger={trigger:?}",
                keys.join(", "),
                aggs.join(", ")
            );
            logical_node(source, depth + 1, out);
        }
        LogicalPlan::Limit { count, source } => {
            let _ = writeln!(out, "Limit: {}", logical_expr(count));
            logical_node(source, depth + 1, out);
        }
        LogicalPlan::Offset { count, source } => {
            let _ = writeln!(out, "Offset: {}", logical_expr(count));
            logical_node(source, depth + 1, out);
        }
        LogicalPlan::Requalifier { qualifier, source } => {
            let _ = writeln!(out, "Requalifier: {qualifier}");
            logical_node(source, depth + 1, out);
        }
        LogicalPlan::Join { left, right, on } => {
            let keys: Vec<String> = on
                .iter()
                .map(|(l, r)| format!("{} = {}", logical_expr(l), logical_expr(r)))
                .collect();
            let _ = writeln!(out, "Join: {}", keys.join(", "));
            logical_node(left, depth + 1, out);
            logical_node(right, depth + 1, out);
        }
        LogicalPlan::Distinct { source } => {
            let _ = writeln!(out, "Distinct");
            logical_node(source, depth + 1, out);
        }
    }
}

fn physical_node(node: &Node, depth: usize, out: &mut String) {
    indent(depth, out);
    match node {
        Node::DataSourceBuilder(dsb) => {
            let filter = dsb
                .filter
                .as_ref()
                .map(|f| format!(" filter={}", physical_expr(f)))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "DataSourceBuilder: {} AS {}{filter}",
                dsb.source_name, dsb.alias
            );
        }
        Node::Filter { predicate, source } => {
            let _ = writeln!(out, "Filter: {}", physical_expr(predicate));
            physical_node(source, depth + 1, out);
        }
        Node::Map { exprs, keep, source } => {
            let rendered: Vec<String> = exprs
                .iter()
                .map(|e| format!("{} AS {}", physical_expr(&e.expr), e.name))
                .collect();
            let _ = writeln!(out, "Map(keep={keep}): {}", rendered.join(", "));
            physical_node(source, depth + 1, out);
        }
        Node::GroupBy(group_by) => {
            let keys: Vec<String> = group_by.key.iter().map(physical_expr).collect();
            let aggs: Vec<String> = group_by
                .aggregates
                .iter()
                .zip(&group_by.fields)
                .zip(&group_by.output_names)
                .map(|((kind, field), name)| format!("{}({field}) AS {name}", kind.name()))
                .collect();
            let _ = writeln!(
                out,
                "GroupBy[{}] agg[{}] trigger={:?}",
                keys.join(", "),
                aggs.join(", "),
                group_by.trigger
            );
            physical_node(&group_by.source, depth + 1, out);
        }
        Node::StreamJoin {
            left,
            right,
            left_key,
            right_key,
        } => {
            let keys: Vec<String> = left_key
                .iter()
                .zip(right_key)
                .map(|(l, r)| format!("{} = {}", physical_expr(l), physical_expr(r)))
                .collect();
            let _ = writeln!(out, "StreamJoin: {}", keys.join(", "));
            physical_node(left, depth + 1, out);
            physical_node(right, depth + 1, out);
        }
        Node::Requalifier { qualifier, source } => {
            let _ = writeln!(out, "Requalifier: {qualifier}");
            physical_node(source, depth + 1, out);
        }
        Node::Distinct { source } => {
            let _ = writeln!(out, "Distinct");
            physical_node(source, depth + 1, out);
        }
        Node::Limit { count, source } => {
            let _ = writeln!(out, "Limit: {}", physical_expr(count));
            physical_node(source, depth + 1, out);
        }
        Node::Offset { count, source } => {
            let _ = writeln!(out, "Offset: {}", physical_expr(count));
            physical_node(source, depth + 1, out);
        }
        Node::Shuffle(shuffle) => {
            let strategy = match &shuffle.strategy {
                ShuffleStrategy::Constant(p) => format!("constant({p})"),
                ShuffleStrategy::Hash(exprs) => {
                    let keys: Vec<String> = exprs.iter().map(physical_expr).collect();
                    format!("hash({})", keys.join(", "))
                }
            };
            let _ = writeln!(out, "Shuffle: {strategy}");
            for source in &shuffle.sources {
                physical_node(source, depth + 1, out);
            }
        }
    }
}

fn logical_expr(expr: &Expr) -> String {
    match expr {
        Expr::Variable(name) => name.clone(),
        Expr::Constant(value) => value.to_string(),
        Expr::FunctionCall { name, args } => {
            let rendered: Vec<String> = args.iter().map(logical_expr).collect();
            format!("{name}({})", rendered.join(", "))
        }
        Expr::Subquery(_) => "<subquery>".to_string(),
        Expr::Tuple(items) => {
            let rendered: Vec<String> = items.iter().map(logical_expr).collect();
            format!("({})", rendered.join(", "))
        }
    }
}

fn physical_expr(expr: &Expression) -> String {
    match expr {
        Expression::Variable { name } => name.clone(),
        Expression::Constant(value) => value.to_string(),
        Expression::FunctionCall { name, args } => {
            let rendered: Vec<String> = args.iter().map(physical_expr).collect();
            format!("{name}({})", rendered.join(", "))
        }
        Expression::Subquery(_) => "<subquery>".to_string(),
        Expression::Tuple(items) => {
            let rendered: Vec<String> = items.iter().map(physical_expr).collect();
            format!("({})", rendered.join(", "))
        }
    }
}
