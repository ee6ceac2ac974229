//! PostgreSQL source.
//!
//! Accepted pushdown predicates translate to parameterized SQL with `$N`
//! placeholders; every value that is not a column of this scan becomes a
//! placeholder evaluated per scan against the outer variable context.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use postgres::types::ToSql;
use postgres::{Client, NoTls};
use tracing::{debug, warn};
use uuid::Uuid;

use rill_common::{Result, RillError, Schema, SchemaField, TypeId, Value};
use rill_execution::exec_node::{
    watermark_max_value, ExecNode, ExecutionContext, MetaSendFn, MetadataMessage, ProduceFn,
};
use rill_execution::expression::CompiledExpr;
use rill_execution::materialize::{compile_expr, MaterializationContext};
use rill_execution::record::Record;
use rill_execution::source::SourceExecutor;
use rill_planner::{Cardinality, Expression, FieldType, Relation, SourceDescription};

use crate::options::{
    get_address_or, get_string, get_string_list, get_string_or, scalar_type, Options,
};

/// A PostgreSQL table registered as a source.
pub struct PostgresSource {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
    table: String,
    fields: Vec<String>,
    primary_keys: Vec<String>,
}

impl PostgresSource {
    /// Build from a source option map: `address` (default
    /// `localhost:5432`), `user`, `password`, `databaseName`, `tableName`,
    /// `fields`, `primaryKeys`.
    pub fn from_options(options: &Options) -> Result<Self> {
        let (host, port) = get_address_or(options, "address", ("localhost", 5432))?;
        let fields = get_string_list(options, "fields")?;
        if fields.is_empty() {
            return Err(RillError::InvalidConfig(
                "postgres source needs a non-empty fields list".to_string(),
            ));
        }
        Ok(PostgresSource {
            host,
            port,
            user: get_string(options, "user")?,
            password: get_string_or(options, "password", "")?,
            database: get_string(options, "databaseName")?,
            table: get_string(options, "tableName")?,
            fields,
            primary_keys: get_string_list(options, "primaryKeys")?,
        })
    }

    fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.database
        )
    }
}

/// Relations the database evaluates natively, on any field.
fn relational_filters() -> BTreeMap<FieldType, BTreeSet<Relation>> {
    let relations = BTreeSet::from([
        Relation::Equal,
        Relation::MoreThan,
        Relation::LessThan,
        Relation::GreaterEqual,
        Relation::LessEqual,
    ]);
    BTreeMap::from([
        (FieldType::Primary, relations.clone()),
        (FieldType::Secondary, relations),
    ])
}

/// Whether the database can evaluate this predicate.
///
/// Accepts any conjunction/disjunction of `{<, <=, =, >=, >}` over
/// variables and scalar constants; rejects other function calls,
/// sub-queries, tuples and non-scalar constants.
fn acceptable(expr: &Expression) -> bool {
    match expr {
        Expression::Variable { .. } => true,
        Expression::Constant(value) => matches!(
            value.type_id(),
            TypeId::Null
                | TypeId::Int
                | TypeId::Float
                | TypeId::Boolean
                | TypeId::String
                | TypeId::Timestamp
        ),
        Expression::FunctionCall { name, args } => match name.as_str() {
            "<" | "<=" | "=" | ">=" | ">" => args.len() == 2 && args.iter().all(acceptable),
            "and" | "or" => args.iter().all(acceptable),
            _ => false,
        },
        Expression::Subquery(_) | Expression::Tuple(_) => false,
    }
}

/// Render accepted predicates as a SQL condition with `$N` placeholders.
///
/// Returns the condition and the expressions backing each placeholder in
/// order.
fn predicates_to_sql(predicates: &[Expression], alias: &str) -> (String, Vec<Expression>) {
    if predicates.is_empty() {
        return ("(TRUE)".to_string(), vec![]);
    }
    let combined = if predicates.len() == 1 {
        predicates[0].clone()
    } else {
        Expression::FunctionCall {
            name: "and".to_string(),
            args: predicates.to_vec(),
        }
    };
    let mut sql = String::new();
    let mut placeholders = Vec::new();
    predicate_to_sql(&combined, alias, &mut sql, &mut placeholders);
    (sql, placeholders)
}

fn predicate_to_sql(
    expr: &Expression,
    alias: &str,
    sql: &mut String,
    placeholders: &mut Vec<Expression>,
) {
    let alias_prefix = format!("{alias}.");
    sql.push('(');
    match expr {
        Expression::Variable { name } => match name.strip_prefix(&alias_prefix) {
            Some(column) => sql.push_str(column),
            None => {
                placeholders.push(expr.clone());
                let _ = write!(sql, "${}", placeholders.len());
            }
        },
        Expression::Constant(value) => {
            if value.is_null() {
                sql.push_str("NULL");
            } else {
                placeholders.push(expr.clone());
                let _ = write!(sql, "${}", placeholders.len());
            }
        }
        Expression::FunctionCall { name, args } => match name.as_str() {
            "<" | "<=" | "=" | ">=" | ">" => {
                predicate_to_sql(&args[0], alias, sql, placeholders);
                sql.push_str(name);
                predicate_to_sql(&args[1], alias, sql, placeholders);
            }
            "and" | "or" => {
                let separator = if name == "and" { " AND " } else { " OR " };
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(separator);
                    }
                    predicate_to_sql(arg, alias, sql, placeholders);
                }
            }
            // Unreachable: push_down_predicates accepted this expression.
            other => unreachable!("unacceptable pushed function: {other}"),
        },
        Expression::Subquery(_) | Expression::Tuple(_) => {
            unreachable!("unacceptable pushed expression")
        }
    }
    sql.push(')');
}

impl SourceExecutor for PostgresSource {
    fn description(&self) -> SourceDescription {
        SourceDescription {
            primary_keys: self.primary_keys.clone(),
            available_filters: relational_filters(),
            cardinality: Cardinality::BoundedDoesntFitInLocalStorage,
            time_field: None,
        }
    }

    fn schema(&self) -> Result<Schema> {
        Ok(Schema::new(
            self.fields
                .iter()
                .map(|name| SchemaField {
                    name: name.clone(),
                    typ: scalar_type(),
                })
                .collect(),
        ))
    }

    fn materialize(
        &self,
        ctx: &MaterializationContext,
        pushed: &[Expression],
        alias: &str,
    ) -> Result<Arc<dyn ExecNode>> {
        let (condition, placeholder_exprs) = predicates_to_sql(pushed, alias);
        let query = format!(
            "SELECT {} FROM {} WHERE {}",
            self.fields.join(", "),
            self.table,
            condition
        );
        let placeholders = placeholder_exprs
            .iter()
            .map(|expr| compile_expr(expr, ctx))
            .collect::<Result<Vec<_>>>()?;
        let fields: Arc<[String]> = self
            .fields
            .iter()
            .map(|name| format!("{alias}.{name}"))
            .collect();
        Ok(Arc::new(PostgresScanExec {
            connection_string: self.connection_string(),
            query,
            placeholders,
            fields,
            statement_id: Uuid::new_v4().to_string(),
            retry_transient: ctx.config.retry_transient_source_errors,
        }))
    }

    fn push_down_predicates(
        &self,
        new: Vec<Expression>,
        pushed: Vec<Expression>,
    ) -> (Vec<Expression>, Vec<Expression>, bool) {
        let mut rejected = Vec::new();
        let mut new_pushed = pushed.clone();
        for predicate in new {
            if acceptable(&predicate) {
                new_pushed.push(predicate);
            } else {
                rejected.push(predicate);
            }
        }
        let changed = new_pushed.len() > pushed.len();
        (rejected, new_pushed, changed)
    }
}

struct PostgresScanExec {
    connection_string: String,
    query: String,
    placeholders: Vec<CompiledExpr>,
    fields: Arc<[String]>,
    /// Fresh per materialization; avoids handle collisions between
    /// concurrent scans of the same table.
    statement_id: String,
    retry_transient: bool,
}

impl PostgresScanExec {
    fn connect(&self) -> Result<Client> {
        let attempt = || {
            Client::connect(&self.connection_string, NoTls)
                .map_err(|e| RillError::transient_source(format!("couldn't connect: {e}")))
        };
        match attempt() {
            Ok(client) => Ok(client),
            Err(err) if self.retry_transient => {
                warn!(%err, "postgres connect failed, retrying once");
                attempt()
            }
            Err(err) => Err(err),
        }
    }
}

fn to_sql_param(value: &Value) -> Result<Box<dyn ToSql + Sync>> {
    Ok(match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Int(v) => Box::new(*v),
        Value::Float(v) => Box::new(*v),
        Value::Boolean(v) => Box::new(*v),
        Value::String(v) => Box::new(v.clone()),
        Value::Timestamp(v) => Box::new(*v),
        other => {
            return Err(RillError::Runtime(format!(
                "invalid pushed down predicate constant: {other}"
            )))
        }
    })
}

fn decode_column(row: &postgres::Row, index: usize) -> Result<Value> {
    if let Ok(v) = row.try_get::<_, Option<i64>>(index) {
        return Ok(v.map(Value::Int).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<i32>>(index) {
        return Ok(v.map(|v| Value::Int(i64::from(v))).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<f64>>(index) {
        return Ok(v.map(Value::Float).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<bool>>(index) {
        return Ok(v.map(Value::Boolean).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<String>>(index) {
        return Ok(v.map(Value::String).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<DateTime<Utc>>>(index) {
        return Ok(v.map(Value::Timestamp).unwrap_or(Value::Null));
    }
    Err(RillError::source(format!(
        "unsupported column type at index {index}"
    )))
}

impl ExecNode for PostgresScanExec {
    fn name(&self) -> &'static str {
        "PostgresScan"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        debug!(statement = %self.statement_id, query = %self.query, "postgres scan start");
        let pctx = ctx.produce_context();

        let mut params = Vec::with_capacity(self.placeholders.len());
        for placeholder in &self.placeholders {
            params.push(to_sql_param(&placeholder.evaluate(ctx)?)?);
        }
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref()).collect();

        let mut client = self.connect()?;
        let statement = client
            .prepare(&self.query)
            .map_err(|e| RillError::source(format!("couldn't prepare statement: {e}")))?;
        let rows = client
            .query(&statement, &param_refs)
            .map_err(|e| RillError::source(format!("query failed: {e}")))?;

        for row in rows {
            ctx.cancel.check()?;
            let mut values = Vec::with_capacity(self.fields.len());
            for index in 0..self.fields.len() {
                values.push(decode_column(&row, index)?);
            }
            on_record(&pctx, Record::new(Arc::clone(&self.fields), values))?;
        }

        on_meta(&pctx, MetadataMessage::Watermark(watermark_max_value()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expression {
        Expression::Variable {
            name: name.to_string(),
        }
    }

    fn relation(left: Expression, name: &str, right: Expression) -> Expression {
        Expression::FunctionCall {
            name: name.to_string(),
            args: vec![left, right],
        }
    }

    fn source() -> PostgresSource {
        let mut options = Options::new();
        options.insert("user".into(), serde_json::json!("app"));
        options.insert("databaseName".into(), serde_json::json!("app"));
        options.insert("tableName".into(), serde_json::json!("people"));
        options.insert("fields".into(), serde_json::json!(["id", "name", "age"]));
        options.insert("primaryKeys".into(), serde_json::json!(["id"]));
        PostgresSource::from_options(&options).unwrap()
    }

    #[test]
    fn accepts_relational_predicates_and_rejects_functions() {
        let ok = relation(var("p.age"), ">=", Expression::Constant(Value::Int(18)));
        let nested = Expression::FunctionCall {
            name: "or".to_string(),
            args: vec![
                ok.clone(),
                relation(var("p.name"), "=", Expression::Constant(Value::String("x".into()))),
            ],
        };
        let bad = relation(
            Expression::FunctionCall {
                name: "not".to_string(),
                args: vec![var("p.alive")],
            },
            "=",
            Expression::Constant(Value::Boolean(true)),
        );

        let (rejected, pushed, changed) =
            source().push_down_predicates(vec![ok.clone(), nested.clone(), bad.clone()], vec![]);
        assert!(changed);
        assert_eq!(pushed, vec![ok, nested]);
        assert_eq!(rejected, vec![bad]);
    }

    #[test]
    fn renders_parameterized_sql_with_column_names() {
        let predicate = relation(var("p.age"), ">=", Expression::Constant(Value::Int(18)));
        let (sql, placeholders) = predicates_to_sql(&[predicate], "p");
        assert_eq!(sql, "((age)>=($1))");
        assert_eq!(placeholders.len(), 1);
    }

    #[test]
    fn outer_variables_become_placeholders() {
        let predicate = relation(var("p.age"), "<", var("outer.maximum"));
        let (sql, placeholders) = predicates_to_sql(&[predicate], "p");
        assert_eq!(sql, "((age)<($1))");
        assert_eq!(
            placeholders,
            vec![Expression::Variable {
                name: "outer.maximum".to_string()
            }]
        );
    }

    #[test]
    fn disjunctions_render_with_or() {
        let predicate = Expression::FunctionCall {
            name: "or".to_string(),
            args: vec![
                relation(var("p.age"), "<", Expression::Constant(Value::Int(10))),
                relation(var("p.age"), ">", Expression::Constant(Value::Int(60))),
            ],
        };
        let (sql, placeholders) = predicates_to_sql(&[predicate], "p");
        assert_eq!(sql, "(((age)<($1)) OR ((age)>($2)))");
        assert_eq!(placeholders.len(), 2);
    }

    #[test]
    fn multiple_predicates_join_with_and() {
        let a = relation(var("p.age"), ">", Expression::Constant(Value::Int(1)));
        let b = relation(var("p.age"), "<", Expression::Constant(Value::Int(9)));
        let (sql, placeholders) = predicates_to_sql(&[a, b], "p");
        assert_eq!(sql, "(((age)>($1)) AND ((age)<($2)))");
        assert_eq!(placeholders.len(), 2);
    }
}
