//! Redis hash source.
//!
//! Every hash is one record: `{<alias>.<keyName>}` first, then the hash
//! fields in name order. Key equality pushed into the source turns the scan
//! into per-key HGETALL lookups; anything else scans the whole database
//! with a `*` pattern in batches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use redis::Commands;
use tracing::{debug, warn};

use rill_common::{Result, RillError, Schema, SchemaField, Type, Value};
use rill_execution::exec_node::{
    watermark_max_value, ExecNode, ExecutionContext, MetaSendFn, MetadataMessage, ProduceContext,
    ProduceFn,
};
use rill_execution::expression::CompiledExpr;
use rill_execution::materialize::{compile_expr, MaterializationContext};
use rill_execution::record::Record;
use rill_execution::source::SourceExecutor;
use rill_planner::{Cardinality, Expression, FieldType, Relation, SourceDescription};

use crate::options::{get_address_or, get_int_or, get_string_or, parse_scalar, Options};

/// A Redis database registered as a source.
pub struct RedisSource {
    host: String,
    port: u16,
    database_index: i64,
    password: String,
    batch_size: usize,
    key_name: String,
}

impl RedisSource {
    /// Build from a source option map, with the documented defaults:
    /// `address=localhost:6379`, `databaseIndex=0`, `batchSize=1000`,
    /// `databaseKeyName=key`.
    pub fn from_options(options: &Options) -> Result<Self> {
        let (host, port) = get_address_or(options, "address", ("localhost", 6379))?;
        Ok(RedisSource {
            host,
            port,
            database_index: get_int_or(options, "databaseIndex", 0)?,
            password: get_string_or(options, "password", "")?,
            batch_size: get_int_or(options, "batchSize", 1000)?.max(1) as usize,
            key_name: get_string_or(options, "databaseKeyName", "key")?,
        })
    }

    fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.database_index)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.database_index
            )
        }
    }

    fn is_key_variable(&self, expr: &Expression) -> bool {
        matches!(
            expr,
            Expression::Variable { name }
                if name.rsplit_once('.').map(|(_, suffix)| suffix) == Some(self.key_name.as_str())
        )
    }

    /// Whether the predicate narrows the scan to concrete keys:
    /// equality or `in` on the key field, or and/or combinations thereof.
    fn acceptable(&self, expr: &Expression) -> bool {
        match expr {
            Expression::FunctionCall { name, args } => match name.as_str() {
                "=" => {
                    args.len() == 2
                        && ((self.is_key_variable(&args[0]) && placeholder_side(&args[1]))
                            || (self.is_key_variable(&args[1]) && placeholder_side(&args[0])))
                }
                "in" => args.len() == 2 && self.is_key_variable(&args[0]) && placeholder_side(&args[1]),
                "and" | "or" => args.iter().all(|arg| self.acceptable(arg)),
                _ => false,
            },
            _ => false,
        }
    }
}

/// The non-key side must be computable without this source's fields.
fn placeholder_side(expr: &Expression) -> bool {
    matches!(
        expr,
        Expression::Constant(_) | Expression::Variable { .. } | Expression::Tuple(_)
    )
}

impl SourceExecutor for RedisSource {
    fn description(&self) -> SourceDescription {
        SourceDescription {
            primary_keys: vec![self.key_name.clone()],
            available_filters: BTreeMap::from([
                (
                    FieldType::Primary,
                    BTreeSet::from([Relation::Equal, Relation::In]),
                ),
                (FieldType::Secondary, BTreeSet::new()),
            ]),
            cardinality: Cardinality::BoundedDoesntFitInLocalStorage,
            time_field: None,
        }
    }

    fn schema(&self) -> Result<Schema> {
        // Hash field names vary per key; only the key field is static.
        Ok(Schema::new(vec![SchemaField {
            name: self.key_name.clone(),
            typ: Type::String,
        }]))
    }

    fn materialize(
        &self,
        ctx: &MaterializationContext,
        pushed: &[Expression],
        alias: &str,
    ) -> Result<Arc<dyn ExecNode>> {
        let key_formula = pushed
            .iter()
            .map(|expr| self.compile_key_formula(expr, ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(RedisScanExec {
            url: self.url(),
            batch_size: self.batch_size,
            key_field: format!("{alias}.{}", self.key_name),
            alias: alias.to_string(),
            key_formula,
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
            if self.acceptable(&predicate) {
                new_pushed.push(predicate);
            } else {
                rejected.push(predicate);
            }
        }
        let changed = new_pushed.len() > pushed.len();
        (rejected, new_pushed, changed)
    }
}

impl RedisSource {
    fn compile_key_formula(
        &self,
        expr: &Expression,
        ctx: &MaterializationContext,
    ) -> Result<KeyFormula> {
        match expr {
            Expression::FunctionCall { name, args } => match name.as_str() {
                "=" => {
                    let value_side = if self.is_key_variable(&args[0]) {
                        &args[1]
                    } else {
                        &args[0]
                    };
                    Ok(KeyFormula::Equal(compile_expr(value_side, ctx)?))
                }
                "in" => Ok(KeyFormula::In(compile_expr(&args[1], ctx)?)),
                "and" => Ok(KeyFormula::And(
                    args.iter()
                        .map(|arg| self.compile_key_formula(arg, ctx))
                        .collect::<Result<Vec<_>>>()?,
                )),
                "or" => Ok(KeyFormula::Or(
                    args.iter()
                        .map(|arg| self.compile_key_formula(arg, ctx))
                        .collect::<Result<Vec<_>>>()?,
                )),
                other => Err(RillError::Plan(format!(
                    "redis cannot evaluate pushed predicate: {other}"
                ))),
            },
            _ => Err(RillError::Plan(
                "redis cannot evaluate pushed predicate".to_string(),
            )),
        }
    }
}

/// Pushed key restriction, evaluated per scan.
enum KeyFormula {
    Equal(CompiledExpr),
    In(CompiledExpr),
    And(Vec<KeyFormula>),
    Or(Vec<KeyFormula>),
}

impl KeyFormula {
    /// The concrete key set this formula selects.
    fn wanted_keys(&self, ctx: &ExecutionContext) -> Result<BTreeSet<String>> {
        match self {
            KeyFormula::Equal(expr) => Ok(BTreeSet::from([value_to_key(&expr.evaluate(ctx)?)?])),
            KeyFormula::In(expr) => match expr.evaluate(ctx)? {
                Value::List(items) | Value::Tuple(items) => {
                    items.iter().map(value_to_key).collect()
                }
                single => Ok(BTreeSet::from([value_to_key(&single)?])),
            },
            KeyFormula::And(parts) => {
                let mut sets = parts.iter().map(|p| p.wanted_keys(ctx));
                let mut result = match sets.next() {
                    Some(first) => first?,
                    None => return Ok(BTreeSet::new()),
                };
                for set in sets {
                    let set = set?;
                    result = result.intersection(&set).cloned().collect();
                }
                Ok(result)
            }
            KeyFormula::Or(parts) => {
                let mut result = BTreeSet::new();
                for part in parts {
                    result.extend(part.wanted_keys(ctx)?);
                }
                Ok(result)
            }
        }
    }
}

fn value_to_key(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Int(v) => Ok(v.to_string()),
        other => Err(RillError::Runtime(format!(
            "redis keys must be strings, got {other}"
        ))),
    }
}

struct RedisScanExec {
    url: String,
    batch_size: usize,
    key_field: String,
    alias: String,
    key_formula: Vec<KeyFormula>,
    retry_transient: bool,
}

impl RedisScanExec {
    fn connect(&self) -> Result<redis::Connection> {
        let attempt = || {
            redis::Client::open(self.url.as_str())
                .and_then(|client| client.get_connection())
                .map_err(|e| RillError::transient_source(format!("couldn't connect: {e}")))
        };
        match attempt() {
            Ok(connection) => Ok(connection),
            Err(err) if self.retry_transient => {
                warn!(%err, "redis connect failed, retrying once");
                attempt()
            }
            Err(err) => Err(err),
        }
    }

    /// One record per existing hash; absent keys are skipped.
    fn emit_key(
        &self,
        connection: &mut redis::Connection,
        key: &str,
        pctx: &ProduceContext,
        on_record: ProduceFn,
    ) -> Result<()> {
        let hash: BTreeMap<String, String> = connection
            .hgetall(key)
            .map_err(|e| RillError::source(format!("couldn't get hash for key {key}: {e}")))?;
        if hash.is_empty() {
            return Ok(());
        }
        let mut fields = Vec::with_capacity(hash.len() + 1);
        let mut values = Vec::with_capacity(hash.len() + 1);
        fields.push(self.key_field.clone());
        values.push(Value::String(key.to_string()));
        for (hash_field, raw) in hash {
            fields.push(format!("{}.{hash_field}", self.alias));
            values.push(parse_scalar(&raw));
        }
        on_record(pctx, Record::new(fields.into(), values))
    }
}

impl ExecNode for RedisScanExec {
    fn name(&self) -> &'static str {
        "RedisScan"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        let pctx = ctx.produce_context();
        let mut connection = self.connect()?;

        let wanted_keys = if self.key_formula.is_empty() {
            None
        } else {
            let mut keys: Option<BTreeSet<String>> = None;
            for formula in &self.key_formula {
                let set = formula.wanted_keys(ctx)?;
                keys = Some(match keys {
                    None => set,
                    Some(existing) => existing.intersection(&set).cloned().collect(),
                });
            }
            keys
        };

        match wanted_keys {
            Some(keys) => {
                debug!(keys = keys.len(), "redis key lookup scan");
                for key in keys {
                    ctx.cancel.check()?;
                    self.emit_key(&mut connection, &key, &pctx, on_record)?;
                }
            }
            None => {
                debug!("redis full database scan");
                let mut cursor = 0u64;
                loop {
                    ctx.cancel.check()?;
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg("*")
                        .arg("COUNT")
                        .arg(self.batch_size)
                        .query(&mut connection)
                        .map_err(|e| RillError::source(format!("scan failed: {e}")))?;
                    for key in batch {
                        ctx.cancel.check()?;
                        self.emit_key(&mut connection, &key, &pctx, on_record)?;
                    }
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
            }
        }

        on_meta(&pctx, MetadataMessage::Watermark(watermark_max_value()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> RedisSource {
        RedisSource::from_options(&Options::new()).unwrap()
    }

    fn key_equals(value: &str) -> Expression {
        Expression::FunctionCall {
            name: "=".to_string(),
            args: vec![
                Expression::Variable {
                    name: "r.key".to_string(),
                },
                Expression::Constant(Value::String(value.to_string())),
            ],
        }
    }

    #[test]
    fn defaults_follow_the_documented_configuration() {
        let s = source();
        assert_eq!(s.host, "localhost");
        assert_eq!(s.port, 6379);
        assert_eq!(s.database_index, 0);
        assert_eq!(s.batch_size, 1000);
        assert_eq!(s.key_name, "key");
    }

    #[test]
    fn key_equality_is_accepted_and_field_filters_are_not() {
        let s = source();
        let field_filter = Expression::FunctionCall {
            name: "=".to_string(),
            args: vec![
                Expression::Variable {
                    name: "r.color".to_string(),
                },
                Expression::Constant(Value::String("red".to_string())),
            ],
        };
        let (rejected, pushed, changed) =
            s.push_down_predicates(vec![key_equals("a"), field_filter.clone()], vec![]);
        assert!(changed);
        assert_eq!(pushed, vec![key_equals("a")]);
        assert_eq!(rejected, vec![field_filter]);
    }

    #[test]
    fn wanted_keys_union_over_or() {
        let s = source();
        let ctx = MaterializationContext::new(Default::default());
        let formula = s
            .compile_key_formula(
                &Expression::FunctionCall {
                    name: "or".to_string(),
                    args: vec![key_equals("a"), key_equals("b")],
                },
                &ctx,
            )
            .unwrap();
        let exec_ctx = ExecutionContext::new(rill_common::CancelToken::new());
        assert_eq!(
            formula.wanted_keys(&exec_ctx).unwrap(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }
}
