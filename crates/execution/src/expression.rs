//! Materialized scalar expressions and the built-in function registry.

use std::cmp::Ordering;
use std::sync::Arc;

use rill_common::{Result, RillError, Value};

use crate::exec_node::{resolve_retractions, run_collect, ExecNode, ExecutionContext};
use crate::record::Record;

/// A compiled, ready-to-evaluate expression.
///
/// Function names and arities were resolved at materialization time, so
/// evaluation failures here are runtime conditions only.
pub enum CompiledExpr {
    /// Lookup into the variable scope chain.
    Variable(String),
    /// Captured literal.
    Constant(Value),
    /// Resolved function call.
    FunctionCall {
        /// Resolved descriptor.
        descriptor: &'static FunctionDescriptor,
        /// Compiled arguments.
        args: Vec<CompiledExpr>,
    },
    /// Materialized sub-query.
    Subquery(Arc<dyn ExecNode>),
    /// Positional tuple constructor.
    Tuple(Vec<CompiledExpr>),
}

impl CompiledExpr {
    /// Evaluate against the given scope.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<Value> {
        match self {
            CompiledExpr::Variable(name) => match ctx.variables.get(name) {
                Some((value, _level)) => Ok(value.clone()),
                None => Err(RillError::Runtime(format!("unknown variable: {name}"))),
            },
            CompiledExpr::Constant(value) => Ok(value.clone()),
            CompiledExpr::FunctionCall { descriptor, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(ctx)?);
                }
                (descriptor.eval)(&values)
            }
            CompiledExpr::Subquery(node) => evaluate_subquery(node.as_ref(), ctx),
            CompiledExpr::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(item.evaluate(ctx)?);
                }
                Ok(Value::Tuple(values))
            }
        }
    }

    /// Evaluate and require a boolean.
    pub fn evaluate_boolean(&self, ctx: &ExecutionContext) -> Result<bool> {
        match self.evaluate(ctx)? {
            Value::Boolean(b) => Ok(b),
            other => Err(RillError::Runtime(format!(
                "expected boolean, got {other}"
            ))),
        }
    }
}

/// Run the sub-query with the current scope visible, then collapse its
/// bounded output into a single value.
///
/// Zero rows yield null; one single-column row yields that value; one
/// multi-column row yields a tuple; several single-column rows yield a
/// list. Anything wider is a runtime error.
fn evaluate_subquery(node: &dyn ExecNode, ctx: &ExecutionContext) -> Result<Value> {
    let records = resolve_retractions(run_collect(node, ctx)?);
    match records.len() {
        0 => Ok(Value::Null),
        1 => {
            let (_, mut values) = records.into_iter().next().map(Record::into_parts).ok_or_else(
                || RillError::Runtime("sub-query produced no record after collapse".to_string()),
            )?;
            if values.len() == 1 {
                Ok(values.remove(0))
            } else {
                Ok(Value::Tuple(values))
            }
        }
        _ => {
            let mut items = Vec::with_capacity(records.len());
            for record in records {
                let (_, values) = record.into_parts();
                let [value] = <[Value; 1]>::try_from(values).map_err(|_| {
                    RillError::Runtime(
                        "sub-query returned multiple rows with multiple columns".to_string(),
                    )
                })?;
                items.push(value);
            }
            Ok(Value::List(items))
        }
    }
}

/// A resolved built-in function.
pub struct FunctionDescriptor {
    /// Function name as referenced by plans.
    pub name: &'static str,
    /// Smallest accepted argument count.
    pub min_args: usize,
    /// Largest accepted argument count.
    pub max_args: usize,
    /// The callable.
    pub eval: fn(&[Value]) -> Result<Value>,
}

/// Resolve a function by name, or fail with a plan error.
///
/// This is the only site where "unknown function" can surface, which keeps
/// the failure at materialization time.
pub fn resolve_function(name: &str, arg_count: usize) -> Result<&'static FunctionDescriptor> {
    let descriptor = FUNCTIONS
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| RillError::Plan(format!("unknown function: {name}")))?;
    if arg_count < descriptor.min_args || arg_count > descriptor.max_args {
        return Err(RillError::Plan(format!(
            "function {name} expects between {} and {} arguments, got {arg_count}",
            descriptor.min_args, descriptor.max_args
        )));
    }
    Ok(descriptor)
}

static FUNCTIONS: &[FunctionDescriptor] = &[
    FunctionDescriptor {
        name: "=",
        min_args: 2,
        max_args: 2,
        eval: |args| Ok(Value::Boolean(compare_values(&args[0], &args[1])? == Ordering::Equal)),
    },
    FunctionDescriptor {
        name: "!=",
        min_args: 2,
        max_args: 2,
        eval: |args| Ok(Value::Boolean(compare_values(&args[0], &args[1])? != Ordering::Equal)),
    },
    FunctionDescriptor {
        name: "<",
        min_args: 2,
        max_args: 2,
        eval: |args| Ok(Value::Boolean(compare_values(&args[0], &args[1])? == Ordering::Less)),
    },
    FunctionDescriptor {
        name: "<=",
        min_args: 2,
        max_args: 2,
        eval: |args| Ok(Value::Boolean(compare_values(&args[0], &args[1])? != Ordering::Greater)),
    },
    FunctionDescriptor {
        name: ">",
        min_args: 2,
        max_args: 2,
        eval: |args| Ok(Value::Boolean(compare_values(&args[0], &args[1])? == Ordering::Greater)),
    },
    FunctionDescriptor {
        name: ">=",
        min_args: 2,
        max_args: 2,
        eval: |args| Ok(Value::Boolean(compare_values(&args[0], &args[1])? != Ordering::Less)),
    },
    FunctionDescriptor {
        name: "and",
        min_args: 2,
        max_args: 2,
        eval: |args| boolean_op(args, |a, b| a && b),
    },
    FunctionDescriptor {
        name: "or",
        min_args: 2,
        max_args: 2,
        eval: |args| boolean_op(args, |a, b| a || b),
    },
    FunctionDescriptor {
        name: "not",
        min_args: 1,
        max_args: 1,
        eval: |args| match &args[0] {
            Value::Boolean(b) => Ok(Value::Boolean(!b)),
            other => Err(RillError::Runtime(format!("not() expects a boolean, got {other}"))),
        },
    },
    FunctionDescriptor {
        name: "+",
        min_args: 2,
        max_args: 2,
        eval: |args| arithmetic(&args[0], &args[1], ArithmeticOp::Add),
    },
    FunctionDescriptor {
        name: "-",
        min_args: 2,
        max_args: 2,
        eval: |args| arithmetic(&args[0], &args[1], ArithmeticOp::Sub),
    },
    FunctionDescriptor {
        name: "*",
        min_args: 2,
        max_args: 2,
        eval: |args| arithmetic(&args[0], &args[1], ArithmeticOp::Mul),
    },
    FunctionDescriptor {
        name: "/",
        min_args: 2,
        max_args: 2,
        eval: |args| arithmetic(&args[0], &args[1], ArithmeticOp::Div),
    },
    FunctionDescriptor {
        name: "in",
        min_args: 2,
        max_args: 2,
        eval: |args| {
            let candidates = match &args[1] {
                Value::List(items) | Value::Tuple(items) => items.as_slice(),
                single => std::slice::from_ref(single),
            };
            Ok(Value::Boolean(candidates.iter().any(|c| *c == args[0])))
        },
    },
    FunctionDescriptor {
        name: "like",
        min_args: 2,
        max_args: 2,
        eval: |args| match (&args[0], &args[1]) {
            (Value::String(s), Value::String(pattern)) => {
                Ok(Value::Boolean(like_match(s, pattern)))
            }
            (l, r) => Err(RillError::Runtime(format!(
                "like expects strings, got {l} and {r}"
            ))),
        },
    },
];

/// Comparison across values, with int/float promotion.
///
/// Values of the same type use the total value order; mixed numeric
/// operands compare as floats; any other mixed pair is a runtime error.
pub fn compare_values(left: &Value, right: &Value) -> Result<Ordering> {
    match (left, right) {
        (Value::Int(l), Value::Float(r)) => Ok(compare_as_floats(*l as f64, *r)),
        (Value::Float(l), Value::Int(r)) => Ok(compare_as_floats(*l, *r as f64)),
        (l, r) if l.type_id() == r.type_id() => Ok(l.compare(r)),
        (l, r) => Err(RillError::Runtime(format!(
            "cannot compare {} with {}",
            l.type_of(),
            r.type_of()
        ))),
    }
}

fn compare_as_floats(l: f64, r: f64) -> Ordering {
    Value::Float(l).compare(&Value::Float(r))
}

fn boolean_op(args: &[Value], op: fn(bool, bool) -> bool) -> Result<Value> {
    match (&args[0], &args[1]) {
        (Value::Boolean(a), Value::Boolean(b)) => Ok(Value::Boolean(op(*a, *b))),
        (l, r) => Err(RillError::Runtime(format!(
            "boolean operator expects booleans, got {l} and {r}"
        ))),
    }
}

enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

fn arithmetic(left: &Value, right: &Value, op: ArithmeticOp) -> Result<Value> {
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => match op {
            ArithmeticOp::Add => checked(l.checked_add(*r)),
            ArithmeticOp::Sub => checked(l.checked_sub(*r)),
            ArithmeticOp::Mul => checked(l.checked_mul(*r)),
            ArithmeticOp::Div => {
                if *r == 0 {
                    Err(RillError::Runtime("division by zero".to_string()))
                } else {
                    checked(l.checked_div(*r))
                }
            }
        },
        (Value::Float(l), Value::Float(r)) => Ok(Value::Float(float_op(*l, *r, op)?)),
        (Value::Int(l), Value::Float(r)) => Ok(Value::Float(float_op(*l as f64, *r, op)?)),
        (Value::Float(l), Value::Int(r)) => Ok(Value::Float(float_op(*l, *r as f64, op)?)),
        (Value::Timestamp(t), Value::Duration(d)) => match op {
            ArithmeticOp::Add => Ok(Value::Timestamp(*t + *d)),
            ArithmeticOp::Sub => Ok(Value::Timestamp(*t - *d)),
            _ => Err(RillError::Runtime(
                "only + and - apply to timestamp and duration".to_string(),
            )),
        },
        (Value::Timestamp(l), Value::Timestamp(r)) => match op {
            ArithmeticOp::Sub => Ok(Value::Duration(*l - *r)),
            _ => Err(RillError::Runtime(
                "only - applies to two timestamps".to_string(),
            )),
        },
        (Value::Duration(l), Value::Duration(r)) => match op {
            ArithmeticOp::Add => Ok(Value::Duration(*l + *r)),
            ArithmeticOp::Sub => Ok(Value::Duration(*l - *r)),
            _ => Err(RillError::Runtime(
                "only + and - apply to two durations".to_string(),
            )),
        },
        (l, r) => Err(RillError::Runtime(format!(
            "arithmetic not defined for {} and {}",
            l.type_of(),
            r.type_of()
        ))),
    }
}

fn float_op(l: f64, r: f64, op: ArithmeticOp) -> Result<f64> {
    match op {
        ArithmeticOp::Add => Ok(l + r),
        ArithmeticOp::Sub => Ok(l - r),
        ArithmeticOp::Mul => Ok(l * r),
        ArithmeticOp::Div => {
            if r == 0.0 {
                Err(RillError::Runtime("division by zero".to_string()))
            } else {
                Ok(l / r)
            }
        }
    }
}

fn checked(value: Option<i64>) -> Result<Value> {
    value
        .map(Value::Int)
        .ok_or_else(|| RillError::Runtime("integer overflow".to_string()))
}

/// SQL LIKE with `%` and `_` wildcards.
fn like_match(s: &str, pattern: &str) -> bool {
    fn inner(s: &[char], p: &[char]) -> bool {
        match (s, p) {
            ([], []) => true,
            (_, ['%', rest @ ..]) => {
                (0..=s.len()).any(|skip| inner(&s[skip..], rest))
            }
            ([_, s_rest @ ..], ['_', p_rest @ ..]) => inner(s_rest, p_rest),
            ([c, s_rest @ ..], [pc, p_rest @ ..]) => c == pc && inner(s_rest, p_rest),
            _ => false,
        }
    }
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&s, &p)
}
