//! Client-side expressions.
//!
//! Selectors, and predicates or keys that could not be translated to SQL, compile to a
//! [`Projection`] evaluated against a [`RowScope`] after shaping.

use std::cmp::Ordering;

use relmap_proto::Value;

use crate::error::{Error, Result};
use crate::metadata::{PropertyType, ScalarType};

use super::expression::BinaryOp;
use super::model::QuerySourceId;
use super::plan::{CompiledPlan, Evaluator};
use super::shaper::{RowScope, ShapedResult, SourceValue};

/// A compiled client-side expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Constant(Value),
    Parameter(String),
    /// The value bound to a source.
    Source(QuerySourceId),
    /// Property (or reference navigation) of the value bound to a source.
    Property {
        source: QuerySourceId,
        name: String,
    },
    /// Member of an evaluated result.
    Member {
        target: Box<Projection>,
        name: String,
    },
    /// Column of the raw command row.
    Column {
        index: usize,
        scalar: Option<ScalarType>,
    },
    Convert {
        operand: Box<Projection>,
        to: PropertyType,
    },
    Binary {
        op: BinaryOp,
        left: Box<Projection>,
        right: Box<Projection>,
    },
    Not(Box<Projection>),
    Conditional {
        test: Box<Projection>,
        if_true: Box<Projection>,
        if_false: Box<Projection>,
    },
    Method {
        method: String,
        target: Option<Box<Projection>>,
        arguments: Vec<Projection>,
    },
    Object(Vec<(String, Projection)>),
    /// An uncorrelated nested query.
    SubQuery(Box<CompiledPlan>),
}

impl Projection {
    /// Visit every nested plan.
    pub fn for_each_plan<'a>(&'a self, f: &mut dyn FnMut(&'a CompiledPlan)) {
        match self {
            Projection::SubQuery(plan) => f(plan),
            Projection::Member { target, .. } => target.for_each_plan(f),
            Projection::Convert { operand, .. } | Projection::Not(operand) => operand.for_each_plan(f),
            Projection::Binary { left, right, .. } => {
                left.for_each_plan(f);
                right.for_each_plan(f);
            }
            Projection::Conditional {
                test,
                if_true,
                if_false,
            } => {
                test.for_each_plan(f);
                if_true.for_each_plan(f);
                if_false.for_each_plan(f);
            }
            Projection::Method {
                target, arguments, ..
            } => {
                if let Some(target) = target {
                    target.for_each_plan(f);
                }
                arguments.iter().for_each(|a| a.for_each_plan(f));
            }
            Projection::Object(members) => members.iter().for_each(|(_, p)| p.for_each_plan(f)),
            Projection::Constant(_)
            | Projection::Parameter(_)
            | Projection::Source(_)
            | Projection::Property { .. }
            | Projection::Column { .. } => {}
        }
    }

    pub(crate) fn for_each_plan_mut(&mut self, f: &mut dyn FnMut(&mut CompiledPlan) -> Result<()>) -> Result<()> {
        match self {
            Projection::SubQuery(plan) => f(plan),
            Projection::Member { target, .. } => target.for_each_plan_mut(f),
            Projection::Convert { operand, .. } | Projection::Not(operand) => operand.for_each_plan_mut(f),
            Projection::Binary { left, right, .. } => {
                left.for_each_plan_mut(f)?;
                right.for_each_plan_mut(f)
            }
            Projection::Conditional {
                test,
                if_true,
                if_false,
            } => {
                test.for_each_plan_mut(f)?;
                if_true.for_each_plan_mut(f)?;
                if_false.for_each_plan_mut(f)
            }
            Projection::Method {
                target, arguments, ..
            } => {
                if let Some(target) = target {
                    target.for_each_plan_mut(f)?;
                }
                arguments.iter_mut().try_for_each(|a| a.for_each_plan_mut(f))
            }
            Projection::Object(members) => members.iter_mut().try_for_each(|(_, p)| p.for_each_plan_mut(f)),
            Projection::Constant(_)
            | Projection::Parameter(_)
            | Projection::Source(_)
            | Projection::Property { .. }
            | Projection::Column { .. } => Ok(()),
        }
    }

    /// Evaluate against one row scope.
    pub fn evaluate(&self, scope: &RowScope, ev: &mut Evaluator) -> Result<ShapedResult> {
        match self {
            Projection::Constant(value) => Ok(ShapedResult::Scalar(value.clone())),
            Projection::Parameter(name) => ev
                .parameter(name)
                .map(|v| ShapedResult::Scalar(v.clone()))
                .ok_or_else(|| Error::MissingParameter(name.clone())),
            Projection::Source(source) => match bound(scope, *source)? {
                SourceValue::Entity(entity) => Ok(ShapedResult::Entity(entity.clone())),
                SourceValue::Absent => Ok(ShapedResult::Absent),
                SourceValue::Row(row) => Ok(ShapedResult::Object(
                    row.names()
                        .iter()
                        .cloned()
                        .zip(row.values().iter().cloned().map(ShapedResult::Scalar))
                        .collect(),
                )),
                SourceValue::Group(items) => Ok(ShapedResult::Collection(items.clone())),
                SourceValue::Shaped(result) => Ok(result.clone()),
            },
            Projection::Property { source, name } => match bound(scope, *source)? {
                SourceValue::Entity(entity) => member_of(ShapedResult::Entity(entity.clone()), name),
                SourceValue::Absent => Ok(ShapedResult::Scalar(Value::Null)),
                SourceValue::Row(row) => row
                    .get(name)
                    .map(|v| ShapedResult::Scalar(v.clone()))
                    .ok_or_else(|| Error::Evaluation(format!("column for '{name}' was not projected"))),
                SourceValue::Group(items) => member_of(ShapedResult::Collection(items.clone()), name),
                SourceValue::Shaped(result) => member_of(result.clone(), name),
            },
            Projection::Member { target, name } => member_of(target.evaluate(scope, ev)?, name),
            Projection::Column { index, scalar } => {
                let value = scope
                    .row()
                    .and_then(|row| row.get(*index))
                    .cloned()
                    .ok_or_else(|| Error::ResultShape(format!("missing column {index}")))?;
                Ok(ShapedResult::Scalar(match scalar {
                    Some(scalar) => scalar.coerce(value),
                    None => value,
                }))
            }
            Projection::Convert { operand, to } => match operand.evaluate(scope, ev)? {
                ShapedResult::Scalar(value) => Ok(ShapedResult::Scalar(to.scalar.coerce(value))),
                other => Ok(other),
            },
            Projection::Binary { op, left, right } => {
                let left = left.evaluate(scope, ev)?;
                match op {
                    BinaryOp::And if truth(&left)? == Some(false) => {
                        return Ok(ShapedResult::Scalar(Value::Bool(false)))
                    }
                    BinaryOp::Or if truth(&left)? == Some(true) => {
                        return Ok(ShapedResult::Scalar(Value::Bool(true)))
                    }
                    _ => {}
                }
                let right = right.evaluate(scope, ev)?;
                binary(*op, &left, &right)
            }
            Projection::Not(operand) => {
                let value = truth(&operand.evaluate(scope, ev)?)?;
                Ok(ShapedResult::Scalar(value.map_or(Value::Null, |b| Value::Bool(!b))))
            }
            Projection::Conditional {
                test,
                if_true,
                if_false,
            } => {
                if truth(&test.evaluate(scope, ev)?)? == Some(true) {
                    if_true.evaluate(scope, ev)
                } else {
                    if_false.evaluate(scope, ev)
                }
            }
            Projection::Method {
                method,
                target,
                arguments,
            } => {
                let target = match target {
                    Some(target) => Some(target.evaluate(scope, ev)?),
                    None => None,
                };
                let arguments = arguments
                    .iter()
                    .map(|a| a.evaluate(scope, ev))
                    .collect::<Result<Vec<_>>>()?;
                call(method, target, &arguments)
            }
            Projection::Object(members) => Ok(ShapedResult::Object(
                members
                    .iter()
                    .map(|(name, p)| p.evaluate(scope, ev).map(|v| (name.clone(), v)))
                    .collect::<Result<_>>()?,
            )),
            Projection::SubQuery(plan) => {
                let results = ev.evaluate_plan(plan)?;
                if plan.scalar {
                    Ok(results.into_iter().next().unwrap_or(ShapedResult::Absent))
                } else {
                    Ok(ShapedResult::Collection(results))
                }
            }
        }
    }
}

fn bound(scope: &RowScope, source: QuerySourceId) -> Result<&SourceValue> {
    scope
        .get(source)
        .ok_or_else(|| Error::Evaluation(format!("query source {} is not in scope", source.raw())))
}

/// Member access on an evaluated result. Absent and NULL propagate as NULL.
pub(crate) fn member_of(target: ShapedResult, name: &str) -> Result<ShapedResult> {
    match target {
        ShapedResult::Entity(entity) => {
            if let Some(value) = entity.get(name) {
                return Ok(ShapedResult::Scalar(value.clone()));
            }
            if entity.entity_type().navigation(name).is_some() {
                return Ok(entity
                    .navigation(name)
                    .map(ShapedResult::Entity)
                    .unwrap_or(ShapedResult::Absent));
            }
            Err(Error::UnknownProperty {
                entity: entity.entity_type().name.clone(),
                property: name.to_string(),
            })
        }
        ShapedResult::Absent | ShapedResult::Scalar(Value::Null) => Ok(ShapedResult::Scalar(Value::Null)),
        ShapedResult::Object(fields) => fields
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::Evaluation(format!("no member '{name}'"))),
        ShapedResult::Collection(items) if name == "Count" => {
            Ok(ShapedResult::Scalar(Value::Int32(items.len() as i32)))
        }
        ShapedResult::Scalar(Value::String(s)) if name == "Length" => {
            Ok(ShapedResult::Scalar(Value::Int32(s.chars().count() as i32)))
        }
        other => Err(Error::Evaluation(format!("no member '{name}' on {other:?}"))),
    }
}

/// Truth value of a result; `None` for NULL.
pub(crate) fn truth(result: &ShapedResult) -> Result<Option<bool>> {
    match result {
        ShapedResult::Scalar(Value::Null) | ShapedResult::Absent => Ok(None),
        ShapedResult::Scalar(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| Error::Evaluation(format!("expected a boolean, got {}", value.type_name()))),
        other => Err(Error::Evaluation(format!("expected a boolean, got {other:?}"))),
    }
}

/// Order two values. NULL sorts before everything; numbers compare across widths.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::Uuid(x), Value::Uuid(y)) => Some(x.cmp(y)),
        _ => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => match (numeric(a), numeric(b)) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        },
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int32(_) | Value::Int64(_) | Value::Float32(_) | Value::Float64(_) => value.as_f64(),
        _ => None,
    }
}

/// Equality with null-equals-null semantics; entities compare by key.
pub(crate) fn results_equal(a: &ShapedResult, b: &ShapedResult) -> bool {
    let is_null = |r: &ShapedResult| matches!(r, ShapedResult::Absent | ShapedResult::Scalar(Value::Null));
    match (a, b) {
        _ if is_null(a) || is_null(b) => is_null(a) && is_null(b),
        (ShapedResult::Scalar(x), ShapedResult::Scalar(y)) => compare_values(x, y) == Some(Ordering::Equal),
        (ShapedResult::Entity(x), ShapedResult::Entity(y)) => x.key() == y.key(),
        _ => a == b,
    }
}

fn binary(op: BinaryOp, left: &ShapedResult, right: &ShapedResult) -> Result<ShapedResult> {
    let scalar = |v: Value| -> Result<ShapedResult> { Ok(ShapedResult::Scalar(v)) };
    match op {
        BinaryOp::Equal => scalar(Value::Bool(results_equal(left, right))),
        BinaryOp::NotEqual => scalar(Value::Bool(!results_equal(left, right))),
        BinaryOp::And | BinaryOp::Or => {
            let (l, r) = (truth(left)?, truth(right)?);
            scalar(match (op, l, r) {
                (BinaryOp::And, Some(x), Some(y)) => Value::Bool(x && y),
                (BinaryOp::Or, Some(x), Some(y)) => Value::Bool(x || y),
                (BinaryOp::And, _, Some(false)) | (BinaryOp::And, Some(false), _) => Value::Bool(false),
                (BinaryOp::Or, _, Some(true)) | (BinaryOp::Or, Some(true), _) => Value::Bool(true),
                _ => Value::Null,
            })
        }
        BinaryOp::LessThan
        | BinaryOp::LessThanOrEqual
        | BinaryOp::GreaterThan
        | BinaryOp::GreaterThanOrEqual => {
            let (Some(l), Some(r)) = (left.as_scalar(), right.as_scalar()) else {
                return Err(Error::Evaluation("comparison of non-scalar values".into()));
            };
            if l.is_null() || r.is_null() {
                return scalar(Value::Bool(false));
            }
            let ordering = compare_values(l, r).ok_or_else(|| {
                Error::Evaluation(format!("cannot compare {} with {}", l.type_name(), r.type_name()))
            })?;
            scalar(Value::Bool(match op {
                BinaryOp::LessThan => ordering == Ordering::Less,
                BinaryOp::LessThanOrEqual => ordering != Ordering::Greater,
                BinaryOp::GreaterThan => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => {
            let (Some(l), Some(r)) = (left.as_scalar(), right.as_scalar()) else {
                return Err(Error::Evaluation("arithmetic on non-scalar values".into()));
            };
            arithmetic(op, l, r).map(ShapedResult::Scalar)
        }
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    if op == BinaryOp::Add {
        if let (Value::String(a), b) | (b, Value::String(a)) = (l, r) {
            let b = b.as_str().map(str::to_string).unwrap_or_else(|| b.to_string());
            return Ok(Value::String(if matches!(l, Value::String(_)) {
                format!("{a}{b}")
            } else {
                format!("{b}{a}")
            }));
        }
    }

    let overflow = || Error::Evaluation("arithmetic overflow".into());
    match (l, r) {
        (Value::Int32(a), Value::Int32(b)) => {
            let (a, b) = (*a, *b);
            let value = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Subtract => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                _ if b == 0 => return Err(Error::Evaluation("division by zero".into())),
                _ => a.checked_div(b),
            };
            value.map(Value::Int32).ok_or_else(overflow)
        }
        _ => match (l.as_i64(), r.as_i64()) {
            (Some(a), Some(b)) => {
                let value = match op {
                    BinaryOp::Add => a.checked_add(b),
                    BinaryOp::Subtract => a.checked_sub(b),
                    BinaryOp::Multiply => a.checked_mul(b),
                    _ if b == 0 => return Err(Error::Evaluation("division by zero".into())),
                    _ => a.checked_div(b),
                };
                value.map(Value::Int64).ok_or_else(overflow)
            }
            _ => match (numeric(l), numeric(r)) {
                (Some(a), Some(b)) => Ok(Value::Float64(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Subtract => a - b,
                    BinaryOp::Multiply => a * b,
                    _ => a / b,
                })),
                _ => Err(Error::Evaluation(format!(
                    "cannot apply {op:?} to {} and {}",
                    l.type_name(),
                    r.type_name()
                ))),
            },
        },
    }
}

fn call(method: &str, target: Option<ShapedResult>, arguments: &[ShapedResult]) -> Result<ShapedResult> {
    if let Some(ShapedResult::Collection(items)) = &target {
        return match method {
            "Count" => Ok(ShapedResult::Scalar(Value::Int32(items.len() as i32))),
            "Any" => Ok(ShapedResult::Scalar(Value::Bool(!items.is_empty()))),
            _ => Err(Error::Evaluation(format!("unsupported collection method '{method}'"))),
        };
    }
    let text = match &target {
        Some(ShapedResult::Scalar(Value::String(s))) => s.as_str(),
        Some(ShapedResult::Scalar(Value::Null)) | Some(ShapedResult::Absent) => {
            return Ok(ShapedResult::Scalar(Value::Null))
        }
        _ => return Err(Error::Evaluation(format!("method '{method}' needs a string target"))),
    };
    let argument = || {
        arguments
            .first()
            .and_then(ShapedResult::as_scalar)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Evaluation(format!("method '{method}' needs a string argument")))
    };

    let value = match method {
        "StartsWith" => Value::Bool(text.starts_with(argument()?)),
        "EndsWith" => Value::Bool(text.ends_with(argument()?)),
        "Contains" => Value::Bool(text.contains(argument()?)),
        "ToUpper" => Value::String(text.to_uppercase()),
        "ToLower" => Value::String(text.to_lowercase()),
        "Trim" => Value::String(text.trim().to_string()),
        _ => return Err(Error::Evaluation(format!("unsupported method '{method}'"))),
    };
    Ok(ShapedResult::Scalar(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_across_widths() {
        assert_eq!(compare_values(&Value::Int32(3), &Value::Int64(3)), Some(Ordering::Equal));
        assert_eq!(compare_values(&Value::Int32(2), &Value::Float64(2.5)), Some(Ordering::Less));
        assert_eq!(compare_values(&Value::Null, &Value::Int32(0)), Some(Ordering::Less));
        assert_eq!(compare_values(&Value::from("a"), &Value::Int32(0)), None);
    }

    #[test]
    fn test_null_semantics() {
        let null = ShapedResult::Scalar(Value::Null);
        assert!(results_equal(&null, &ShapedResult::Absent));
        assert!(!results_equal(&null, &ShapedResult::Scalar(Value::Int32(1))));
        assert_eq!(
            binary(BinaryOp::LessThan, &null, &ShapedResult::Scalar(Value::Int32(1))).unwrap(),
            ShapedResult::Scalar(Value::Bool(false))
        );
        assert_eq!(
            member_of(ShapedResult::Absent, "City").unwrap(),
            ShapedResult::Scalar(Value::Null)
        );
    }

    #[test]
    fn test_arithmetic_and_concat() {
        assert_eq!(
            arithmetic(BinaryOp::Add, &Value::Int32(2), &Value::Int32(3)).unwrap(),
            Value::Int32(5)
        );
        assert_eq!(
            arithmetic(BinaryOp::Add, &Value::from("Order "), &Value::Int32(7)).unwrap(),
            Value::from("Order 7")
        );
        assert!(arithmetic(BinaryOp::Divide, &Value::Int64(1), &Value::Int32(0)).is_err());
    }

    #[test]
    fn test_string_methods() {
        let target = Some(ShapedResult::Scalar(Value::from("London")));
        let arg = [ShapedResult::Scalar(Value::from("Lon"))];
        assert_eq!(
            call("StartsWith", target.clone(), &arg).unwrap(),
            ShapedResult::Scalar(Value::Bool(true))
        );
        assert_eq!(
            call("ToUpper", target, &[]).unwrap(),
            ShapedResult::Scalar(Value::from("LONDON"))
        );
        assert_eq!(
            call("Trim", Some(ShapedResult::Absent), &[]).unwrap(),
            ShapedResult::Scalar(Value::Null)
        );
    }
}
