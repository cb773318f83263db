//! Tree-walking evaluator over the restricted AST.
//!
//! Evaluation is side-effect free. Accessing an unknown name or a missing
//! member yields `undefined`, which propagates through optional chaining
//! and is distinct from JSON `null` (so `?? ` can supply defaults for
//! both).

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::{ExpressionError, Scope};
use serde_json::{Number, Value as JsonValue, json};

/// An evaluation result: a JSON value, `undefined`, or one of the
/// enumerated host namespaces awaiting member access.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EvalValue {
    Undefined,
    Json(JsonValue),
    /// `$node`, awaiting a node-name index.
    NodeAccessor,
    /// `$input`, awaiting `.all()` / `.first()` / `.last()` / `.item`.
    InputAccessor,
    /// `Math`, awaiting a method.
    MathNamespace,
    /// `JSON`, awaiting `stringify` / `parse`.
    JsonNamespace,
}

impl EvalValue {
    pub(crate) fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Json(JsonValue::Null))
    }

    pub(crate) fn truthy(&self) -> bool {
        match self {
            Self::Undefined => false,
            Self::Json(value) => match value {
                JsonValue::Null => false,
                JsonValue::Bool(b) => *b,
                JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                JsonValue::String(s) => !s.is_empty(),
                JsonValue::Array(_) | JsonValue::Object(_) => true,
            },
            _ => true,
        }
    }

    /// Converts to the JSON value handed back to callers; `undefined`
    /// collapses to `null`.
    pub(crate) fn into_json(self) -> JsonValue {
        match self {
            Self::Json(value) => value,
            _ => JsonValue::Null,
        }
    }

    /// String coercion used by template concatenation.
    pub(crate) fn coerce_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Json(JsonValue::Null) => "null".to_string(),
            Self::Json(JsonValue::String(s)) => s.clone(),
            Self::Json(JsonValue::Bool(b)) => b.to_string(),
            Self::Json(JsonValue::Number(n)) => n.to_string(),
            Self::Json(other) => other.to_string(),
            _ => "undefined".to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Json(JsonValue::Number(n)) => n.as_f64(),
            Self::Json(JsonValue::String(s)) => s.parse().ok(),
            Self::Json(JsonValue::Bool(b)) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }
}

fn number(value: f64) -> EvalValue {
    // Whole results stay integers so equality against JSON integers holds.
    let json_number = if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        Number::from(value as i64)
    } else {
        match Number::from_f64(value) {
            Some(n) => n,
            None => return EvalValue::Json(JsonValue::Null),
        }
    };
    EvalValue::Json(JsonValue::Number(json_number))
}

/// Evaluates an expression against a scope.
pub(crate) fn eval(expr: &Expr, scope: &Scope<'_>) -> Result<EvalValue, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(EvalValue::Json(value.clone())),
        Expr::Ident(name) => Ok(resolve_ident(name, scope)),
        Expr::Member {
            object,
            name,
            optional: _,
        } => {
            let object = eval(object, scope)?;
            Ok(member(&object, name, scope))
        }
        Expr::Index {
            object,
            index,
            optional: _,
        } => {
            let object = eval(object, scope)?;
            let index = eval(index, scope)?;
            Ok(index_access(&object, &index, scope))
        }
        Expr::Call { callee, args } => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(arg, scope)?);
            }
            call(callee, &evaluated, scope)
        }
        Expr::Unary { op, expr } => {
            let value = eval(expr, scope)?;
            Ok(match op {
                UnaryOp::Not => EvalValue::Json(JsonValue::Bool(!value.truthy())),
                UnaryOp::Neg => value.as_f64().map_or(EvalValue::Undefined, |f| number(-f)),
            })
        }
        Expr::Binary { op, lhs, rhs } => binary(*op, lhs, rhs, scope),
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if eval(cond, scope)?.truthy() {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
    }
}

fn resolve_ident(name: &str, scope: &Scope<'_>) -> EvalValue {
    match name {
        "$json" => scope
            .current_item()
            .map_or(EvalValue::Undefined, |item| {
                EvalValue::Json(item.json_value())
            }),
        "$binary" => scope.current_item().map_or(EvalValue::Undefined, |item| {
            item.binary
                .as_ref()
                .map_or(EvalValue::Json(json!({})), |binary| {
                    EvalValue::Json(serde_json::to_value(binary).unwrap_or(JsonValue::Null))
                })
        }),
        "$parameter" => EvalValue::Json(JsonValue::Object(scope.parameters.clone())),
        "$workflow" => EvalValue::Json(json!({
            "id": scope.workflow_id,
            "name": scope.workflow_name,
            "active": true,
        })),
        "$execution" => EvalValue::Json(json!({"id": scope.execution_id})),
        "$executionId" => EvalValue::Json(JsonValue::String(scope.execution_id.to_string())),
        "$now" => EvalValue::Json(JsonValue::String(scope.now.to_rfc3339())),
        "$today" => EvalValue::Json(JsonValue::String(
            scope.now.date_naive().format("%Y-%m-%d").to_string(),
        )),
        "$itemIndex" => number(scope.item_index as f64),
        "$runIndex" => number(f64::from(scope.run_index)),
        "$node" => EvalValue::NodeAccessor,
        "$input" => EvalValue::InputAccessor,
        "Math" => EvalValue::MathNamespace,
        "JSON" => EvalValue::JsonNamespace,
        _ => EvalValue::Undefined,
    }
}

fn member(object: &EvalValue, name: &str, scope: &Scope<'_>) -> EvalValue {
    match object {
        EvalValue::NodeAccessor => scope.node_item(name),
        EvalValue::InputAccessor => match name {
            "item" => scope
                .current_item()
                .map_or(EvalValue::Undefined, |item| {
                    EvalValue::Json(
                        serde_json::to_value(item).unwrap_or(JsonValue::Null),
                    )
                }),
            _ => EvalValue::Undefined,
        },
        EvalValue::Json(JsonValue::Object(map)) => map
            .get(name)
            .map_or(EvalValue::Undefined, |v| EvalValue::Json(v.clone())),
        EvalValue::Json(JsonValue::String(s)) if name == "length" => number(s.chars().count() as f64),
        EvalValue::Json(JsonValue::Array(items)) if name == "length" => number(items.len() as f64),
        _ => EvalValue::Undefined,
    }
}

fn index_access(object: &EvalValue, index: &EvalValue, scope: &Scope<'_>) -> EvalValue {
    match (object, index) {
        (EvalValue::NodeAccessor, EvalValue::Json(JsonValue::String(name))) => {
            scope.node_item(name)
        }
        (EvalValue::Json(JsonValue::Object(map)), EvalValue::Json(JsonValue::String(key))) => {
            map.get(key)
                .map_or(EvalValue::Undefined, |v| EvalValue::Json(v.clone()))
        }
        (EvalValue::Json(JsonValue::Array(items)), index) => index
            .as_f64()
            .and_then(|f| items.get(f as usize))
            .map_or(EvalValue::Undefined, |v| EvalValue::Json(v.clone())),
        (EvalValue::Json(JsonValue::String(s)), index) => index
            .as_f64()
            .and_then(|f| s.chars().nth(f as usize))
            .map_or(EvalValue::Undefined, |c| {
                EvalValue::Json(JsonValue::String(c.to_string()))
            }),
        _ => EvalValue::Undefined,
    }
}

fn call(
    callee: &Expr,
    args: &[EvalValue],
    scope: &Scope<'_>,
) -> Result<EvalValue, ExpressionError> {
    let Expr::Member {
        object,
        name,
        optional,
    } = callee
    else {
        return Err(ExpressionError::Eval {
            message: "only method calls on host values are supported".to_string(),
        });
    };
    let object = eval(object, scope)?;

    match &object {
        EvalValue::MathNamespace => return math_method(name, args),
        EvalValue::JsonNamespace => return json_method(name, args),
        EvalValue::InputAccessor => return Ok(input_method(name, scope)),
        _ => {}
    }

    // `a?.method()` short-circuits; a plain call on a missing value is an
    // error, matching the usual scripting semantics.
    if object.is_nullish() {
        if *optional {
            return Ok(EvalValue::Undefined);
        }
        return Err(ExpressionError::Eval {
            message: format!("cannot call '{name}' of undefined"),
        });
    }

    Ok(match (&object, name.as_str()) {
        (EvalValue::Json(JsonValue::String(s)), method) => string_method(s, method, args),
        (EvalValue::Json(JsonValue::Array(items)), method) => array_method(items, method, args),
        (EvalValue::Json(JsonValue::Number(n)), method) => {
            number_method(n.as_f64().unwrap_or(0.0), method, args)
        }
        (EvalValue::Json(other), "toString") => {
            EvalValue::Json(JsonValue::String(EvalValue::Json(other.clone()).coerce_string()))
        }
        _ => EvalValue::Undefined,
    })
}

fn string_method(s: &str, method: &str, args: &[EvalValue]) -> EvalValue {
    let arg_str = |i: usize| -> String {
        args.get(i).map_or(String::new(), EvalValue::coerce_string)
    };
    match method {
        "toUpperCase" => EvalValue::Json(JsonValue::String(s.to_uppercase())),
        "toLowerCase" => EvalValue::Json(JsonValue::String(s.to_lowercase())),
        "trim" => EvalValue::Json(JsonValue::String(s.trim().to_string())),
        "includes" => EvalValue::Json(JsonValue::Bool(s.contains(&arg_str(0)))),
        "startsWith" => EvalValue::Json(JsonValue::Bool(s.starts_with(&arg_str(0)))),
        "endsWith" => EvalValue::Json(JsonValue::Bool(s.ends_with(&arg_str(0)))),
        "split" => {
            let sep = arg_str(0);
            let parts: Vec<JsonValue> = if sep.is_empty() {
                s.chars()
                    .map(|c| JsonValue::String(c.to_string()))
                    .collect()
            } else {
                s.split(&sep)
                    .map(|p| JsonValue::String(p.to_string()))
                    .collect()
            };
            EvalValue::Json(JsonValue::Array(parts))
        }
        "replace" => {
            EvalValue::Json(JsonValue::String(s.replacen(&arg_str(0), &arg_str(1), 1)))
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_bounds(chars.len(), args);
            EvalValue::Json(JsonValue::String(chars[start..end].iter().collect()))
        }
        "toString" => EvalValue::Json(JsonValue::String(s.to_string())),
        "toNumber" => s
            .trim()
            .parse::<f64>()
            .map_or(EvalValue::Undefined, number),
        _ => EvalValue::Undefined,
    }
}

fn array_method(items: &[JsonValue], method: &str, args: &[EvalValue]) -> EvalValue {
    match method {
        "first" => items
            .first()
            .map_or(EvalValue::Undefined, |v| EvalValue::Json(v.clone())),
        "last" => items
            .last()
            .map_or(EvalValue::Undefined, |v| EvalValue::Json(v.clone())),
        "join" => {
            let sep = args
                .first()
                .map_or(",".to_string(), EvalValue::coerce_string);
            let joined = items
                .iter()
                .map(|v| EvalValue::Json(v.clone()).coerce_string())
                .collect::<Vec<_>>()
                .join(&sep);
            EvalValue::Json(JsonValue::String(joined))
        }
        "includes" => {
            let needle = args.first().cloned().unwrap_or(EvalValue::Undefined);
            let found = items
                .iter()
                .any(|v| EvalValue::Json(v.clone()) == needle);
            EvalValue::Json(JsonValue::Bool(found))
        }
        "slice" => {
            let (start, end) = slice_bounds(items.len(), args);
            EvalValue::Json(JsonValue::Array(items[start..end].to_vec()))
        }
        _ => EvalValue::Undefined,
    }
}

fn number_method(value: f64, method: &str, args: &[EvalValue]) -> EvalValue {
    match method {
        "toFixed" => {
            let digits = args
                .first()
                .and_then(EvalValue::as_f64)
                .unwrap_or(0.0)
                .clamp(0.0, 20.0) as usize;
            EvalValue::Json(JsonValue::String(format!("{value:.digits$}")))
        }
        "toString" => EvalValue::Json(JsonValue::String(
            EvalValue::Json(json!(value)).coerce_string(),
        )),
        _ => EvalValue::Undefined,
    }
}

fn math_method(name: &str, args: &[EvalValue]) -> Result<EvalValue, ExpressionError> {
    let numbers: Vec<f64> = args.iter().filter_map(EvalValue::as_f64).collect();
    let first = numbers.first().copied();
    Ok(match name {
        "min" => numbers
            .iter()
            .copied()
            .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.min(n))))
            .map_or(EvalValue::Undefined, number),
        "max" => numbers
            .iter()
            .copied()
            .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.max(n))))
            .map_or(EvalValue::Undefined, number),
        "round" => first.map_or(EvalValue::Undefined, |n| number(n.round())),
        "floor" => first.map_or(EvalValue::Undefined, |n| number(n.floor())),
        "ceil" => first.map_or(EvalValue::Undefined, |n| number(n.ceil())),
        "abs" => first.map_or(EvalValue::Undefined, |n| number(n.abs())),
        other => {
            return Err(ExpressionError::Eval {
                message: format!("unknown Math method '{other}'"),
            });
        }
    })
}

fn json_method(name: &str, args: &[EvalValue]) -> Result<EvalValue, ExpressionError> {
    match name {
        "stringify" => {
            let value = args.first().cloned().unwrap_or(EvalValue::Undefined);
            Ok(EvalValue::Json(JsonValue::String(
                serde_json::to_string(&value.into_json()).unwrap_or_default(),
            )))
        }
        "parse" => {
            let text = args.first().map_or(String::new(), EvalValue::coerce_string);
            Ok(serde_json::from_str(&text)
                .map_or(EvalValue::Undefined, EvalValue::Json))
        }
        other => Err(ExpressionError::Eval {
            message: format!("unknown JSON method '{other}'"),
        }),
    }
}

fn input_method(name: &str, scope: &Scope<'_>) -> EvalValue {
    let to_item_json = |item: &crate::item::ExecutionItem| {
        serde_json::to_value(item).unwrap_or(JsonValue::Null)
    };
    match name {
        "all" => EvalValue::Json(JsonValue::Array(
            scope.input_items.iter().map(to_item_json).collect(),
        )),
        "first" => scope
            .input_items
            .first()
            .map_or(EvalValue::Undefined, |i| EvalValue::Json(to_item_json(i))),
        "last" => scope
            .input_items
            .last()
            .map_or(EvalValue::Undefined, |i| EvalValue::Json(to_item_json(i))),
        _ => EvalValue::Undefined,
    }
}

fn slice_bounds(len: usize, args: &[EvalValue]) -> (usize, usize) {
    let resolve = |raw: f64| -> usize {
        if raw < 0.0 {
            len.saturating_sub((-raw) as usize)
        } else {
            (raw as usize).min(len)
        }
    };
    let start = args.first().and_then(EvalValue::as_f64).map_or(0, resolve);
    let end = args.get(1).and_then(EvalValue::as_f64).map_or(len, resolve);
    (start, end.max(start))
}

fn binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    scope: &Scope<'_>,
) -> Result<EvalValue, ExpressionError> {
    // Short-circuiting operators evaluate the right side lazily.
    match op {
        BinaryOp::NullishCoalesce => {
            let left = eval(lhs, scope)?;
            return if left.is_nullish() {
                eval(rhs, scope)
            } else {
                Ok(left)
            };
        }
        BinaryOp::Or => {
            let left = eval(lhs, scope)?;
            return if left.truthy() { Ok(left) } else { eval(rhs, scope) };
        }
        BinaryOp::And => {
            let left = eval(lhs, scope)?;
            return if left.truthy() { eval(rhs, scope) } else { Ok(left) };
        }
        _ => {}
    }

    let left = eval(lhs, scope)?;
    let right = eval(rhs, scope)?;

    Ok(match op {
        BinaryOp::Add => match (&left, &right) {
            (EvalValue::Json(JsonValue::String(_)), _)
            | (_, EvalValue::Json(JsonValue::String(_))) => EvalValue::Json(JsonValue::String(
                format!("{}{}", left.coerce_string(), right.coerce_string()),
            )),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => number(a + b),
                _ => EvalValue::Undefined,
            },
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => match op {
                    BinaryOp::Sub => number(a - b),
                    BinaryOp::Mul => number(a * b),
                    BinaryOp::Div => number(a / b),
                    _ => number(a % b),
                },
                _ => EvalValue::Undefined,
            }
        }
        BinaryOp::Eq => EvalValue::Json(JsonValue::Bool(loose_eq(&left, &right))),
        BinaryOp::NotEq => EvalValue::Json(JsonValue::Bool(!loose_eq(&left, &right))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            EvalValue::Json(JsonValue::Bool(compare(op, &left, &right)))
        }
        // Short-circuit ops handled above.
        _ => EvalValue::Undefined,
    })
}

fn loose_eq(left: &EvalValue, right: &EvalValue) -> bool {
    if left.is_nullish() && right.is_nullish() {
        return true;
    }
    if left == right {
        return true;
    }
    // Numeric coercion across number/string/bool.
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compare(op: BinaryOp, left: &EvalValue, right: &EvalValue) -> bool {
    if let (EvalValue::Json(JsonValue::String(a)), EvalValue::Json(JsonValue::String(b))) =
        (left, right)
    {
        return match op {
            BinaryOp::Lt => a < b,
            BinaryOp::LtEq => a <= b,
            BinaryOp::Gt => a > b,
            _ => a >= b,
        };
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => match op {
            BinaryOp::Lt => a < b,
            BinaryOp::LtEq => a <= b,
            BinaryOp::Gt => a > b,
            _ => a >= b,
        },
        _ => false,
    }
}
