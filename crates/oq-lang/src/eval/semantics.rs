//! Coercion, arithmetic and comparison rules shared by the direct
//! interpreter and the constant folder. Everything here is a pure
//! function over values; both execution paths must agree because they
//! call the same code.

use std::cmp::Ordering;

use crate::ast::node::BinaryOp;
use crate::number::Number;
use crate::range::Range;

use super::error::RuntimeError;
use super::value::Value;

/// Applies a strict (non-short-circuiting) binary operator. `&&` and
/// `||` are handled by the evaluator so the right operand stays lazy.
pub fn binary_op(
    op: BinaryOp,
    left: Value,
    right: Value,
    range: Range,
) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Add => add(left, right, range),
        BinaryOp::Sub => arith(op, left, right, range),
        BinaryOp::Mul => arith(op, left, right, range),
        BinaryOp::Div => arith(op, left, right, range),
        BinaryOp::Mod => arith(op, left, right, range),
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::NotEq => Ok(Value::Bool(left != right)),
        BinaryOp::Lt => comparison(op, left, right, range),
        BinaryOp::Le => comparison(op, left, right, range),
        BinaryOp::Gt => comparison(op, left, right, range),
        BinaryOp::Ge => comparison(op, left, right, range),
        BinaryOp::And => {
            let l = left.is_truthy();
            Ok(Value::Bool(l && right.is_truthy()))
        }
        BinaryOp::Or => Ok(or_result(left.is_truthy(), right)),
    }
}

/// The `||` result once the left side is known: a truthy side yields
/// `true`; otherwise the raw right operand passes through, which is
/// what makes `false || null` evaluate to `null` while
/// `null || false` evaluates to `false`.
pub fn or_result(left_truthy: bool, right: Value) -> Value {
    if left_truthy {
        Value::Bool(true)
    } else if right.is_truthy() {
        Value::Bool(true)
    } else {
        right
    }
}

/// `+` with the string exception: if either operand is a string the
/// other is stringified (null as the empty string) and the result is
/// concatenation. Otherwise numeric addition with null propagation
/// and list broadcasting.
pub fn add(left: Value, right: Value, range: Range) -> Result<Value, RuntimeError> {
    if let Some(broadcast) = broadcast(BinaryOp::Add, &left, &right, range)? {
        return Ok(broadcast);
    }
    match (&left, &right) {
        (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
            "{}{}",
            left.to_display_string(),
            right.to_display_string()
        ))),
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Number(l), Value::Number(r)) => Ok(Value::Number(*l + *r)),
        _ => Err(invalid_types(BinaryOp::Add, &left, &right, range)),
    }
}

fn arith(op: BinaryOp, left: Value, right: Value, range: Range) -> Result<Value, RuntimeError> {
    if let Some(broadcast) = broadcast(op, &left, &right, range)? {
        return Ok(broadcast);
    }
    match (&left, &right) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Number(l), Value::Number(r)) => match op {
            BinaryOp::Sub => Ok(Value::Number(*l - *r)),
            BinaryOp::Mul => Ok(Value::Number(*l * *r)),
            BinaryOp::Div => {
                if r.is_zero() {
                    Err(RuntimeError::ZeroDivision(range))
                } else {
                    Ok(Value::Number(*l / *r))
                }
            }
            BinaryOp::Mod => {
                if r.is_zero() {
                    Err(RuntimeError::ZeroDivision(range))
                } else {
                    Ok(Value::Number(*l % *r))
                }
            }
            _ => unreachable!(),
        },
        _ => Err(invalid_types(op, &left, &right, range)),
    }
}

/// Element-wise application between a collection and a scalar, or two
/// collections of equal length. Returns `None` when neither operand is
/// a collection.
fn broadcast(
    op: BinaryOp,
    left: &Value,
    right: &Value,
    range: Range,
) -> Result<Option<Value>, RuntimeError> {
    fn rebuild(template: &Value, items: Vec<Value>) -> Value {
        match template {
            Value::Set(_) => Value::set_of(items),
            _ => Value::List(items),
        }
    }
    match (left, right) {
        (Value::List(ls) | Value::Set(ls), Value::List(rs) | Value::Set(rs)) => {
            if ls.len() != rs.len() {
                return Err(RuntimeError::UnequalListLengths {
                    left: ls.len(),
                    right: rs.len(),
                    range,
                });
            }
            let items = ls
                .iter()
                .zip(rs)
                .map(|(l, r)| binary_op(op, l.clone(), r.clone(), range))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(rebuild(left, items)))
        }
        (Value::List(ls) | Value::Set(ls), scalar) => {
            let items = ls
                .iter()
                .map(|l| binary_op(op, l.clone(), scalar.clone(), range))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(rebuild(left, items)))
        }
        (scalar, Value::List(rs) | Value::Set(rs)) => {
            let items = rs
                .iter()
                .map(|r| binary_op(op, scalar.clone(), r.clone(), range))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(rebuild(right, items)))
        }
        _ => Ok(None),
    }
}

fn comparison(
    op: BinaryOp,
    left: Value,
    right: Value,
    range: Range,
) -> Result<Value, RuntimeError> {
    let ordering = compare(&left, &right, range)?;
    let result = match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

/// Ordering for `< <= > >=`: dates compare to dates, everything else
/// must coerce to a number.
pub fn compare(left: &Value, right: &Value, range: Range) -> Result<Ordering, RuntimeError> {
    match (left, right) {
        (Value::DateTime(l), Value::DateTime(r)) => Ok(l.cmp(r)),
        _ => Ok(to_number(left, range)?.cmp(&to_number(right, range)?)),
    }
}

/// Numeric coercion for comparisons and numeric builtins: numbers pass
/// through, strings are parsed; anything else is a runtime error.
pub fn to_number(value: &Value, range: Range) -> Result<Number, RuntimeError> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::String(s) => s.trim().parse::<f64>().map(Number::new).map_err(|_| {
            RuntimeError::InvalidType {
                expected: "number",
                found: "string",
                range,
            }
        }),
        other => Err(RuntimeError::InvalidType {
            expected: "number",
            found: other.name(),
            range,
        }),
    }
}

pub fn negate(value: Value, range: Range) -> Result<Value, RuntimeError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Number(n) => Ok(Value::Number(-n)),
        Value::List(items) => Ok(Value::List(
            items
                .into_iter()
                .map(|v| negate(v, range))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        other => Err(RuntimeError::InvalidType {
            expected: "number",
            found: other.name(),
            range,
        }),
    }
}

pub fn not(value: &Value) -> Value {
    Value::Bool(!value.is_truthy())
}

fn invalid_types(op: BinaryOp, left: &Value, right: &Value, range: Range) -> RuntimeError {
    RuntimeError::InvalidTypes {
        op: op.name(),
        left: left.name(),
        right: right.name(),
        range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn num(n: f64) -> Value {
        Value::from(n)
    }

    fn op(op: BinaryOp, l: Value, r: Value) -> Result<Value, RuntimeError> {
        binary_op(op, l, r, Range::default())
    }

    #[rstest]
    #[case(num(1.0), Value::Null)]
    #[case(Value::Null, num(1.0))]
    #[case(Value::Null, Value::Null)]
    fn test_arithmetic_null_propagation(#[case] l: Value, #[case] r: Value) {
        assert_eq!(op(BinaryOp::Add, l.clone(), r.clone()).unwrap(), Value::Null);
        assert_eq!(op(BinaryOp::Mul, l, r).unwrap(), Value::Null);
    }

    #[test]
    fn test_string_concat_treats_null_as_empty() {
        assert_eq!(
            op(BinaryOp::Add, Value::from("Hello"), Value::Null).unwrap(),
            Value::from("Hello")
        );
        assert_eq!(
            op(BinaryOp::Add, Value::Null, Value::from("Hello")).unwrap(),
            Value::from("Hello")
        );
        assert_eq!(
            op(BinaryOp::Add, Value::from("n = "), num(7.0)).unwrap(),
            Value::from("n = 7")
        );
    }

    #[test]
    fn test_list_broadcast() {
        let list = Value::List(vec![num(5.0), num(3.0), num(2.0), num(1.0)]);
        let expected = Value::List(vec![num(7.0), num(5.0), num(4.0), num(3.0)]);
        assert_eq!(op(BinaryOp::Add, list, num(2.0)).unwrap(), expected);
    }

    #[test]
    fn test_elementwise_lists_require_equal_length() {
        let a = Value::List(vec![num(1.0), num(2.0)]);
        let b = Value::List(vec![num(1.0)]);
        assert!(matches!(
            op(BinaryOp::Add, a, b),
            Err(RuntimeError::UnequalListLengths { left: 2, right: 1, .. })
        ));
    }

    #[rstest]
    #[case(BinaryOp::Div)]
    #[case(BinaryOp::Mod)]
    fn test_zero_division(#[case] o: BinaryOp) {
        assert!(matches!(
            op(o, num(1.0), num(0.0)),
            Err(RuntimeError::ZeroDivision(_))
        ));
    }

    // The asymmetric three-valued OR.
    #[rstest]
    #[case(Value::Null, Value::Bool(false), Value::Bool(false))]
    #[case(Value::Bool(false), Value::Null, Value::Null)]
    #[case(Value::Bool(true), Value::Null, Value::Bool(true))]
    #[case(Value::Null, Value::Bool(true), Value::Bool(true))]
    #[case(Value::Bool(false), Value::Bool(false), Value::Bool(false))]
    fn test_or_truth_table(#[case] l: Value, #[case] r: Value, #[case] expected: Value) {
        assert_eq!(op(BinaryOp::Or, l, r).unwrap(), expected);
    }

    #[rstest]
    #[case(Value::Null, Value::Bool(true), false)]
    #[case(Value::Bool(true), Value::Null, false)]
    #[case(Value::Bool(false), Value::Null, false)]
    #[case(Value::Null, Value::Bool(false), false)]
    #[case(Value::Null, Value::Null, false)]
    #[case(Value::Bool(true), Value::Bool(true), true)]
    fn test_and_truth_table(#[case] l: Value, #[case] r: Value, #[case] expected: bool) {
        assert_eq!(op(BinaryOp::And, l, r).unwrap(), Value::Bool(expected));
    }

    #[test]
    fn test_not_null_is_true() {
        assert_eq!(not(&Value::Null), Value::Bool(true));
    }

    #[test]
    fn test_comparison_coerces_strings() {
        assert_eq!(
            op(BinaryOp::Lt, Value::from("2"), num(10.0)).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_comparison_rejects_non_numeric() {
        assert!(matches!(
            op(BinaryOp::Lt, Value::Bool(true), num(1.0)),
            Err(RuntimeError::InvalidType { .. })
        ));
    }

    #[test]
    fn test_negate_broadcasts() {
        let list = Value::List(vec![num(1.0), num(2.0)]);
        assert_eq!(
            negate(list, Range::default()).unwrap(),
            Value::List(vec![num(-1.0), num(-2.0)])
        );
    }
}
