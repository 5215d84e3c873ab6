use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, FixedOffset};
use compact_str::CompactString;
use itertools::Itertools;

use crate::model::ModelHandle;
use crate::number::Number;
use crate::search_expr::{Ident, SearchNode};

use super::env::Env;

/// The runtime value. Equality is the language's semantic equality,
/// not plain structural equality: `Null` equals the empty collection,
/// a one-element collection equals its bare element, and `Set`
/// comparison disregards order.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Number(Number),
    String(String),
    Bool(bool),
    List(Vec<Value>),
    /// Unordered, deduplicated under semantic equality. Kept as a Vec
    /// because values are not hashable under semantic equality.
    Set(Vec<Value>),
    /// Insertion-ordered string-keyed record; keys unique, last
    /// assignment wins.
    Struct(Vec<(CompactString, Value)>),
    /// A closure: parameter, body and the defining environment.
    Function(Ident, SearchNode, Rc<RefCell<Env>>),
    Builtin(CompactString),
    /// Comparator marker produced by `desc()`; self-cancelling.
    Desc(Rc<Value>),
    Model(ModelHandle),
    DateTime(DateTime<FixedOffset>),
    Regex(Rc<regex_lite::Regex>),
    RegexMatch {
        groups: Vec<Option<String>>,
        offsets: Vec<Option<(usize, usize)>>,
    },
}

impl Value {
    pub fn name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bool(_) => "boolean",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Struct(_) => "struct",
            Value::Function(_, _, _) | Value::Builtin(_) | Value::Desc(_) => "function",
            Value::Model(_) => "model",
            Value::DateTime(_) => "date",
            Value::Regex(_) => "regex",
            Value::RegexMatch { .. } => "match",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
            Value::List(items) | Value::Set(items) => !items.is_empty(),
            Value::Struct(fields) => !fields.is_empty(),
            _ => true,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(
            self,
            Value::Function(_, _, _) | Value::Builtin(_) | Value::Desc(_)
        )
    }

    /// The value as a sequence: collections yield their elements,
    /// `Null` is empty, a bare scalar is a one-element sequence.
    pub fn into_sequence(self) -> Vec<Value> {
        match self {
            Value::Null => Vec::new(),
            Value::List(items) | Value::Set(items) => items,
            other => vec![other],
        }
    }

    /// Number of elements under sequence semantics.
    pub fn size(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::List(items) | Value::Set(items) => items.len(),
            Value::Struct(fields) => fields.len(),
            _ => 1,
        }
    }

    /// Builds a set, deduplicating under semantic equality.
    pub fn set_of(items: impl IntoIterator<Item = Value>) -> Value {
        let mut set: Vec<Value> = Vec::new();
        for item in items {
            if !set.contains(&item) {
                set.push(item);
            }
        }
        Value::Set(set)
    }

    /// String coercion used by `+` concatenation, templates and
    /// `toString`: `Null` becomes the empty string.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::List(items) | Value::Set(items) => {
                write!(f, "{}", items.iter().map(|v| v.to_string()).join(", "))
            }
            Value::Struct(fields) => {
                write!(
                    f,
                    "{{{}}}",
                    fields
                        .iter()
                        .map(|(k, v)| format!("{}: {}", k, v))
                        .join(", ")
                )
            }
            Value::Function(_, _, _) | Value::Builtin(_) | Value::Desc(_) => {
                write!(f, "<function>")
            }
            Value::Model(handle) => write!(f, "{}", handle.qualified_name),
            Value::DateTime(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Regex(r) => write!(f, "{}", r.as_str()),
            Value::RegexMatch { groups, .. } => {
                write!(f, "{}", groups.first().cloned().flatten().unwrap_or_default())
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        semantic_eq(self, other)
    }
}

fn set_eq(a: &[Value], b: &[Value]) -> bool {
    a.iter().all(|x| b.contains(x)) && b.iter().all(|y| a.contains(y))
}

fn struct_eq(a: &[(CompactString, Value)], b: &[(CompactString, Value)]) -> bool {
    a.len() == b.len()
        && a.iter().all(|(k, v)| {
            b.iter()
                .find(|(k2, _)| k2 == k)
                .is_some_and(|(_, v2)| v == v2)
        })
}

fn semantic_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Desc(x), _) => semantic_eq(x, b),
        (_, Value::Desc(y)) => semantic_eq(a, y),
        (Value::Null, Value::Null) => true,
        (Value::List(xs), Value::List(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| semantic_eq(x, y))
        }
        (Value::Set(xs), Value::Set(ys))
        | (Value::Set(xs), Value::List(ys))
        | (Value::List(ys), Value::Set(xs)) => set_eq(xs, ys),
        // Null/empty equivalence and singleton collapse.
        (Value::List(xs), y) | (y, Value::List(xs)) | (Value::Set(xs), y) | (y, Value::Set(xs)) => {
            match xs.len() {
                0 => matches!(y, Value::Null),
                1 => semantic_eq(&xs[0], y),
                _ => false,
            }
        }
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Struct(xs), Value::Struct(ys)) => struct_eq(xs, ys),
        (Value::Model(x), Value::Model(y)) => x == y,
        (Value::DateTime(x), Value::DateTime(y)) => x == y,
        (Value::Regex(x), Value::Regex(y)) => x.as_str() == y.as_str(),
        (
            Value::RegexMatch { groups: x, .. },
            Value::RegexMatch { groups: y, .. },
        ) => x == y,
        (Value::Function(p1, b1, _), Value::Function(p2, b2, _)) => {
            p1 == p2 && Rc::ptr_eq(&b1.expr, &b2.expr)
        }
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        _ => false,
    }
}

/// Total order used by the default `sort`. Values of different kinds
/// order by kind; this never fails, unlike the `<` operator.
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::DateTime(_) => 4,
            _ => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(Number::new(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
