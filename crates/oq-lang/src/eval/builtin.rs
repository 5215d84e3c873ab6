use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::LazyLock;

use chrono::{Datelike, FixedOffset, TimeZone, Timelike, Utc};
use compact_str::CompactString;
use rustc_hash::FxHashMap;

use crate::model::{ModelHandle, ObjectAccess};
use crate::number::Number;
use crate::range::Range;

use super::error::RuntimeError;
use super::semantics;
use super::value::Value;

/// Context handed to first-order builtins: the object-model access
/// capability and the two timezone offsets used by date builtins.
pub struct BuiltinCtx<'a> {
    pub access: &'a dyn ObjectAccess,
    pub user_offset: FixedOffset,
    pub system_offset: FixedOffset,
}

pub type BuiltinFn = fn(&BuiltinCtx, Range, Vec<Value>) -> Result<Value, RuntimeError>;

#[derive(Debug, Clone, Copy)]
pub struct ParamNum {
    pub min: usize,
    pub max: Option<usize>,
}

impl ParamNum {
    pub const fn fixed(n: usize) -> Self {
        ParamNum {
            min: n,
            max: Some(n),
        }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        ParamNum {
            min,
            max: Some(max),
        }
    }

    pub const VARIADIC: Self = ParamNum { min: 0, max: None };

    pub fn check(&self, name: &str, got: usize, range: Range) -> Result<(), RuntimeError> {
        let ok = got >= self.min && self.max.is_none_or(|m| got <= m);
        if ok {
            Ok(())
        } else {
            Err(RuntimeError::InvalidNumberOfArguments {
                name: name.into(),
                expected: self.describe(),
                got,
                range,
            })
        }
    }

    fn describe(&self) -> String {
        match self.max {
            Some(max) if max == self.min => max.to_string(),
            Some(max) => format!("{} to {}", self.min, max),
            None => format!("at least {}", self.min),
        }
    }
}

pub struct BuiltinFunction {
    pub params: ParamNum,
    pub func: BuiltinFn,
}

/// Builtins whose semantics need the evaluator itself (they call user
/// functions); dispatched inside the evaluator, not through the table.
pub const HIGHER_ORDER: &[&str] = &[
    "map", "filter", "reduce", "sort", "groupBy", "indexBy", "traverse", "apply",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains_key(name) || HIGHER_ORDER.contains(&name)
}

/// Builtins with observable effects or ambient inputs; the constant
/// folder must not evaluate these at compile time.
pub fn is_impure(name: &str) -> bool {
    matches!(
        name,
        "now" | "new" | "set" | "add" | "delete" | "copy" | "instanceOf" | "referers" | "get"
    )
}

macro_rules! builtin {
    ($map:ident, $name:literal, $params:expr, $func:expr) => {
        $map.insert(
            CompactString::const_new($name),
            BuiltinFunction {
                params: $params,
                func: $func,
            },
        );
    };
}

pub static BUILTINS: LazyLock<FxHashMap<CompactString, BuiltinFunction>> = LazyLock::new(|| {
    let mut map: FxHashMap<CompactString, BuiltinFunction> = FxHashMap::default();

    builtin!(map, "list", ParamNum::VARIADIC, |_, _, args| Ok(
        Value::List(args)
    ));
    builtin!(map, "union", ParamNum::VARIADIC, |_, _, args| {
        Ok(Value::set_of(
            args.into_iter().flat_map(Value::into_sequence),
        ))
    });
    builtin!(map, "none", ParamNum::fixed(0), |_, _, _| Ok(Value::Set(
        Vec::new()
    )));
    builtin!(map, "singleton", ParamNum::fixed(1), |_, _, mut args| {
        Ok(match args.remove(0) {
            Value::Null => Value::Set(Vec::new()),
            value => Value::Set(vec![value]),
        })
    });
    builtin!(map, "size", ParamNum::fixed(1), |_, _, args| Ok(
        Value::from(args[0].size())
    ));
    builtin!(map, "singleElement", ParamNum::fixed(1), single_element);
    builtin!(map, "sum", ParamNum::VARIADIC, sum);
    builtin!(map, "min", ParamNum::VARIADIC, |_, range, args| {
        fold_extreme(args, range, Ordering::Less)
    });
    builtin!(map, "max", ParamNum::VARIADIC, |_, range, args| {
        fold_extreme(args, range, Ordering::Greater)
    });
    builtin!(map, "average", ParamNum::VARIADIC, average);
    builtin!(map, "first", ParamNum::fixed(1), |_, _, mut args| {
        let mut seq = args.remove(0).into_sequence();
        Ok(if seq.is_empty() {
            Value::Null
        } else {
            seq.remove(0)
        })
    });
    builtin!(map, "last", ParamNum::fixed(1), |_, _, mut args| {
        Ok(args.remove(0).into_sequence().pop().unwrap_or(Value::Null))
    });
    builtin!(map, "reverse", ParamNum::fixed(1), |_, _, mut args| {
        let mut seq = args.remove(0).into_sequence();
        seq.reverse();
        Ok(Value::List(seq))
    });
    builtin!(map, "distinct", ParamNum::fixed(1), |_, _, mut args| {
        let mut out: Vec<Value> = Vec::new();
        for item in args.remove(0).into_sequence() {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        Ok(Value::List(out))
    });
    builtin!(map, "concat", ParamNum::VARIADIC, |_, _, args| {
        Ok(Value::List(
            args.into_iter()
                .flat_map(Value::into_sequence)
                .filter(|v| !matches!(v, Value::Null))
                .collect(),
        ))
    });
    builtin!(map, "flatten", ParamNum::fixed(1), |_, _, mut args| {
        let mut out = Vec::new();
        flatten_into(args.remove(0), &mut out);
        Ok(Value::List(out))
    });
    builtin!(map, "join", ParamNum::range(1, 2), |_, _, mut args| {
        let sep = if args.len() == 2 {
            match args.pop() {
                Some(Value::String(s)) => s,
                Some(other) => other.to_display_string(),
                None => unreachable!(),
            }
        } else {
            String::new()
        };
        let parts: Vec<String> = args
            .remove(0)
            .into_sequence()
            .iter()
            .map(Value::to_display_string)
            .collect();
        Ok(Value::String(parts.join(&sep)))
    });
    builtin!(map, "contains", ParamNum::fixed(2), contains);
    builtin!(map, "get", ParamNum::fixed(2), get_value);
    builtin!(map, "keys", ParamNum::fixed(1), |_, range, args| {
        match &args[0] {
            Value::Struct(fields) => Ok(Value::List(
                fields
                    .iter()
                    .map(|(k, _)| Value::String(k.to_string()))
                    .collect(),
            )),
            Value::Null => Ok(Value::Null),
            other => Err(invalid_type("struct", other, range)),
        }
    });
    builtin!(map, "values", ParamNum::fixed(1), |_, range, args| {
        match &args[0] {
            Value::Struct(fields) => {
                Ok(Value::List(fields.iter().map(|(_, v)| v.clone()).collect()))
            }
            Value::Null => Ok(Value::Null),
            other => Err(invalid_type("struct", other, range)),
        }
    });
    builtin!(map, "desc", ParamNum::fixed(1), |_, _, mut args| {
        Ok(match args.remove(0) {
            Value::Desc(inner) => (*inner).clone(),
            value => Value::Desc(Rc::new(value)),
        })
    });

    builtin!(map, "toBoolean", ParamNum::fixed(1), |_, _, args| Ok(
        Value::Bool(args[0].is_truthy())
    ));
    builtin!(map, "toNumber", ParamNum::fixed(1), |_, range, args| {
        match &args[0] {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::from(if *b { 1.0 } else { 0.0 })),
            other => Ok(Value::Number(semantics::to_number(other, range)?)),
        }
    });
    builtin!(map, "toString", ParamNum::fixed(1), |_, _, args| Ok(
        Value::String(args[0].to_display_string())
    ));
    builtin!(map, "not", ParamNum::fixed(1), |_, _, args| Ok(
        semantics::not(&args[0])
    ));

    builtin!(map, "abs", ParamNum::fixed(1), |_, range, args| {
        numeric_unary(&args[0], range, |n| n.abs())
    });
    builtin!(map, "round", ParamNum::fixed(1), |_, range, args| {
        numeric_unary(&args[0], range, |n| n.round())
    });
    builtin!(map, "floor", ParamNum::fixed(1), |_, range, args| {
        numeric_unary(&args[0], range, |n| n.floor())
    });
    builtin!(map, "ceiling", ParamNum::fixed(1), |_, range, args| {
        numeric_unary(&args[0], range, |n| n.ceil())
    });
    builtin!(map, "sqrt", ParamNum::fixed(1), |_, range, args| {
        numeric_unary(&args[0], range, |n| n.sqrt())
    });
    builtin!(map, "pow", ParamNum::fixed(2), |_, range, args| {
        match (&args[0], &args[1]) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (base, exp) => {
                let base = semantics::to_number(base, range)?;
                let exp = semantics::to_number(exp, range)?;
                Ok(Value::from(base.value().powf(exp.value())))
            }
        }
    });

    builtin!(map, "subString", ParamNum::range(2, 3), sub_string);
    builtin!(map, "toUpperCase", ParamNum::fixed(1), |_, range, args| {
        string_unary(&args[0], range, |s| s.to_uppercase())
    });
    builtin!(map, "toLowerCase", ParamNum::fixed(1), |_, range, args| {
        string_unary(&args[0], range, |s| s.to_lowercase())
    });
    builtin!(map, "trim", ParamNum::fixed(1), |_, range, args| {
        string_unary(&args[0], range, |s| s.trim().to_string())
    });
    builtin!(map, "length", ParamNum::fixed(1), |_, _, args| {
        Ok(match &args[0] {
            Value::String(s) => Value::from(s.chars().count()),
            other => Value::from(other.size()),
        })
    });
    builtin!(map, "startsWith", ParamNum::fixed(2), |_, range, args| {
        match (&args[0], &args[1]) {
            (Value::Null, _) => Ok(Value::Bool(false)),
            (Value::String(s), Value::String(prefix)) => Ok(Value::Bool(s.starts_with(prefix))),
            (other, _) => Err(invalid_type("string", other, range)),
        }
    });
    builtin!(map, "endsWith", ParamNum::fixed(2), |_, range, args| {
        match (&args[0], &args[1]) {
            (Value::Null, _) => Ok(Value::Bool(false)),
            (Value::String(s), Value::String(suffix)) => Ok(Value::Bool(s.ends_with(suffix))),
            (other, _) => Err(invalid_type("string", other, range)),
        }
    });
    builtin!(map, "replace", ParamNum::fixed(3), |_, range, args| {
        match (&args[0], &args[1], &args[2]) {
            (Value::Null, _, _) => Ok(Value::Null),
            (Value::String(s), Value::String(from), Value::String(to)) => {
                Ok(Value::String(s.replace(from, to)))
            }
            (other, _, _) => Err(invalid_type("string", other, range)),
        }
    });
    builtin!(map, "split", ParamNum::fixed(2), |_, range, args| {
        match (&args[0], &args[1]) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::String(s), Value::String(sep)) => Ok(Value::List(
                s.split(sep.as_str()).map(Value::from).collect(),
            )),
            (other, _) => Err(invalid_type("string", other, range)),
        }
    });

    builtin!(map, "now", ParamNum::fixed(0), |ctx, _, _| Ok(
        Value::DateTime(Utc::now().with_timezone(&ctx.user_offset))
    ));
    builtin!(map, "date", ParamNum::range(3, 6), date);
    builtin!(map, "dateField", ParamNum::fixed(2), date_field);
    builtin!(map, "toSystemTime", ParamNum::fixed(1), |ctx, range, args| {
        match &args[0] {
            Value::Null => Ok(Value::Null),
            Value::DateTime(d) => Ok(Value::DateTime(d.with_timezone(&ctx.system_offset))),
            other => Err(invalid_type("date", other, range)),
        }
    });
    builtin!(map, "toUserTime", ParamNum::fixed(1), |ctx, range, args| {
        match &args[0] {
            Value::Null => Ok(Value::Null),
            Value::DateTime(d) => Ok(Value::DateTime(d.with_timezone(&ctx.user_offset))),
            other => Err(invalid_type("date", other, range)),
        }
    });

    builtin!(map, "new", ParamNum::fixed(1), |ctx, range, args| {
        let handle = as_model(&args[0], range)?;
        ctx.access
            .new_object(handle)
            .map_err(|e| RuntimeError::access(e, range))
    });
    builtin!(map, "set", ParamNum::fixed(3), |ctx, range, mut args| {
        let value = args.pop().unwrap_or(Value::Null);
        let attr = as_string(&args[1], range)?;
        let handle = as_model(&args[0], range)?;
        ctx.access
            .set(handle, &attr, value)
            .map_err(|e| RuntimeError::access(e, range))
    });
    builtin!(map, "add", ParamNum::fixed(3), |ctx, range, mut args| {
        let value = args.pop().unwrap_or(Value::Null);
        let attr = as_string(&args[1], range)?;
        let handle = as_model(&args[0], range)?;
        ctx.access
            .add(handle, &attr, value)
            .map_err(|e| RuntimeError::access(e, range))
    });
    builtin!(map, "delete", ParamNum::fixed(1), |ctx, range, args| {
        let handle = as_model(&args[0], range)?;
        ctx.access
            .delete(handle)
            .map_err(|e| RuntimeError::access(e, range))
    });
    builtin!(map, "copy", ParamNum::fixed(1), |ctx, range, args| {
        let handle = as_model(&args[0], range)?;
        ctx.access
            .copy(handle)
            .map_err(|e| RuntimeError::access(e, range))
    });
    builtin!(map, "instanceOf", ParamNum::fixed(2), |ctx, range, args| {
        let handle = as_model(&args[0], range)?;
        let type_handle = as_model(&args[1], range)?;
        ctx.access
            .instance_of(handle, type_handle)
            .map(Value::Bool)
            .map_err(|e| RuntimeError::access(e, range))
    });
    builtin!(map, "referers", ParamNum::fixed(2), |ctx, range, args| {
        let attr = as_string(&args[1], range)?;
        let handle = as_model(&args[0], range)?;
        ctx.access
            .referers(handle, &attr)
            .map_err(|e| RuntimeError::access(e, range))
    });

    builtin!(map, "regex", ParamNum::fixed(1), |_, range, args| {
        let pattern = as_string(&args[0], range)?;
        regex_lite::Regex::new(&pattern)
            .map(|r| Value::Regex(Rc::new(r)))
            .map_err(|e| RuntimeError::InvalidRegex {
                pattern,
                message: e.to_string(),
                range,
            })
    });
    builtin!(map, "regexSearch", ParamNum::fixed(2), regex_search);
    builtin!(map, "regexGroup", ParamNum::fixed(2), |_, range, args| {
        match &args[0] {
            Value::Null => Ok(Value::Null),
            Value::RegexMatch { groups, .. } => {
                let n = as_index(&args[1], range)?;
                Ok(groups
                    .get(n)
                    .cloned()
                    .flatten()
                    .map(Value::String)
                    .unwrap_or(Value::Null))
            }
            other => Err(invalid_type("match", other, range)),
        }
    });
    builtin!(map, "regexStart", ParamNum::range(1, 2), |_, range, args| {
        match_offset(&args, range, |(start, _)| start)
    });
    builtin!(map, "regexEnd", ParamNum::range(1, 2), |_, range, args| {
        match_offset(&args, range, |(_, end)| end)
    });
    builtin!(map, "regexReplace", ParamNum::fixed(3), |_, range, args| {
        match (&args[0], &args[1], &args[2]) {
            (_, Value::Null, _) => Ok(Value::Null),
            (Value::Regex(re), Value::String(text), Value::String(template)) => {
                Ok(Value::String(regex_replace_literal(re, text, template)))
            }
            (Value::Regex(_), Value::String(_), other) => {
                Err(invalid_type("string or function", other, range))
            }
            (other, _, _) => Err(invalid_type("regex", other, range)),
        }
    });

    map
});

fn invalid_type(expected: &'static str, found: &Value, range: Range) -> RuntimeError {
    RuntimeError::InvalidType {
        expected,
        found: found.name(),
        range,
    }
}

fn as_string(value: &Value, range: Range) -> Result<String, RuntimeError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(invalid_type("string", other, range)),
    }
}

fn as_model<'v>(value: &'v Value, range: Range) -> Result<&'v ModelHandle, RuntimeError> {
    match value {
        Value::Model(handle) => Ok(handle),
        other => Err(invalid_type("model", other, range)),
    }
}

fn as_index(value: &Value, range: Range) -> Result<usize, RuntimeError> {
    Ok(semantics::to_number(value, range)?.to_int().max(0) as usize)
}

fn numeric_unary(
    value: &Value,
    range: Range,
    f: fn(f64) -> f64,
) -> Result<Value, RuntimeError> {
    match value {
        Value::Null => Ok(Value::Null),
        other => {
            let n = semantics::to_number(other, range)?;
            Ok(Value::from(f(n.value())))
        }
    }
}

fn string_unary(
    value: &Value,
    range: Range,
    f: impl Fn(&str) -> String,
) -> Result<Value, RuntimeError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::String(s) => Ok(Value::String(f(s))),
        other => Err(invalid_type("string", other, range)),
    }
}

fn single_element(_: &BuiltinCtx, range: Range, mut args: Vec<Value>) -> Result<Value, RuntimeError> {
    let mut seq = args.remove(0).into_sequence();
    match seq.len() {
        0 => Ok(Value::Null),
        1 => Ok(seq.remove(0)),
        n => Err(RuntimeError::NotSingleElement { got: n, range }),
    }
}

fn non_null_elements(args: Vec<Value>) -> Vec<Value> {
    args.into_iter()
        .flat_map(Value::into_sequence)
        .filter(|v| !matches!(v, Value::Null))
        .collect()
}

fn sum(_: &BuiltinCtx, range: Range, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let mut total = Number::default();
    for value in non_null_elements(args) {
        total = total + semantics::to_number(&value, range)?;
    }
    Ok(Value::Number(total))
}

fn average(_: &BuiltinCtx, range: Range, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let values = non_null_elements(args);
    if values.is_empty() {
        return Ok(Value::Null);
    }
    let mut total = Number::default();
    for value in &values {
        total = total + semantics::to_number(value, range)?;
    }
    Ok(Value::from(total.value() / values.len() as f64))
}

fn fold_extreme(args: Vec<Value>, range: Range, keep: Ordering) -> Result<Value, RuntimeError> {
    let mut best: Option<Value> = None;
    for value in non_null_elements(args) {
        best = Some(match best {
            None => value,
            Some(current) => {
                if semantics::compare(&value, &current, range)? == keep {
                    value
                } else {
                    current
                }
            }
        });
    }
    Ok(best.unwrap_or(Value::Null))
}

fn flatten_into(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Null => {}
        Value::List(items) | Value::Set(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        other => out.push(other),
    }
}

fn contains(_: &BuiltinCtx, range: Range, args: Vec<Value>) -> Result<Value, RuntimeError> {
    match (&args[0], &args[1]) {
        (Value::Null, _) => Ok(Value::Bool(false)),
        (Value::String(s), Value::String(needle)) => Ok(Value::Bool(s.contains(needle.as_str()))),
        (Value::String(_), other) => Err(invalid_type("string", other, range)),
        (Value::List(items) | Value::Set(items), needle) => {
            Ok(Value::Bool(items.contains(needle)))
        }
        (Value::Struct(fields), Value::String(key)) => {
            Ok(Value::Bool(fields.iter().any(|(k, _)| k == key)))
        }
        (other, _) => Err(invalid_type("collection", other, range)),
    }
}

fn get_value(ctx: &BuiltinCtx, range: Range, args: Vec<Value>) -> Result<Value, RuntimeError> {
    match (&args[0], &args[1]) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Struct(fields), Value::String(key)) => Ok(fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)),
        (Value::List(items) | Value::Set(items), index) => {
            let i = semantics::to_number(index, range)?.to_int();
            let i = if i < 0 { items.len() as i64 + i } else { i };
            Ok(items.get(i.max(0) as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::Model(handle), Value::String(attr)) => ctx
            .access
            .get(handle, attr)
            .map_err(|e| RuntimeError::access(e, range)),
        (Value::RegexMatch { groups, .. }, index) => {
            let i = as_index(index, range)?;
            Ok(groups
                .get(i)
                .cloned()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null))
        }
        (other, _) => Err(invalid_type("struct, list or model", other, range)),
    }
}

fn sub_string(_: &BuiltinCtx, range: Range, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let s = match &args[0] {
        Value::Null => return Ok(Value::Null),
        Value::String(s) => s,
        other => return Err(invalid_type("string", other, range)),
    };
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let clamp = |i: i64| -> usize {
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len) as usize
    };
    let from = clamp(semantics::to_number(&args[1], range)?.to_int());
    let to = match args.get(2) {
        Some(v) => clamp(semantics::to_number(v, range)?.to_int()),
        None => len as usize,
    };
    if from >= to {
        return Ok(Value::String(String::new()));
    }
    Ok(Value::String(chars[from..to].iter().collect()))
}

fn date(ctx: &BuiltinCtx, range: Range, args: Vec<Value>) -> Result<Value, RuntimeError> {
    if args.len() != 3 && args.len() != 6 {
        return Err(RuntimeError::InvalidNumberOfArguments {
            name: "date".into(),
            expected: "3 or 6".to_string(),
            got: args.len(),
            range,
        });
    }
    let mut fields = [0i64; 6];
    for (i, arg) in args.iter().enumerate() {
        fields[i] = semantics::to_number(arg, range)?.to_int();
    }
    ctx.user_offset
        .with_ymd_and_hms(
            fields[0] as i32,
            fields[1] as u32,
            fields[2] as u32,
            fields[3] as u32,
            fields[4] as u32,
            fields[5] as u32,
        )
        .single()
        .map(Value::DateTime)
        .ok_or_else(|| RuntimeError::InvalidDate {
            message: format!(
                "{}-{}-{} {}:{}:{} is not a valid date",
                fields[0], fields[1], fields[2], fields[3], fields[4], fields[5]
            ),
            range,
        })
}

fn date_field(_: &BuiltinCtx, range: Range, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let d = match &args[0] {
        Value::Null => return Ok(Value::Null),
        Value::DateTime(d) => d,
        other => return Err(invalid_type("date", other, range)),
    };
    let field = as_string(&args[1], range)?;
    let value = match field.as_str() {
        "year" => d.year() as i64,
        "month" => d.month() as i64,
        "day" => d.day() as i64,
        "hour" => d.hour() as i64,
        "minute" => d.minute() as i64,
        "second" => d.second() as i64,
        "weekday" => d.weekday().number_from_monday() as i64,
        _ => {
            return Err(RuntimeError::InvalidDate {
                message: format!("unknown date field `{field}`"),
                range,
            });
        }
    };
    Ok(Value::from(value))
}

/// Builds a match value from regex captures: group texts plus byte
/// offsets, index 0 being the whole match.
pub fn match_value(caps: &regex_lite::Captures) -> Value {
    let mut groups = Vec::new();
    let mut offsets = Vec::new();
    for group in caps.iter() {
        groups.push(group.map(|m| m.as_str().to_string()));
        offsets.push(group.map(|m| (m.start(), m.end())));
    }
    Value::RegexMatch { groups, offsets }
}

fn regex_search(_: &BuiltinCtx, range: Range, args: Vec<Value>) -> Result<Value, RuntimeError> {
    match (&args[0], &args[1]) {
        (_, Value::Null) => Ok(Value::Null),
        (Value::Regex(re), Value::String(text)) => Ok(re
            .captures(text)
            .map(|caps| match_value(&caps))
            .unwrap_or(Value::Null)),
        (Value::Regex(_), other) => Err(invalid_type("string", other, range)),
        (other, _) => Err(invalid_type("regex", other, range)),
    }
}

fn match_offset(
    args: &[Value],
    range: Range,
    pick: fn((usize, usize)) -> usize,
) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Null => Ok(Value::Null),
        Value::RegexMatch { offsets, .. } => {
            let n = match args.get(1) {
                Some(v) => as_index(v, range)?,
                None => 0,
            };
            Ok(offsets
                .get(n)
                .copied()
                .flatten()
                .map(|o| Value::from(pick(o)))
                .unwrap_or(Value::Null))
        }
        other => Err(invalid_type("match", other, range)),
    }
}

/// Replaces every match of `re` in `text`, expanding `$N` references
/// in the template. `$$` is a literal dollar. A reference to a group
/// that did not participate in the match ends expansion for that
/// occurrence.
pub fn regex_replace_literal(re: &regex_lite::Regex, text: &str, template: &str) -> String {
    let mut out = String::new();
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let whole = caps.get(0).expect("group 0 always participates");
        out.push_str(&text[last..whole.start()]);
        expand_template(&caps, template, &mut out);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    out
}

fn expand_template(caps: &regex_lite::Captures, template: &str, out: &mut String) {
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'$') {
            chars.next();
            out.push('$');
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        if digits.is_empty() {
            out.push('$');
            continue;
        }
        let n: usize = digits.parse().unwrap_or(usize::MAX);
        match caps.get(n) {
            Some(group) => out.push_str(group.as_str()),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MemoryModel;
    use rstest::rstest;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let model = MemoryModel::new();
        let offset = FixedOffset::east_opt(0).unwrap();
        let ctx = BuiltinCtx {
            access: &model,
            user_offset: offset,
            system_offset: offset,
        };
        let b = BUILTINS.get(name).unwrap();
        b.params.check(name, args.len(), Range::default())?;
        (b.func)(&ctx, Range::default(), args)
    }

    fn num(n: f64) -> Value {
        Value::from(n)
    }

    #[test]
    fn test_sum_ignores_nulls_and_empty_is_zero() {
        assert_eq!(
            call("sum", vec![num(3.0), num(5.0), Value::Null]).unwrap(),
            num(8.0)
        );
        assert_eq!(call("sum", vec![]).unwrap(), num(0.0));
    }

    #[test]
    fn test_average_ignores_nulls_and_empty_is_null() {
        assert_eq!(call("average", vec![Value::Null, num(3.0)]).unwrap(), num(3.0));
        assert_eq!(call("average", vec![]).unwrap(), Value::Null);
    }

    #[test]
    fn test_min_max() {
        assert_eq!(call("min", vec![num(3.0), num(1.0), num(2.0)]).unwrap(), num(1.0));
        assert_eq!(call("max", vec![num(3.0), Value::Null]).unwrap(), num(3.0));
        assert_eq!(call("min", vec![]).unwrap(), Value::Null);
    }

    #[test]
    fn test_singleton_of_null_is_empty() {
        let s = call("singleton", vec![Value::Null]).unwrap();
        assert_eq!(call("size", vec![s]).unwrap(), num(0.0));
    }

    #[test]
    fn test_single_element() {
        assert_eq!(
            call("singleElement", vec![Value::List(vec![num(1.0)])]).unwrap(),
            num(1.0)
        );
        assert_eq!(
            call("singleElement", vec![Value::Null]).unwrap(),
            Value::Null
        );
        assert!(matches!(
            call("singleElement", vec![Value::List(vec![num(1.0), num(2.0)])]),
            Err(RuntimeError::NotSingleElement { got: 2, .. })
        ));
    }

    #[rstest]
    #[case(vec![Value::from("hello"), num(1.0)], "ello")]
    #[case(vec![Value::from("hello"), num(1.0), num(3.0)], "el")]
    #[case(vec![Value::from("hello"), num(-3.0)], "llo")]
    #[case(vec![Value::from("hello"), num(0.0), num(-1.0)], "hell")]
    #[case(vec![Value::from("hello"), num(3.0), num(2.0)], "")]
    fn test_sub_string(#[case] args: Vec<Value>, #[case] expected: &str) {
        assert_eq!(call("subString", args).unwrap(), Value::from(expected));
    }

    #[test]
    fn test_concat_drops_null_members() {
        let result = call(
            "concat",
            vec![
                Value::List(vec![num(1.0), Value::Null]),
                Value::Null,
                num(2.0),
            ],
        )
        .unwrap();
        assert_eq!(result, Value::List(vec![num(1.0), num(2.0)]));
    }

    #[test]
    fn test_flatten() {
        let nested = Value::List(vec![
            Value::List(vec![num(1.0), num(2.0)]),
            Value::Null,
            num(3.0),
        ]);
        assert_eq!(
            call("flatten", vec![nested]).unwrap(),
            Value::List(vec![num(1.0), num(2.0), num(3.0)])
        );
    }

    #[test]
    fn test_union_deduplicates() {
        let result = call(
            "union",
            vec![
                Value::List(vec![num(1.0), num(2.0)]),
                Value::List(vec![num(2.0), num(3.0)]),
            ],
        )
        .unwrap();
        assert_eq!(result.size(), 3);
    }

    #[test]
    fn test_desc_is_self_cancelling() {
        let c = Value::Builtin("toNumber".into());
        let once = call("desc", vec![c.clone()]).unwrap();
        assert!(matches!(once, Value::Desc(_)));
        let twice = call("desc", vec![once]).unwrap();
        assert_eq!(twice, c);
    }

    #[test]
    fn test_regex_replace_group_expansion() {
        let re = regex_lite::Regex::new("a(b+)?c").unwrap();
        assert_eq!(regex_replace_literal(&re, "xacyabbcz", "_$1_"), "x_y_bb_z");
    }

    #[test]
    fn test_regex_replace_whole_match_and_dollar() {
        let re = regex_lite::Regex::new("b+").unwrap();
        assert_eq!(regex_replace_literal(&re, "abca", "<$0>"), "a<b>ca");
        assert_eq!(regex_replace_literal(&re, "abca", "$$"), "a$ca");
    }

    #[test]
    fn test_regex_search_and_group() {
        let re = call("regex", vec![Value::from("a(b+)c")]).unwrap();
        let m = call("regexSearch", vec![re.clone(), Value::from("xabbcy")]).unwrap();
        assert_eq!(call("regexGroup", vec![m.clone(), num(1.0)]).unwrap(), Value::from("bb"));
        assert_eq!(call("regexStart", vec![m.clone()]).unwrap(), num(1.0));
        assert_eq!(call("regexEnd", vec![m]).unwrap(), num(5.0));
        assert_eq!(
            call("regexSearch", vec![re, Value::Null]).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_null_regex_pattern_is_an_error() {
        assert!(matches!(
            call("regex", vec![Value::Null]),
            Err(RuntimeError::InvalidType { .. })
        ));
    }

    #[test]
    fn test_date_construction_and_fields() {
        let d = call("date", vec![num(2024.0), num(2.0), num(29.0)]).unwrap();
        assert_eq!(call("dateField", vec![d.clone(), Value::from("year")]).unwrap(), num(2024.0));
        assert_eq!(call("dateField", vec![d, Value::from("month")]).unwrap(), num(2.0));
        assert!(matches!(
            call("date", vec![num(2023.0), num(2.0), num(29.0)]),
            Err(RuntimeError::InvalidDate { .. })
        ));
    }

    #[test]
    fn test_get_on_struct_list_and_null() {
        let s = Value::Struct(vec![("a".into(), num(1.0))]);
        assert_eq!(call("get", vec![s.clone(), Value::from("a")]).unwrap(), num(1.0));
        assert_eq!(call("get", vec![s, Value::from("b")]).unwrap(), Value::Null);
        let l = Value::List(vec![num(1.0), num(2.0)]);
        assert_eq!(call("get", vec![l.clone(), num(1.0)]).unwrap(), num(2.0));
        assert_eq!(call("get", vec![l.clone(), num(-1.0)]).unwrap(), num(2.0));
        assert_eq!(call("get", vec![l, num(9.0)]).unwrap(), Value::Null);
        assert_eq!(call("get", vec![Value::Null, num(0.0)]).unwrap(), Value::Null);
    }

    #[test]
    fn test_param_count_checking() {
        assert!(matches!(
            call("size", vec![]),
            Err(RuntimeError::InvalidNumberOfArguments { .. })
        ));
    }
}
