pub mod builtin;
pub mod env;
pub mod error;
pub mod semantics;
pub mod value;

use std::cell::RefCell;
use std::rc::Rc;

use chrono::FixedOffset;
use compact_str::CompactString;
use log::trace;

use crate::ast::node::{BinaryOp, UnaryOp};
use crate::model::{ObjectAccess, OutputWriter};
use crate::range::Range;
use crate::search_expr::{SearchExpr, SearchNode, SearchTemplatePart};
use crate::template;

use builtin::{BUILTINS, BuiltinCtx};
use env::Env;
use error::RuntimeError;
use value::Value;

/// Maximum live evaluator recursion depth. Each unit of depth costs a
/// handful of native stack frames, so the limit has to fit inside a
/// default 2 MiB thread stack.
#[cfg(debug_assertions)]
pub const DEFAULT_MAX_CALL_DEPTH: u32 = 32; // Lower limit for the larger debug frames.
#[cfg(not(debug_assertions))]
pub const DEFAULT_MAX_CALL_DEPTH: u32 = 192;

/// The direct tree-walking interpreter. One instance serves a single
/// evaluation call; the constant folder drives the same code for its
/// compile-time evaluation, which is what keeps the two execution
/// paths in agreement.
pub struct Evaluator<'a> {
    access: &'a dyn ObjectAccess,
    writer: Option<&'a mut dyn OutputWriter>,
    user_offset: FixedOffset,
    system_offset: FixedOffset,
    max_depth: u32,
    depth: u32,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        access: &'a dyn ObjectAccess,
        writer: Option<&'a mut dyn OutputWriter>,
        user_offset: FixedOffset,
        system_offset: FixedOffset,
        max_depth: u32,
    ) -> Self {
        Evaluator {
            access,
            writer,
            user_offset,
            system_offset,
            max_depth,
            depth: 0,
        }
    }

    /// Evaluates a whole expression. When the expression evaluates to
    /// a function and arguments are supplied, the function is applied
    /// to them (curried); trailing unused arguments are ignored.
    pub fn evaluate(&mut self, node: &SearchNode, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let root = Env::new();
        let value = self.eval(node, &root)?;
        if value.is_function() && !args.is_empty() {
            self.apply(value, args, node.range)
        } else {
            Ok(value)
        }
    }

    /// Evaluates one node. Recursion is bounded by the call depth
    /// limit, so deeply nested input fails with `StackOverflow`
    /// instead of exhausting the native stack.
    pub fn eval(
        &mut self,
        node: &SearchNode,
        env: &Rc<RefCell<Env>>,
    ) -> Result<Value, RuntimeError> {
        self.enter(node.range)?;
        let result = self.eval_expr(node, env);
        self.leave();
        result
    }

    fn eval_expr(
        &mut self,
        node: &SearchNode,
        env: &Rc<RefCell<Env>>,
    ) -> Result<Value, RuntimeError> {
        match &*node.expr {
            SearchExpr::Const(value) => Ok(value.clone()),
            SearchExpr::Model(handle) => Ok(Value::Model(handle.clone())),
            SearchExpr::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.eval(item, env))
                    .collect::<Result<_, _>>()?,
            )),
            SearchExpr::Map(pairs) => {
                let mut fields: Vec<(CompactString, Value)> = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = CompactString::new(self.eval(key, env)?.to_display_string());
                    let value = self.eval(value, env)?;
                    match fields.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, v)) => *v = value,
                        None => fields.push((key, value)),
                    }
                }
                Ok(Value::Struct(fields))
            }
            SearchExpr::Lambda(param, body) => {
                Ok(Value::Function(param.clone(), body.clone(), Rc::clone(env)))
            }
            SearchExpr::Var(name) => {
                env.borrow()
                    .resolve(name)
                    .ok_or_else(|| RuntimeError::UndefinedVariable {
                        name: name.clone(),
                        range: node.range,
                    })
            }
            SearchExpr::Call(target, args) => {
                let callee = self.eval(target, env)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, env))
                    .collect::<Result<Vec<_>, _>>()?;
                self.apply(callee, args, node.range)
            }
            SearchExpr::Binary(BinaryOp::Or, left, right) => {
                let left = self.eval(left, env)?;
                if left.is_truthy() {
                    Ok(Value::Bool(true))
                } else {
                    let right = self.eval(right, env)?;
                    Ok(semantics::or_result(false, right))
                }
            }
            SearchExpr::Binary(BinaryOp::And, left, right) => {
                let left = self.eval(left, env)?;
                if !left.is_truthy() {
                    Ok(Value::Bool(false))
                } else {
                    let right = self.eval(right, env)?;
                    Ok(Value::Bool(right.is_truthy()))
                }
            }
            SearchExpr::Binary(op, left, right) => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                semantics::binary_op(*op, left, right, node.range)
            }
            SearchExpr::Unary(UnaryOp::Not, operand) => {
                Ok(semantics::not(&self.eval(operand, env)?))
            }
            SearchExpr::Unary(UnaryOp::Neg, operand) => {
                semantics::negate(self.eval(operand, env)?, node.range)
            }
            SearchExpr::Block(bindings, body) => {
                let frame = Env::with_parent(env);
                for (name, value) in bindings {
                    let value = self.eval(value, &frame)?;
                    frame.borrow_mut().define(name.clone(), value);
                }
                self.eval(body, &frame)
            }
            SearchExpr::If(cond, then, els) => {
                if self.eval(cond, env)?.is_truthy() {
                    self.eval(then, env)
                } else {
                    self.eval(els, env)
                }
            }
            SearchExpr::Switch {
                selector,
                cases,
                default,
            } => {
                let selector = selector
                    .as_ref()
                    .map(|s| self.eval(s, env))
                    .transpose()?;
                for (case, result) in cases {
                    let case = self.eval(case, env)?;
                    let hit = match &selector {
                        Some(selector) => *selector == case,
                        None => case.is_truthy(),
                    };
                    if hit {
                        return self.eval(result, env);
                    }
                }
                match default {
                    Some(default) => self.eval(default, env),
                    None => Ok(Value::Null),
                }
            }
            SearchExpr::Recursion { seed, step, bounds } => {
                let seed = self.eval(seed, env)?;
                let step = self.eval(step, env)?;
                let bounds = match bounds {
                    Some((from, to)) => {
                        let from = semantics::to_number(&self.eval(from, env)?, node.range)?;
                        let to = semantics::to_number(&self.eval(to, env)?, node.range)?;
                        Some((from.to_int(), to.to_int()))
                    }
                    None => None,
                };
                self.eval_recursion(seed, step, bounds, node.range)
            }
            SearchExpr::Template(parts) => self.eval_template(parts, env, node.range),
        }
    }

    /// Applies a callable to already-evaluated arguments.
    pub fn apply(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        range: Range,
    ) -> Result<Value, RuntimeError> {
        match callee {
            Value::Function(_, _, _) => self.apply_function(callee, args, range),
            Value::Builtin(name) => {
                let name = name.clone();
                self.call_builtin(&name, args, range)
            }
            other => Err(RuntimeError::InvalidType {
                expected: "function",
                found: other.name(),
                range,
            }),
        }
    }

    /// Curried application: each lambda binds one argument; when the
    /// body yields another function the next argument is consumed.
    /// Leftover arguments are silently ignored.
    fn apply_function(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        range: Range,
    ) -> Result<Value, RuntimeError> {
        self.enter(range)?;
        let mut args = if args.is_empty() {
            vec![Value::Null].into_iter()
        } else {
            args.into_iter()
        };
        let mut current = callee;
        let result = loop {
            match current {
                Value::Function(param, body, closure) => match args.next() {
                    Some(arg) => {
                        let frame = Env::with_parent(&closure);
                        frame.borrow_mut().define(param, arg);
                        current = self.eval(&body, &frame)?;
                    }
                    None => break Value::Function(param, body, closure),
                },
                done => break done,
            }
        };
        self.leave();
        Ok(result)
    }

    fn enter(&mut self, range: Range) -> Result<(), RuntimeError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            Err(RuntimeError::StackOverflow(range))
        } else {
            Ok(())
        }
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn ctx(&self) -> BuiltinCtx<'a> {
        BuiltinCtx {
            access: self.access,
            user_offset: self.user_offset,
            system_offset: self.system_offset,
        }
    }

    fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<Value>,
        range: Range,
    ) -> Result<Value, RuntimeError> {
        trace!("builtin {name}/{}", args.len());
        match name {
            "map" | "filter" => self.map_filter(name, args, range),
            "reduce" => self.reduce(args, range),
            "sort" => self.sort(args, range),
            "groupBy" => self.group_by(args, range),
            "indexBy" => self.index_by(args, range),
            "traverse" => self.traverse_call(args, range),
            "apply" => {
                let mut args = args;
                if args.is_empty() {
                    return Err(wrong_args("apply", "at least 1", 0, range));
                }
                let callee = args.remove(0);
                self.apply(callee, args, range)
            }
            "regexReplace" if args.len() == 3 && args[2].is_function() => {
                self.regex_replace_fn(args, range)
            }
            _ => {
                let builtin =
                    BUILTINS
                        .get(name)
                        .ok_or_else(|| RuntimeError::UnknownFunction {
                            name: name.into(),
                            range,
                        })?;
                builtin.params.check(name, args.len(), range)?;
                (builtin.func)(&self.ctx(), range, args)
            }
        }
    }

    fn map_filter(
        &mut self,
        name: &str,
        mut args: Vec<Value>,
        range: Range,
    ) -> Result<Value, RuntimeError> {
        if args.len() != 2 {
            return Err(wrong_args(name, "2", args.len(), range));
        }
        let f = args.pop().unwrap_or(Value::Null);
        let input = args.pop().unwrap_or(Value::Null);
        let keep_set = matches!(input, Value::Set(_));
        let mut out = Vec::new();
        for item in input.into_sequence() {
            if name == "map" {
                out.push(self.apply(f.clone(), vec![item], range)?);
            } else {
                let keep = self.apply(f.clone(), vec![item.clone()], range)?;
                if keep.is_truthy() {
                    out.push(item);
                }
            }
        }
        Ok(if keep_set {
            Value::set_of(out)
        } else {
            Value::List(out)
        })
    }

    fn reduce(&mut self, mut args: Vec<Value>, range: Range) -> Result<Value, RuntimeError> {
        if args.len() != 2 && args.len() != 3 {
            return Err(wrong_args("reduce", "2 or 3", args.len(), range));
        }
        let init = if args.len() == 3 { args.pop() } else { None };
        let f = args.pop().unwrap_or(Value::Null);
        let items = args.pop().unwrap_or(Value::Null).into_sequence();
        let mut items = items.into_iter();
        let mut acc = match init {
            Some(init) => init,
            None => match items.next() {
                Some(first) => first,
                None => return Ok(Value::Null),
            },
        };
        for item in items {
            acc = self.apply(f.clone(), vec![acc, item], range)?;
        }
        Ok(acc)
    }

    /// `sort(xs)` orders naturally; `sort(xs, keyFn)` orders by the
    /// extracted key; a `desc()`-wrapped key function inverts the
    /// order, and `desc(desc(k))` is `k` again.
    fn sort(&mut self, mut args: Vec<Value>, range: Range) -> Result<Value, RuntimeError> {
        if args.is_empty() || args.len() > 2 {
            return Err(wrong_args("sort", "1 or 2", args.len(), range));
        }
        let comparator = if args.len() == 2 { args.pop() } else { None };
        let items = args.pop().unwrap_or(Value::Null).into_sequence();

        let (key_fn, descending) = match comparator {
            Some(Value::Desc(inner)) => ((*inner).clone(), true),
            Some(other) => (other, false),
            None => (Value::Null, false),
        };

        let mut keyed: Vec<(Value, Value)> = Vec::with_capacity(items.len());
        for item in items {
            let key = if key_fn.is_function() {
                self.apply(key_fn.clone(), vec![item.clone()], range)?
            } else {
                item.clone()
            };
            keyed.push((key, item));
        }
        keyed.sort_by(|(a, _), (b, _)| value::total_cmp(a, b));
        if descending {
            keyed.reverse();
        }
        Ok(Value::List(keyed.into_iter().map(|(_, v)| v).collect()))
    }

    /// `indexBy(xs, keyFn[, mergeFn])`: later values win on collision
    /// unless a merge function combines them pairwise in encounter
    /// order.
    fn index_by(&mut self, mut args: Vec<Value>, range: Range) -> Result<Value, RuntimeError> {
        if args.len() != 2 && args.len() != 3 {
            return Err(wrong_args("indexBy", "2 or 3", args.len(), range));
        }
        let merge = if args.len() == 3 { args.pop() } else { None };
        let key_fn = args.pop().unwrap_or(Value::Null);
        let items = args.pop().unwrap_or(Value::Null).into_sequence();

        let mut fields: Vec<(CompactString, Value)> = Vec::new();
        for item in items {
            let key = self.apply(key_fn.clone(), vec![item.clone()], range)?;
            let key = CompactString::new(key.to_display_string());
            match fields.iter_mut().position(|(k, _)| *k == key) {
                Some(i) => {
                    let merged = match &merge {
                        Some(merge) => {
                            let existing = fields[i].1.clone();
                            self.apply(merge.clone(), vec![existing, item], range)?
                        }
                        None => item,
                    };
                    fields[i].1 = merged;
                }
                None => fields.push((key, item)),
            }
        }
        Ok(Value::Struct(fields))
    }

    /// `groupBy(xs, keyFn[, keyFn2, ...])`: indexBy with implicit list
    /// accumulation; additional key functions sub-group recursively.
    fn group_by(&mut self, mut args: Vec<Value>, range: Range) -> Result<Value, RuntimeError> {
        if args.len() < 2 {
            return Err(wrong_args("groupBy", "at least 2", args.len(), range));
        }
        let key_fns: Vec<Value> = args.split_off(1);
        let input = args.pop().unwrap_or(Value::Null);
        self.group_levels(input.into_sequence(), &key_fns, range)
    }

    fn group_levels(
        &mut self,
        items: Vec<Value>,
        key_fns: &[Value],
        range: Range,
    ) -> Result<Value, RuntimeError> {
        let (key_fn, rest) = match key_fns.split_first() {
            Some(split) => split,
            None => return Ok(Value::List(items)),
        };
        let mut groups: Vec<(CompactString, Vec<Value>)> = Vec::new();
        for item in items {
            let key = self.apply(key_fn.clone(), vec![item.clone()], range)?;
            let key = CompactString::new(key.to_display_string());
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(item),
                None => groups.push((key, vec![item])),
            }
        }
        let mut fields = Vec::with_capacity(groups.len());
        for (key, members) in groups {
            fields.push((key, self.group_levels(members, rest, range)?));
        }
        Ok(Value::Struct(fields))
    }

    /// Post-order tree reduction: for each node, combine its own value
    /// with the list of its children's reduced values.
    fn traverse_call(&mut self, mut args: Vec<Value>, range: Range) -> Result<Value, RuntimeError> {
        if args.len() != 4 {
            return Err(wrong_args("traverse", "4", args.len(), range));
        }
        let combine = args.pop().unwrap_or(Value::Null);
        let value_fn = args.pop().unwrap_or(Value::Null);
        let children = args.pop().unwrap_or(Value::Null);
        let node = args.pop().unwrap_or(Value::Null);
        self.traverse(node, &children, &value_fn, &combine, range)
    }

    fn traverse(
        &mut self,
        node: Value,
        children: &Value,
        value_fn: &Value,
        combine: &Value,
        range: Range,
    ) -> Result<Value, RuntimeError> {
        self.enter(range)?;
        let own = self.apply(value_fn.clone(), vec![node.clone()], range)?;
        let kids = self
            .apply(children.clone(), vec![node], range)?
            .into_sequence();
        let mut reduced = Vec::with_capacity(kids.len());
        for kid in kids {
            reduced.push(self.traverse(kid, children, value_fn, combine, range)?);
        }
        let result = self.apply(combine.clone(), vec![own, Value::List(reduced)], range);
        self.leave();
        result
    }

    /// Relation-following recursion. Without bounds, steps until no
    /// new elements appear (the accumulated set, seed included). With
    /// `(from, to)` bounds, collects only the elements whose depth
    /// falls inside the range, seed being depth 0.
    fn eval_recursion(
        &mut self,
        seed: Value,
        step: Value,
        bounds: Option<(i64, i64)>,
        range: Range,
    ) -> Result<Value, RuntimeError> {
        match bounds {
            None => {
                let mut acc: Vec<Value> = Vec::new();
                let mut frontier: Vec<Value> = Vec::new();
                for item in seed.into_sequence() {
                    if !acc.contains(&item) {
                        acc.push(item.clone());
                        frontier.push(item);
                    }
                }
                while !frontier.is_empty() {
                    let mut next = Vec::new();
                    for item in &frontier {
                        let out = self.apply(step.clone(), vec![item.clone()], range)?;
                        for value in out.into_sequence() {
                            if !acc.contains(&value) && !next.contains(&value) {
                                next.push(value);
                            }
                        }
                    }
                    acc.extend(next.iter().cloned());
                    frontier = next;
                }
                Ok(Value::Set(acc))
            }
            Some((from, to)) => {
                let mut result: Vec<Value> = Vec::new();
                let mut frontier = seed.into_sequence();
                let mut depth = 0i64;
                loop {
                    if frontier.is_empty() || depth > to {
                        break;
                    }
                    if depth >= from {
                        for item in &frontier {
                            if !result.contains(item) {
                                result.push(item.clone());
                            }
                        }
                    }
                    if depth == to {
                        break;
                    }
                    let mut next = Vec::new();
                    for item in &frontier {
                        let out = self.apply(step.clone(), vec![item.clone()], range)?;
                        for value in out.into_sequence() {
                            if !next.contains(&value) {
                                next.push(value);
                            }
                        }
                    }
                    frontier = next;
                    depth += 1;
                }
                Ok(Value::Set(result))
            }
        }
    }

    fn regex_replace_fn(
        &mut self,
        mut args: Vec<Value>,
        range: Range,
    ) -> Result<Value, RuntimeError> {
        let f = args.pop().unwrap_or(Value::Null);
        let text = match args.remove(1) {
            Value::Null => return Ok(Value::Null),
            Value::String(text) => text,
            other => {
                return Err(RuntimeError::InvalidType {
                    expected: "string",
                    found: other.name(),
                    range,
                });
            }
        };
        let re = match args.remove(0) {
            Value::Regex(re) => re,
            other => {
                return Err(RuntimeError::InvalidType {
                    expected: "regex",
                    found: other.name(),
                    range,
                });
            }
        };
        let mut out = String::new();
        let mut last = 0;
        for caps in re.captures_iter(&text) {
            let whole = match caps.get(0) {
                Some(whole) => whole,
                None => continue,
            };
            out.push_str(&text[last..whole.start()]);
            let replacement = self.apply(f.clone(), vec![builtin::match_value(&caps)], range)?;
            out.push_str(&replacement.to_display_string());
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(Value::String(out))
    }

    fn eval_template(
        &mut self,
        parts: &[SearchTemplatePart],
        env: &Rc<RefCell<Env>>,
        range: Range,
    ) -> Result<Value, RuntimeError> {
        let mut buffer = String::new();
        for part in parts {
            match part {
                SearchTemplatePart::Text(text) => buffer.push_str(text),
                SearchTemplatePart::Expr(node) => {
                    let value = self.eval(node, env)?;
                    buffer.push_str(&value.to_display_string());
                }
            }
        }
        template::ensure_safe(&buffer, range)?;
        match &mut self.writer {
            Some(writer) => {
                writer.write(&buffer);
                Ok(Value::Null)
            }
            None => Ok(Value::String(buffer)),
        }
    }
}

fn wrong_args(name: &str, expected: &str, got: usize, range: Range) -> RuntimeError {
    RuntimeError::InvalidNumberOfArguments {
        name: name.into(),
        expected: expected.to_string(),
        got,
        range,
    }
}
