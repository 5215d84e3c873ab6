pub mod compiled;

use chrono::FixedOffset;
use log::debug;
use thiserror::Error;

use crate::eval::env::Env;
use crate::eval::error::RuntimeError;
use crate::eval::value::Value;
use crate::eval::{Evaluator, builtin};
use crate::model::{AccessError, ModelHandle, ObjectAccess};
use crate::range::Range;
use crate::search_expr::{Ident, SearchExpr, SearchNode, SearchTemplatePart};

pub use compiled::CompiledExpr;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum CompileError {
    /// Constant folding evaluated a subtree to an invalid result; the
    /// underlying failure surfaces at compile time instead of at call
    /// time.
    #[error("{0}")]
    Folding(RuntimeError),
}

impl CompileError {
    pub fn range(&self) -> Range {
        match self {
            CompileError::Folding(e) => e.range(),
        }
    }
}

/// Compiles a resolved tree into a reusable executable, folding every
/// closed pure subtree into a literal by evaluating it now. Folding
/// uses the same evaluator as direct execution, so a folded tree
/// cannot disagree with the unfolded one.
pub fn compile(
    node: &SearchNode,
    user_offset: FixedOffset,
    system_offset: FixedOffset,
    max_depth: u32,
) -> Result<CompiledExpr, CompileError> {
    let folder = Folder {
        user_offset,
        system_offset,
        max_depth,
    };
    let root = folder.fold(node)?;
    Ok(CompiledExpr::new(root, user_offset, system_offset, max_depth))
}

struct Folder {
    user_offset: FixedOffset,
    system_offset: FixedOffset,
    max_depth: u32,
}

impl Folder {
    fn fold(&self, node: &SearchNode) -> Result<SearchNode, CompileError> {
        if matches!(&*node.expr, SearchExpr::Const(_)) {
            return Ok(node.clone());
        }
        // Lambdas stay structural; folding one would bake a
        // compile-time closure environment into the tree. Their
        // bodies still fold below.
        if !matches!(&*node.expr, SearchExpr::Lambda(_, _)) && closed_pure(node, &mut Vec::new()) {
            debug!("folding subtree at {}", node.range);
            return self.fold_eval(node);
        }
        self.fold_children(node)
    }

    /// Evaluates a closed pure subtree at compile time.
    fn fold_eval(&self, node: &SearchNode) -> Result<SearchNode, CompileError> {
        let access = NoAccess;
        let mut evaluator = Evaluator::new(
            &access,
            None,
            self.user_offset,
            self.system_offset,
            self.max_depth,
        );
        let value = evaluator
            .eval(node, &Env::new())
            .map_err(CompileError::Folding)?;
        Ok(SearchNode::constant(node.range, value))
    }

    fn fold_children(&self, node: &SearchNode) -> Result<SearchNode, CompileError> {
        let expr = match &*node.expr {
            SearchExpr::Const(_) | SearchExpr::Model(_) | SearchExpr::Var(_) => {
                return Ok(node.clone());
            }
            SearchExpr::List(items) => SearchExpr::List(self.fold_all(items)?),
            SearchExpr::Map(pairs) => SearchExpr::Map(
                pairs
                    .iter()
                    .map(|(k, v)| Ok((self.fold(k)?, self.fold(v)?)))
                    .collect::<Result<_, CompileError>>()?,
            ),
            SearchExpr::Lambda(param, body) => {
                SearchExpr::Lambda(param.clone(), self.fold(body)?)
            }
            SearchExpr::Call(target, args) => {
                SearchExpr::Call(self.fold(target)?, self.fold_all(args)?)
            }
            SearchExpr::Binary(op, l, r) => {
                SearchExpr::Binary(*op, self.fold(l)?, self.fold(r)?)
            }
            SearchExpr::Unary(op, operand) => SearchExpr::Unary(*op, self.fold(operand)?),
            SearchExpr::Block(bindings, body) => {
                let bindings = bindings
                    .iter()
                    .map(|(name, value)| Ok((name.clone(), self.fold(value)?)))
                    .collect::<Result<_, CompileError>>()?;
                SearchExpr::Block(bindings, self.fold(body)?)
            }
            SearchExpr::If(cond, then, els) => {
                SearchExpr::If(self.fold(cond)?, self.fold(then)?, self.fold(els)?)
            }
            SearchExpr::Switch {
                selector,
                cases,
                default,
            } => SearchExpr::Switch {
                selector: selector.as_ref().map(|s| self.fold(s)).transpose()?,
                cases: cases
                    .iter()
                    .map(|(c, v)| Ok((self.fold(c)?, self.fold(v)?)))
                    .collect::<Result<_, CompileError>>()?,
                default: default.as_ref().map(|d| self.fold(d)).transpose()?,
            },
            SearchExpr::Recursion { seed, step, bounds } => SearchExpr::Recursion {
                seed: self.fold(seed)?,
                step: self.fold(step)?,
                bounds: bounds
                    .as_ref()
                    .map(|(from, to)| {
                        Ok::<_, CompileError>((self.fold(from)?, self.fold(to)?))
                    })
                    .transpose()?,
            },
            SearchExpr::Template(parts) => SearchExpr::Template(
                parts
                    .iter()
                    .map(|part| match part {
                        SearchTemplatePart::Text(text) => {
                            Ok(SearchTemplatePart::Text(text.clone()))
                        }
                        SearchTemplatePart::Expr(node) => {
                            Ok(SearchTemplatePart::Expr(self.fold(node)?))
                        }
                    })
                    .collect::<Result<_, CompileError>>()?,
            ),
        };
        Ok(SearchNode::new(node.range, expr))
    }

    fn fold_all(&self, nodes: &[SearchNode]) -> Result<Vec<SearchNode>, CompileError> {
        nodes.iter().map(|n| self.fold(n)).collect()
    }
}

/// Whether a subtree can be evaluated at compile time: every variable
/// it uses is bound by a lambda or block inside the subtree itself,
/// and it contains no model handles, no impure builtins, no template
/// output. `bound` starts empty at the candidate root and tracks only
/// binders introduced within the subtree; a variable bound by an
/// enclosing scope is runtime state and counts as free.
fn closed_pure(node: &SearchNode, bound: &mut Vec<Ident>) -> bool {
    match &*node.expr {
        SearchExpr::Const(_) => true,
        SearchExpr::Model(_) => false,
        SearchExpr::Template(_) => false,
        SearchExpr::Var(name) => {
            bound.iter().any(|b| b == name)
                || (builtin::is_builtin(name) && !builtin::is_impure(name))
        }
        SearchExpr::List(items) => items.iter().all(|i| closed_pure(i, bound)),
        SearchExpr::Map(pairs) => pairs
            .iter()
            .all(|(k, v)| closed_pure(k, bound) && closed_pure(v, bound)),
        SearchExpr::Lambda(param, body) => {
            bound.push(param.clone());
            let result = closed_pure(body, bound);
            bound.pop();
            result
        }
        SearchExpr::Call(target, args) => {
            closed_pure(target, bound) && args.iter().all(|a| closed_pure(a, bound))
        }
        SearchExpr::Binary(_, l, r) => closed_pure(l, bound) && closed_pure(r, bound),
        SearchExpr::Unary(_, operand) => closed_pure(operand, bound),
        SearchExpr::Block(bindings, body) => {
            let depth = bound.len();
            for (name, value) in bindings {
                if !closed_pure(value, bound) {
                    bound.truncate(depth);
                    return false;
                }
                bound.push(name.clone());
            }
            let result = closed_pure(body, bound);
            bound.truncate(depth);
            result
        }
        SearchExpr::If(cond, then, els) => {
            closed_pure(cond, bound) && closed_pure(then, bound) && closed_pure(els, bound)
        }
        SearchExpr::Switch {
            selector,
            cases,
            default,
        } => {
            selector.as_ref().is_none_or(|s| closed_pure(s, bound))
                && cases
                    .iter()
                    .all(|(c, v)| closed_pure(c, bound) && closed_pure(v, bound))
                && default.as_ref().is_none_or(|d| closed_pure(d, bound))
        }
        SearchExpr::Recursion { seed, step, bounds } => {
            closed_pure(seed, bound)
                && closed_pure(step, bound)
                && bounds
                    .as_ref()
                    .is_none_or(|(f, t)| closed_pure(f, bound) && closed_pure(t, bound))
        }
    }
}

/// Object access stand-in for compile-time evaluation. Impure builtins
/// are never folded, so this is unreachable in practice; if a folding
/// bug ever routes through it, the failure surfaces as a compile
/// error rather than silent misbehavior.
struct NoAccess;

impl NoAccess {
    fn refuse<T>(&self) -> Result<T, AccessError> {
        Err(AccessError::Other(
            "object access is not available at compile time".to_string(),
        ))
    }
}

impl ObjectAccess for NoAccess {
    fn get(&self, _: &ModelHandle, _: &str) -> Result<Value, AccessError> {
        self.refuse()
    }
    fn set(&self, _: &ModelHandle, _: &str, _: Value) -> Result<Value, AccessError> {
        self.refuse()
    }
    fn add(&self, _: &ModelHandle, _: &str, _: Value) -> Result<Value, AccessError> {
        self.refuse()
    }
    fn new_object(&self, _: &ModelHandle) -> Result<Value, AccessError> {
        self.refuse()
    }
    fn delete(&self, _: &ModelHandle) -> Result<Value, AccessError> {
        self.refuse()
    }
    fn copy(&self, _: &ModelHandle) -> Result<Value, AccessError> {
        self.refuse()
    }
    fn instance_of(&self, _: &ModelHandle, _: &ModelHandle) -> Result<bool, AccessError> {
        self.refuse()
    }
    fn referers(&self, _: &ModelHandle, _: &str) -> Result<Value, AccessError> {
        self.refuse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse;
    use crate::eval::value::Value;
    use crate::model::{MemoryModel, ModelKind};
    use crate::resolver::build;
    use proptest::prelude::*;
    use rstest::rstest;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn compile_src(input: &str, model: &MemoryModel) -> Result<CompiledExpr, CompileError> {
        let node = build(&parse(input).unwrap(), model).unwrap();
        compile(&node, utc(), utc(), crate::eval::DEFAULT_MAX_CALL_DEPTH)
    }

    fn interpret(input: &str, model: &MemoryModel, args: Vec<Value>) -> Value {
        let node = build(&parse(input).unwrap(), model).unwrap();
        let mut evaluator = Evaluator::new(
            model,
            None,
            utc(),
            utc(),
            crate::eval::DEFAULT_MAX_CALL_DEPTH,
        );
        evaluator.evaluate(&node, args).unwrap()
    }

    #[test]
    fn test_closed_expression_folds_to_constant() {
        let model = MemoryModel::new();
        let compiled = compile_src("1 + 2 * 3", &model).unwrap();
        assert!(matches!(
            &*compiled.root().expr,
            SearchExpr::Const(Value::Number(n)) if *n == 7.into()
        ));
    }

    #[test]
    fn test_free_variable_prevents_folding() {
        let model = MemoryModel::new();
        let compiled = compile_src("x -> x + (1 + 2)", &model).unwrap();
        // The lambda stays; the closed (1 + 2) inside is folded.
        match &*compiled.root().expr {
            SearchExpr::Lambda(_, body) => match &*body.expr {
                SearchExpr::Binary(_, l, r) => {
                    assert!(matches!(&*l.expr, SearchExpr::Var(_)));
                    assert!(matches!(&*r.expr, SearchExpr::Const(Value::Number(_))));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_model_literal_prevents_folding() {
        let model = MemoryModel::new();
        model.register("Accounts:User", ModelKind::Type);
        let compiled = compile_src("`Accounts:User`", &model).unwrap();
        assert!(matches!(&*compiled.root().expr, SearchExpr::Model(_)));
    }

    #[test]
    fn test_impure_builtin_prevents_folding() {
        let model = MemoryModel::new();
        let compiled = compile_src("now()", &model).unwrap();
        assert!(matches!(&*compiled.root().expr, SearchExpr::Call(_, _)));
    }

    #[test]
    fn test_template_prevents_folding() {
        let model = MemoryModel::new();
        let compiled = compile_src("{{{a{1 + 1}b}}}", &model).unwrap();
        match &*compiled.root().expr {
            SearchExpr::Template(parts) => {
                // Embedded closed expressions still fold.
                assert!(matches!(
                    &parts[1],
                    SearchTemplatePart::Expr(n) if matches!(&*n.expr, SearchExpr::Const(_))
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_folding_failure_is_a_compile_error() {
        let model = MemoryModel::new();
        let err = compile_src("list('a', 'b').singleElement()", &model).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Folding(crate::eval::error::RuntimeError::NotSingleElement {
                got: 2,
                ..
            })
        ));
    }

    #[rstest]
    #[case("1 + 2 * 3")]
    #[case("sum(3, 5, null)")]
    #[case("list(5, 3, 2, 1) + 2")]
    #[case("null || false")]
    #[case("false || null")]
    #[case("{ a = 1; b = a + 1; a + b }")]
    #[case("list(3, 1, 2).sort(desc(x -> x))")]
    #[case("switch (2) { 1: 'one'; 2: 'two'; default: '?'; }")]
    #[case("0.recursion(x -> x + 1, 0, 5)")]
    #[case("regex('a(b+)?c').regexReplace('xacyabbcz', '_$1_')")]
    #[case("'a' + null")]
    #[case("(a -> b -> a + b)(1)(2)")]
    fn test_dual_path_equivalence(#[case] input: &str) {
        let model = MemoryModel::new();
        let interpreted = interpret(input, &model, vec![]);
        let compiled = compile_src(input, &model).unwrap();
        let executed = compiled.execute_with(&model, None, vec![]).unwrap();
        assert_eq!(interpreted, executed, "paths disagree on `{input}`");
    }

    #[test]
    fn test_dual_path_equivalence_with_arguments() {
        let model = MemoryModel::new();
        let src = "x -> y -> x * 10 + y + (2 + 3)";
        let args = vec![Value::from(4.0), Value::from(2.0)];
        let interpreted = interpret(src, &model, args.clone());
        let compiled = compile_src(src, &model).unwrap();
        let executed = compiled.execute_with(&model, None, args).unwrap();
        assert_eq!(interpreted, executed);
        assert_eq!(interpreted, Value::from(47.0));
    }

    #[test]
    fn test_parameter_used_with_model_access_compiles() {
        let model = MemoryModel::new();
        model.register("Shop:Item", ModelKind::Type);
        let item = model.create_object("Shop:Item");
        model.set_attr(&item, "price", Value::from(9.5));

        let compiled = compile_src("o -> o.get('price') * 2", &model).unwrap();
        let result = compiled
            .execute_with(&model, None, vec![Value::Model(item)])
            .unwrap();
        assert_eq!(result, Value::from(19.0));
    }

    #[test]
    fn test_binding_used_inside_template_survives_folding() {
        let model = MemoryModel::new();
        let compiled = compile_src("{ n = 2; {{{x{n}y}}} }", &model).unwrap();
        let result = compiled.execute_with(&model, None, vec![]).unwrap();
        assert_eq!(result, Value::from("x2y"));
    }

    #[test]
    fn test_execute_with_writer_streams_template() {
        let model = MemoryModel::new();
        let compiled = compile_src("{{{<b>{1 + 1}</b>}}}", &model).unwrap();
        let mut out = String::new();
        let result = compiled.execute_with(&model, Some(&mut out), vec![]).unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(out, "<b>2</b>");
    }

    #[test]
    fn test_compiled_expression_is_reusable() {
        let model = MemoryModel::new();
        let compiled = compile_src("x -> x + 1", &model).unwrap();
        for i in 0..3 {
            let result = compiled
                .execute_with(&model, None, vec![Value::from(i as f64)])
                .unwrap();
            assert_eq!(result, Value::from(i as f64 + 1.0));
        }
    }

    // Source generator for closed, error-free expressions: every
    // generated tree must fold completely, so the compiled result has
    // to agree with the interpreter on it.
    fn closed_expr() -> impl Strategy<Value = String> {
        let leaf = prop_oneof![
            (0..100i64).prop_map(|n| n.to_string()),
            Just("null".to_string()),
            Just("true".to_string()),
            Just("false".to_string()),
        ];
        leaf.prop_recursive(3, 24, 3, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("({a} + {b})")),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("({a} * {b})")),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("({a} == {b})")),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("({a} || {b})")),
                (inner.clone(), inner.clone(), inner.clone())
                    .prop_map(|(c, a, b)| format!("({c} ? {a} : {b})")),
                (inner.clone(), inner.clone())
                    .prop_map(|(a, b)| format!("list({a}, {b}).size()")),
                inner.clone().prop_map(|a| format!("sum({a})")),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_dual_path_equivalence(src in closed_expr()) {
            let model = MemoryModel::new();
            let node = build(&parse(&src).unwrap(), &model).unwrap();
            let mut evaluator = Evaluator::new(
                &model, None, utc(), utc(), crate::eval::DEFAULT_MAX_CALL_DEPTH,
            );
            let interpreted = evaluator.evaluate(&node, vec![]);
            let compiled = compile(&node, utc(), utc(), crate::eval::DEFAULT_MAX_CALL_DEPTH);
            match (interpreted, compiled) {
                (Ok(direct), Ok(compiled)) => {
                    let executed = compiled.execute_with(&model, None, vec![]).unwrap();
                    prop_assert_eq!(direct, executed, "paths disagree on `{}`", src);
                }
                (Err(_), Err(_)) => {}
                (direct, compiled) => {
                    return Err(TestCaseError::fail(format!(
                        "one path failed on `{}`: direct={:?} compiled-err={}",
                        src, direct, compiled.is_err()
                    )));
                }
            }
        }
    }
}
