use std::rc::Rc;

use chrono::FixedOffset;
use log::debug;

use crate::ast;
use crate::compiler::{self, CompiledExpr};
use crate::error::{Error, InnerError};
use crate::eval::DEFAULT_MAX_CALL_DEPTH;
use crate::eval::value::Value;
use crate::model::{ModelResolver, ObjectAccess, OutputWriter};
use crate::resolver;

#[derive(Debug, Clone)]
pub struct Options {
    /// Fold closed pure subtrees at compile time. On by default; turn
    /// off to debug a suspected folding discrepancy.
    pub optimize: bool,
    /// Offset applied by `now()` and `toUserTime`.
    pub user_offset: FixedOffset,
    /// Offset applied by `toSystemTime`.
    pub system_offset: FixedOffset,
    pub max_call_stack_depth: u32,
}

impl Default for Options {
    fn default() -> Self {
        let utc = FixedOffset::east_opt(0).unwrap();
        Self {
            optimize: true,
            user_offset: utc,
            system_offset: utc,
            max_call_stack_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

/// Front door of the expression engine: owns the model resolver and
/// the evaluation options, and drives text through parse, resolve and
/// compile.
#[derive(Clone)]
pub struct Engine {
    resolver: Rc<dyn ModelResolver>,
    options: Options,
}

impl Engine {
    pub fn new(resolver: Rc<dyn ModelResolver>) -> Self {
        Self::with_options(resolver, Options::default())
    }

    pub fn with_options(resolver: Rc<dyn ModelResolver>, options: Options) -> Self {
        Engine { resolver, options }
    }

    pub fn set_optimize(&mut self, optimize: bool) {
        self.options.optimize = optimize;
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Parses and resolves `code` into a reusable executable. With
    /// optimization enabled, closed pure subtrees are folded now, so
    /// their failures surface here rather than at execution time.
    #[allow(clippy::result_large_err)]
    pub fn compile(&self, code: &str) -> Result<CompiledExpr, Error> {
        debug!("compiling expression ({} bytes)", code.len());
        let node =
            ast::parse(code).map_err(|e| Error::from_error(code, InnerError::Parse(e)))?;
        let search = resolver::build(&node, &*self.resolver)
            .map_err(|e| Error::from_error(code, InnerError::Resolve(e)))?;
        if self.options.optimize {
            compiler::compile(
                &search,
                self.options.user_offset,
                self.options.system_offset,
                self.options.max_call_stack_depth,
            )
            .map_err(|e| Error::from_error(code, InnerError::Compile(e)))
        } else {
            Ok(CompiledExpr::new(
                search,
                self.options.user_offset,
                self.options.system_offset,
                self.options.max_call_stack_depth,
            ))
        }
    }

    /// One-shot convenience: compile and execute in a single call.
    #[allow(clippy::result_large_err)]
    pub fn eval<'a>(
        &self,
        code: &str,
        access: &'a dyn ObjectAccess,
        writer: Option<&'a mut dyn OutputWriter>,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        let compiled = self.compile(code)?;
        compiled
            .execute_with(access, writer, args)
            .map_err(|e| Error::from_error(code, InnerError::Eval(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MemoryModel, ModelKind};
    use rstest::rstest;

    fn engine(model: &Rc<MemoryModel>) -> Engine {
        Engine::new(Rc::clone(model) as Rc<dyn ModelResolver>)
    }

    #[test]
    fn test_eval_simple_expression() {
        let model = Rc::new(MemoryModel::new());
        let result = engine(&model).eval("1 + 2", &*model, None, vec![]).unwrap();
        assert_eq!(result, Value::from(3.0));
    }

    #[test]
    fn test_eval_applies_arguments() {
        let model = Rc::new(MemoryModel::new());
        let result = engine(&model)
            .eval("x -> x * 2", &*model, None, vec![Value::from(21.0)])
            .unwrap();
        assert_eq!(result, Value::from(42.0));
    }

    #[test]
    fn test_parse_error_carries_source() {
        let model = Rc::new(MemoryModel::new());
        let err = engine(&model).eval("1 +", &*model, None, vec![]).unwrap_err();
        assert!(matches!(err.cause, InnerError::Parse(_)));
        assert_eq!(err.source_code, "1 +");
    }

    #[test]
    fn test_unknown_model_fails_at_compile() {
        let model = Rc::new(MemoryModel::new());
        let err = engine(&model).compile("`No:Such`").unwrap_err();
        assert!(matches!(err.cause, InnerError::Resolve(_)));
    }

    #[test]
    fn test_folding_error_surfaces_at_compile() {
        let model = Rc::new(MemoryModel::new());
        let err = engine(&model)
            .compile("list('a', 'b').singleElement()")
            .unwrap_err();
        assert!(matches!(err.cause, InnerError::Compile(_)));
    }

    #[rstest]
    #[case("sum(1, 2, 3) + 4", Value::from(10.0))]
    #[case("'a' + null", Value::from("a"))]
    #[case("null || false", Value::Bool(false))]
    fn test_optimized_and_unoptimized_agree(#[case] code: &str, #[case] expected: Value) {
        let model = Rc::new(MemoryModel::new());
        let mut eng = engine(&model);
        assert_eq!(eng.eval(code, &*model, None, vec![]).unwrap(), expected);
        eng.set_optimize(false);
        assert_eq!(eng.eval(code, &*model, None, vec![]).unwrap(), expected);
    }

    #[test]
    fn test_model_attribute_through_engine() {
        let model = Rc::new(MemoryModel::new());
        model.register("Shop:Item", ModelKind::Type);
        let item = model.create_object("Shop:Item");
        model.set_attr(&item, "price", Value::from(9.5));

        let result = engine(&model)
            .eval("o -> o.get('price') * 2", &*model, None, vec![Value::Model(item)])
            .unwrap();
        assert_eq!(result, Value::from(19.0));
    }

    #[test]
    fn test_template_renders_through_writer() {
        let model = Rc::new(MemoryModel::new());
        let mut out = String::new();
        let result = engine(&model)
            .eval(
                "{{{<b>{1 + 1}</b>}}}",
                &*model,
                Some(&mut out),
                vec![],
            )
            .unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(out, "<b>2</b>");
    }
}
