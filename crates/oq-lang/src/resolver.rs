use std::rc::Rc;

use compact_str::CompactString;
use thiserror::Error;

use crate::ast::node::{Expr, Node, TemplatePart};
use crate::eval::value::Value;
use crate::model::ModelResolver;
use crate::range::Range;
use crate::search_expr::{SearchExpr, SearchNode, SearchTemplatePart};

#[derive(Error, Debug, PartialEq, Clone)]
pub enum ResolveError {
    #[error("Unknown model `{name}`")]
    ModelNotFound { name: CompactString, range: Range },
    #[error("Invalid regular expression `{pattern}`: {message}")]
    InvalidRegex {
        pattern: String,
        message: String,
        range: Range,
    },
}

impl ResolveError {
    pub fn range(&self) -> Range {
        match self {
            ResolveError::ModelNotFound { range, .. } => *range,
            ResolveError::InvalidRegex { range, .. } => *range,
        }
    }
}

/// Resolves every model literal in the tree through `resolver`,
/// producing the executable form. Each literal is resolved exactly
/// once, before any constant folding can run.
pub fn build(node: &Node, resolver: &dyn ModelResolver) -> Result<SearchNode, ResolveError> {
    let expr = match &*node.expr {
        Expr::Number(n) => SearchExpr::Const(Value::Number(*n)),
        Expr::String(s) => SearchExpr::Const(Value::String(s.clone())),
        Expr::Bool(b) => SearchExpr::Const(Value::Bool(*b)),
        Expr::Null => SearchExpr::Const(Value::Null),
        Expr::ModelLiteral(name) => match resolver.resolve(name) {
            Some(handle) => SearchExpr::Model(handle),
            None => {
                return Err(ResolveError::ModelNotFound {
                    name: name.clone(),
                    range: node.range,
                });
            }
        },
        Expr::RegexLiteral(pattern) => {
            let regex = compile_regex(pattern, node.range)?;
            SearchExpr::Const(Value::Regex(regex))
        }
        Expr::List(elems) => SearchExpr::List(build_all(elems, resolver)?),
        Expr::Map(pairs) => SearchExpr::Map(
            pairs
                .iter()
                .map(|(k, v)| Ok((build(k, resolver)?, build(v, resolver)?)))
                .collect::<Result<_, ResolveError>>()?,
        ),
        Expr::Lambda(param, body) => SearchExpr::Lambda(param.clone(), build(body, resolver)?),
        Expr::Var(name) => SearchExpr::Var(name.clone()),
        Expr::Call(target, args) => {
            SearchExpr::Call(build(target, resolver)?, build_all(args, resolver)?)
        }
        Expr::Binary(op, l, r) => SearchExpr::Binary(*op, build(l, resolver)?, build(r, resolver)?),
        Expr::Unary(op, operand) => SearchExpr::Unary(*op, build(operand, resolver)?),
        Expr::Block(bindings, body) => SearchExpr::Block(
            bindings
                .iter()
                .map(|(name, value)| Ok((name.clone(), build(value, resolver)?)))
                .collect::<Result<_, ResolveError>>()?,
            build(body, resolver)?,
        ),
        Expr::If(cond, then, els) => SearchExpr::If(
            build(cond, resolver)?,
            build(then, resolver)?,
            build(els, resolver)?,
        ),
        Expr::Switch {
            selector,
            cases,
            default,
        } => SearchExpr::Switch {
            selector: selector.as_ref().map(|s| build(s, resolver)).transpose()?,
            cases: cases
                .iter()
                .map(|(c, v)| Ok((build(c, resolver)?, build(v, resolver)?)))
                .collect::<Result<_, ResolveError>>()?,
            default: default.as_ref().map(|d| build(d, resolver)).transpose()?,
        },
        Expr::Recursion { seed, step, bounds } => SearchExpr::Recursion {
            seed: build(seed, resolver)?,
            step: build(step, resolver)?,
            bounds: bounds
                .as_ref()
                .map(|(from, to)| Ok::<_, ResolveError>((build(from, resolver)?, build(to, resolver)?)))
                .transpose()?,
        },
        Expr::Template(parts) => SearchExpr::Template(
            parts
                .iter()
                .map(|part| match part {
                    TemplatePart::Text(text) => Ok(SearchTemplatePart::Text(text.clone())),
                    TemplatePart::Expr(node) => {
                        Ok(SearchTemplatePart::Expr(build(node, resolver)?))
                    }
                })
                .collect::<Result<_, ResolveError>>()?,
        ),
    };
    Ok(SearchNode::new(node.range, expr))
}

fn build_all(nodes: &[Node], resolver: &dyn ModelResolver) -> Result<Vec<SearchNode>, ResolveError> {
    nodes.iter().map(|n| build(n, resolver)).collect()
}

pub(crate) fn compile_regex(
    pattern: &str,
    range: Range,
) -> Result<Rc<regex_lite::Regex>, ResolveError> {
    regex_lite::Regex::new(pattern)
        .map(Rc::new)
        .map_err(|e| ResolveError::InvalidRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
            range,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse;
    use crate::model::{MemoryModel, ModelKind};
    use crate::range::Position;

    fn build_src(input: &str, model: &MemoryModel) -> Result<SearchNode, ResolveError> {
        build(&parse(input).unwrap(), model)
    }

    #[test]
    fn test_literals_become_constants() {
        let model = MemoryModel::new();
        let node = build_src("7", &model).unwrap();
        assert_eq!(*node.expr, SearchExpr::Const(Value::Number(7.into())));
    }

    #[test]
    fn test_model_literal_resolves_to_handle() {
        let model = MemoryModel::new();
        let handle = model.register("Accounts:User", ModelKind::Type);
        let node = build_src("`Accounts:User`", &model).unwrap();
        assert_eq!(*node.expr, SearchExpr::Model(handle));
    }

    #[test]
    fn test_unknown_model_fails_with_name_and_position() {
        let model = MemoryModel::new();
        let err = build_src("1 + `No:Such`", &model).unwrap_err();
        match err {
            ResolveError::ModelNotFound { name, range } => {
                assert_eq!(name, "No:Such");
                assert_eq!(range.start, Position::new(1, 5));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_regex_literal_is_compiled() {
        let model = MemoryModel::new();
        let node = build_src("regex('a+')", &model).unwrap();
        assert!(matches!(&*node.expr, SearchExpr::Const(Value::Regex(r)) if r.as_str() == "a+"));
    }

    #[test]
    fn test_invalid_regex_literal_fails_at_build() {
        let model = MemoryModel::new();
        assert!(matches!(
            build_src("regex('a(')", &model),
            Err(ResolveError::InvalidRegex { .. })
        ));
    }
}
