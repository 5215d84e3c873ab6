use std::rc::Rc;

use compact_str::CompactString;

use crate::ast::node::{BinaryOp, UnaryOp};
use crate::eval::value::Value;
use crate::model::ModelHandle;
use crate::range::Range;

pub type Ident = CompactString;

#[derive(Debug, Clone, PartialEq)]
pub enum SearchTemplatePart {
    Text(String),
    Expr(SearchNode),
}

/// A resolved, executable expression node. Isomorphic to the parsed
/// tree except that model literals are bound handles and literals are
/// already runtime values; constant folding later replaces whole
/// subtrees by `Const` nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchNode {
    pub range: Range,
    pub expr: Rc<SearchExpr>,
}

impl SearchNode {
    pub fn new(range: Range, expr: SearchExpr) -> Self {
        SearchNode {
            range,
            expr: Rc::new(expr),
        }
    }

    pub fn constant(range: Range, value: Value) -> Self {
        SearchNode::new(range, SearchExpr::Const(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchExpr {
    Const(Value),
    Model(ModelHandle),
    List(Vec<SearchNode>),
    Map(Vec<(SearchNode, SearchNode)>),
    Lambda(Ident, SearchNode),
    Var(Ident),
    Call(SearchNode, Vec<SearchNode>),
    Binary(BinaryOp, SearchNode, SearchNode),
    Unary(UnaryOp, SearchNode),
    Block(Vec<(Ident, SearchNode)>, SearchNode),
    If(SearchNode, SearchNode, SearchNode),
    Switch {
        selector: Option<SearchNode>,
        cases: Vec<(SearchNode, SearchNode)>,
        default: Option<SearchNode>,
    },
    Recursion {
        seed: SearchNode,
        step: SearchNode,
        bounds: Option<(SearchNode, SearchNode)>,
    },
    Template(Vec<SearchTemplatePart>),
}
