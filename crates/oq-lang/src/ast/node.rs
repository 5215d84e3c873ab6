use std::rc::Rc;

use compact_str::CompactString;
#[cfg(feature = "ast-json")]
use serde::{Deserialize, Serialize};

use crate::number::Number;
use crate::range::Range;

pub type Ident = CompactString;

#[cfg_attr(feature = "ast-json", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

#[cfg_attr(feature = "ast-json", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// One segment of a template body after parsing.
#[cfg_attr(feature = "ast-json", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Clone)]
pub enum TemplatePart {
    Text(String),
    Expr(Node),
}

/// A parsed expression node. The expression itself is shared behind an
/// `Rc` so that desugaring steps can reuse subtrees without cloning.
#[cfg_attr(feature = "ast-json", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Clone)]
pub struct Node {
    pub range: Range,
    pub expr: Rc<Expr>,
}

impl Node {
    pub fn new(range: Range, expr: Expr) -> Self {
        Node {
            range,
            expr: Rc::new(expr),
        }
    }
}

#[cfg_attr(feature = "ast-json", derive(Serialize, Deserialize))]
#[derive(Debug, PartialEq, Clone)]
pub enum Expr {
    Number(Number),
    String(String),
    Bool(bool),
    Null,
    /// `[e, ...]` or `list(e, ...)` stays a call; this is `[...]` only.
    List(Vec<Node>),
    /// `{'k': v, ...}`, insertion ordered, keys evaluated at runtime.
    Map(Vec<(Node, Node)>),
    /// Backtick-quoted qualified name, resolved before execution.
    ModelLiteral(Ident),
    /// `regex('...')` with a literal pattern, compiled at parse time.
    RegexLiteral(String),
    Lambda(Ident, Node),
    Var(Ident),
    Call(Node, Vec<Node>),
    Binary(BinaryOp, Node, Node),
    Unary(UnaryOp, Node),
    /// `{ name = expr; ...; final }`
    Block(Vec<(Ident, Node)>, Node),
    If(Node, Node, Node),
    /// Both switch forms; the condition-list form has no selector.
    Switch {
        selector: Option<Node>,
        cases: Vec<(Node, Node)>,
        default: Option<Node>,
    },
    /// `recursion(seed, step[, from, to])`, bounded or unbounded.
    Recursion {
        seed: Node,
        step: Node,
        bounds: Option<(Node, Node)>,
    },
    Template(Vec<TemplatePart>),
}
