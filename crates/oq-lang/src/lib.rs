//! `oq-lang` is an embeddable search-expression engine: a small
//! functional language for querying and transforming model objects,
//! with an HTML template mode for rendering results.
//!
//! ## Examples
//!
//! ```
//! use std::rc::Rc;
//! use oq_lang::{Engine, MemoryModel, Value};
//!
//! let model = Rc::new(MemoryModel::new());
//! let engine = Engine::new(model.clone());
//!
//! let result = engine.eval("list(1, 2, 3).map(x -> x * 2).sum()", &*model, None, vec![]).unwrap();
//! assert_eq!(result, Value::from(12.0));
//!
//! // Compile once, execute many times.
//! let doubled = engine.compile("x -> x * 2").unwrap();
//! let result = doubled.execute_with(&*model, None, vec![Value::from(21.0)]).unwrap();
//! assert_eq!(result, Value::from(42.0));
//! ```

mod ast;
mod compiler;
mod engine;
mod error;
mod eval;
mod lexer;
mod model;
mod number;
mod range;
mod resolver;
mod search_expr;
mod template;

pub use ast::error::ParseError;
pub use ast::node::Expr as AstExpr;
pub use ast::node::Node as AstNode;
pub use ast::parse;
pub use compiler::{CompileError, CompiledExpr, compile};
pub use engine::{Engine, Options};
pub use error::{Error, InnerError};
pub use eval::error::RuntimeError;
pub use eval::value::Value;
pub use eval::{DEFAULT_MAX_CALL_DEPTH, Evaluator};
pub use lexer::error::LexerError;
pub use lexer::token::{Token, TokenKind};
pub use lexer::tokenize;
pub use model::{
    AccessError, MemoryModel, ModelHandle, ModelKind, ModelResolver, ObjectAccess, OutputWriter,
};
pub use number::Number;
pub use range::{Position, Range};
pub use resolver::{ResolveError, build};
pub use search_expr::{SearchExpr, SearchNode};
