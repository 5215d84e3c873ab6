use chrono::FixedOffset;

use crate::eval::error::RuntimeError;
use crate::eval::value::Value;
use crate::eval::Evaluator;
use crate::model::{ObjectAccess, OutputWriter};
use crate::search_expr::SearchNode;

/// A folded expression ready for repeated execution. Holds no
/// per-invocation state; every call builds a fresh evaluator over the
/// shared immutable tree.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    root: SearchNode,
    user_offset: FixedOffset,
    system_offset: FixedOffset,
    max_depth: u32,
}

impl CompiledExpr {
    pub(crate) fn new(
        root: SearchNode,
        user_offset: FixedOffset,
        system_offset: FixedOffset,
        max_depth: u32,
    ) -> Self {
        CompiledExpr {
            root,
            user_offset,
            system_offset,
            max_depth,
        }
    }

    pub fn root(&self) -> &SearchNode {
        &self.root
    }

    /// Runs the expression against an object store. When the result is
    /// a function and arguments are supplied, they are applied in
    /// order. Template scripts stream through `writer` when one is
    /// given and return null; without a writer they return the
    /// rendered string.
    pub fn execute_with<'a>(
        &self,
        access: &'a dyn ObjectAccess,
        writer: Option<&'a mut dyn OutputWriter>,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let mut evaluator = Evaluator::new(
            access,
            writer,
            self.user_offset,
            self.system_offset,
            self.max_depth,
        );
        evaluator.evaluate(&self.root, args)
    }
}
