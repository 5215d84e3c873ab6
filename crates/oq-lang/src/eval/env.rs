use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::search_expr::Ident;

use super::builtin;
use super::value::Value;

/// One binding frame. Frames chain through their parent; closures keep
/// their defining frame alive by holding the `Rc`.
#[derive(Debug, Default)]
pub struct Env {
    context: FxHashMap<Ident, Value>,
    parent: Option<Rc<RefCell<Env>>>,
}

impl Env {
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Env::default()))
    }

    pub fn with_parent(parent: &Rc<RefCell<Env>>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Env {
            context: FxHashMap::default(),
            parent: Some(Rc::clone(parent)),
        }))
    }

    pub fn define(&mut self, name: Ident, value: Value) {
        self.context.insert(name, value);
    }

    /// Walks the frame chain; a miss at the root falls back to the
    /// builtin table so builtins can be passed around as values.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.context.get(name) {
            return Some(value.clone());
        }
        match &self.parent {
            Some(parent) => parent.borrow().resolve(name),
            None => {
                if builtin::is_builtin(name) {
                    Some(Value::Builtin(name.into()))
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_walks_parent_chain() {
        let root = Env::new();
        root.borrow_mut().define("a".into(), Value::from(1.0));
        let child = Env::with_parent(&root);
        child.borrow_mut().define("b".into(), Value::from(2.0));

        assert_eq!(child.borrow().resolve("a"), Some(Value::from(1.0)));
        assert_eq!(child.borrow().resolve("b"), Some(Value::from(2.0)));
        assert_eq!(child.borrow().resolve("c"), None);
    }

    #[test]
    fn test_inner_binding_shadows_outer() {
        let root = Env::new();
        root.borrow_mut().define("a".into(), Value::from(1.0));
        let child = Env::with_parent(&root);
        child.borrow_mut().define("a".into(), Value::from(2.0));

        assert_eq!(child.borrow().resolve("a"), Some(Value::from(2.0)));
    }

    #[test]
    fn test_frame_outlives_evaluator_scope() {
        let child = {
            let root = Env::new();
            root.borrow_mut().define("a".into(), Value::from(1.0));
            Env::with_parent(&root)
        };
        assert_eq!(child.borrow().resolve("a"), Some(Value::from(1.0)));
    }

    #[test]
    fn test_root_miss_falls_back_to_builtins() {
        let root = Env::new();
        assert_eq!(
            root.borrow().resolve("size"),
            Some(Value::Builtin("size".into()))
        );
    }
}
