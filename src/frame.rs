// Lexical scope frames
// A frame maps names to values and points at its parent. Lookups that miss
// every frame fall through to the shared built-ins registry.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::functions;
use crate::value::JValue;

/// A lexical scope.
#[derive(Debug, Default)]
pub struct Frame {
    bindings: RefCell<IndexMap<String, JValue>>,
    parent: Option<Rc<Frame>>,
    /// Set while evaluating sibling elements that are not real recursion.
    parallel: Cell<bool>,
}

impl Frame {
    /// A frame whose parent is the built-ins registry.
    pub fn root() -> Rc<Frame> {
        Rc::new(Frame::default())
    }

    pub fn child(parent: &Rc<Frame>) -> Rc<Frame> {
        Rc::new(Frame {
            bindings: RefCell::new(IndexMap::new()),
            parent: Some(Rc::clone(parent)),
            parallel: Cell::new(false),
        })
    }

    pub fn bind(&self, name: impl Into<String>, value: JValue) {
        self.bindings.borrow_mut().insert(name.into(), value);
    }

    /// Look a name up through the parent chain, then the built-ins.
    /// An explicit `null` binding is returned as such.
    pub fn lookup(&self, name: &str) -> Option<JValue> {
        let mut frame = self;
        loop {
            if let Some(value) = frame.bindings.borrow().get(name) {
                return Some(value.clone());
            }
            match &frame.parent {
                Some(parent) => frame = parent.as_ref(),
                None => return functions::builtin(name).map(JValue::Native),
            }
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel.get()
    }

    /// Set the parallel flag, returning the previous value.
    pub fn set_parallel(&self, parallel: bool) -> bool {
        self.parallel.replace(parallel)
    }

    /// Drop every binding. Used to break closure cycles once an evaluation ends.
    pub(crate) fn clear(&self) {
        self.bindings.borrow_mut().clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings.borrow().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_parents() {
        let root = Frame::root();
        root.bind("a", JValue::from(1i64));
        let child = Frame::child(&root);
        child.bind("b", JValue::from(2i64));
        assert_eq!(child.lookup("a"), Some(JValue::from(1i64)));
        assert_eq!(child.lookup("b"), Some(JValue::from(2i64)));
        assert_eq!(root.lookup("b"), None);
    }

    #[test]
    fn test_child_shadows_parent() {
        let root = Frame::root();
        root.bind("x", JValue::from(1i64));
        let child = Frame::child(&root);
        child.bind("x", JValue::Null);
        assert_eq!(child.lookup("x"), Some(JValue::Null));
        assert_eq!(root.lookup("x"), Some(JValue::from(1i64)));
    }

    #[test]
    fn test_builtins_resolve_at_root() {
        let frame = Frame::child(&Frame::root());
        assert!(frame.lookup("sum").is_some_and(|f| f.is_function()));
        assert!(frame.lookup("no_such_function").is_none());
    }

    #[test]
    fn test_bindings_keep_insertion_order() {
        let frame = Frame::root();
        frame.bind("z", JValue::Null);
        frame.bind("a", JValue::Null);
        assert_eq!(frame.names(), vec!["z".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_parallel_flag_is_per_frame() {
        let root = Frame::root();
        let child = Frame::child(&root);
        assert!(!child.set_parallel(true));
        assert!(child.is_parallel());
        assert!(!root.is_parallel());
    }
}
