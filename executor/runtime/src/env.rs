use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::value::Value;

/// Lexical scope: a mapping from identifier to value plus a parent pointer.
///
/// Cloning an `Env` aliases the same scope; closures capture their defining
/// environment this way. A scope created for a `parallel` branch carries a
/// write barrier: lookups may cross it, assignments to bindings beyond it
/// fail, preserving the isolation promised to scripts.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    vars: Mutex<HashMap<String, Value>>,
    parent: Option<Env>,
    barrier: bool,
}

impl Env {
    pub fn root(vars: HashMap<String, Value>) -> Env {
        Env {
            inner: Arc::new(EnvInner {
                vars: Mutex::new(vars),
                parent: None,
                barrier: false,
            }),
        }
    }

    pub fn child(&self) -> Env {
        Env {
            inner: Arc::new(EnvInner {
                vars: Mutex::new(HashMap::new()),
                parent: Some(self.clone()),
                barrier: false,
            }),
        }
    }

    /// Child scope for a `parallel` branch; writes into the parent chain are
    /// rejected.
    pub fn parallel_child(&self) -> Env {
        Env {
            inner: Arc::new(EnvInner {
                vars: Mutex::new(HashMap::new()),
                parent: Some(self.clone()),
                barrier: true,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.inner.vars.lock().get(name) {
            return Some(value.clone());
        }
        self.inner.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Bind in this scope, shadowing any parent binding.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.inner.vars.lock().insert(name.into(), value);
    }

    /// Assignment: update the nearest existing binding, or define locally if
    /// the name is unbound anywhere in the chain.
    pub fn assign(&self, name: &str, value: Value) -> Result<()> {
        if !self.try_assign(name, &value, false)? {
            self.define(name, value);
        }
        Ok(())
    }

    fn try_assign(&self, name: &str, value: &Value, crossed_barrier: bool) -> Result<bool> {
        {
            let mut vars = self.inner.vars.lock();
            if vars.contains_key(name) {
                if crossed_barrier {
                    return Err(Error::permission_denied(format!(
                        "cannot assign to '{name}' from inside a parallel block"
                    )));
                }
                vars.insert(name.to_string(), value.clone());
                return Ok(true);
            }
        }
        match &self.inner.parent {
            Some(parent) => {
                parent.try_assign(name, value, crossed_barrier || self.inner.barrier)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_parent_chain() {
        let root = Env::root(HashMap::new());
        root.define("x", Value::Num(1.0));
        let child = root.child();
        assert_eq!(child.get("x"), Some(Value::Num(1.0)));
        assert!(child.get("y").is_none());
    }

    #[test]
    fn assign_updates_nearest_binding() {
        let root = Env::root(HashMap::new());
        root.define("x", Value::Num(1.0));
        let child = root.child();
        child.assign("x", Value::Num(2.0)).unwrap();
        assert_eq!(root.get("x"), Some(Value::Num(2.0)));
    }

    #[test]
    fn unbound_assign_defines_locally() {
        let root = Env::root(HashMap::new());
        let child = root.child();
        child.assign("y", Value::Num(3.0)).unwrap();
        assert_eq!(child.get("y"), Some(Value::Num(3.0)));
        assert!(root.get("y").is_none());
    }

    #[test]
    fn barrier_blocks_parent_writes() {
        let root = Env::root(HashMap::new());
        root.define("x", Value::Num(1.0));
        let branch = root.parallel_child();

        let err = branch.assign("x", Value::Num(2.0)).unwrap_err();
        assert_eq!(err.kind_str(), "permission_denied");
        // parent binding untouched
        assert_eq!(root.get("x"), Some(Value::Num(1.0)));

        // fresh names still bind locally inside the branch
        branch.assign("local", Value::Num(9.0)).unwrap();
        assert!(root.get("local").is_none());

        // reads across the barrier keep working
        assert_eq!(branch.get("x"), Some(Value::Num(1.0)));
    }

    #[test]
    fn barrier_applies_to_deeper_scopes() {
        let root = Env::root(HashMap::new());
        root.define("x", Value::Num(1.0));
        let branch = root.parallel_child();
        let inner = branch.child();
        let err = inner.assign("x", Value::Num(2.0)).unwrap_err();
        assert_eq!(err.kind_str(), "permission_denied");
    }
}
