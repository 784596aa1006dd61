use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ast::Program;
use crate::env::Env;
use crate::eval::{Evaluator, Signal};

/// Shared, mutable ordered sequence. Passing it around aliases the same
/// container; mutations are in place.
pub type Array = Arc<Mutex<Vec<Value>>>;

/// Shared, mutable string-keyed mapping. Insertion order is not preserved.
pub type Object = Arc<Mutex<HashMap<String, Value>>>;

/// A Du runtime value.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Num(f64),
    Str(String),
    Array(Array),
    Object(Object),
    Function(Function),
    Code(Arc<CodeValue>),
    Error(Arc<ErrorValue>),
}

/// A parsed program together with its source and origin.
pub struct CodeValue {
    pub program: Arc<Program>,
    pub source: String,
    pub name: String,
}

/// Script-visible error value: what a `catch` arm receives for runtime
/// failures, and what `e.kind` / `e.message` read from.
pub struct ErrorValue {
    pub kind: String,
    pub message: String,
    pub payload: Value,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub stack: Vec<String>,
}

#[derive(Clone)]
pub enum Function {
    Script(Arc<ScriptFn>),
    Native(Arc<NativeFn>),
}

/// Closure over its defining environment.
pub struct ScriptFn {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: Arc<Vec<crate::ast::Stmt>>,
    pub env: Env,
}

/// Host-provided callable. Natives may raise the exit signal, which is why
/// they return a [`Signal`] instead of a plain error.
pub struct NativeFn {
    pub name: String,
    #[allow(clippy::type_complexity)]
    pub f: Box<dyn Fn(&mut Evaluator, &[Value]) -> Result<Value, Signal> + Send + Sync>,
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Script(f) => f.name.as_deref().unwrap_or("fn"),
            Function::Native(f) => &f.name,
        }
    }
}

impl Value {
    /// Build a native function value.
    pub fn native<F>(name: impl Into<String>, f: F) -> Value
    where
        F: Fn(&mut Evaluator, &[Value]) -> Result<Value, Signal> + Send + Sync + 'static,
    {
        Value::Function(Function::Native(Arc::new(NativeFn {
            name: name.into(),
            f: Box::new(f),
        })))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(items)))
    }

    pub fn object(map: HashMap<String, Value>) -> Value {
        Value::Object(Arc::new(Mutex::new(map)))
    }

    /// `nil` and `false` are falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Code(_) => "code",
            Value::Error(_) => "error",
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Recursive copy across an isolation boundary. Arrays and objects are
    /// rebuilt with fresh containers; function and code values do not survive
    /// (they close over scopes that cannot be transferred) and become `nil`.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Nil => Value::Nil,
            Value::Bool(b) => Value::Bool(*b),
            Value::Num(n) => Value::Num(*n),
            Value::Str(s) => Value::Str(s.clone()),
            Value::Array(arr) => {
                let items = arr.lock().iter().map(Value::deep_copy).collect();
                Value::array(items)
            }
            Value::Object(obj) => {
                let map = obj
                    .lock()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect();
                Value::object(map)
            }
            Value::Function(_) | Value::Code(_) => Value::Nil,
            Value::Error(e) => Value::Error(Arc::new(ErrorValue {
                kind: e.kind.clone(),
                message: e.message.clone(),
                payload: e.payload.deep_copy(),
                file: e.file.clone(),
                line: e.line,
                stack: e.stack.clone(),
            })),
        }
    }

    /// Format for `print` and string concatenation. Integral numbers render
    /// without a decimal point.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => format_number(*n),
            Value::Str(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => {
                serde_json::to_string(&self.to_json()).unwrap_or_else(|_| "null".to_string())
            }
            Value::Function(f) => format!("<function {}>", f.name()),
            Value::Code(c) => format!("<code {}>", c.name),
            Value::Error(e) => e.message.clone(),
        }
    }

    /// Convert to a JSON document. Function and code values map to `null`
    /// (they are stripped by isolation before any serialization point).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Nil | Value::Function(_) | Value::Code(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            // integral numbers serialize as JSON integers, mirroring their
            // script-level formatting
            Value::Num(n) if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.0e15 => {
                serde_json::Value::Number(serde_json::Number::from(*n as i64))
            }
            Value::Num(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.lock().iter().map(Value::to_json).collect())
            }
            Value::Object(obj) => {
                let map = obj
                    .lock()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                serde_json::Value::Object(map)
            }
            Value::Error(e) => {
                let mut map = serde_json::Map::new();
                map.insert("kind".into(), serde_json::Value::String(e.kind.clone()));
                map.insert("message".into(), serde_json::Value::String(e.message.clone()));
                if !e.payload.is_nil() {
                    map.insert("payload".into(), e.payload.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let map = map
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect();
                Value::object(map)
            }
        }
    }
}

/// Integral values format as integers, matching script-level number display.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl PartialEq for Value {
    /// Structural equality: arrays and objects compare element-wise,
    /// functions compare by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.lock();
                let b = b.lock();
                *a == *b
            }
            (Value::Object(a), Value::Object(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.lock();
                let b = b.lock();
                *a == *b
            }
            (Value::Function(a), Value::Function(b)) => match (a, b) {
                (Function::Script(a), Function::Script(b)) => Arc::ptr_eq(a, b),
                (Function::Native(a), Function::Native(b)) => Arc::ptr_eq(a, b),
                _ => false,
            },
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => {
                a.kind == b.kind && a.message == b.message && a.payload == b.payload
            }
            _ => false,
        }
    }
}

// Debug delegates to the display form, which is what log lines want.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{}", other.to_display_string()),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Num(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Num(value as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers_are_shared() {
        let a = Value::array(vec![Value::Num(1.0)]);
        let b = a.clone();
        if let Value::Array(arr) = &a {
            arr.lock().push(Value::Num(2.0));
        }
        if let Value::Array(arr) = &b {
            assert_eq!(arr.lock().len(), 2);
        }
    }

    #[test]
    fn deep_copy_isolates() {
        let inner = Value::array(vec![Value::Num(1.0)]);
        let mut map = HashMap::new();
        map.insert("list".to_string(), inner.clone());
        let original = Value::object(map);

        let copy = original.deep_copy();
        if let Value::Array(arr) = &inner {
            arr.lock().push(Value::Num(2.0));
        }

        let copied_list = copy.as_object().unwrap().lock().get("list").cloned().unwrap();
        assert_eq!(copied_list.as_array().unwrap().lock().len(), 1);
    }

    #[test]
    fn deep_copy_drops_functions_and_code() {
        let f = Value::native("noop", |_, _| Ok(Value::Nil));
        assert!(f.deep_copy().is_nil());

        let code = Value::Code(Arc::new(CodeValue {
            program: Arc::new(crate::parser::parse("1").unwrap()),
            source: "1".to_string(),
            name: "<code>".to_string(),
        }));
        assert!(code.deep_copy().is_nil());

        let mut map = HashMap::new();
        map.insert("fn".to_string(), Value::native("noop", |_, _| Ok(Value::Nil)));
        let obj = Value::object(map);
        let copy = obj.deep_copy();
        assert!(copy.as_object().unwrap().lock().get("fn").unwrap().is_nil());
    }

    #[test]
    fn integral_numbers_format_without_fraction() {
        assert_eq!(format_number(6.0), "6");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(1.5), "1.5");
    }

    #[test]
    fn structural_equality() {
        let a = Value::array(vec![Value::Num(1.0), Value::Str("x".into())]);
        let b = Value::array(vec![Value::Num(1.0), Value::Str("x".into())]);
        assert_eq!(a, b);

        let c = Value::array(vec![Value::Num(2.0)]);
        assert_ne!(a, c);
    }

    #[test]
    fn json_round_trip() {
        let doc: serde_json::Value = serde_json::from_str("{\"a\":1,\"b\":[2,3]}").unwrap();
        let value = Value::from_json(&doc);
        let back = value.to_json();
        assert_eq!(doc, back);
    }
}
