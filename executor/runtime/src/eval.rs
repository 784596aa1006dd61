use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ast::*;
use crate::context;
use crate::env::Env;
use crate::error::Error;
use crate::interpreter::Interpreter;
use crate::value::{ErrorValue, Function, ScriptFn, Value};

/// Non-local control flow raised during evaluation. `Error` propagates until
/// a `try` catches it; the others unwind to their matching construct. `Exit`
/// is not an error: it carries a payload out of the current worker and is how
/// `exit(...)` and the response helpers return from their frame.
pub enum Signal {
    Error(Error),
    Return(Value),
    Break,
    Continue,
    Exit(Value),
}

impl From<Error> for Signal {
    fn from(value: Error) -> Self {
        Signal::Error(value)
    }
}

pub type Flow<T = Value> = Result<T, Signal>;

/// Interval (in statements) between cooperative deadline checks.
const DEADLINE_CHECK_INTERVAL: u32 = 64;

const MAX_CALL_DEPTH: usize = 200;

/// Tree-walking evaluator. Single-threaded within one worker; workers get
/// their own evaluator over a fresh or child environment.
pub struct Evaluator {
    interp: Interpreter,
    deadline: Option<Instant>,
    depth: usize,
    steps: u32,
    caller_env: Option<Env>,
}

impl Evaluator {
    pub fn new(interp: Interpreter) -> Self {
        Evaluator {
            interp,
            deadline: None,
            depth: 0,
            steps: 0,
            caller_env: None,
        }
    }

    pub fn with_deadline(interp: Interpreter, deadline: Option<Instant>) -> Self {
        Evaluator {
            interp,
            deadline,
            depth: 0,
            steps: 0,
            caller_env: None,
        }
    }

    /// Scope of the innermost script call site; what `include` executes in.
    pub fn caller_env(&self) -> Option<&Env> {
        self.caller_env.as_ref()
    }

    pub fn interp(&self) -> &Interpreter {
        &self.interp
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the cooperative deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check_deadline(&self) -> Result<(), Error> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::timeout("execution deadline exceeded"));
            }
        }
        Ok(())
    }

    /// Run a program to completion. `exit(v)` and a top-level `return`
    /// resolve to their payload; the program's value is otherwise the value
    /// of its final expression.
    pub fn run_program(&mut self, program: &Program, env: &Env) -> Result<Value, Error> {
        match self.eval_block(&program.body, env) {
            Ok(value) => Ok(value),
            Err(Signal::Exit(value)) | Err(Signal::Return(value)) => Ok(value),
            Err(Signal::Break) => Err(Error::msg("'break' outside of a loop")),
            Err(Signal::Continue) => Err(Error::msg("'continue' outside of a loop")),
            Err(Signal::Error(err)) => Err(err),
        }
    }

    /// A block's value is the value of its last expression statement.
    pub fn eval_block(&mut self, stmts: &[Stmt], env: &Env) -> Flow {
        let mut last = Value::Nil;
        for stmt in stmts {
            last = self.eval_stmt(stmt, env)?;
        }
        Ok(last)
    }

    fn eval_stmt(&mut self, stmt: &Stmt, env: &Env) -> Flow {
        self.steps = self.steps.wrapping_add(1);
        if self.steps % DEADLINE_CHECK_INTERVAL == 0 {
            self.check_deadline()?;
        }
        self.eval_stmt_inner(stmt, env)
            .map_err(|sig| locate(sig, stmt.line, stmt.column))
    }

    fn eval_stmt_inner(&mut self, stmt: &Stmt, env: &Env) -> Flow {
        match &stmt.kind {
            StmtKind::Expr(expr) => self.eval_expr(expr, env),
            StmtKind::Assign { target, value } => {
                let value = self.eval_expr(value, env)?;
                self.assign(target, value, env)?;
                Ok(Value::Nil)
            }
            StmtKind::If { arms, else_body } => {
                for (cond, body) in arms {
                    if self.eval_expr(cond, env)?.is_truthy() {
                        return self.eval_block(body, env);
                    }
                }
                match else_body {
                    Some(body) => self.eval_block(body, env),
                    None => Ok(Value::Nil),
                }
            }
            StmtKind::While { cond, body } => {
                while self.eval_expr(cond, env)?.is_truthy() {
                    self.check_deadline()?;
                    match self.eval_block(body, env) {
                        Ok(_) | Err(Signal::Continue) => {}
                        Err(Signal::Break) => break,
                        Err(other) => return Err(other),
                    }
                }
                Ok(Value::Nil)
            }
            StmtKind::For {
                key,
                var,
                iter,
                body,
            } => {
                let iterable = self.eval_expr(iter, env)?;
                let pairs = iteration_pairs(&iterable)?;
                for (k, v) in pairs {
                    self.check_deadline()?;
                    if let Some(key) = key {
                        env.assign(key, k)?;
                    }
                    env.assign(var, v)?;
                    match self.eval_block(body, env) {
                        Ok(_) | Err(Signal::Continue) => {}
                        Err(Signal::Break) => break,
                        Err(other) => return Err(other),
                    }
                }
                Ok(Value::Nil)
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval_expr(expr, env)?,
                    None => Value::Nil,
                };
                Err(Signal::Return(value))
            }
            StmtKind::Break => Err(Signal::Break),
            StmtKind::Continue => Err(Signal::Continue),
        }
    }

    fn assign(&mut self, target: &Target, value: Value, env: &Env) -> Flow<()> {
        match target {
            Target::Name(name) => {
                env.assign(name, value)?;
                Ok(())
            }
            Target::Member { object, field } => {
                let object = self.eval_expr(object, env)?;
                match object {
                    Value::Object(map) => {
                        map.lock().insert(field.clone(), value);
                        Ok(())
                    }
                    other => Err(Error::type_error(format!(
                        "cannot set member '{field}' on {}",
                        other.type_name()
                    ))
                    .into()),
                }
            }
            Target::Index { object, index } => {
                let object = self.eval_expr(object, env)?;
                let index = self.eval_expr(index, env)?;
                match (&object, &index) {
                    (Value::Array(arr), Value::Num(n)) => {
                        let mut items = arr.lock();
                        let idx = *n as usize;
                        if *n < 0.0 || idx > items.len() {
                            return Err(Error::type_error(format!(
                                "index {} out of range (len {})",
                                crate::value::format_number(*n),
                                items.len()
                            ))
                            .into());
                        }
                        if idx == items.len() {
                            items.push(value);
                        } else {
                            items[idx] = value;
                        }
                        Ok(())
                    }
                    (Value::Object(map), Value::Str(key)) => {
                        map.lock().insert(key.clone(), value);
                        Ok(())
                    }
                    (obj, idx) => Err(Error::type_error(format!(
                        "cannot index {} with {}",
                        obj.type_name(),
                        idx.type_name()
                    ))
                    .into()),
                }
            }
        }
    }

    pub fn eval_expr(&mut self, expr: &Expr, env: &Env) -> Flow {
        match &expr.kind {
            ExprKind::Nil => Ok(Value::Nil),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Num(n) => Ok(Value::Num(*n)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::Ident(name) => env
                .get(name)
                .ok_or_else(|| Error::undefined(name.clone()).into()),
            ExprKind::ArrayLit(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(item, env)?);
                }
                Ok(Value::array(out))
            }
            ExprKind::ObjectLit(entries) => {
                let mut map = std::collections::HashMap::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval_expr(value, env)?);
                }
                Ok(Value::object(map))
            }
            ExprKind::Fn { params, body } => Ok(Value::Function(Function::Script(Arc::new(
                ScriptFn {
                    name: None,
                    params: params.clone(),
                    body: body.clone(),
                    env: env.clone(),
                },
            )))),
            ExprKind::Call { callee, args } => {
                let callee = self.eval_expr(callee, env)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg, env)?);
                }
                let prev = std::mem::replace(&mut self.caller_env, Some(env.clone()));
                let result = self.call(&callee, &values);
                self.caller_env = prev;
                result
            }
            ExprKind::Member { object, field } => {
                let object = self.eval_expr(object, env)?;
                member(&object, field)
            }
            ExprKind::Index { object, index } => {
                let object = self.eval_expr(object, env)?;
                let index = self.eval_expr(index, env)?;
                index_value(&object, &index)
            }
            ExprKind::Unary { op, expr } => {
                let value = self.eval_expr(expr, env)?;
                match op {
                    UnaryOp::Neg => match value {
                        Value::Num(n) => Ok(Value::Num(-n)),
                        other => Err(Error::type_error(format!(
                            "cannot negate {}",
                            other.type_name()
                        ))
                        .into()),
                    },
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.eval_expr(lhs, env)?;
                let rhs = self.eval_expr(rhs, env)?;
                binary(*op, lhs, rhs)
            }
            ExprKind::And(lhs, rhs) => {
                let lhs = self.eval_expr(lhs, env)?;
                if lhs.is_truthy() {
                    self.eval_expr(rhs, env)
                } else {
                    Ok(lhs)
                }
            }
            ExprKind::Or(lhs, rhs) => {
                let lhs = self.eval_expr(lhs, env)?;
                if lhs.is_truthy() {
                    Ok(lhs)
                } else {
                    self.eval_expr(rhs, env)
                }
            }
            ExprKind::Try { body, var, handler } => {
                match self.eval_block(body, &env.child()) {
                    Ok(value) => Ok(value),
                    Err(Signal::Error(err)) => {
                        let caught = caught_value(&err);
                        let handler_env = env.child();
                        handler_env.define(var.clone(), caught);
                        self.eval_block(handler, &handler_env)
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    /// Invoke a callable value with already-evaluated arguments.
    pub fn call(&mut self, callee: &Value, args: &[Value]) -> Flow {
        match callee {
            Value::Function(f) => self.call_function(f, args, false),
            other => Err(Error::type_error(format!(
                "{} is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    /// Like [`call`](Self::call), but the call scope carries the parallel
    /// write barrier. Used for `parallel` branches.
    pub fn call_with_barrier(&mut self, f: &Function, args: &[Value]) -> Flow {
        self.call_function(f, args, true)
    }

    fn call_function(&mut self, f: &Function, args: &[Value], barrier: bool) -> Flow {
        self.check_deadline()?;
        match f {
            Function::Native(native) => (native.f)(self, args),
            Function::Script(script) => {
                if self.depth >= MAX_CALL_DEPTH {
                    return Err(Error::msg("maximum call depth exceeded").into());
                }
                let scope = if barrier {
                    script.env.parallel_child()
                } else {
                    script.env.child()
                };
                for (i, param) in script.params.iter().enumerate() {
                    scope.define(param.clone(), args.get(i).cloned().unwrap_or(Value::Nil));
                }
                self.depth += 1;
                let result = self.eval_block(&script.body, &scope);
                self.depth -= 1;
                match result {
                    Ok(value) => Ok(value),
                    Err(Signal::Return(value)) => Ok(value),
                    Err(other) => Err(other),
                }
            }
        }
    }
}

/// What a `catch` arm binds: the thrown payload for `throw`, otherwise the
/// script-visible error value.
fn caught_value(err: &Error) -> Value {
    if let Some(payload) = err.payload() {
        return payload.clone();
    }
    Value::Error(Arc::new(ErrorValue {
        kind: err.kind_str().to_string(),
        message: err.to_string(),
        payload: Value::Nil,
        file: err.file().map(|p| p.display().to_string()),
        line: err.position().map(|(line, _)| line),
        stack: err.stack().to_vec(),
    }))
}

fn locate(sig: Signal, line: u32, column: u32) -> Signal {
    match sig {
        Signal::Error(err) => {
            let err = err.with_position(line, column);
            let err = match context::current_frame() {
                Some(frame) => err.with_file(frame.file.clone()).with_stack(context::capture_stack()),
                None => err,
            };
            Signal::Error(err)
        }
        other => other,
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Flow {
    match op {
        BinOp::Add => match (&lhs, &rhs) {
            (Value::Num(a), Value::Num(b)) => Ok(Value::Num(a + b)),
            (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::Str(format!(
                "{}{}",
                lhs.to_display_string(),
                rhs.to_display_string()
            ))),
            _ => Err(type_mismatch("+", &lhs, &rhs)),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            let (a, b) = match (lhs.as_num(), rhs.as_num()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(type_mismatch(op_name(op), &lhs, &rhs)),
            };
            match op {
                BinOp::Sub => Ok(Value::Num(a - b)),
                BinOp::Mul => Ok(Value::Num(a * b)),
                BinOp::Div => {
                    if b == 0.0 {
                        Err(Error::arithmetic("division by zero").into())
                    } else {
                        Ok(Value::Num(a / b))
                    }
                }
                BinOp::Mod => {
                    if b == 0.0 {
                        Err(Error::arithmetic("modulo by zero").into())
                    } else {
                        Ok(Value::Num(a % b))
                    }
                }
                _ => unreachable!(),
            }
        }
        BinOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (&lhs, &rhs) {
                (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => return Err(type_mismatch(op_name(op), &lhs, &rhs)),
            };
            let Some(ord) = ord else {
                return Ok(Value::Bool(false));
            };
            let result = match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                BinOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
    }
}

fn op_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
    }
}

fn type_mismatch(op: &str, lhs: &Value, rhs: &Value) -> Signal {
    Error::type_error(format!(
        "operator '{op}' not defined for {} and {}",
        lhs.type_name(),
        rhs.type_name()
    ))
    .into()
}

fn member(object: &Value, field: &str) -> Flow {
    match object {
        Value::Object(map) => Ok(map.lock().get(field).cloned().unwrap_or(Value::Nil)),
        Value::Error(err) => Ok(match field {
            "kind" => Value::Str(err.kind.clone()),
            "message" => Value::Str(err.message.clone()),
            "payload" => err.payload.clone(),
            "file" => err
                .file
                .as_ref()
                .map(|f| Value::Str(f.clone()))
                .unwrap_or(Value::Nil),
            "line" => err
                .line
                .map(|l| Value::Num(l as f64))
                .unwrap_or(Value::Nil),
            "stack" => Value::array(err.stack.iter().map(|s| Value::Str(s.clone())).collect()),
            _ => Value::Nil,
        }),
        other => Err(Error::type_error(format!(
            "cannot read member '{field}' of {}",
            other.type_name()
        ))
        .into()),
    }
}

fn index_value(object: &Value, index: &Value) -> Flow {
    match (object, index) {
        (Value::Array(arr), Value::Num(n)) => {
            let items = arr.lock();
            if *n < 0.0 {
                return Ok(Value::Nil);
            }
            Ok(items.get(*n as usize).cloned().unwrap_or(Value::Nil))
        }
        (Value::Object(map), Value::Str(key)) => {
            Ok(map.lock().get(key).cloned().unwrap_or(Value::Nil))
        }
        (Value::Str(s), Value::Num(n)) => {
            if *n < 0.0 {
                return Ok(Value::Nil);
            }
            Ok(s.chars()
                .nth(*n as usize)
                .map(|c| Value::Str(c.to_string()))
                .unwrap_or(Value::Nil))
        }
        (obj, idx) => Err(Error::type_error(format!(
            "cannot index {} with {}",
            obj.type_name(),
            idx.type_name()
        ))
        .into()),
    }
}

/// Snapshot-based iteration: the loop walks a copy of the container contents
/// so a body mutating the container cannot deadlock or skip.
fn iteration_pairs(value: &Value) -> Result<Vec<(Value, Value)>, Signal> {
    match value {
        Value::Array(arr) => Ok(arr
            .lock()
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::Num(i as f64), v.clone()))
            .collect()),
        Value::Object(map) => Ok(map
            .lock()
            .iter()
            .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
            .collect()),
        Value::Str(s) => Ok(s
            .chars()
            .enumerate()
            .map(|(i, c)| (Value::Num(i as f64), Value::Str(c.to_string())))
            .collect()),
        other => Err(Error::type_error(format!(
            "cannot iterate over {}",
            other.type_name()
        ))
        .into()),
    }
}
