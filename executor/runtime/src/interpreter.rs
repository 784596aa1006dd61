use std::collections::HashMap;
use std::sync::Arc;

use crate::builtins;
use crate::capabilities::Capabilities;
use crate::config::Config;
use crate::context::{self, Frame, FrameReason};
use crate::env::Env;
use crate::error::Result;
use crate::eval::Evaluator;
use crate::metrics;
use crate::modules::ModuleLoader;
use crate::parser;
use crate::value::Value;

/// The embeddable interpreter: capabilities, configuration, the builtins
/// registry and the module caches behind one shared handle. Cloning is cheap
/// and hands workers their own reference.
#[derive(Clone)]
pub struct Interpreter {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    caps: Capabilities,
    loader: ModuleLoader,
    globals: HashMap<String, Value>,
}

impl Interpreter {
    pub fn new(config: Config, caps: Capabilities) -> Interpreter {
        metrics::init();
        let mut globals = HashMap::new();
        builtins::register_all(&mut globals);
        Interpreter {
            shared: Arc::new(Shared {
                config,
                caps,
                loader: ModuleLoader::new(),
                globals,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn caps(&self) -> &Capabilities {
        &self.shared.caps
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.shared.loader
    }

    /// Fresh top-level scope with every builtin bound. `require` uses this
    /// for module isolation.
    pub fn root_env(&self) -> Env {
        Env::root(self.shared.globals.clone())
    }

    /// Evaluate a source text on the calling thread. `exit(v)` resolves to
    /// its payload; otherwise the value of the final expression is returned.
    pub fn execute(&self, source: &str) -> Result<Value> {
        let program = parser::parse(source)?;
        let frame = Frame::new(
            self.config().script_dir.join("<main>"),
            FrameReason::Main,
            "",
            context::current_frame(),
        );
        let _guard = context::push_frame(frame);
        let env = self.root_env();
        Evaluator::new(self.clone()).run_program(&program, &env)
    }

    /// Resolve a script through the module waterfall and execute it.
    pub fn execute_path(&self, spec: &str) -> Result<Value> {
        let (path, program) = self.loader().resolve_and_parse(self, spec)?;
        let frame = Frame::new(path, FrameReason::Main, spec, context::current_frame());
        let _guard = context::push_frame(frame);
        let env = self.root_env();
        Evaluator::new(self.clone()).run_program(&program, &env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interp() -> Interpreter {
        Interpreter::new(Config::default(), Capabilities::none())
    }

    fn run(src: &str) -> Value {
        interp().execute(src).unwrap()
    }

    #[test]
    fn arithmetic_and_final_expression() {
        assert_eq!(run("1 + 2 * 3"), Value::Num(7.0));
        assert_eq!(run("x = 10\nx / 4"), Value::Num(2.5));
        assert_eq!(run("\"a\" + 1"), Value::Str("a1".into()));
    }

    #[test]
    fn exit_short_circuits() {
        assert_eq!(run("exit(42)\n99"), Value::Num(42.0));
    }

    #[test]
    fn closures_capture_their_scope() {
        let src = "
            make = fn(n)
                return fn() return n + 1 end
            end
            f = make(41)
            f()
        ";
        assert_eq!(run(src), Value::Num(42.0));
    }

    #[test]
    fn shared_arrays_alias() {
        let src = "
            a = [1]
            b = a
            push(b, 2)
            len(a)
        ";
        assert_eq!(run(src), Value::Num(2.0));
    }

    #[test]
    fn while_loop_and_break() {
        let src = "
            i = 0
            while true
                i = i + 1
                if i >= 5
                    break
                end
            end
            i
        ";
        assert_eq!(run(src), Value::Num(5.0));
    }

    #[test]
    fn for_loop_over_array_and_object() {
        let src = "
            total = 0
            for v in [1, 2, 3]
                total = total + v
            end
            total
        ";
        assert_eq!(run(src), Value::Num(6.0));

        let src = "
            seen = 0
            for k, v in {a: 1, b: 2}
                seen = seen + v
            end
            seen
        ";
        assert_eq!(run(src), Value::Num(3.0));
    }

    #[test]
    fn try_catches_thrown_payload() {
        assert_eq!(
            run("try throw(\"x\") catch e e end"),
            Value::Str("x".into())
        );
    }

    #[test]
    fn try_exposes_error_kind() {
        assert_eq!(
            run("try 1 / 0 catch e e.kind end"),
            Value::Str("arithmetic".into())
        );
        assert_eq!(
            run("try missing_name catch e e.kind end"),
            Value::Str("undefined".into())
        );
    }

    #[test]
    fn undefined_identifier_errors() {
        let err = interp().execute("nope").unwrap_err();
        assert_eq!(err.kind_str(), "undefined");
    }

    #[test]
    fn division_by_zero() {
        let err = interp().execute("1 / 0").unwrap_err();
        assert_eq!(err.kind_str(), "arithmetic");
    }

    #[test]
    fn errors_carry_position() {
        let err = interp().execute("x = 1\nboom()").unwrap_err();
        assert_eq!(err.position().map(|(l, _)| l), Some(2));
    }

    #[test]
    fn member_and_index_access() {
        assert_eq!(run("o = {a: {b: [10, 20]}}\no.a.b[1]"), Value::Num(20.0));
        assert_eq!(run("o = {}\no.missing"), Value::Nil);
        assert_eq!(run("[1, 2][9]"), Value::Nil);
    }

    #[test]
    fn object_member_assignment() {
        assert_eq!(run("o = {}\no.x = 1\no.x + 1"), Value::Num(2.0));
        assert_eq!(run("a = [1]\na[1] = 5\na[1]"), Value::Num(5.0));
    }

    #[test]
    fn logic_operators_short_circuit() {
        assert_eq!(run("false and boom()"), Value::Bool(false));
        assert_eq!(run("1 or boom()"), Value::Num(1.0));
        assert_eq!(run("nil or \"fallback\""), Value::Str("fallback".into()));
    }

    #[test]
    fn parallel_collects_results_with_nil_for_failures() {
        let out = run(
            "parallel([fn() return 1 end, fn() throw(\"x\") end, fn() return 3 end])",
        );
        let items = out.as_array().unwrap().lock().clone();
        assert_eq!(items, vec![Value::Num(1.0), Value::Nil, Value::Num(3.0)]);
    }

    #[test]
    fn parallel_accepts_varargs_and_objects() {
        let out = run("parallel(fn() return 1 end, fn() return 2 end)");
        assert_eq!(out.as_array().unwrap().lock().len(), 2);

        let out = run("parallel({a: fn() return 1 end, b: fn() return 2 end})");
        let map = out.as_object().unwrap().lock().clone();
        assert_eq!(map.get("a"), Some(&Value::Num(1.0)));
        assert_eq!(map.get("b"), Some(&Value::Num(2.0)));
    }

    #[test]
    fn parallel_branches_cannot_write_caller_bindings() {
        let out = run(
            "x = 1\nresults = parallel([fn() x = 2 end])\nresults[0] == nil and x == 1",
        );
        assert_eq!(out, Value::Bool(true));
    }

    #[test]
    fn parallel_branches_read_caller_scope() {
        let out = run("base = 40\nparallel([fn() return base + 2 end])[0]");
        assert_eq!(out, Value::Num(42.0));
    }

    #[test]
    fn parallel_rejects_non_callables() {
        let out = run("try parallel([1]) catch e e.kind end");
        assert_eq!(out, Value::Str("type_error".into()));
    }

    #[test]
    fn sys_namespace_readable_from_scripts() {
        let out = run("datastore(\"sys\").get(\"uptime_seconds\") >= 0");
        assert_eq!(out, Value::Bool(true));
    }

    #[test]
    fn string_equality_and_comparison() {
        assert_eq!(run("\"a\" == \"a\""), Value::Bool(true));
        assert_eq!(run("\"a\" < \"b\""), Value::Bool(true));
        assert_eq!(run("[1, 2] == [1, 2]"), Value::Bool(true));
        assert_eq!(run("{a: 1} == {a: 1}"), Value::Bool(true));
        assert_eq!(run("{a: 1} == {a: 2}"), Value::Bool(false));
    }
}
