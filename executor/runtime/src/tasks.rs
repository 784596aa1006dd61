use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error};
use uuid::Uuid;

use crate::context::{self, Frame, FrameReason, RequestContext};
use crate::error::{Error, Result};
use crate::eval::{Evaluator, Flow, Signal};
use crate::interpreter::Interpreter;
use crate::metrics;
use crate::value::{Function, Value};

/// Grace period the `run` caller grants the worker past its own deadline to
/// deliver the cooperative timeout result before the channel wait gives up.
const RUN_RECV_GRACE: Duration = Duration::from_millis(200);

/// `spawn(path, data?)`: fire-and-forget worker. Returns the process id
/// immediately; uncaught worker errors are logged and discarded.
pub fn spawn(interp: &Interpreter, spec: &str, data: &Value) -> Result<Value> {
    let (path, program) = interp.loader().resolve_and_parse(interp, spec)?;
    metrics::record_spawn();
    let proc_id = Uuid::new_v4().to_string();
    let frame = Frame::new(
        path.clone(),
        FrameReason::Spawn,
        proc_id.clone(),
        context::current_frame(),
    );
    let data = data.deep_copy();
    let interp = interp.clone();
    std::thread::Builder::new()
        .name(format!("du-spawn-{}", &proc_id[..8]))
        .spawn(move || {
            let ctx = RequestContext::new(data, frame.clone());
            let getter_data = ctx.data.clone();
            let _frame_guard = context::push_frame(frame);
            let _ctx_guard =
                context::register_context(ctx, Arc::new(move || getter_data.clone()));
            let env = interp.root_env();
            let mut eval = Evaluator::new(interp.clone());
            if let Err(e) = eval.run_program(&program, &env) {
                error!("spawn {}: {e}", path.display());
            }
        })
        .map_err(|e| Error::io(format!("failed to spawn worker: {e}")))?;
    Ok(Value::Str(proc_id))
}

/// `run(path, data?, timeout?)`: like spawn, but the caller blocks on a
/// completion channel. `exit(v)` becomes the return value; errors bubble up;
/// exceeding the timeout fails with the `timeout` kind.
pub fn run(
    interp: &Interpreter,
    spec: &str,
    data: &Value,
    timeout: Option<Duration>,
) -> Result<Value> {
    let (path, program) = interp.loader().resolve_and_parse(interp, spec)?;
    metrics::record_run();
    let frame = Frame::new(
        path.clone(),
        FrameReason::Run,
        spec,
        context::current_frame(),
    );
    let data = data.deep_copy();
    let worker_interp = interp.clone();
    let deadline = timeout.map(|t| Instant::now() + t);
    let (tx, rx) = mpsc::channel();

    std::thread::Builder::new()
        .name("du-run".to_string())
        .spawn(move || {
            let ctx = RequestContext::new(data, frame.clone());
            let getter_data = ctx.data.clone();
            let _frame_guard = context::push_frame(frame);
            let _ctx_guard =
                context::register_context(ctx, Arc::new(move || getter_data.clone()));
            let env = worker_interp.root_env();
            let mut eval = Evaluator::with_deadline(worker_interp.clone(), deadline);
            let result = eval.run_program(&program, &env);
            // the caller may have given up already; nothing to do then
            let _ = tx.send(result);
        })
        .map_err(|e| Error::io(format!("failed to spawn worker: {e}")))?;

    match timeout {
        Some(t) => match rx.recv_timeout(t + RUN_RECV_GRACE) {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "run '{spec}' exceeded {:.3}s",
                t.as_secs_f64()
            ))),
        },
        None => rx
            .recv()
            .unwrap_or_else(|_| Err(Error::msg(format!("run '{spec}' worker died")))),
    }
}

enum ParallelInput {
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

/// `parallel(items)`: fan a batch of callables out over worker threads. All
/// branches run to completion; a failed branch contributes `nil` in its
/// position. List (or varargs) input yields a list in order, object input an
/// object under the same keys.
pub fn parallel(eval: &mut Evaluator, args: &[Value]) -> Flow<Value> {
    let input = match args {
        [Value::Array(arr)] => ParallelInput::List(arr.lock().clone()),
        [Value::Object(map)] => ParallelInput::Map(
            map.lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        _ => ParallelInput::List(args.to_vec()),
    };

    match input {
        ParallelInput::List(items) => {
            let results = join_all(eval, items)?;
            Ok(Value::array(results))
        }
        ParallelInput::Map(entries) => {
            let (keys, items): (Vec<String>, Vec<Value>) = entries.into_iter().unzip();
            let results = join_all(eval, items)?;
            let map = keys.into_iter().zip(results).collect();
            Ok(Value::object(map))
        }
    }
}

fn join_all(eval: &mut Evaluator, items: Vec<Value>) -> Flow<Vec<Value>> {
    // reject non-callables before any branch starts
    for item in &items {
        if item.as_function().is_none() {
            return Err(Error::type_error(format!(
                "parallel: expected a function, got {}",
                item.type_name()
            ))
            .into());
        }
    }

    let deadline = eval.deadline();
    let frame = context::current_frame();
    let registration = context::current_registration();

    let handles: Vec<_> = items
        .into_iter()
        .map(|item| {
            let interp = eval.interp().clone();
            let frame = frame.clone();
            let registration = registration.clone();
            std::thread::spawn(move || {
                let _frame_guard = frame.map(context::push_frame);
                let _ctx_guard =
                    registration.map(|(ctx, getter)| context::register_context(ctx, getter));
                let mut branch_eval = Evaluator::with_deadline(interp, deadline);
                let Value::Function(func) = item else {
                    return None;
                };
                match branch_eval.call_with_barrier(&func, &[]) {
                    Ok(value) => Some(value),
                    Err(Signal::Exit(value)) | Err(Signal::Return(value)) => Some(value),
                    Err(Signal::Error(e)) => {
                        debug!("parallel branch failed: {e}");
                        None
                    }
                    Err(_) => None,
                }
            })
        })
        .collect();

    let results = handles
        .into_iter()
        .map(|h| h.join().ok().flatten().unwrap_or(Value::Nil))
        .collect();
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::capabilities::Capabilities;
    use crate::config::Config;
    use crate::store::{registry, StoreConfig};

    fn interp_with(sources: Vec<(&str, &str)>) -> Interpreter {
        let sources = sources
            .into_iter()
            .map(|(p, s)| (PathBuf::from(p), s.to_string()))
            .collect();
        Interpreter::new(
            Config {
                script_dir: PathBuf::from("/app"),
                ..Config::default()
            },
            Capabilities::from_sources(sources),
        )
    }

    #[test]
    fn run_returns_exit_value_with_context_data() {
        let interp = interp_with(vec![(
            "/app/w.du",
            "data = context()\nexit(data.n * 2)",
        )]);
        let out = run(
            &interp,
            "w.du",
            &Value::object(
                [("n".to_string(), Value::Num(3.0))].into_iter().collect(),
            ),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(out, Value::Num(6.0));
    }

    #[test]
    fn run_bubbles_worker_errors() {
        let interp = interp_with(vec![("/app/boom.du", "throw(\"bad\")")]);
        let err = run(&interp, "boom.du", &Value::Nil, None).unwrap_err();
        assert_eq!(err.payload().unwrap().as_str(), Some("bad"));
    }

    #[test]
    fn run_times_out_with_timeout_kind() {
        let interp = interp_with(vec![(
            "/app/slow.du",
            "while true\nsleep(0.05)\nend",
        )]);
        let err = run(
            &interp,
            "slow.du",
            &Value::Nil,
            Some(Duration::from_millis(150)),
        )
        .unwrap_err();
        assert_eq!(err.kind_str(), "timeout");
    }

    #[test]
    fn spawn_returns_proc_id_immediately_and_executes() {
        let interp = interp_with(vec![(
            "/app/bg.du",
            "datastore(\"test-spawn-bg\").set(\"done\", context().tag)",
        )]);
        let data = Value::object(
            [("tag".to_string(), Value::Str("ok".into()))]
                .into_iter()
                .collect(),
        );
        let id = spawn(&interp, "bg.du", &data).unwrap();
        assert!(id.as_str().unwrap().len() > 8);

        let store = registry().obtain("test-spawn-bg", StoreConfig::default());
        let got = store
            .wait("done", Some(&Value::Str("ok".into())), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(got, Value::Str("ok".into()));
    }

    #[test]
    fn spawn_errors_are_not_propagated() {
        let interp = interp_with(vec![("/app/bad.du", "throw(\"ignored\")")]);
        assert!(spawn(&interp, "bad.du", &Value::Nil).is_ok());
    }

    #[test]
    fn spawn_data_is_deep_copied() {
        let interp = interp_with(vec![(
            "/app/copy.du",
            "s = datastore(\"test-spawn-copy\")\ns.wait(\"go\", 1, 5)\ns.set(\"len\", len(context().list))",
        )]);
        let list = Value::array(vec![Value::Num(1.0)]);
        let data = Value::object(
            [("list".to_string(), list.clone())].into_iter().collect(),
        );
        spawn(&interp, "copy.du", &data).unwrap();

        // mutate after handoff; the worker must still see one element
        list.as_array().unwrap().lock().push(Value::Num(2.0));
        let store = registry().obtain("test-spawn-copy", StoreConfig::default());
        store.set("go", &Value::Num(1.0)).unwrap();
        let got = store
            .wait("len", Some(&Value::Num(1.0)), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(got, Value::Num(1.0));
    }

    #[test]
    fn missing_script_fails_not_found() {
        let interp = interp_with(vec![]);
        let err = spawn(&interp, "ghost.du", &Value::Nil).unwrap_err();
        assert_eq!(err.kind_str(), "not_found");
    }
}
