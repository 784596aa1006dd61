use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::builtins::args;
use crate::error::Error;
use crate::eval::{Evaluator, Signal};
use crate::store::{registry, Store, StoreConfig};
use crate::value::Value;

pub fn register(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "datastore".into(),
        Value::native("datastore", |_, args| {
            let namespace = args::string("datastore", args, 0)?;
            let config = parse_config(args.get(1))?;
            let store = registry().obtain(namespace, config);
            Ok(handle(store))
        }),
    );
}

/// Script-value form: `{persist: "path.json", persist_interval: seconds}`.
fn parse_config(value: Option<&Value>) -> Result<StoreConfig, Signal> {
    let Some(value) = value else {
        return Ok(StoreConfig::default());
    };
    match value {
        Value::Nil => Ok(StoreConfig::default()),
        Value::Object(map) => {
            let map = map.lock();
            let persist = match map.get("persist") {
                Some(Value::Str(path)) => Some(PathBuf::from(path)),
                Some(Value::Nil) | None => None,
                Some(other) => {
                    return Err(Error::type_error(format!(
                        "datastore: persist must be a string path, got {}",
                        other.type_name()
                    ))
                    .into())
                }
            };
            let persist_interval = match map.get("persist_interval") {
                Some(Value::Num(n)) if *n > 0.0 => Some(Duration::from_secs_f64(*n)),
                Some(Value::Num(_)) | Some(Value::Nil) | None => None,
                Some(other) => {
                    return Err(Error::type_error(format!(
                        "datastore: persist_interval must be a number, got {}",
                        other.type_name()
                    ))
                    .into())
                }
            };
            Ok(StoreConfig {
                persist,
                persist_interval,
            })
        }
        other => Err(Error::type_error(format!(
            "datastore: config must be an object, got {}",
            other.type_name()
        ))
        .into()),
    }
}

/// Effective blocking budget: the script's timeout argument (0 or absent
/// means forever) capped by the evaluator's own deadline.
fn blocking_budget(
    eval: &Evaluator,
    name: &str,
    timeout: Option<f64>,
) -> Result<Option<Duration>, Signal> {
    let requested = match timeout {
        Some(t) if t < 0.0 => {
            return Err(Error::type_error(format!("{name}: timeout must be non-negative")).into())
        }
        Some(t) if t > 0.0 => Some(Duration::from_secs_f64(t)),
        _ => None,
    };
    Ok(match (requested, eval.remaining()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    })
}

/// Handle object whose members are native functions bound to the namespace's
/// store. `s.set("x", 1)` is plain member access followed by a call.
fn handle(store: Arc<Store>) -> Value {
    let mut map = HashMap::new();

    map.insert(
        "name".to_string(),
        Value::Str(store.name().to_string()),
    );

    let s = store.clone();
    map.insert(
        "get".to_string(),
        Value::native("get", move |_, args| Ok(s.get(args::string("get", args, 0)?))),
    );

    let s = store.clone();
    map.insert(
        "set".to_string(),
        Value::native("set", move |_, args| {
            s.set(args::string("set", args, 0)?, args::any("set", args, 1)?)?;
            Ok(Value::Nil)
        }),
    );

    let s = store.clone();
    map.insert(
        "set_once".to_string(),
        Value::native("set_once", move |_, args| {
            let stored = s.set_once(
                args::string("set_once", args, 0)?,
                args::any("set_once", args, 1)?,
            )?;
            Ok(Value::Bool(stored))
        }),
    );

    let s = store.clone();
    map.insert(
        "swap".to_string(),
        Value::native("swap", move |_, args| {
            Ok(s.swap(args::string("swap", args, 0)?, args::any("swap", args, 1)?)?)
        }),
    );

    let s = store.clone();
    map.insert(
        "increment".to_string(),
        Value::native("increment", move |_, args| {
            let delta = args::opt_num("increment", args, 1)?.unwrap_or(1.0);
            Ok(Value::Num(
                s.increment(args::string("increment", args, 0)?, delta)?,
            ))
        }),
    );

    let s = store.clone();
    map.insert(
        "push".to_string(),
        Value::native("push", move |_, args| {
            Ok(Value::from(s.push(
                args::string("push", args, 0)?,
                args::any("push", args, 1)?,
            )?))
        }),
    );

    let s = store.clone();
    map.insert(
        "unshift".to_string(),
        Value::native("unshift", move |_, args| {
            Ok(Value::from(s.unshift(
                args::string("unshift", args, 0)?,
                args::any("unshift", args, 1)?,
            )?))
        }),
    );

    let s = store.clone();
    map.insert(
        "pop".to_string(),
        Value::native("pop", move |_, args| {
            Ok(s.pop(args::string("pop", args, 0)?)?)
        }),
    );

    let s = store.clone();
    map.insert(
        "shift".to_string(),
        Value::native("shift", move |_, args| {
            Ok(s.shift(args::string("shift", args, 0)?)?)
        }),
    );

    let s = store.clone();
    map.insert(
        "exists".to_string(),
        Value::native("exists", move |_, args| {
            Ok(Value::Bool(s.exists(args::string("exists", args, 0)?)))
        }),
    );

    let s = store.clone();
    map.insert(
        "delete".to_string(),
        Value::native("delete", move |_, args| {
            Ok(Value::Bool(s.delete(args::string("delete", args, 0)?)?))
        }),
    );

    let s = store.clone();
    map.insert(
        "clear".to_string(),
        Value::native("clear", move |_, _| {
            s.clear()?;
            Ok(Value::Nil)
        }),
    );

    let s = store.clone();
    map.insert(
        "rename".to_string(),
        Value::native("rename", move |_, args| {
            s.rename(
                args::string("rename", args, 0)?,
                args::string("rename", args, 1)?,
            )?;
            Ok(Value::Nil)
        }),
    );

    let s = store.clone();
    map.insert(
        "keys".to_string(),
        Value::native("keys", move |_, _| {
            Ok(Value::array(s.keys().into_iter().map(Value::Str).collect()))
        }),
    );

    let s = store.clone();
    map.insert(
        "save".to_string(),
        Value::native("save", move |_, _| {
            s.save()?;
            Ok(Value::Nil)
        }),
    );

    let s = store.clone();
    map.insert(
        "load".to_string(),
        Value::native("load", move |_, _| {
            s.load()?;
            Ok(Value::Nil)
        }),
    );

    let s = store.clone();
    map.insert(
        "shutdown".to_string(),
        Value::native("shutdown", move |_, _| {
            s.shutdown();
            Ok(Value::Nil)
        }),
    );

    let s = store.clone();
    map.insert(
        "wait".to_string(),
        Value::native("wait", move |eval, args| {
            let key = args::string("wait", args, 0)?;
            let expected = args::opt(args, 1).cloned();
            let budget = blocking_budget(eval, "wait", args::opt_num("wait", args, 2)?)?;
            Ok(s.wait(key, expected.as_ref(), budget)?)
        }),
    );

    let s = store.clone();
    map.insert(
        "wait_for".to_string(),
        Value::native("wait_for", move |eval, args| {
            let key = args::string("wait_for", args, 0)?.to_string();
            args::function("wait_for", args, 1)?;
            let predicate = args[1].clone();
            let budget = blocking_budget(eval, "wait_for", args::opt_num("wait_for", args, 2)?)?;
            let value = s.wait_for(&key, budget, |snapshot| {
                match eval.call(&predicate, &[snapshot]) {
                    Ok(v) => Ok(v.is_truthy()),
                    Err(Signal::Error(e)) => Err(e),
                    Err(_) => Err(Error::msg("wait_for: illegal control flow in predicate")),
                }
            })?;
            Ok(value)
        }),
    );

    Value::object(map)
}
