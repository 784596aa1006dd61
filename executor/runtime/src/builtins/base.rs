use std::collections::HashMap;
use std::time::Duration;

use crate::builtins::args;
use crate::context;
use crate::error::Error;
use crate::eval::Signal;
use crate::metrics;
use crate::modules;
use crate::tasks;
use crate::value::Value;

pub fn register(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "print".into(),
        Value::native("print", |eval, args| {
            let mut text = args
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(" ");
            text.push('\n');
            eval.interp().caps().write_output(&text)?;
            Ok(Value::Nil)
        }),
    );

    globals.insert(
        "type".into(),
        Value::native("type", |_, args| {
            Ok(Value::Str(args::any("type", args, 0)?.type_name().into()))
        }),
    );

    globals.insert(
        "len".into(),
        Value::native("len", |_, args| {
            let value = args::any("len", args, 0)?;
            let len = match value {
                Value::Str(s) => s.chars().count(),
                Value::Array(arr) => arr.lock().len(),
                Value::Object(map) => map.lock().len(),
                other => {
                    return Err(Error::type_error(format!(
                        "len: cannot measure {}",
                        other.type_name()
                    ))
                    .into())
                }
            };
            Ok(Value::from(len))
        }),
    );

    globals.insert(
        "str".into(),
        Value::native("str", |_, args| {
            Ok(Value::Str(args::any("str", args, 0)?.to_display_string()))
        }),
    );

    globals.insert(
        "num".into(),
        Value::native("num", |_, args| {
            let value = args::any("num", args, 0)?;
            match value {
                Value::Num(n) => Ok(Value::Num(*n)),
                Value::Str(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Num)
                    .map_err(|_| Error::type_error(format!("num: cannot parse '{s}'")).into()),
                other => Err(Error::type_error(format!(
                    "num: cannot convert {}",
                    other.type_name()
                ))
                .into()),
            }
        }),
    );

    globals.insert(
        "exit".into(),
        Value::native("exit", |_, args| {
            Err(Signal::Exit(args.first().cloned().unwrap_or(Value::Nil)))
        }),
    );

    globals.insert(
        "throw".into(),
        Value::native("throw", |_, args| {
            let payload = args.first().cloned().unwrap_or(Value::Nil);
            Err(Error::thrown(payload).into())
        }),
    );

    globals.insert(
        "sleep".into(),
        Value::native("sleep", |eval, args| {
            let seconds = args::num("sleep", args, 0)?;
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(Error::type_error("sleep: duration must be non-negative").into());
            }
            let duration = Duration::from_secs_f64(seconds);
            if let Some(remaining) = eval.remaining() {
                if remaining < duration {
                    std::thread::sleep(remaining);
                    return Err(Error::timeout("sleep interrupted by deadline").into());
                }
            }
            std::thread::sleep(duration);
            Ok(Value::Nil)
        }),
    );

    globals.insert(
        "clock".into(),
        Value::native("clock", |_, _| Ok(Value::Num(metrics::uptime_seconds()))),
    );

    globals.insert(
        "context".into(),
        Value::native("context", |_, _| Ok(context::current_context_data())),
    );

    globals.insert(
        "env".into(),
        Value::native("env", |eval, args| {
            let name = args::string("env", args, 0)?;
            Ok(eval
                .interp()
                .caps()
                .read_env(name)?
                .map(Value::Str)
                .unwrap_or(Value::Nil))
        }),
    );

    globals.insert(
        "load".into(),
        Value::native("load", |eval, args| {
            let spec = args::string("load", args, 0)?;
            let (_, bytes) = modules::read_file(eval.interp(), spec)?;
            Ok(Value::Str(String::from_utf8_lossy(&bytes).into_owned()))
        }),
    );

    globals.insert(
        "save".into(),
        Value::native("save", |eval, args| {
            let spec = args::string("save", args, 0)?;
            let content = args::any("save", args, 1)?;
            let text = match content {
                Value::Str(s) => s.clone(),
                other => other.to_display_string(),
            };
            modules::write_file(eval.interp(), spec, text.as_bytes())?;
            Ok(Value::Nil)
        }),
    );

    globals.insert(
        "require".into(),
        Value::native("require", |eval, args| {
            let spec = args::string("require", args, 0)?.to_string();
            modules::require(eval, &spec)
        }),
    );

    globals.insert(
        "include".into(),
        Value::native("include", |eval, args| {
            let spec = args::string("include", args, 0)?.to_string();
            let env = match eval.caller_env() {
                Some(env) => env.clone(),
                None => eval.interp().root_env(),
            };
            modules::include(eval, &spec, &env)
        }),
    );

    globals.insert(
        "spawn".into(),
        Value::native("spawn", |eval, args| {
            let spec = args::string("spawn", args, 0)?.to_string();
            let data = args.get(1).cloned().unwrap_or(Value::Nil);
            Ok(tasks::spawn(eval.interp(), &spec, &data)?)
        }),
    );

    globals.insert(
        "run".into(),
        Value::native("run", |eval, args| {
            let spec = args::string("run", args, 0)?.to_string();
            let data = args.get(1).cloned().unwrap_or(Value::Nil);
            let timeout = match args::opt_num("run", args, 2)? {
                Some(t) if t < 0.0 => {
                    return Err(Error::type_error("run: timeout must be non-negative").into())
                }
                Some(t) if t > 0.0 => Some(Duration::from_secs_f64(t)),
                _ => None,
            };
            Ok(tasks::run(eval.interp(), &spec, &data, timeout)?)
        }),
    );

    globals.insert(
        "parallel".into(),
        Value::native("parallel", |eval, args| tasks::parallel(eval, args)),
    );
}
