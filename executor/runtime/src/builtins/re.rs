use std::collections::HashMap;

use regex::Regex;

use crate::builtins::args;
use crate::error::Error;
use crate::eval::Signal;
use crate::value::Value;

fn compile(name: &str, pattern: &str) -> Result<Regex, Signal> {
    Regex::new(pattern)
        .map_err(|e| Error::type_error(format!("{name}: invalid pattern - {e}")).into())
}

pub fn register(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "re_match".into(),
        Value::native("re_match", |_, args| {
            let text = args::string("re_match", args, 0)?;
            let re = compile("re_match", args::string("re_match", args, 1)?)?;
            Ok(Value::Bool(re.is_match(text)))
        }),
    );

    globals.insert(
        "re_find".into(),
        Value::native("re_find", |_, args| {
            let text = args::string("re_find", args, 0)?;
            let re = compile("re_find", args::string("re_find", args, 1)?)?;
            Ok(re
                .find(text)
                .map(|m| Value::Str(m.as_str().to_string()))
                .unwrap_or(Value::Nil))
        }),
    );

    globals.insert(
        "re_find_all".into(),
        Value::native("re_find_all", |_, args| {
            let text = args::string("re_find_all", args, 0)?;
            let re = compile("re_find_all", args::string("re_find_all", args, 1)?)?;
            Ok(Value::array(
                re.find_iter(text)
                    .map(|m| Value::Str(m.as_str().to_string()))
                    .collect(),
            ))
        }),
    );

    globals.insert(
        "re_replace".into(),
        Value::native("re_replace", |_, args| {
            let text = args::string("re_replace", args, 0)?;
            let re = compile("re_replace", args::string("re_replace", args, 1)?)?;
            let replacement = args::string("re_replace", args, 2)?;
            Ok(Value::Str(re.replace_all(text, replacement).into_owned()))
        }),
    );

    globals.insert(
        "re_split".into(),
        Value::native("re_split", |_, args| {
            let text = args::string("re_split", args, 0)?;
            let re = compile("re_split", args::string("re_split", args, 1)?)?;
            Ok(Value::array(
                re.split(text).map(|p| Value::Str(p.to_string())).collect(),
            ))
        }),
    );
}
