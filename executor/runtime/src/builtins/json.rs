use std::collections::HashMap;

use crate::builtins::args;
use crate::error::Error;
use crate::value::Value;

pub fn register(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "parse_json".into(),
        Value::native("parse_json", |_, args| {
            let text = args::string("parse_json", args, 0)?;
            let doc: serde_json::Value = serde_json::from_str(text).map_err(Error::from)?;
            Ok(Value::from_json(&doc))
        }),
    );

    globals.insert(
        "format_json".into(),
        Value::native("format_json", |_, args| {
            let value = args::any("format_json", args, 0)?;
            let pretty = args.get(1).map(Value::is_truthy).unwrap_or(false);
            let doc = value.to_json();
            let text = if pretty {
                serde_json::to_string_pretty(&doc).map_err(Error::from)?
            } else {
                serde_json::to_string(&doc).map_err(Error::from)?
            };
            Ok(Value::Str(text))
        }),
    );
}
