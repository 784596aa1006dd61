use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::builtins::args;
use crate::error::Error;
use crate::value::Value;

const DEFAULT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn register(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "now".into(),
        Value::native("now", |_, _| {
            Ok(Value::Num(Utc::now().timestamp_millis() as f64 / 1000.0))
        }),
    );

    globals.insert(
        "format_time".into(),
        Value::native("format_time", |_, args| {
            let epoch = args::num("format_time", args, 0)?;
            let format = args::opt_string("format_time", args, 1)?.unwrap_or(DEFAULT_FORMAT);
            let secs = epoch.floor() as i64;
            let nanos = ((epoch - epoch.floor()) * 1e9) as u32;
            let dt = DateTime::<Utc>::from_timestamp(secs, nanos)
                .ok_or_else(|| Error::type_error("format_time: timestamp out of range"))?;
            Ok(Value::Str(dt.format(format).to_string()))
        }),
    );

    globals.insert(
        "parse_time".into(),
        Value::native("parse_time", |_, args| {
            let text = args::string("parse_time", args, 0)?;
            let epoch = match args::opt_string("parse_time", args, 1)? {
                Some(format) => NaiveDateTime::parse_from_str(text, format)
                    .map_err(|e| Error::parse(format!("parse_time: {e}"), 0, 0))?
                    .and_utc()
                    .timestamp() as f64,
                None => DateTime::parse_from_rfc3339(text)
                    .map_err(|e| Error::parse(format!("parse_time: {e}"), 0, 0))?
                    .timestamp() as f64,
            };
            Ok(Value::Num(epoch))
        }),
    );
}

#[cfg(test)]
mod tests {
    use crate::capabilities::Capabilities;
    use crate::config::Config;
    use crate::interpreter::Interpreter;
    use crate::value::Value;

    fn run(src: &str) -> Value {
        Interpreter::new(Config::default(), Capabilities::none())
            .execute(src)
            .unwrap()
    }

    #[test]
    fn format_round_trips_through_parse() {
        let out = run(
            "t = parse_time(\"2024-05-01 12:00:00\", \"%Y-%m-%d %H:%M:%S\")\nformat_time(t)",
        );
        assert_eq!(out, Value::Str("2024-05-01 12:00:00".into()));
    }

    #[test]
    fn rfc3339_is_the_default_parse_format() {
        let out = run("parse_time(\"1970-01-01T00:01:00Z\")");
        assert_eq!(out, Value::Num(60.0));
    }

    #[test]
    fn now_is_unix_seconds() {
        let v = run("now()").as_num().unwrap();
        assert!(v > 1.7e9);
    }
}
