use std::collections::HashMap;

use crate::builtins::args;
use crate::error::Error;
use crate::value::Value;

pub fn register(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "upper".into(),
        Value::native("upper", |_, args| {
            Ok(Value::Str(args::string("upper", args, 0)?.to_uppercase()))
        }),
    );

    globals.insert(
        "lower".into(),
        Value::native("lower", |_, args| {
            Ok(Value::Str(args::string("lower", args, 0)?.to_lowercase()))
        }),
    );

    globals.insert(
        "trim".into(),
        Value::native("trim", |_, args| {
            Ok(Value::Str(args::string("trim", args, 0)?.trim().to_string()))
        }),
    );

    globals.insert(
        "split".into(),
        Value::native("split", |_, args| {
            let text = args::string("split", args, 0)?;
            let sep = args::string("split", args, 1)?;
            let parts: Vec<Value> = if sep.is_empty() {
                text.chars().map(|c| Value::Str(c.to_string())).collect()
            } else {
                text.split(sep).map(|p| Value::Str(p.to_string())).collect()
            };
            Ok(Value::array(parts))
        }),
    );

    globals.insert(
        "join".into(),
        Value::native("join", |_, args| {
            let items = args::array("join", args, 0)?;
            let sep = args::opt_string("join", args, 1)?.unwrap_or("");
            let joined = items
                .lock()
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(sep);
            Ok(Value::Str(joined))
        }),
    );

    globals.insert(
        "contains".into(),
        Value::native("contains", |_, args| {
            let haystack = args::any("contains", args, 0)?;
            let needle = args::any("contains", args, 1)?;
            let found = match haystack {
                Value::Str(s) => match needle.as_str() {
                    Some(sub) => s.contains(sub),
                    None => {
                        return Err(Error::type_error(
                            "contains: needle for a string must be a string",
                        )
                        .into())
                    }
                },
                Value::Array(arr) => arr.lock().iter().any(|v| v == needle),
                other => {
                    return Err(Error::type_error(format!(
                        "contains: cannot search {}",
                        other.type_name()
                    ))
                    .into())
                }
            };
            Ok(Value::Bool(found))
        }),
    );

    globals.insert(
        "starts_with".into(),
        Value::native("starts_with", |_, args| {
            let text = args::string("starts_with", args, 0)?;
            let prefix = args::string("starts_with", args, 1)?;
            Ok(Value::Bool(text.starts_with(prefix)))
        }),
    );

    globals.insert(
        "ends_with".into(),
        Value::native("ends_with", |_, args| {
            let text = args::string("ends_with", args, 0)?;
            let suffix = args::string("ends_with", args, 1)?;
            Ok(Value::Bool(text.ends_with(suffix)))
        }),
    );

    globals.insert(
        "replace".into(),
        Value::native("replace", |_, args| {
            let text = args::string("replace", args, 0)?;
            let from = args::string("replace", args, 1)?;
            let to = args::string("replace", args, 2)?;
            Ok(Value::Str(text.replace(from, to)))
        }),
    );

    globals.insert(
        "substr".into(),
        Value::native("substr", |_, args| {
            let text = args::string("substr", args, 0)?;
            let chars: Vec<char> = text.chars().collect();
            let start = args::index_in(args::num("substr", args, 1)?, chars.len());
            let count = match args::opt_num("substr", args, 2)? {
                Some(n) if n < 0.0 => 0,
                Some(n) => n as usize,
                None => chars.len().saturating_sub(start),
            };
            let out: String = chars.iter().skip(start).take(count).collect();
            Ok(Value::Str(out))
        }),
    );

    globals.insert(
        "index_of".into(),
        Value::native("index_of", |_, args| {
            let haystack = args::any("index_of", args, 0)?;
            match haystack {
                Value::Str(s) => {
                    let needle = args::string("index_of", args, 1)?;
                    match s.find(needle) {
                        // report in characters, not bytes
                        Some(byte_idx) => {
                            let char_idx = s[..byte_idx].chars().count();
                            Ok(Value::from(char_idx))
                        }
                        None => Ok(Value::Num(-1.0)),
                    }
                }
                Value::Array(arr) => {
                    let needle = args::any("index_of", args, 1)?;
                    let idx = arr.lock().iter().position(|v| v == needle);
                    Ok(idx.map(Value::from).unwrap_or(Value::Num(-1.0)))
                }
                other => Err(Error::type_error(format!(
                    "index_of: cannot search {}",
                    other.type_name()
                ))
                .into()),
            }
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
    fn case_and_trim() {
        assert_eq!(run("upper(\"du\")"), Value::Str("DU".into()));
        assert_eq!(run("lower(\"DU\")"), Value::Str("du".into()));
        assert_eq!(run("trim(\"  x \")"), Value::Str("x".into()));
    }

    #[test]
    fn split_and_join_round_trip() {
        assert_eq!(
            run("join(split(\"a,b,c\", \",\"), \"-\")"),
            Value::Str("a-b-c".into())
        );
        assert_eq!(run("len(split(\"abc\", \"\"))"), Value::Num(3.0));
    }

    #[test]
    fn search_helpers() {
        assert_eq!(run("contains(\"hello\", \"ell\")"), Value::Bool(true));
        assert_eq!(run("contains([1, 2], 2)"), Value::Bool(true));
        assert_eq!(run("starts_with(\"hello\", \"he\")"), Value::Bool(true));
        assert_eq!(run("ends_with(\"hello\", \"lo\")"), Value::Bool(true));
        assert_eq!(run("index_of(\"hello\", \"l\")"), Value::Num(2.0));
        assert_eq!(run("index_of(\"hello\", \"z\")"), Value::Num(-1.0));
    }

    #[test]
    fn substr_is_character_based() {
        assert_eq!(run("substr(\"hello\", 1, 3)"), Value::Str("ell".into()));
        assert_eq!(run("substr(\"hello\", 3)"), Value::Str("lo".into()));
        assert_eq!(run("substr(\"hello\", -2)"), Value::Str("lo".into()));
    }
}
