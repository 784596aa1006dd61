use std::collections::HashMap;

use crate::builtins::args;
use crate::error::Error;
use crate::value::Value;

pub fn register(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "push".into(),
        Value::native("push", |_, args| {
            let arr = args::array("push", args, 0)?;
            let item = args::any("push", args, 1)?;
            let mut items = arr.lock();
            items.push(item.clone());
            Ok(Value::from(items.len()))
        }),
    );

    globals.insert(
        "pop".into(),
        Value::native("pop", |_, args| {
            let arr = args::array("pop", args, 0)?;
            Ok(arr.lock().pop().unwrap_or(Value::Nil))
        }),
    );

    globals.insert(
        "shift".into(),
        Value::native("shift", |_, args| {
            let arr = args::array("shift", args, 0)?;
            let mut items = arr.lock();
            if items.is_empty() {
                Ok(Value::Nil)
            } else {
                Ok(items.remove(0))
            }
        }),
    );

    globals.insert(
        "unshift".into(),
        Value::native("unshift", |_, args| {
            let arr = args::array("unshift", args, 0)?;
            let item = args::any("unshift", args, 1)?;
            let mut items = arr.lock();
            items.insert(0, item.clone());
            Ok(Value::from(items.len()))
        }),
    );

    globals.insert(
        "insert".into(),
        Value::native("insert", |_, args| {
            let arr = args::array("insert", args, 0)?;
            let index = args::num("insert", args, 1)?;
            let item = args::any("insert", args, 2)?;
            let mut items = arr.lock();
            let idx = args::index_in(index, items.len());
            items.insert(idx, item.clone());
            Ok(Value::from(items.len()))
        }),
    );

    globals.insert(
        "remove".into(),
        Value::native("remove", |_, args| {
            let target = args::any("remove", args, 0)?;
            match target {
                Value::Array(arr) => {
                    let index = args::num("remove", args, 1)?;
                    let mut items = arr.lock();
                    if index < 0.0 || index as usize >= items.len() {
                        return Ok(Value::Nil);
                    }
                    Ok(items.remove(index as usize))
                }
                Value::Object(map) => {
                    let key = args::string("remove", args, 1)?;
                    Ok(map.lock().remove(key).unwrap_or(Value::Nil))
                }
                other => Err(Error::type_error(format!(
                    "remove: cannot remove from {}",
                    other.type_name()
                ))
                .into()),
            }
        }),
    );

    globals.insert(
        "sort".into(),
        Value::native("sort", |_, args| {
            let arr = args::array("sort", args, 0)?;
            let mut items = arr.lock();
            let all_nums = items.iter().all(|v| matches!(v, Value::Num(_)));
            let all_strs = items.iter().all(|v| matches!(v, Value::Str(_)));
            if all_nums {
                items.sort_by(|a, b| {
                    a.as_num()
                        .partial_cmp(&b.as_num())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            } else if all_strs {
                items.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
            } else {
                return Err(
                    Error::type_error("sort: array must be all numbers or all strings").into(),
                );
            }
            drop(items);
            Ok(args[0].clone())
        }),
    );

    globals.insert(
        "reverse".into(),
        Value::native("reverse", |_, args| {
            let arr = args::array("reverse", args, 0)?;
            arr.lock().reverse();
            Ok(args[0].clone())
        }),
    );

    globals.insert(
        "slice".into(),
        Value::native("slice", |_, args| {
            let arr = args::array("slice", args, 0)?;
            let items = arr.lock();
            let start = args::index_in(args::num("slice", args, 1)?, items.len());
            let end = match args::opt_num("slice", args, 2)? {
                Some(n) => args::index_in(n, items.len()),
                None => items.len(),
            };
            let out: Vec<Value> = items
                .get(start..end.max(start))
                .map(|s| s.to_vec())
                .unwrap_or_default();
            Ok(Value::array(out))
        }),
    );

    globals.insert(
        "concat".into(),
        Value::native("concat", |_, args| {
            let mut out = Vec::new();
            for (i, _) in args.iter().enumerate() {
                let arr = args::array("concat", args, i)?;
                out.extend(arr.lock().iter().cloned());
            }
            Ok(Value::array(out))
        }),
    );

    globals.insert(
        "keys".into(),
        Value::native("keys", |_, args| {
            let value = args::any("keys", args, 0)?;
            match value {
                Value::Object(map) => Ok(Value::array(
                    map.lock().keys().map(|k| Value::Str(k.clone())).collect(),
                )),
                Value::Array(arr) => {
                    let len = arr.lock().len();
                    Ok(Value::array((0..len).map(Value::from).collect()))
                }
                other => Err(Error::type_error(format!(
                    "keys: cannot list keys of {}",
                    other.type_name()
                ))
                .into()),
            }
        }),
    );

    globals.insert(
        "values".into(),
        Value::native("values", |_, args| {
            let map = args::object("values", args, 0)?;
            Ok(Value::array(map.lock().values().cloned().collect()))
        }),
    );

    globals.insert(
        "has".into(),
        Value::native("has", |_, args| {
            let map = args::object("has", args, 0)?;
            let key = args::string("has", args, 1)?;
            Ok(Value::Bool(map.lock().contains_key(key)))
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
    fn push_grows_in_place() {
        // push mutates the shared container and returns the new length
        assert_eq!(run("a = [1]\nn = push(a, 9)\nn + a[1]"), Value::Num(11.0));
    }

    #[test]
    fn pop_shift_unshift() {
        assert_eq!(run("a = [1, 2]\npop(a)"), Value::Num(2.0));
        assert_eq!(run("a = [1, 2]\nshift(a)"), Value::Num(1.0));
        assert_eq!(run("a = [2]\nunshift(a, 1)\na[0]"), Value::Num(1.0));
        assert_eq!(run("pop([])"), Value::Nil);
    }

    #[test]
    fn sort_and_reverse() {
        assert_eq!(run("join(sort([3, 1, 2]), \",\")"), Value::Str("1,2,3".into()));
        assert_eq!(run("join(reverse([1, 2]), \",\")"), Value::Str("2,1".into()));
        assert_eq!(
            run("try sort([1, \"a\"]) catch e e.kind end"),
            Value::Str("type_error".into())
        );
    }

    #[test]
    fn slice_and_concat() {
        assert_eq!(run("join(slice([1,2,3,4], 1, 3), \",\")"), Value::Str("2,3".into()));
        assert_eq!(run("len(concat([1], [2, 3]))"), Value::Num(3.0));
    }

    #[test]
    fn object_helpers() {
        assert_eq!(run("has({a: 1}, \"a\")"), Value::Bool(true));
        assert_eq!(run("has({}, \"a\")"), Value::Bool(false));
        assert_eq!(run("len(keys({a: 1, b: 2}))"), Value::Num(2.0));
        assert_eq!(run("o = {a: 1}\nremove(o, \"a\")\nhas(o, \"a\")"), Value::Bool(false));
    }
}
