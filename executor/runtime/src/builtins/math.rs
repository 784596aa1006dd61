use std::collections::HashMap;

use crate::builtins::args;
use crate::error::Error;
use crate::value::Value;

pub fn register(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "abs".into(),
        Value::native("abs", |_, args| {
            Ok(Value::Num(args::num("abs", args, 0)?.abs()))
        }),
    );

    globals.insert(
        "floor".into(),
        Value::native("floor", |_, args| {
            Ok(Value::Num(args::num("floor", args, 0)?.floor()))
        }),
    );

    globals.insert(
        "ceil".into(),
        Value::native("ceil", |_, args| {
            Ok(Value::Num(args::num("ceil", args, 0)?.ceil()))
        }),
    );

    globals.insert(
        "round".into(),
        Value::native("round", |_, args| {
            Ok(Value::Num(args::num("round", args, 0)?.round()))
        }),
    );

    globals.insert(
        "sqrt".into(),
        Value::native("sqrt", |_, args| {
            let n = args::num("sqrt", args, 0)?;
            if n < 0.0 {
                return Err(Error::arithmetic("sqrt of a negative number").into());
            }
            Ok(Value::Num(n.sqrt()))
        }),
    );

    globals.insert(
        "pow".into(),
        Value::native("pow", |_, args| {
            let base = args::num("pow", args, 0)?;
            let exp = args::num("pow", args, 1)?;
            Ok(Value::Num(base.powf(exp)))
        }),
    );

    globals.insert(
        "min".into(),
        Value::native("min", |_, args| fold("min", args, f64::min)),
    );

    globals.insert(
        "max".into(),
        Value::native("max", |_, args| fold("max", args, f64::max)),
    );

    globals.insert(
        "random".into(),
        Value::native("random", |_, _| Ok(Value::Num(rand::random::<f64>()))),
    );
}

fn fold(
    name: &str,
    args: &[Value],
    pick: impl Fn(f64, f64) -> f64,
) -> Result<Value, crate::eval::Signal> {
    args::need(name, args, 1)?;
    let mut acc = args::num(name, args, 0)?;
    for i in 1..args.len() {
        acc = pick(acc, args::num(name, args, i)?);
    }
    Ok(Value::Num(acc))
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
    fn rounding_family() {
        assert_eq!(run("floor(1.9)"), Value::Num(1.0));
        assert_eq!(run("ceil(1.1)"), Value::Num(2.0));
        assert_eq!(run("round(1.5)"), Value::Num(2.0));
        assert_eq!(run("abs(-3)"), Value::Num(3.0));
    }

    #[test]
    fn min_max_varargs() {
        assert_eq!(run("min(3, 1, 2)"), Value::Num(1.0));
        assert_eq!(run("max(3, 1, 2)"), Value::Num(3.0));
    }

    #[test]
    fn sqrt_of_negative_is_arithmetic_error() {
        assert_eq!(
            run("try sqrt(-1) catch e e.kind end"),
            Value::Str("arithmetic".into())
        );
    }

    #[test]
    fn random_is_in_unit_interval() {
        let v = run("random()").as_num().unwrap();
        assert!((0.0..1.0).contains(&v));
    }
}
