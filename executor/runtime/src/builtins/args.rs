//! Argument extraction helpers shared by the intrinsics. Mismatches raise
//! `arity_error` / `type_error` with the intrinsic's name in the message.

use crate::error::Error;
use crate::eval::Signal;
use crate::value::{Array, Function, Object, Value};

pub fn need(name: &str, args: &[Value], count: usize) -> Result<(), Signal> {
    if args.len() < count {
        return Err(Error::arity(format!(
            "{name} expects at least {count} argument{}, got {}",
            if count == 1 { "" } else { "s" },
            args.len()
        ))
        .into());
    }
    Ok(())
}

fn wrong_type(name: &str, index: usize, expected: &str, got: &Value) -> Signal {
    Error::type_error(format!(
        "{name}: argument {} must be {expected}, got {}",
        index + 1,
        got.type_name()
    ))
    .into()
}

pub fn any<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a Value, Signal> {
    need(name, args, index + 1)?;
    Ok(&args[index])
}

pub fn num(name: &str, args: &[Value], index: usize) -> Result<f64, Signal> {
    let value = any(name, args, index)?;
    value
        .as_num()
        .ok_or_else(|| wrong_type(name, index, "a number", value))
}

pub fn string<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a str, Signal> {
    let value = any(name, args, index)?;
    value
        .as_str()
        .ok_or_else(|| wrong_type(name, index, "a string", value))
}

pub fn array<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a Array, Signal> {
    let value = any(name, args, index)?;
    value
        .as_array()
        .ok_or_else(|| wrong_type(name, index, "an array", value))
}

pub fn object<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a Object, Signal> {
    let value = any(name, args, index)?;
    value
        .as_object()
        .ok_or_else(|| wrong_type(name, index, "an object", value))
}

pub fn function<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a Function, Signal> {
    let value = any(name, args, index)?;
    value
        .as_function()
        .ok_or_else(|| wrong_type(name, index, "a function", value))
}

pub fn opt(args: &[Value], index: usize) -> Option<&Value> {
    match args.get(index) {
        Some(Value::Nil) | None => None,
        Some(value) => Some(value),
    }
}

pub fn opt_num(name: &str, args: &[Value], index: usize) -> Result<Option<f64>, Signal> {
    match opt(args, index) {
        None => Ok(None),
        Some(value) => value
            .as_num()
            .map(Some)
            .ok_or_else(|| wrong_type(name, index, "a number", value)),
    }
}

pub fn opt_string<'a>(
    name: &str,
    args: &'a [Value],
    index: usize,
) -> Result<Option<&'a str>, Signal> {
    match opt(args, index) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| wrong_type(name, index, "a string", value)),
    }
}

/// Character-count index clamped into a string/array of length `len`.
pub fn index_in(n: f64, len: usize) -> usize {
    if n < 0.0 {
        let back = (-n) as usize;
        len.saturating_sub(back)
    } else {
        (n as usize).min(len)
    }
}
