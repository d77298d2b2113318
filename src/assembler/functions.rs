//! Built-in functions, looked up by name from a static registry.
use super::context::Context;
use super::diagnostic::{Diagnostic, Locale};
use super::parser::ExpressionError;
use super::value::{CharacterMode, Value, ValueKind};

// Longest string `$SR` will build.
const MAX_REPEAT_LENGTH: usize = 0o100000;

pub type BuiltInFunction = fn(&mut Context, Locale, &[Value]) -> Result<Value, ExpressionError>;

const REGISTRY: [(&str, BuiltInFunction); 6] = [
    ("$CAS", change_to_ascii),
    ("$CFS", change_to_fieldata),
    ("$SL", string_length),
    ("$SR", string_repeat),
    ("$SS", substring),
    ("$TYPE", type_of),
];

pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

pub fn lookup(name: &str) -> Option<BuiltInFunction> {
    let upper = name.to_uppercase();
    REGISTRY.iter().find(|(n, _)| *n == upper).map(|(_, f)| *f)
}

fn check_count(ctx: &mut Context, locale: Locale, name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExpressionError> {
    if args.len() < min || args.len() > max {
        ctx.post(Diagnostic::error(locale, format!("Wrong number of arguments to {}", name)));
        return Err(ExpressionError);
    }
    Ok(())
}

fn string_arg<'v>(ctx: &mut Context, locale: Locale, name: &str, arg: &'v Value) -> Result<&'v str, ExpressionError> {
    match &arg.kind {
        ValueKind::String(sv) => Ok(&sv.value),
        _ => {
            ctx.post(Diagnostic::value(locale, format!("{} requires a string argument", name)));
            Err(ExpressionError)
        }
    }
}

fn integer_arg(ctx: &mut Context, locale: Locale, name: &str, arg: &Value) -> Result<i64, ExpressionError> {
    match arg.as_integer() {
        Some(iv) if !iv.has_references() => match iv.to_i64() {
            Some(i) => Ok(i),
            None => {
                ctx.post(Diagnostic::value(locale, format!("{} argument out of range", name)));
                Err(ExpressionError)
            }
        },
        _ => {
            ctx.post(Diagnostic::value(locale, format!("{} requires a discrete integer argument", name)));
            Err(ExpressionError)
        }
    }
}

fn change_to_ascii(ctx: &mut Context, locale: Locale, args: &[Value]) -> Result<Value, ExpressionError> {
    check_count(ctx, locale, "$CAS", args, 1, 1)?;
    let text = string_arg(ctx, locale, "$CAS", &args[0])?;
    Ok(Value::string(text, CharacterMode::Ascii))
}

fn change_to_fieldata(ctx: &mut Context, locale: Locale, args: &[Value]) -> Result<Value, ExpressionError> {
    check_count(ctx, locale, "$CFS", args, 1, 1)?;
    let text = string_arg(ctx, locale, "$CFS", &args[0])?;
    Ok(Value::string(text.to_uppercase(), CharacterMode::Fieldata))
}

fn string_length(ctx: &mut Context, locale: Locale, args: &[Value]) -> Result<Value, ExpressionError> {
    check_count(ctx, locale, "$SL", args, 1, 1)?;
    let text = string_arg(ctx, locale, "$SL", &args[0])?;
    Ok(Value::integer(text.chars().count() as i64))
}

fn string_repeat(ctx: &mut Context, locale: Locale, args: &[Value]) -> Result<Value, ExpressionError> {
    check_count(ctx, locale, "$SR", args, 2, 2)?;
    let text = string_arg(ctx, locale, "$SR", &args[0])?;
    let count = integer_arg(ctx, locale, "$SR", &args[1])?;
    if count < 0 {
        ctx.post(Diagnostic::value(locale, "$SR count may not be negative"));
        return Err(ExpressionError);
    }
    let length = text.chars().count();
    match (count as usize).checked_mul(length) {
        Some(total) if total <= MAX_REPEAT_LENGTH => {}
        _ => {
            ctx.post(Diagnostic::value(locale, "$SR result is too long"));
            return Err(ExpressionError);
        }
    }
    let mode = args[0].to_string_value().map(|sv| sv.mode).unwrap_or(CharacterMode::Default);
    Ok(Value::string(text.repeat(count as usize), mode))
}

/// `$SS(string, start [, count])` with `start` counted from 1. Without a
/// count the rest of the string is taken.
fn substring(ctx: &mut Context, locale: Locale, args: &[Value]) -> Result<Value, ExpressionError> {
    check_count(ctx, locale, "$SS", args, 2, 3)?;
    let text = string_arg(ctx, locale, "$SS", &args[0])?;
    let start = integer_arg(ctx, locale, "$SS", &args[1])?;
    let chars: Vec<char> = text.chars().collect();
    let count = match args.get(2) {
        Some(arg) => integer_arg(ctx, locale, "$SS", arg)?,
        None => chars.len() as i64 - start + 1,
    };
    if start < 1 || count < 0 || (start - 1 + count) as usize > chars.len() {
        ctx.post(Diagnostic::value(locale, "$SS range is outside the string"));
        return Err(ExpressionError);
    }
    let begin = (start - 1) as usize;
    let result: String = chars[begin..begin + count as usize].iter().collect();
    let mode = args[0].to_string_value().map(|sv| sv.mode).unwrap_or(CharacterMode::Default);
    Ok(Value::string(result, mode))
}

fn type_of(ctx: &mut Context, locale: Locale, args: &[Value]) -> Result<Value, ExpressionError> {
    check_count(ctx, locale, "$TYPE", args, 1, 1)?;
    Ok(Value::integer(args[0].type_code()))
}
