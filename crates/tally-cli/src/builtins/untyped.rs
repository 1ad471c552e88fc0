use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use serde_json::Value as Json;
use tally_ast::ty::FormulaType;
use tally_types::{parse_json, Decimal, DynamicValue, ErrorValue, FormulaValue};

use super::from_dynamic;
use crate::invoke::{BlankPolicy, Invocation, InvokeError};

type Outcome = Result<FormulaValue, InvokeError>;

fn invalid(inv: &Invocation<'_>, msg: String) -> Outcome {
    Ok(inv.error(|s| ErrorValue::invalid_argument(msg, s)))
}

/// The dynamic argument at `i`, or an error value naming the function.
fn untyped_arg<'v>(
    inv: &'v Invocation<'_>,
    i: usize,
    func: &str,
) -> Result<&'v DynamicValue, FormulaValue> {
    match inv.arg(i) {
        FormulaValue::Untyped(d) => Ok(d),
        other => Err(inv.error(|s| {
            ErrorValue::invalid_argument(
                format!("{func} expects an untyped value, got {}", other.formula_type()),
                s,
            )
        })),
    }
}

pub(super) fn builtin_parse_json(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    match inv.arg(0) {
        FormulaValue::String(text) => Ok(parse_json(text, inv.span())),
        other => invalid(inv, format!("ParseJSON expects text, got {}", other.formula_type())),
    }
}

pub(super) fn builtin_value(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    let locale = inv.services().locale();
    let d = match inv.arg(0) {
        FormulaValue::Number(n) => return Ok(FormulaValue::Number(*n)),
        FormulaValue::Decimal(d) => {
            return Ok(FormulaValue::Number(d.to_f64().unwrap_or(f64::NAN)))
        }
        FormulaValue::String(s) => {
            return match locale.parse_f64(s) {
                Some(n) => Ok(FormulaValue::Number(n)),
                None => invalid(inv, format!("'{s}' is not a number")),
            }
        }
        FormulaValue::Untyped(d) => d,
        other => return invalid(inv, format!("Value cannot convert {}", other.formula_type())),
    };
    match d.declared_type() {
        FormulaType::Blank => Ok(FormulaValue::Blank),
        FormulaType::Number => Ok(FormulaValue::Number(d.as_f64()?)),
        FormulaType::Decimal => Ok(FormulaValue::Number(
            d.as_decimal()?.and_then(|x| x.to_f64()).unwrap_or(f64::NAN),
        )),
        FormulaType::String => {
            let s = d.as_str()?;
            match locale.parse_f64(s) {
                Some(n) => Ok(FormulaValue::Number(n)),
                None => invalid(inv, format!("'{s}' is not a number")),
            }
        }
        other => invalid(inv, format!("Value cannot convert an untyped {other}")),
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn not_representable(inv: &Invocation<'_>, what: impl std::fmt::Display) -> Outcome {
    Ok(inv.error(|s| {
        ErrorValue::numeric(format!("{what} cannot be represented as a decimal"), s)
    }))
}

pub(super) fn builtin_decimal(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    let d = match inv.arg(0) {
        FormulaValue::Decimal(d) => return Ok(FormulaValue::Decimal(*d)),
        FormulaValue::Number(n) => {
            return match Decimal::try_from(*n) {
                Ok(d) => Ok(FormulaValue::Decimal(d)),
                Err(_) => not_representable(inv, n),
            }
        }
        FormulaValue::String(s) => {
            return match parse_decimal(s) {
                Some(d) => Ok(FormulaValue::Decimal(d)),
                None => invalid(inv, format!("'{s}' is not a decimal")),
            }
        }
        FormulaValue::Untyped(d) => d,
        other => return invalid(inv, format!("Decimal cannot convert {}", other.formula_type())),
    };
    match d {
        DynamicValue::Number(n) => match Decimal::try_from(*n) {
            Ok(x) => Ok(FormulaValue::Decimal(x)),
            Err(_) => not_representable(inv, n),
        },
        _ => match d.declared_type() {
            FormulaType::Blank => Ok(FormulaValue::Blank),
            FormulaType::Number | FormulaType::Decimal => match d.as_decimal()? {
                Some(x) => Ok(FormulaValue::Decimal(x)),
                None => not_representable(inv, d),
            },
            FormulaType::String => {
                let s = d.as_str()?;
                match parse_decimal(s) {
                    Some(x) => Ok(FormulaValue::Decimal(x)),
                    None => invalid(inv, format!("'{s}' is not a decimal")),
                }
            }
            other => invalid(inv, format!("Decimal cannot convert an untyped {other}")),
        },
    }
}

pub(super) fn builtin_text(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    let d = match untyped_arg(inv, 0, "Text") {
        Ok(d) => d,
        Err(e) => return Ok(e),
    };
    match d.declared_type() {
        FormulaType::Blank => Ok(FormulaValue::Blank),
        FormulaType::String => Ok(FormulaValue::String(d.as_str()?.to_string())),
        FormulaType::Number | FormulaType::Decimal => Ok(FormulaValue::String(d.to_string())),
        FormulaType::Boolean => Ok(FormulaValue::String(d.as_bool()?.to_string())),
        other => invalid(inv, format!("Text cannot convert an untyped {other}")),
    }
}

pub(super) fn builtin_boolean(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    let d = match untyped_arg(inv, 0, "Boolean") {
        Ok(d) => d,
        Err(e) => return Ok(e),
    };
    match d.declared_type() {
        FormulaType::Blank => Ok(FormulaValue::Blank),
        FormulaType::Boolean => Ok(FormulaValue::Boolean(d.as_bool()?)),
        FormulaType::String => {
            let s = d.as_str()?;
            if s.eq_ignore_ascii_case("true") {
                Ok(FormulaValue::Boolean(true))
            } else if s.eq_ignore_ascii_case("false") {
                Ok(FormulaValue::Boolean(false))
            } else {
                invalid(inv, format!("'{s}' is not a boolean"))
            }
        }
        other => invalid(inv, format!("Boolean cannot convert an untyped {other}")),
    }
}

/// The dynamic argument at `i` when it is array-shaped.
fn array_arg<'v>(
    inv: &'v Invocation<'_>,
    i: usize,
    func: &str,
) -> Result<&'v DynamicValue, FormulaValue> {
    let d = untyped_arg(inv, i, func)?;
    if d.declared_type() == FormulaType::Array {
        Ok(d)
    } else {
        Err(inv.error(|s| {
            ErrorValue::invalid_argument(
                format!("{func} expects an array, got {}", d.declared_type()),
                s,
            )
        }))
    }
}

pub(super) fn builtin_index(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    let arr = match array_arg(inv, 0, "Index") {
        Ok(d) => d,
        Err(e) => return Ok(e),
    };
    let FormulaValue::Number(n) = inv.arg(1) else {
        return invalid(inv, "Index expects a number for the position".into());
    };
    let len = arr.len()?;
    let pos = n.trunc();
    if !(1.0..=len as f64).contains(&pos) {
        return invalid(
            inv,
            format!("index {n} is out of range for an array of {len} element(s)"),
        );
    }
    Ok(from_dynamic(arr.index(pos as usize - 1)?))
}

pub(super) fn builtin_count_rows(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    match array_arg(inv, 0, "CountRows") {
        Ok(arr) => Ok(FormulaValue::Number(arr.len()? as f64)),
        Err(e) => Ok(e),
    }
}

pub(super) fn builtin_column(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    let d = match untyped_arg(inv, 0, "Column") {
        Ok(d) => d,
        Err(e) => return Ok(e),
    };
    let FormulaValue::String(name) = inv.arg(1) else {
        return invalid(inv, "Column expects text for the column name".into());
    };
    Ok(d.try_get_property(name)
        .map(from_dynamic)
        .unwrap_or(FormulaValue::Blank))
}

pub(super) fn builtin_column_names(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    let d = match untyped_arg(inv, 0, "ColumnNames") {
        Ok(d) => d,
        Err(e) => return Ok(e),
    };
    match d.try_get_property_names() {
        Some(names) => Ok(FormulaValue::Untyped(DynamicValue::sequence(
            names
                .into_iter()
                .map(|n| DynamicValue::from_json(Json::String(n))),
        ))),
        None => invalid(
            inv,
            format!("ColumnNames is not supported on an untyped {}", d.declared_type()),
        ),
    }
}
