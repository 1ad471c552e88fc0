use chrono::{Offset, Utc};
use rust_decimal::prelude::ToPrimitive;
use tally_ast::ty::FormulaType;
use tally_types::{ErrorValue, FormulaValue};

use crate::invoke::{BlankPolicy, Invocation, InvokeError};

type Outcome = Result<FormulaValue, InvokeError>;

/// `Decimal` when the call site expects one, otherwise a float.
pub(super) fn builtin_rand(inv: &Invocation<'_>) -> Outcome {
    let random = inv.services().random();
    if inv.result_type() == FormulaType::Decimal {
        Ok(FormulaValue::Decimal(random.next_decimal()))
    } else {
        Ok(FormulaValue::Number(random.next_f64()))
    }
}

fn number_arg(v: &FormulaValue) -> Option<f64> {
    match v {
        FormulaValue::Number(n) => Some(*n),
        FormulaValue::Decimal(d) => d.to_f64(),
        _ => None,
    }
}

/// Uniform integer in `[ceil(lo), floor(hi)]`.
pub(super) fn builtin_rand_between(inv: &Invocation<'_>) -> Outcome {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    let (Some(lo), Some(hi)) = (number_arg(inv.arg(0)), number_arg(inv.arg(1))) else {
        return Ok(inv.error(|s| {
            ErrorValue::invalid_argument("RandBetween expects numbers", s)
        }));
    };
    let (lo, hi) = (lo.ceil(), hi.floor());
    if !lo.is_finite() || !hi.is_finite() || lo > hi {
        return Ok(inv.error(|s| {
            ErrorValue::numeric(format!("RandBetween has an empty range {lo}..{hi}"), s)
        }));
    }
    let span = hi - lo + 1.0;
    if !span.is_finite() {
        return Ok(inv.error(|s| {
            ErrorValue::numeric(format!("RandBetween range {lo}..{hi} is too wide"), s)
        }));
    }
    let pick = lo + (inv.services().random().next_f64() * span).floor();
    Ok(FormulaValue::Number(pick.min(hi)))
}

pub(super) fn builtin_now(inv: &Invocation<'_>) -> Outcome {
    let tz = inv.services().timezone();
    let now = inv.services().clock().utc_now();
    Ok(FormulaValue::DateTime(now.with_timezone(&tz.offset())))
}

pub(super) fn builtin_utc_now(inv: &Invocation<'_>) -> Outcome {
    let now = inv.services().clock().utc_now();
    Ok(FormulaValue::DateTime(now.with_timezone(&Utc.fix())))
}
