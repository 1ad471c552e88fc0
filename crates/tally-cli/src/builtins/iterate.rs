use serde_json::Value as Json;
use tally_ast::ty::FormulaType;
use tally_types::{DynamicValue, ErrorValue, FormulaValue};
use tokio_util::sync::CancellationToken;

use super::from_dynamic;
use crate::invoke::{check_cancelled, BlankPolicy, BoxFuture, Invocation, InvokeError};

pub(super) fn builtin_for_all<'a>(
    inv: Invocation<'a>,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<FormulaValue, InvokeError>> {
    Box::pin(for_all(inv, cancel))
}

/// Evaluate the lambda once per element, in order. The first error result
/// is the result of the whole call.
async fn for_all(
    inv: Invocation<'_>,
    cancel: &CancellationToken,
) -> Result<FormulaValue, InvokeError> {
    if let Some(v) = inv.short_circuit(BlankPolicy::Propagate) {
        return Ok(v);
    }
    let items = match inv.arg(0) {
        FormulaValue::Untyped(d) if d.declared_type() == FormulaType::Array => d.clone(),
        other => {
            return Ok(inv.error(|s| {
                ErrorValue::invalid_argument(
                    format!("ForAll expects an array, got {}", describe(other)),
                    s,
                )
            }))
        }
    };
    let FormulaValue::Lambda(lambda) = *inv.arg(1) else {
        return Ok(inv.error(|s| {
            ErrorValue::invalid_argument("ForAll expects a formula for its second argument", s)
        }));
    };

    let len = items.len()?;
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        check_cancelled(cancel)?;
        let item = from_dynamic(items.index(i)?);
        let result = inv
            .context()
            .evaluate_lambda(lambda, vec![item], cancel)
            .await?;
        match to_dynamic(result, &inv) {
            Ok(d) => out.push(d),
            Err(e) => return Ok(e),
        }
    }
    tracing::debug!(elements = len, "ForAll finished");
    Ok(FormulaValue::Untyped(DynamicValue::sequence(out)))
}

fn describe(v: &FormulaValue) -> String {
    match v {
        FormulaValue::Untyped(d) => format!("an untyped {}", d.declared_type()),
        other => other.formula_type().to_string(),
    }
}

/// Store a lambda result as an element of the output sequence. Error
/// results come back as `Err` and end the iteration.
fn to_dynamic(v: FormulaValue, inv: &Invocation<'_>) -> Result<DynamicValue, FormulaValue> {
    Ok(match v {
        FormulaValue::Untyped(d) => d,
        FormulaValue::Blank => DynamicValue::from_json(Json::Null),
        FormulaValue::Boolean(b) => DynamicValue::from_json(Json::Bool(b)),
        FormulaValue::Number(n) => DynamicValue::Number(n),
        FormulaValue::Decimal(d) => DynamicValue::Decimal(d),
        FormulaValue::String(s) => DynamicValue::from_json(Json::String(s)),
        FormulaValue::DateTime(dt) => DynamicValue::from_json(Json::String(dt.to_rfc3339())),
        FormulaValue::Lambda(_) => {
            return Err(inv.error(|s| {
                ErrorValue::invalid_argument("ForAll cannot collect a formula as a value", s)
            }))
        }
        e @ FormulaValue::Error(_) => return Err(e),
    })
}
