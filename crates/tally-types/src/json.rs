use tally_ast::span::Span;

use crate::dynamic::DynamicValue;
use crate::value::{ErrorValue, FormulaValue};

/// Parse JSON text into a formula value.
///
/// - root `null` → `Blank` (not an empty document node)
/// - valid text → `Untyped` wrapping the root node
/// - invalid text → `InvalidArgument` error carrying the parser diagnostic
///   and `span`
///
/// `serde_json::Value` owns all of its strings, so the returned node never
/// refers back into `text`.
pub fn parse_json(text: &str, span: Span) -> FormulaValue {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Null) => FormulaValue::Blank,
        Ok(doc) => FormulaValue::Untyped(DynamicValue::from_json(doc)),
        Err(e) => FormulaValue::Error(ErrorValue::invalid_argument(
            format!("the value passed to ParseJSON is not valid JSON: {e}"),
            span,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn null_root_is_blank() {
        assert_eq!(parse_json("null", Span::default()), FormulaValue::Blank);
        assert_eq!(parse_json("  null \n", Span::default()), FormulaValue::Blank);
    }

    #[test]
    fn nested_null_is_not_blank() {
        match parse_json("[null]", Span::default()) {
            FormulaValue::Untyped(v) => assert_eq!(v.len().unwrap(), 1),
            other => panic!("expected untyped, got {other}"),
        }
    }

    #[test]
    fn trailing_garbage_is_invalid_argument() {
        let span = Span::new(10, 24);
        match parse_json("{} x", span) {
            FormulaValue::Error(e) => {
                assert_eq!(e.kind, ErrorKind::InvalidArgument);
                assert_eq!(e.span, span);
                assert!(e.message.contains("line 1"), "message: {}", e.message);
            }
            other => panic!("expected error, got {other}"),
        }
    }
}
