//! Interpreter values as they cross the invocation boundary.

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use tally_ast::ir::LambdaId;
use tally_ast::span::Span;
use tally_ast::ty::FormulaType;

use crate::dynamic::DynamicValue;

/// Category of a data-path error. Errors of these kinds travel as values;
/// they never unwind the evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed external input, e.g. unparsable document text.
    InvalidArgument,
    /// Unresolvable symbol or reference.
    Validation,
    /// A fault raised while fulfilling a call (I/O, transport).
    ExternalFailure,
    /// Arithmetic result out of range or undefined.
    Numeric,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::Validation => "Validation",
            ErrorKind::ExternalFailure => "ExternalFailure",
            ErrorKind::Numeric => "Numeric",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed error carried as a formula value.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
        }
    }

    pub fn invalid_argument(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::InvalidArgument, message, span)
    }

    pub fn validation(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Validation, message, span)
    }

    pub fn external_failure(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::ExternalFailure, message, span)
    }

    pub fn numeric(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Numeric, message, span)
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.kind, self.span, self.message)
    }
}

/// Runtime values in Tally
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaValue {
    Blank,
    Boolean(bool),
    Number(f64),
    Decimal(Decimal),
    String(String),
    DateTime(DateTime<FixedOffset>),
    /// Dynamically-shaped data read through the capability accessors.
    Untyped(DynamicValue),
    /// Reference to a lambda argument, evaluated through the execution context.
    Lambda(LambdaId),
    Error(ErrorValue),
}

impl FormulaValue {
    pub fn formula_type(&self) -> FormulaType {
        match self {
            FormulaValue::Blank => FormulaType::Blank,
            FormulaValue::Boolean(_) => FormulaType::Boolean,
            FormulaValue::Number(_) => FormulaType::Number,
            FormulaValue::Decimal(_) => FormulaType::Decimal,
            FormulaValue::String(_) => FormulaType::String,
            FormulaValue::DateTime(_) => FormulaType::DateTime,
            FormulaValue::Untyped(_) => FormulaType::Untyped,
            FormulaValue::Lambda(_) => FormulaType::Lambda,
            FormulaValue::Error(_) => FormulaType::Error,
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, FormulaValue::Blank)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FormulaValue::Error(_))
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            FormulaValue::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        FormulaValue::Error(ErrorValue::new(kind, message, span))
    }
}

impl From<ErrorValue> for FormulaValue {
    fn from(e: ErrorValue) -> Self {
        FormulaValue::Error(e)
    }
}

impl From<DynamicValue> for FormulaValue {
    fn from(v: DynamicValue) -> Self {
        FormulaValue::Untyped(v)
    }
}

impl std::fmt::Display for FormulaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormulaValue::Blank => write!(f, "Blank()"),
            FormulaValue::Boolean(v) => write!(f, "{v}"),
            FormulaValue::Number(v) => write!(f, "{v}"),
            FormulaValue::Decimal(v) => write!(f, "{v}"),
            FormulaValue::String(s) => write!(f, "\"{s}\""),
            FormulaValue::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            FormulaValue::Untyped(v) => write!(f, "{v}"),
            FormulaValue::Lambda(id) => write!(f, "<lambda:{id}>"),
            FormulaValue::Error(e) => write!(f, "<error {}: {}>", e.kind, e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formula_type_of_each_variant() {
        assert_eq!(FormulaValue::Blank.formula_type(), FormulaType::Blank);
        assert_eq!(FormulaValue::Number(1.0).formula_type(), FormulaType::Number);
        assert_eq!(
            FormulaValue::Decimal(Decimal::ONE).formula_type(),
            FormulaType::Decimal
        );
        assert_eq!(
            FormulaValue::Untyped(DynamicValue::Number(2.0)).formula_type(),
            FormulaType::Untyped
        );
        assert_eq!(
            FormulaValue::Lambda(LambdaId(0)).formula_type(),
            FormulaType::Lambda
        );
    }

    #[test]
    fn error_display_includes_kind_span_and_message() {
        let e = ErrorValue::invalid_argument("bad input", Span::new(3, 9));
        assert_eq!(e.to_string(), "InvalidArgument at 3..9: bad input");
        let v = FormulaValue::from(e);
        assert!(v.is_error());
        assert_eq!(v.as_error().map(|e| e.kind), Some(ErrorKind::InvalidArgument));
    }
}
