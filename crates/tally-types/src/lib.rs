#![deny(unused_must_use)]
#![warn(clippy::dbg_macro, clippy::todo, clippy::unimplemented)]
#![forbid(unsafe_code)]

mod dynamic;
mod json;
mod value;

pub use dynamic::{DynamicValue, JsonNode, UnsupportedOperation};
pub use json::parse_json;
pub use value::{ErrorKind, ErrorValue, FormulaValue};

// Re-exported so dependents name one decimal type.
pub use rust_decimal::Decimal;
