//! Builtin functions, registered in every `FunctionTable`.

use std::fmt;

use tally_ast::ty::FormulaType;
use tally_types::{DynamicValue, FormulaValue};
use tokio_util::sync::CancellationToken;

use crate::dispatch::FormulaFunction;
use crate::invoke::{BoxFuture, Invocation, InvokeError};

mod ambient;
mod iterate;
mod untyped;

use ambient::{builtin_now, builtin_rand, builtin_rand_between, builtin_utc_now};
use iterate::builtin_for_all;
use untyped::{
    builtin_boolean, builtin_column, builtin_column_names, builtin_count_rows, builtin_decimal,
    builtin_index, builtin_parse_json, builtin_text, builtin_value,
};

pub type SyncBuiltinFn = fn(&Invocation<'_>) -> Result<FormulaValue, InvokeError>;
pub type AsyncBuiltinFn = for<'a> fn(
    Invocation<'a>,
    &'a CancellationToken,
) -> BoxFuture<'a, Result<FormulaValue, InvokeError>>;

#[derive(Clone, Copy)]
pub enum BuiltinImpl {
    /// Finishes without awaiting anything.
    Sync(SyncBuiltinFn),
    /// Awaits the evaluator or I/O.
    Async(AsyncBuiltinFn),
}

#[derive(Clone)]
pub struct Builtin {
    pub name: &'static str,
    pub params: &'static [FormulaType],
    pub imp: BuiltinImpl,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Builtin({}/{})", self.name, self.params.len())
    }
}

impl PartialEq for Builtin {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl FormulaFunction for Builtin {
    fn name(&self) -> &str {
        self.name
    }

    fn params(&self) -> &[FormulaType] {
        self.params
    }

    fn invoke<'a>(
        &'a self,
        inv: Invocation<'a>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>> {
        match self.imp {
            BuiltinImpl::Sync(f) => Box::pin(std::future::ready(f(&inv))),
            BuiltinImpl::Async(f) => f(inv, cancel),
        }
    }
}

use FormulaType::{Lambda, Number, String as Text, Untyped};

pub static BUILTINS: &[Builtin] = &[
    Builtin {
        name: "ParseJSON",
        params: &[Text],
        imp: BuiltinImpl::Sync(builtin_parse_json),
    },
    Builtin {
        name: "Value",
        params: &[Untyped],
        imp: BuiltinImpl::Sync(builtin_value),
    },
    Builtin {
        name: "Decimal",
        params: &[Untyped],
        imp: BuiltinImpl::Sync(builtin_decimal),
    },
    Builtin {
        name: "Text",
        params: &[Untyped],
        imp: BuiltinImpl::Sync(builtin_text),
    },
    Builtin {
        name: "Boolean",
        params: &[Untyped],
        imp: BuiltinImpl::Sync(builtin_boolean),
    },
    Builtin {
        name: "Index",
        params: &[Untyped, Number],
        imp: BuiltinImpl::Sync(builtin_index),
    },
    Builtin {
        name: "CountRows",
        params: &[Untyped],
        imp: BuiltinImpl::Sync(builtin_count_rows),
    },
    Builtin {
        name: "Column",
        params: &[Untyped, Text],
        imp: BuiltinImpl::Sync(builtin_column),
    },
    Builtin {
        name: "ColumnNames",
        params: &[Untyped],
        imp: BuiltinImpl::Sync(builtin_column_names),
    },
    Builtin {
        name: "ForAll",
        params: &[Untyped, Lambda],
        imp: BuiltinImpl::Async(builtin_for_all),
    },
    Builtin {
        name: "Rand",
        params: &[],
        imp: BuiltinImpl::Sync(builtin_rand),
    },
    Builtin {
        name: "RandBetween",
        params: &[Number, Number],
        imp: BuiltinImpl::Sync(builtin_rand_between),
    },
    Builtin {
        name: "Now",
        params: &[],
        imp: BuiltinImpl::Sync(builtin_now),
    },
    Builtin {
        name: "UTCNow",
        params: &[],
        imp: BuiltinImpl::Sync(builtin_utc_now),
    },
];

/// Untyped value read out of a document; a JSON null reads as `Blank`.
pub(crate) fn from_dynamic(d: DynamicValue) -> FormulaValue {
    match &d {
        DynamicValue::Json(node) if node.node().is_null() => FormulaValue::Blank,
        _ => FormulaValue::Untyped(d),
    }
}
