#![deny(unused_must_use)]
#![warn(clippy::dbg_macro, clippy::todo, clippy::unimplemented)]
#![forbid(unsafe_code)]

pub mod builtins;
pub mod connector;
pub mod dispatch;
pub mod host;
pub mod invoke;
pub mod registry;
pub mod services;
pub mod trace;

pub use dispatch::{FormulaFunction, FunctionHandle, FunctionId, FunctionTable};
pub use invoke::{BlankPolicy, BoxFuture, ExecutionContext, Invocation, InvokeError};
pub use registry::ServiceRegistry;
pub use tokio_util::sync::CancellationToken;
