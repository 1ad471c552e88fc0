//! The invocation envelope and the outcome types of a call.

use std::future::Future;
use std::pin::Pin;

use tally_ast::ir::{IrContext, LambdaId};
use tally_ast::span::Span;
use tally_ast::ty::FormulaType;
use tally_types::{ErrorValue, FormulaValue, UnsupportedOperation};
use tokio_util::sync::CancellationToken;

use crate::registry::ServiceRegistry;

/// Boxed future returned across the dispatch boundary.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcomes of a call that are not formula values.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// Cooperative abort. Never carries a partial result.
    #[error("evaluation was cancelled")]
    Cancelled,
    /// A dynamic value was used against its contract (a caller bug).
    #[error(transparent)]
    Unsupported(#[from] UnsupportedOperation),
    /// Unexpected fault inside an implementation. The dispatch boundary
    /// turns this into an `ExternalFailure` error value.
    #[error("{0:#}")]
    Fault(anyhow::Error),
    /// An error the caller asked to have raised instead of returned
    /// (connector `throw_on_error`).
    #[error("{0}")]
    Raised(ErrorValue),
}

impl From<anyhow::Error> for InvokeError {
    fn from(e: anyhow::Error) -> Self {
        InvokeError::Fault(e)
    }
}

/// Abort with `Cancelled` if the signal has fired.
pub fn check_cancelled(cancel: &CancellationToken) -> Result<(), InvokeError> {
    if cancel.is_cancelled() {
        Err(InvokeError::Cancelled)
    } else {
        Ok(())
    }
}

/// Access back into the running evaluator, for functions that evaluate
/// sub-expressions such as lambda arguments.
pub trait ExecutionContext: Send + Sync {
    fn evaluate_lambda<'a>(
        &'a self,
        lambda: LambdaId,
        args: Vec<FormulaValue>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>>;
}

/// How a function treats blank arguments under the short-circuit
/// convention. Errors always short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankPolicy {
    /// Any blank argument makes the result blank.
    Propagate,
    /// The function gives blanks its own meaning.
    Accept,
}

/// Apply the blank/error short-circuit convention to `args`.
///
/// Returns the first error value (left to right) unchanged; otherwise,
/// under `BlankPolicy::Propagate`, `Blank` if any argument is blank.
pub fn short_circuit(args: &[FormulaValue], policy: BlankPolicy) -> Option<FormulaValue> {
    if let Some(err) = args.iter().find(|a| a.is_error()) {
        return Some(err.clone());
    }
    if policy == BlankPolicy::Propagate && args.iter().any(FormulaValue::is_blank) {
        return Some(FormulaValue::Blank);
    }
    None
}

static MISSING_ARG: FormulaValue = FormulaValue::Blank;

/// Everything one function call gets: its evaluated arguments, the call
/// node's IR context, the evaluation's services and the evaluator itself.
///
/// The envelope borrows per-call evaluator state for `'a` and therefore
/// cannot be kept past the call. It is never mutated; `with_args` derives
/// a new one.
pub struct Invocation<'a> {
    args: Vec<FormulaValue>,
    ir: &'a IrContext,
    services: &'a ServiceRegistry,
    context: &'a dyn ExecutionContext,
}

impl<'a> Invocation<'a> {
    pub fn new(
        args: Vec<FormulaValue>,
        ir: &'a IrContext,
        services: &'a ServiceRegistry,
        context: &'a dyn ExecutionContext,
    ) -> Self {
        Self {
            args,
            ir,
            services,
            context,
        }
    }

    pub fn args(&self) -> &[FormulaValue] {
        &self.args
    }

    /// Argument `i`, or `Blank` when the call has fewer arguments.
    pub fn arg(&self, i: usize) -> &FormulaValue {
        self.args.get(i).unwrap_or(&MISSING_ARG)
    }

    pub fn ir(&self) -> &'a IrContext {
        self.ir
    }

    /// Derived from the call node, never stored separately.
    pub fn result_type(&self) -> FormulaType {
        self.ir.result_type
    }

    pub fn span(&self) -> Span {
        self.ir.span
    }

    pub fn services(&self) -> &'a ServiceRegistry {
        self.services
    }

    pub fn context(&self) -> &'a dyn ExecutionContext {
        self.context
    }

    /// Same call with different arguments; every other field is shared.
    pub fn with_args(&self, args: Vec<FormulaValue>) -> Invocation<'a> {
        Invocation {
            args,
            ir: self.ir,
            services: self.services,
            context: self.context,
        }
    }

    pub fn short_circuit(&self, policy: BlankPolicy) -> Option<FormulaValue> {
        short_circuit(&self.args, policy)
    }

    /// An error value located at this call.
    pub fn error(&self, err: impl FnOnce(Span) -> ErrorValue) -> FormulaValue {
        FormulaValue::Error(err(self.span()))
    }
}

impl std::fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("args", &self.args)
            .field("ir", self.ir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::ErrorKind;

    struct NoLambdas;

    impl ExecutionContext for NoLambdas {
        fn evaluate_lambda<'a>(
            &'a self,
            _lambda: LambdaId,
            _args: Vec<FormulaValue>,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>> {
            Box::pin(async { Ok(FormulaValue::Blank) })
        }
    }

    fn err(msg: &str) -> FormulaValue {
        FormulaValue::error(ErrorKind::Validation, msg, Span::default())
    }

    #[test]
    fn with_args_shares_everything_but_arguments() {
        let ir = IrContext::new(FormulaType::Decimal, Span::new(4, 11));
        let services = ServiceRegistry::new();
        let ctx = NoLambdas;
        let inv = Invocation::new(vec![FormulaValue::Number(1.0)], &ir, &services, &ctx);
        let derived = inv.with_args(vec![FormulaValue::Boolean(true), FormulaValue::Blank]);

        assert!(std::ptr::eq(inv.ir(), derived.ir()));
        assert!(std::ptr::eq(inv.services(), derived.services()));
        assert!(std::ptr::eq(
            inv.context() as *const _ as *const u8,
            derived.context() as *const _ as *const u8
        ));
        assert_eq!(derived.result_type(), FormulaType::Decimal);
        assert_eq!(inv.args(), &[FormulaValue::Number(1.0)]);
        assert_eq!(derived.args().len(), 2);
    }

    #[test]
    fn missing_argument_reads_as_blank() {
        let ir = IrContext::new(FormulaType::Number, Span::default());
        let services = ServiceRegistry::new();
        let inv = Invocation::new(Vec::new(), &ir, &services, &NoLambdas);
        assert!(inv.arg(3).is_blank());
    }

    #[test]
    fn first_error_wins() {
        let args = vec![
            FormulaValue::Number(1.0),
            err("first"),
            FormulaValue::Blank,
            err("second"),
        ];
        assert_eq!(short_circuit(&args, BlankPolicy::Propagate), Some(err("first")));
        assert_eq!(short_circuit(&args, BlankPolicy::Accept), Some(err("first")));
    }

    #[test]
    fn blank_policy() {
        let args = vec![FormulaValue::Number(1.0), FormulaValue::Blank];
        assert_eq!(
            short_circuit(&args, BlankPolicy::Propagate),
            Some(FormulaValue::Blank)
        );
        assert_eq!(short_circuit(&args, BlankPolicy::Accept), None);
        assert_eq!(
            short_circuit(&[FormulaValue::Boolean(false)], BlankPolicy::Propagate),
            None
        );
    }

    #[test]
    fn cancellation_check() {
        let cancel = CancellationToken::new();
        assert!(check_cancelled(&cancel).is_ok());
        cancel.cancel();
        assert!(matches!(check_cancelled(&cancel), Err(InvokeError::Cancelled)));
    }
}
