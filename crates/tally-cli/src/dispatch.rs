//! Function identities, the function table and the invocation boundary.
//!
//! The evaluator builds a `FunctionTable` once, resolves every call site to
//! a `FunctionHandle` ahead of time, and then invokes handles with an
//! envelope per call. The handle is the boundary: it owns argument
//! coercion, converts implementation faults into error values, and records
//! the call in the optional tracer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tally_ast::ty::FormulaType;
use tally_types::{Decimal, ErrorValue, FormulaValue};
use tokio_util::sync::CancellationToken;

use crate::invoke::{BoxFuture, Invocation, InvokeError};
use crate::trace::CallTracer;

/// A function's declared name and namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId {
    pub namespace: Option<String>,
    pub name: String,
}

impl FunctionId {
    pub fn builtin(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn qualified(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Parse `Name` or `Namespace.Name`.
    pub fn parse(text: &str) -> Self {
        match text.rsplit_once('.') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Self::qualified(ns, name),
            _ => Self::builtin(text),
        }
    }

    pub fn of(f: &dyn FormulaFunction) -> Self {
        Self {
            namespace: f.namespace().map(str::to_string),
            name: f.name().to_string(),
        }
    }
}

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A callable function plus the metadata a binder needs to bind calls to it.
pub trait FormulaFunction: Send + Sync {
    fn name(&self) -> &str;

    fn namespace(&self) -> Option<&str> {
        None
    }

    /// Name used in locale-invariant formula text.
    fn invariant_name(&self) -> &str {
        self.name()
    }

    /// Enumerations and option sets the binder must resolve for this function.
    fn required_enums(&self) -> &[&'static str] {
        &[]
    }

    /// Declared parameter types; the arity of every call.
    fn params(&self) -> &[FormulaType];

    fn invoke<'a>(
        &'a self,
        inv: Invocation<'a>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("function '{0}' is already registered")]
    Duplicate(FunctionId),
}

/// All functions an evaluator can call, keyed by identity.
#[derive(Default)]
pub struct FunctionTable {
    functions: HashMap<FunctionId, Arc<dyn FormulaFunction>>,
    tracer: Option<Arc<Mutex<CallTracer>>>,
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.functions.keys().map(|id| id.to_string()).collect();
        names.sort();
        f.debug_struct("FunctionTable")
            .field("functions", &names)
            .field("traced", &self.tracer.is_some())
            .finish()
    }
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding every builtin.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        for b in crate::builtins::BUILTINS {
            let f: Arc<dyn FormulaFunction> = Arc::new(b.clone());
            table.functions.insert(FunctionId::of(f.as_ref()), f);
        }
        table
    }

    pub fn register(&mut self, f: Arc<dyn FormulaFunction>) -> Result<(), RegistryError> {
        let id = FunctionId::of(f.as_ref());
        if self.functions.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.functions.insert(id, f);
        Ok(())
    }

    /// Record every call made through handles resolved after this point.
    pub fn with_tracer(mut self, tracer: Arc<Mutex<CallTracer>>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn resolve(&self, id: &FunctionId) -> Option<FunctionHandle> {
        self.functions.get(id).map(|f| FunctionHandle {
            id: id.clone(),
            target: Arc::clone(f),
            tracer: self.tracer.clone(),
        })
    }

    /// Every registered function, ordered by identity.
    pub fn functions(&self) -> Vec<(&FunctionId, &dyn FormulaFunction)> {
        let mut all: Vec<_> = self
            .functions
            .iter()
            .map(|(id, f)| (id, f.as_ref()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// A resolved call target. Cheap to clone; holds no per-call state.
#[derive(Clone)]
pub struct FunctionHandle {
    id: FunctionId,
    target: Arc<dyn FormulaFunction>,
    tracer: Option<Arc<Mutex<CallTracer>>>,
}

impl std::fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionHandle").field("id", &self.id).finish()
    }
}

impl FunctionHandle {
    pub fn id(&self) -> &FunctionId {
        &self.id
    }

    pub fn function(&self) -> &dyn FormulaFunction {
        self.target.as_ref()
    }

    /// Invoke the target.
    ///
    /// Produces exactly one formula value, or `Cancelled`, or a contract
    /// violation. Faults raised by the target come back as
    /// `ExternalFailure` error values.
    pub async fn invoke(
        &self,
        inv: Invocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<FormulaValue, InvokeError> {
        let ir = *inv.ir();
        let inputs = self.tracer.as_ref().map(|_| inv.args().to_vec());
        let start = Instant::now();

        let outcome = if cancel.is_cancelled() {
            Err(InvokeError::Cancelled)
        } else {
            let params = self.target.params();
            if params.len() != inv.args().len() {
                Ok(FormulaValue::Error(ErrorValue::validation(
                    format!(
                        "{} expects {} argument(s), got {}",
                        self.id,
                        params.len(),
                        inv.args().len()
                    ),
                    ir.span,
                )))
            } else {
                let inv = match coerce_args(params, inv.args(), &ir) {
                    Some(args) => inv.with_args(args),
                    None => inv,
                };
                tracing::debug!(function = %self.id, result_type = %ir.result_type, "invoke");
                self.target.invoke(inv, cancel).await
            }
        };

        let outcome = match outcome {
            Err(InvokeError::Fault(e)) => {
                tracing::warn!(function = %self.id, error = %format!("{e:#}"), "call failed");
                Ok(FormulaValue::Error(ErrorValue::external_failure(
                    format!("{}: {:#}", self.id, e),
                    ir.span,
                )))
            }
            Err(InvokeError::Cancelled) => {
                tracing::info!(function = %self.id, "call cancelled");
                Err(InvokeError::Cancelled)
            }
            other => other,
        };

        if let (Some(tracer), Some(inputs)) = (&self.tracer, inputs) {
            let mut t = tracer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = t.record(&self.id, &inputs, &outcome, start.elapsed()) {
                tracing::error!(function = %self.id, error = %e, "trace write failed");
            }
        }

        outcome
    }
}

/// Widen arguments to their declared parameter type. Returns `None` when
/// nothing needs to change.
fn coerce_args(
    params: &[FormulaType],
    args: &[FormulaValue],
    ir: &tally_ast::ir::IrContext,
) -> Option<Vec<FormulaValue>> {
    let needs = params
        .iter()
        .zip(args)
        .any(|(p, a)| matches!((p, a), (FormulaType::Decimal, FormulaValue::Number(_))));
    if !needs {
        return None;
    }
    let coerced = params
        .iter()
        .zip(args)
        .map(|(p, a)| match (p, a) {
            (FormulaType::Decimal, FormulaValue::Number(n)) => match Decimal::try_from(*n) {
                Ok(d) => FormulaValue::Decimal(d),
                Err(_) => FormulaValue::Error(ErrorValue::numeric(
                    format!("{n} cannot be represented as a decimal"),
                    ir.span,
                )),
            },
            _ => a.clone(),
        })
        .collect();
    Some(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::{check_cancelled, ExecutionContext};
    use crate::registry::ServiceRegistry;
    use anyhow::Context;
    use tally_ast::ir::{IrContext, LambdaId};
    use tally_ast::span::Span;
    use tally_types::ErrorKind;

    struct Ctx;

    impl ExecutionContext for Ctx {
        fn evaluate_lambda<'a>(
            &'a self,
            _lambda: LambdaId,
            _args: Vec<FormulaValue>,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>> {
            Box::pin(async { Ok(FormulaValue::Blank) })
        }
    }

    /// Echoes its single argument back.
    struct Echo(FormulaType);

    impl FormulaFunction for Echo {
        fn name(&self) -> &str {
            "Echo"
        }
        fn params(&self) -> &[FormulaType] {
            std::slice::from_ref(&self.0)
        }
        fn invoke<'a>(
            &'a self,
            inv: Invocation<'a>,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>> {
            Box::pin(async move {
                check_cancelled(cancel)?;
                Ok(inv.arg(0).clone())
            })
        }
    }

    struct Faulty;

    impl FormulaFunction for Faulty {
        fn name(&self) -> &str {
            "Faulty"
        }
        fn namespace(&self) -> Option<&str> {
            Some("Files")
        }
        fn params(&self) -> &[FormulaType] {
            &[]
        }
        fn invoke<'a>(
            &'a self,
            _inv: Invocation<'a>,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>> {
            Box::pin(async {
                let text = std::fs::read_to_string("/nonexistent/tally/attachment")
                    .context("resolving attachment")?;
                Ok(FormulaValue::String(text))
            })
        }
    }

    fn run(
        handle: &FunctionHandle,
        args: Vec<FormulaValue>,
    ) -> Result<FormulaValue, InvokeError> {
        let ir = IrContext::new(FormulaType::Blank, Span::new(1, 5));
        let services = ServiceRegistry::new();
        let cancel = CancellationToken::new();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(handle.invoke(Invocation::new(args, &ir, &services, &Ctx), &cancel))
    }

    #[test]
    fn function_id_parsing_and_display() {
        assert_eq!(FunctionId::parse("Rand"), FunctionId::builtin("Rand"));
        assert_eq!(
            FunctionId::parse("Office365.SendMail"),
            FunctionId::qualified("Office365", "SendMail")
        );
        assert_eq!(FunctionId::parse(".x"), FunctionId::builtin(".x"));
        assert_eq!(FunctionId::qualified("A", "B").to_string(), "A.B");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut table = FunctionTable::new();
        table.register(Arc::new(Echo(FormulaType::Number))).unwrap();
        let err = table.register(Arc::new(Echo(FormulaType::String))).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(id) if id.name == "Echo"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn number_is_widened_for_decimal_params() {
        let mut table = FunctionTable::new();
        table.register(Arc::new(Echo(FormulaType::Decimal))).unwrap();
        let h = table.resolve(&FunctionId::builtin("Echo")).unwrap();
        let out = run(&h, vec![FormulaValue::Number(2.5)]).unwrap();
        assert_eq!(out, FormulaValue::Decimal(Decimal::new(25, 1)));
    }

    #[test]
    fn unrepresentable_number_becomes_numeric_error() {
        let mut table = FunctionTable::new();
        table.register(Arc::new(Echo(FormulaType::Decimal))).unwrap();
        let h = table.resolve(&FunctionId::builtin("Echo")).unwrap();
        match run(&h, vec![FormulaValue::Number(f64::INFINITY)]).unwrap() {
            FormulaValue::Error(e) => assert_eq!(e.kind, ErrorKind::Numeric),
            other => panic!("expected error, got {other}"),
        }
    }

    #[test]
    fn other_params_are_not_coerced() {
        let mut table = FunctionTable::new();
        table.register(Arc::new(Echo(FormulaType::Number))).unwrap();
        let h = table.resolve(&FunctionId::builtin("Echo")).unwrap();
        assert_eq!(
            run(&h, vec![FormulaValue::Number(2.5)]).unwrap(),
            FormulaValue::Number(2.5)
        );
    }

    #[test]
    fn wrong_arity_is_validation_error() {
        let mut table = FunctionTable::new();
        table.register(Arc::new(Echo(FormulaType::Number))).unwrap();
        let h = table.resolve(&FunctionId::builtin("Echo")).unwrap();
        match run(&h, vec![]).unwrap() {
            FormulaValue::Error(e) => {
                assert_eq!(e.kind, ErrorKind::Validation);
                assert!(e.message.contains("expects 1"), "{}", e.message);
            }
            other => panic!("expected error, got {other}"),
        }
    }

    #[test]
    fn fault_becomes_external_failure_value() {
        let mut table = FunctionTable::new();
        table.register(Arc::new(Faulty)).unwrap();
        let h = table.resolve(&FunctionId::qualified("Files", "Faulty")).unwrap();
        match run(&h, vec![]).unwrap() {
            FormulaValue::Error(e) => {
                assert_eq!(e.kind, ErrorKind::ExternalFailure);
                assert_eq!(e.span, Span::new(1, 5));
                assert!(
                    e.message.starts_with("Files.Faulty: resolving attachment"),
                    "{}",
                    e.message
                );
            }
            other => panic!("expected error, got {other}"),
        }
    }

    #[test]
    fn cancelled_before_call() {
        let mut table = FunctionTable::new();
        table.register(Arc::new(Echo(FormulaType::Number))).unwrap();
        let h = table.resolve(&FunctionId::builtin("Echo")).unwrap();
        let ir = IrContext::new(FormulaType::Number, Span::default());
        let services = ServiceRegistry::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let out = rt.block_on(h.invoke(
            Invocation::new(vec![FormulaValue::Number(1.0)], &ir, &services, &Ctx),
            &cancel,
        ));
        assert!(matches!(out, Err(InvokeError::Cancelled)));
    }

    /// Localized name with an option set the binder has to resolve.
    struct SendMail;

    impl FormulaFunction for SendMail {
        fn name(&self) -> &str {
            "EnviarCorreo"
        }
        fn namespace(&self) -> Option<&str> {
            Some("Mail")
        }
        fn invariant_name(&self) -> &str {
            "SendMail"
        }
        fn required_enums(&self) -> &[&'static str] {
            &["Importance"]
        }
        fn params(&self) -> &[FormulaType] {
            &[FormulaType::String]
        }
        fn invoke<'a>(
            &'a self,
            _inv: Invocation<'a>,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>> {
            Box::pin(async { Ok(FormulaValue::Boolean(true)) })
        }
    }

    #[test]
    fn registration_metadata_defaults_and_overrides() {
        let mut table = FunctionTable::new();
        table.register(Arc::new(Echo(FormulaType::Number))).unwrap();
        table.register(Arc::new(SendMail)).unwrap();

        let echo = table.resolve(&FunctionId::builtin("Echo")).unwrap();
        assert_eq!(echo.function().invariant_name(), "Echo");
        assert!(echo.function().required_enums().is_empty());

        let mail = table.resolve(&FunctionId::qualified("Mail", "EnviarCorreo")).unwrap();
        assert_eq!(mail.function().invariant_name(), "SendMail");
        assert_eq!(mail.function().required_enums(), &["Importance"]);
    }

    #[test]
    fn unknown_function_does_not_resolve() {
        let table = FunctionTable::with_builtins();
        assert!(table.resolve(&FunctionId::builtin("NoSuchFunction")).is_none());
        assert!(table.resolve(&FunctionId::builtin("ParseJSON")).is_some());
    }
}
