//! Functions backed by an external connector.
//!
//! A connector function turns its arguments into a JSON request, sends it
//! over the `Transport` registered for its namespace and reads the response
//! back with `parse_json`, or hands back the raw body when raw results are
//! requested.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::{Map, Value as Json};
use tally_ast::ty::FormulaType;
use tally_types::{parse_json, DynamicValue, ErrorValue, FormulaValue};
use tokio_util::sync::CancellationToken;

use crate::dispatch::FormulaFunction;
use crate::invoke::{check_cancelled, BlankPolicy, BoxFuture, Invocation, InvokeError};
use crate::services::TimeZoneInfo;

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub operation: String,
    pub body: Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Moves one request to a connector and brings back its response.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: TransportRequest)
        -> BoxFuture<'a, anyhow::Result<TransportResponse>>;
}

/// Serves canned responses from `<root>/<operation>.json`.
#[derive(Debug, Clone)]
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Transport for FileTransport {
    fn send<'a>(
        &'a self,
        request: TransportRequest,
    ) -> BoxFuture<'a, anyhow::Result<TransportResponse>> {
        Box::pin(async move {
            let op = request.operation.as_str();
            if op.is_empty() || op.contains(['/', '\\']) || op == ".." || op == "." {
                bail!("invalid operation name '{op}'");
            }
            let path = self.root.join(format!("{op}.json"));
            let body = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading response {}", path.display()))?;
            tracing::debug!(operation = op, path = %path.display(), "file transport");
            Ok(TransportResponse { status: 200, body })
        })
    }
}

/// What an evaluation knows about reaching connectors.
pub trait ConnectorContext: Send + Sync {
    fn transport_for(&self, namespace: &str) -> Option<Arc<dyn Transport>>;

    /// Timezone date-time arguments are converted to before sending.
    fn timezone(&self) -> TimeZoneInfo;

    /// Raise connector errors instead of returning them as values.
    fn throw_on_error(&self) -> bool {
        false
    }

    /// Return response bodies as text instead of parsing them.
    fn return_raw_results(&self) -> bool {
        false
    }
}

#[derive(Default, Clone)]
pub struct BasicConnectorContext {
    transports: HashMap<String, Arc<dyn Transport>>,
    timezone: TimeZoneInfo,
    throw_on_error: bool,
    raw: bool,
}

impl std::fmt::Debug for BasicConnectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ns: Vec<_> = self.transports.keys().collect();
        ns.sort();
        f.debug_struct("BasicConnectorContext")
            .field("namespaces", &ns)
            .field("timezone", &self.timezone)
            .field("throw_on_error", &self.throw_on_error)
            .field("raw", &self.raw)
            .finish()
    }
}

impl BasicConnectorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, namespace: impl Into<String>, t: Arc<dyn Transport>) -> Self {
        self.transports.insert(namespace.into(), t);
        self
    }

    pub fn with_timezone(mut self, tz: TimeZoneInfo) -> Self {
        self.timezone = tz;
        self
    }

    pub fn with_throw_on_error(mut self, yes: bool) -> Self {
        self.throw_on_error = yes;
        self
    }

    pub fn with_raw_results(mut self, yes: bool) -> Self {
        self.raw = yes;
        self
    }
}

impl ConnectorContext for BasicConnectorContext {
    fn transport_for(&self, namespace: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(namespace).cloned()
    }

    fn timezone(&self) -> TimeZoneInfo {
        self.timezone
    }

    fn throw_on_error(&self) -> bool {
        self.throw_on_error
    }

    fn return_raw_results(&self) -> bool {
        self.raw
    }
}

/// A view of another context that always asks for raw results.
pub struct RawResultsContext<'a> {
    base: &'a dyn ConnectorContext,
}

impl<'a> RawResultsContext<'a> {
    pub fn new(base: &'a dyn ConnectorContext) -> Self {
        Self { base }
    }
}

impl ConnectorContext for RawResultsContext<'_> {
    fn transport_for(&self, namespace: &str) -> Option<Arc<dyn Transport>> {
        self.base.transport_for(namespace)
    }

    fn timezone(&self) -> TimeZoneInfo {
        self.base.timezone()
    }

    fn throw_on_error(&self) -> bool {
        self.base.throw_on_error()
    }

    fn return_raw_results(&self) -> bool {
        true
    }
}

/// One operation exposed by a connector namespace.
#[derive(Debug, Clone)]
pub struct ConnectorFunction {
    namespace: String,
    name: String,
    params: Vec<FormulaType>,
    param_names: Vec<String>,
    raw: bool,
}

impl ConnectorFunction {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        params: impl IntoIterator<Item = (String, FormulaType)>,
    ) -> Self {
        let (param_names, params) = params.into_iter().unzip();
        Self {
            namespace: namespace.into(),
            name: name.into(),
            params,
            param_names,
            raw: false,
        }
    }

    /// This call site always receives the response body as text.
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    fn request_body(&self, inv: &Invocation<'_>, tz: TimeZoneInfo) -> Result<Json, ErrorValue> {
        let mut body = Map::new();
        for (name, value) in self.param_names.iter().zip(inv.args()) {
            body.insert(name.clone(), to_json(value, tz, inv)?);
        }
        Ok(Json::Object(body))
    }

    async fn call(
        &self,
        inv: Invocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<FormulaValue, InvokeError> {
        if let Some(v) = inv.short_circuit(BlankPolicy::Accept) {
            return Ok(v);
        }
        check_cancelled(cancel)?;

        let Some(registered) = inv.services().connector() else {
            return Ok(inv.error(|s| {
                ErrorValue::validation(
                    format!("no connector is available for {}", self.namespace),
                    s,
                )
            }));
        };
        let raw_view;
        let ctx: &dyn ConnectorContext = if self.raw {
            raw_view = RawResultsContext::new(registered.as_ref());
            &raw_view
        } else {
            registered.as_ref()
        };

        let Some(transport) = ctx.transport_for(&self.namespace) else {
            return Ok(inv.error(|s| {
                ErrorValue::validation(
                    format!("connector namespace '{}' is not configured", self.namespace),
                    s,
                )
            }));
        };

        let body = match self.request_body(&inv, ctx.timezone()) {
            Ok(b) => b,
            Err(e) => return Ok(FormulaValue::Error(e)),
        };
        let request = TransportRequest {
            operation: self.name.clone(),
            body,
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
            r = transport.send(request) => r,
        };

        let response = match response {
            Ok(r) => r,
            Err(e) if ctx.throw_on_error() => {
                return Err(InvokeError::Raised(ErrorValue::external_failure(
                    format!("{}.{}: {:#}", self.namespace, self.name, e),
                    inv.span(),
                )));
            }
            Err(e) => {
                return Err(InvokeError::Fault(
                    e.context(format!("calling connector {}", self.namespace)),
                ))
            }
        };

        if response.status >= 400 {
            let err = ErrorValue::external_failure(
                format!(
                    "{}.{} returned status {}: {}",
                    self.namespace,
                    self.name,
                    response.status,
                    response.body.trim()
                ),
                inv.span(),
            );
            return if ctx.throw_on_error() {
                Err(InvokeError::Raised(err))
            } else {
                Ok(FormulaValue::Error(err))
            };
        }

        if ctx.return_raw_results() {
            Ok(FormulaValue::String(response.body))
        } else {
            Ok(parse_json(&response.body, inv.span()))
        }
    }
}

impl FormulaFunction for ConnectorFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn params(&self) -> &[FormulaType] {
        &self.params
    }

    fn invoke<'a>(
        &'a self,
        inv: Invocation<'a>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>> {
        Box::pin(self.call(inv, cancel))
    }
}

fn to_json(
    value: &FormulaValue,
    tz: TimeZoneInfo,
    inv: &Invocation<'_>,
) -> Result<Json, ErrorValue> {
    Ok(match value {
        FormulaValue::Blank => Json::Null,
        FormulaValue::Boolean(b) => Json::Bool(*b),
        FormulaValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .ok_or_else(|| {
                ErrorValue::numeric(format!("{n} cannot be sent to a connector"), inv.span())
            })?,
        FormulaValue::Decimal(d) => decimal_json(&d.to_string()),
        FormulaValue::String(s) => Json::String(s.clone()),
        FormulaValue::DateTime(dt) => Json::String(dt.with_timezone(&tz.offset()).to_rfc3339()),
        FormulaValue::Untyped(u) => dynamic_json(u),
        FormulaValue::Lambda(_) => {
            return Err(ErrorValue::invalid_argument(
                "a lambda cannot be sent to a connector",
                inv.span(),
            ))
        }
        FormulaValue::Error(e) => return Err(e.clone()),
    })
}

/// Decimal literal as an exact JSON number.
fn decimal_json(text: &str) -> Json {
    serde_json::from_str(text).unwrap_or_else(|_| Json::String(text.to_string()))
}

fn dynamic_json(u: &DynamicValue) -> Json {
    match u {
        DynamicValue::Json(node) => node.node().clone(),
        DynamicValue::Sequence(items) => Json::Array(items.iter().map(dynamic_json).collect()),
        DynamicValue::Decimal(d) => decimal_json(&d.to_string()),
        DynamicValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .unwrap_or(Json::Null),
    }
}
