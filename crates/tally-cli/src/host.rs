//! Embedding layer: builds the services and function table for one host
//! configuration and runs single calls against them.
//!
//! Connector namespaces are described by a `connector.json` manifest in
//! the connector's directory:
//!
//! ```json
//! { "functions": [
//!     { "name": "GetUser", "params": [{ "name": "id", "type": "Number" }] },
//!     { "name": "Export", "params": [], "raw": true }
//! ] }
//! ```
//!
//! Each operation is answered by `FileTransport` from `<dir>/<name>.json`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as Json;
use tally_ast::ir::{IrContext, LambdaId};
use tally_ast::span::Span;
use tally_ast::ty::FormulaType;
use tally_types::{DynamicValue, ErrorValue, FormulaValue};
use tokio_util::sync::CancellationToken;

use crate::connector::{BasicConnectorContext, ConnectorContext, ConnectorFunction, FileTransport};
use crate::dispatch::{FunctionId, FunctionTable};
use crate::invoke::{BoxFuture, ExecutionContext, Invocation, InvokeError};
use crate::registry::ServiceRegistry;
use crate::services::{
    ClockService, DefaultRandom, FixedClock, Locale, RandomService, TimeZoneInfo,
};
use crate::trace::CallTracer;

/// File name of a connector manifest inside its directory.
pub const MANIFEST_FILE: &str = "connector.json";

/// Largest manifest accepted (1MB).
const MAX_MANIFEST_SIZE: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSpec {
    pub namespace: String,
    pub dir: PathBuf,
}

impl std::str::FromStr for ConnectorSpec {
    type Err = String;

    /// `Namespace=DIR`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((ns, dir)) if !ns.is_empty() && !dir.is_empty() => Ok(Self {
                namespace: ns.to_string(),
                dir: PathBuf::from(dir),
            }),
            _ => Err(format!("expected NAMESPACE=DIR, got '{s}'")),
        }
    }
}

/// Everything a host needs to set up an evaluation.
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub connectors: Vec<ConnectorSpec>,
    pub timezone: Option<TimeZoneInfo>,
    pub locale: Option<String>,
    /// Seed for a deterministic random source.
    pub seed: Option<u64>,
    /// Freeze the clock at this instant.
    pub now: Option<DateTime<Utc>>,
    pub throw_on_error: bool,
    pub raw_results: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    functions: Vec<ManifestFunction>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFunction {
    name: String,
    #[serde(default)]
    params: Vec<ManifestParam>,
    #[serde(default)]
    raw: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestParam {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

/// Read the connector functions declared in `dir`.
pub fn load_connector(namespace: &str, dir: &Path) -> Result<Vec<ConnectorFunction>> {
    let path = dir.join(MANIFEST_FILE);
    let size = std::fs::metadata(&path)
        .with_context(|| format!("reading connector manifest {}", path.display()))?
        .len();
    if size > MAX_MANIFEST_SIZE {
        bail!("connector manifest {} exceeds {} bytes", path.display(), MAX_MANIFEST_SIZE);
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading connector manifest {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&text)
        .with_context(|| format!("parsing connector manifest {}", path.display()))?;

    manifest
        .functions
        .into_iter()
        .map(|f| {
            let params = f
                .params
                .into_iter()
                .map(|p| {
                    let ty = FormulaType::from_name(&p.ty).ok_or_else(|| {
                        anyhow!("{namespace}.{}: unknown parameter type '{}'", f.name, p.ty)
                    })?;
                    Ok((p.name, ty))
                })
                .collect::<Result<Vec<_>>>()?;
            let func = ConnectorFunction::new(namespace, f.name, params);
            Ok(if f.raw { func.raw() } else { func })
        })
        .collect()
}

/// Services plus functions for one configuration.
#[derive(Debug)]
pub struct Host {
    services: ServiceRegistry,
    functions: FunctionTable,
}

impl Host {
    pub fn new(config: &HostConfig) -> Result<Self> {
        let mut services = ServiceRegistry::with_defaults();
        if let Some(at) = config.now {
            services.insert::<Arc<dyn ClockService>>(Arc::new(FixedClock(at)));
        }
        if let Some(seed) = config.seed {
            services.insert::<Arc<dyn RandomService>>(Arc::new(DefaultRandom::seeded(seed)));
        }
        if let Some(name) = &config.locale {
            services.insert(Locale::new(name.clone()));
        }
        let timezone = config.timezone.unwrap_or_default();
        services.insert(timezone);

        let mut functions = FunctionTable::with_builtins();
        if !config.connectors.is_empty() {
            let mut ctx = BasicConnectorContext::new()
                .with_timezone(timezone)
                .with_throw_on_error(config.throw_on_error)
                .with_raw_results(config.raw_results);
            for spec in &config.connectors {
                for f in load_connector(&spec.namespace, &spec.dir)? {
                    functions.register(Arc::new(f))?;
                }
                let transport = Arc::new(FileTransport::new(&spec.dir));
                ctx = ctx.with_transport(spec.namespace.clone(), transport);
                tracing::debug!(
                    namespace = %spec.namespace,
                    dir = %spec.dir.display(),
                    "connector loaded"
                );
            }
            services.insert::<Arc<dyn ConnectorContext>>(Arc::new(ctx));
        }

        Ok(Self {
            services,
            functions,
        })
    }

    /// Record every call in `tracer`.
    pub fn with_tracer(mut self, tracer: Arc<Mutex<CallTracer>>) -> Self {
        self.functions = self.functions.with_tracer(tracer);
        self
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// Invoke one function with already-evaluated arguments.
    ///
    /// An unknown function is a `Validation` error value, as a binder would
    /// report it.
    pub async fn call(
        &self,
        id: &FunctionId,
        args: Vec<FormulaValue>,
        result_type: FormulaType,
        cancel: &CancellationToken,
    ) -> Result<FormulaValue, InvokeError> {
        let span = Span::new(0, id.to_string().len() as u32);
        let Some(handle) = self.functions.resolve(id) else {
            return Ok(FormulaValue::Error(ErrorValue::validation(
                format!("'{id}' is an unknown or unsupported function"),
                span,
            )));
        };
        let ir = IrContext::new(result_type, span);
        let inv = Invocation::new(args, &ir, &self.services, &Detached);
        handle.invoke(inv, cancel).await
    }
}

/// Evaluator for calls made outside any formula; it has no lambdas.
struct Detached;

impl ExecutionContext for Detached {
    fn evaluate_lambda<'a>(
        &'a self,
        lambda: LambdaId,
        _args: Vec<FormulaValue>,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<FormulaValue, InvokeError>> {
        let err = ErrorValue::validation(
            format!("formula {lambda} cannot be evaluated outside an expression"),
            Span::default(),
        );
        Box::pin(std::future::ready(Ok(FormulaValue::Error(err))))
    }
}

/// Map a JSON literal to a formula value.
pub fn value_from_json(v: Json) -> FormulaValue {
    match v {
        Json::Null => FormulaValue::Blank,
        Json::Bool(b) => FormulaValue::Boolean(b),
        Json::Number(n) => match n.as_f64() {
            Some(f) => FormulaValue::Number(f),
            None => FormulaValue::Untyped(DynamicValue::from_json(Json::Number(n))),
        },
        Json::String(s) => FormulaValue::String(s),
        doc @ (Json::Array(_) | Json::Object(_)) => {
            FormulaValue::Untyped(DynamicValue::from_json(doc))
        }
    }
}

/// Parse one command-line argument written as a JSON literal.
pub fn parse_arg(text: &str) -> Result<FormulaValue> {
    let v: Json = serde_json::from_str(text)
        .with_context(|| format!("argument '{text}' is not a JSON literal"))?;
    Ok(value_from_json(v))
}
