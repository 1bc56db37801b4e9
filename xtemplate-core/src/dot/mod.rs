//! Dot assembly: synthesizing a per-request root value from an ordered list
//! of provider configs, and the built-in providers.
//!
//! Pooling is intentionally omitted — every request allocates a fresh
//! [`DotRecord`] rather than recycling one from a pool. See `DESIGN.md`.

pub mod flush;
pub mod instance_view;
pub mod request;
pub mod response;

#[cfg(feature = "bus")]
pub mod bus;
#[cfg(feature = "fs")]
pub mod fs;
#[cfg(feature = "kv")]
pub mod kv;
#[cfg(feature = "sql")]
pub mod sql;

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use minijinja::value::{Object, Value};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigMap;
use crate::error::SignalSlot;
use crate::functions::SIGNAL_CONTEXT_KEY;
use crate::http::{HeaderMap, Method, Uri};

/// A provider-init or cleanup failure.
#[derive(Debug, thiserror::Error, Clone)]
#[error("{0}")]
pub struct ProviderError(pub String);

impl ProviderError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A lightweight, owned copy of a template execution error, threaded through
/// the cleanup chain so later providers can see what earlier ones (or the
/// template itself) produced.
#[derive(Debug, Clone)]
pub struct ExecError(pub String);

impl From<&minijinja::Error> for ExecError {
    fn from(err: &minijinja::Error) -> Self {
        ExecError(err.to_string())
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a provider needs to produce this request's value for its
/// field.
pub struct ProviderContext<'a> {
    pub server_cancel: &'a CancellationToken,
    pub request_cancel: &'a CancellationToken,
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub body: &'a crate::http::Bytes,
    pub path_vars: &'a [(String, String)],
    pub field_name: &'a str,
    pub settings: &'a ConfigMap,
    pub instance: &'a crate::instance::Instance,
    /// The streaming handler's write destination; `None` for buffered/init
    /// plans.
    pub sink: Option<Arc<flush::StreamSink>>,
}

/// A pluggable dot provider. Implementors contribute exactly one named field
/// to the synthesized request root.
pub trait DotProvider: Send + Sync {
    /// Produces this request's value for the field. A representative value
    /// produced against a mock/build-time context also satisfies the build
    /// step's type probe.
    fn value<'a>(&'a self, ctx: &'a ProviderContext<'a>) -> BoxFuture<'a, Result<Value, ProviderError>>;

    /// Whether this provider participates in the cleanup chain. Providers
    /// that implement a cleanup contract are recorded by index.
    fn needs_cleanup(&self) -> bool {
        false
    }

    /// Runs in declaration order (not reverse) once template execution has
    /// finished; receives and may replace the accumulated error.
    fn cleanup<'a>(
        &'a self,
        _value: Value,
        error: Option<ExecError>,
    ) -> BoxFuture<'a, Option<ExecError>> {
        Box::pin(async move { error })
    }
}

/// Trait object-safe factory for user-defined ([`crate::config::ProviderKind::Custom`])
/// provider kinds, registered via [`crate::config::Config::register_provider_factory`].
pub trait DotProviderFactory: Send + Sync {
    fn build(&self, field_name: &str, settings: &ConfigMap) -> Result<Arc<dyn DotProvider>, crate::error::BuildError>;
}

/// A synthesized record type built from an ordered list of providers.
#[derive(Clone)]
pub struct DotPlan {
    pub(crate) entries: Vec<(String, Arc<dyn DotProvider>)>,
    pub(crate) cleanup_indices: Vec<usize>,
}

impl DotPlan {
    pub fn new(entries: Vec<(String, Arc<dyn DotProvider>)>) -> Self {
        let cleanup_indices = entries
            .iter()
            .enumerate()
            .filter_map(|(i, (_, p))| p.needs_cleanup().then_some(i))
            .collect();
        Self { entries, cleanup_indices }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Builds this request's [`DotValue`] by running every provider in
    /// order and synthesizing the result into one record.
    pub async fn assemble(&self, ctx_base: &ProviderContext<'_>) -> Result<DotValue, ProviderError> {
        let mut fields = Vec::with_capacity(self.entries.len() + 1);
        for (name, provider) in &self.entries {
            let ctx = ProviderContext { field_name: name, ..clone_ctx(ctx_base) };
            let value = provider.value(&ctx).await?;
            fields.push((name.clone(), value));
        }
        let signal = SignalSlot::new();
        fields.push((SIGNAL_CONTEXT_KEY.to_string(), Value::from_object(signal.clone())));
        Ok(DotValue::new(fields, signal))
    }

    /// Runs cleanup in declaration order, folding the accumulated error.
    pub async fn cleanup(&self, dot: &DotValue, mut error: Option<ExecError>) -> Option<ExecError> {
        for &idx in &self.cleanup_indices {
            let (name, provider) = &self.entries[idx];
            let value = dot.field(name).cloned().unwrap_or(Value::from(()));
            error = provider.cleanup(value, error).await;
        }
        error
    }
}

fn clone_ctx<'a>(ctx: &ProviderContext<'a>) -> ProviderContext<'a> {
    ProviderContext {
        server_cancel: ctx.server_cancel,
        request_cancel: ctx.request_cancel,
        method: ctx.method,
        uri: ctx.uri,
        headers: ctx.headers,
        body: ctx.body,
        path_vars: ctx.path_vars,
        field_name: ctx.field_name,
        settings: ctx.settings,
        instance: ctx.instance,
        sink: ctx.sink.clone(),
    }
}

/// The synthesized root value's backing object: a named struct per
/// commonly-used combination plus a generic map.
#[derive(Debug)]
pub struct DotRecord {
    fields: Vec<(String, Value)>,
}

impl DotRecord {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl Object for DotRecord {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        self.field(name).cloned()
    }
}

/// A concrete instance of a [`DotPlan`]'s record type. Never retained
/// beyond the request.
#[derive(Clone)]
pub struct DotValue {
    record: Arc<DotRecord>,
    value: Value,
    signal: SignalSlot,
}

impl DotValue {
    fn new(fields: Vec<(String, Value)>, signal: SignalSlot) -> Self {
        let record = Arc::new(DotRecord { fields });
        let value = Value::from_dyn_object(record.clone());
        Self { record, value, signal }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.record.field(name)
    }

    pub fn as_value(&self) -> Value {
        self.value.clone()
    }

    /// The signal slot `return`/`response.*`/`flush.*` raise into; resolved
    /// by the handler once template execution returns.
    pub fn signal(&self) -> &SignalSlot {
        &self.signal
    }
}
