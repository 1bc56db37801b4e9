//! Error kinds and the in-band execution signal.
//!
//! A structured, `thiserror`-derived enum covers errors that are never shown
//! to an HTTP client (`ConfigError`, `BuildError`, `RouteError`), while a
//! hand-rolled `AppError` with its own `IntoResponse`, `Display`, and `Debug`
//! covers the few errors that do need to become an HTTP response directly.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::http::{IntoResponse, Response, StatusCode};

/// Config-time validation failure: bad delimiters, unknown provider kind,
/// missing setting. Fatal before any build step runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown dot provider kind {kind:?} for field {field:?}")]
    UnknownProviderKind { field: String, kind: String },
    #[error("provider {field:?} is missing required setting {key:?}")]
    MissingSetting { field: String, key: String },
    #[error("left and right action delimiters must differ, got {left:?} and {right:?}")]
    InvalidDelimiters { left: String, right: String },
    #[error("duplicate dot provider field name {0:?}")]
    DuplicateField(String),
}

/// Instance construction failure. Fatal at build; the previous `Instance`,
/// if any, remains live.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("reading template filesystem: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("parsing template {name:?}: {source}")]
    TemplateParse {
        name: String,
        #[source]
        source: minijinja::Error,
    },
    #[error("asset {path:?}: alternate encoding {encoding} does not decode to the identity hash")]
    EncodingHashMismatch { path: String, encoding: &'static str },
    #[error("route {pattern:?} is registered by both {first:?} and {second:?}")]
    DuplicateRoute {
        pattern: String,
        first: String,
        second: String,
    },
    #[error("route pattern {pattern:?} ({source_name:?}): {reason}")]
    InvalidRoute {
        pattern: String,
        source_name: String,
        reason: &'static str,
    },
    #[error("dot provider {field:?} failed to produce a representative value: {message}")]
    ProviderProbe { field: String, message: String },
    #[error("INIT template {name:?}: {source}")]
    Init {
        name: String,
        #[source]
        source: minijinja::Error,
    },
}

/// Route-grammar rejection, surfaced to builders as part of
/// [`BuildError::InvalidRoute`].
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error("empty path segment")]
    EmptySegment,
    #[error("{{$}} may only appear as the final segment")]
    MisplacedEndAnchor,
    #[error("empty path variable name in {{{0}}}")]
    EmptyVariableName(String),
}

/// Errors that are rendered directly to an HTTP client: a handler-level
/// failure that did not go through template execution at all (asset lookup,
/// method-not-allowed, content negotiation failure).
pub enum AppError {
    NotFound,
    NotAcceptable(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            AppError::NotAcceptable(msg) => (StatusCode::NOT_ACCEPTABLE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, message).into_response()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound => write!(f, "not found"),
            AppError::NotAcceptable(msg) => write!(f, "not acceptable: {msg}"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl fmt::Debug for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for AppError {}

/// The outcome of executing one template against a [`crate::dot::DotValue`].
///
/// `minijinja` has no way for a template-callable method to unwind a
/// template evaluation except by returning an error, so `response.*`/
/// `flush.*` methods and the `return` helper record the *real* outcome in a
/// [`SignalSlot`] shared with the executing template and then raise a
/// throwaway `minijinja::Error` to stop evaluation. The handler inspects the
/// slot once `execute` returns, and only treats a leftover error as genuine
/// if the slot is empty.
pub enum ExecOutcome {
    /// Either execution completed normally, or a return/status signal fired;
    /// the handler should write out the buffered/streamed body using
    /// whatever status and headers were accumulated.
    Ok,
    /// A hijack (`ServeContent`, `ServeFile`) fully replaces the response;
    /// anything already buffered must be discarded.
    Hijack(Response),
    /// A genuine template execution error.
    Error(minijinja::Error),
}

#[derive(Debug)]
pub(crate) enum ExecSignal {
    Return,
    Hijack(Response),
}

/// Shared slot a [`crate::dot::DotValue`]'s providers use to record a
/// return/hijack signal before aborting template evaluation.
#[derive(Clone, Debug)]
pub struct SignalSlot(Arc<Mutex<Option<ExecSignal>>>);

impl Default for SignalSlot {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }
}

impl SignalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_return(&self) {
        *self.0.lock().unwrap() = Some(ExecSignal::Return);
    }

    pub(crate) fn set_hijack(&self, response: Response) {
        *self.0.lock().unwrap() = Some(ExecSignal::Hijack(response));
    }

    pub(crate) fn take(&self) -> Option<ExecSignal> {
        self.0.lock().unwrap().take()
    }

    /// Builds the abort error a signal-raising method returns to stop
    /// template evaluation.
    pub(crate) fn abort_error(&self) -> minijinja::Error {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, "xtemplate signal raised")
    }

    /// Resolves an `execute()` result into the outcome a handler should act
    /// on, consuming any recorded signal. Generic over the success payload
    /// since buffered execution produces a `String` and streaming execution
    /// writes directly into the sink and produces `()`.
    pub(crate) fn resolve<T>(&self, result: Result<T, minijinja::Error>) -> ExecOutcome {
        match result {
            Ok(_) => match self.take() {
                Some(ExecSignal::Hijack(response)) => ExecOutcome::Hijack(response),
                Some(ExecSignal::Return) | None => ExecOutcome::Ok,
            },
            Err(err) => match self.take() {
                Some(ExecSignal::Hijack(response)) => ExecOutcome::Hijack(response),
                Some(ExecSignal::Return) => ExecOutcome::Ok,
                None => ExecOutcome::Error(err),
            },
        }
    }
}
