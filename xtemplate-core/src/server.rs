//! Server: holds the live [`Instance`] behind an atomic swap, serializes
//! reloads, and runs the HTTP listen loop (spec.md §4.H).
//!
//! Grounded on the teacher's `AppBuilder::serve`/`shutdown_signal` shape
//! (`r2e-core/src/builder.rs`): bind a `TcpListener`, run `axum::serve` with
//! graceful shutdown on Ctrl-C/SIGTERM, log start/stop. The bean-graph
//! builder itself has no counterpart here — an [`Instance`] is built from a
//! plain [`Config`], not a compile-time dependency graph — so only the
//! listen-loop shape survives; see `DESIGN.md`.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::State;
use axum::routing::any;
use tokio::sync::Mutex as AsyncMutex;
use tower_http::catch_panic::CatchPanicLayer;

use crate::config::Config;
use crate::error::BuildError;
use crate::handlers;
use crate::http::{Body, IntoResponse, Request, Response};
use crate::instance::{self, Instance};

/// Holds the current [`Instance`] behind an [`ArcSwap`] so every request
/// reads a consistent snapshot without locking (spec.md §4.H: "always
/// re-reads the cell per request"). The config a reload builds from, and
/// the serialization of reloads against each other, share one mutex —
/// "Reloads are serialized by a mutex; construction is not" (spec.md §4.H).
pub struct Server {
    current: ArcSwap<Instance>,
    config: AsyncMutex<Config>,
}

impl Server {
    /// Builds the first instance from `config` and wraps it.
    pub async fn build(config: Config) -> Result<Self, BuildError> {
        let instance = instance::build(config.clone()).await?;
        Ok(Self {
            current: ArcSwap::from_pointee(instance),
            config: AsyncMutex::new(config),
        })
    }

    /// The instance live at the moment of the call (spec.md §3 `Server`).
    /// Cloning is a cheap `Arc` handle, so callers that need a stable view
    /// across several operations (a single request) should call this once
    /// and reuse the result rather than calling it again mid-request.
    pub fn current(&self) -> Instance {
        (**self.current.load()).clone()
    }

    /// Builds a fresh instance from the stored config, with `overrides`
    /// applied to a copy, then atomically swaps it in (spec.md §4.H:
    /// "`Reload(overrides…)` builds a new Instance from the stored Config
    /// with overrides applied to a copy"). The previous instance's
    /// cancellation context is only cancelled once the new instance is
    /// live, so in-flight requests against it keep running until they
    /// notice cancellation. On failure the previous instance remains live
    /// and the error is returned untouched.
    pub async fn reload(&self, overrides: impl FnOnce(&mut Config)) -> Result<u64, BuildError> {
        let mut guard = self.config.lock().await;
        let mut next_config = guard.clone_for_reload();
        overrides(&mut next_config);
        let next = instance::build(next_config.clone()).await?;
        let new_id = next.id();

        let previous = self.current();
        self.current.store(Arc::new(next));
        previous.cancellation().cancel();
        *guard = next_config;

        tracing::info!(instance_id = new_id, "reloaded instance");
        Ok(new_id)
    }

    /// Dispatches one request against whichever instance is live when the
    /// request arrives (spec.md §4.H, §4.F).
    pub async fn handle(&self, req: Request<Body>) -> Response {
        handlers::dispatch(self.current(), req).await
    }

    /// Cancels the live instance's context, letting long-lived provider
    /// resources (bus subscriptions, open file handles, `WaitForServerStop`
    /// streams) unwind.
    pub fn shutdown(&self) {
        self.current().cancellation().cancel();
    }

    /// Builds the catch-all `axum::Router` that forwards every method and
    /// path to [`Server::handle`] — this crate's own router (spec.md §4.B)
    /// does the real method/pattern matching, so axum's own routing is used
    /// only as the entry point into the `tower` stack. A `CatchPanicLayer`
    /// (the teacher's `layers::catch_panic_layer`, `quarlus-core/src/layers.rs`)
    /// turns a panicking request handler into a 500 instead of taking down
    /// the whole listener; template execution itself already can't panic the
    /// dispatcher since it runs inside `spawn_blocking` (`handlers.rs`), but a
    /// dot provider's synchronous `call_method` runs inline.
    pub fn into_router(self: Arc<Self>) -> axum::Router {
        axum::Router::new()
            .fallback(any(
                |State(server): State<Arc<Server>>, req: Request<Body>| async move { server.handle(req).await },
            ))
            .layer(CatchPanicLayer::custom(handle_panic))
            .with_state(self)
    }

    /// Binds `addr` and serves until a shutdown signal arrives, then cancels
    /// the live instance. Mirrors the teacher's `AppBuilder::serve`
    /// (`r2e-core/src/builder.rs`): bind, log, serve with graceful shutdown,
    /// log again on exit.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "xtemplate server listening");
        let router = self.clone().into_router();
        axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;
        self.shutdown();
        tracing::info!("xtemplate server stopped");
        Ok(())
    }
}

/// `CatchPanicLayer`'s panic handler: logs and converts to a 500, the way the
/// teacher's `panic_handler` does (`quarlus-core/src/layers.rs`).
fn handle_panic(err: Box<dyn std::any::Any + Send>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %message, "request handler panicked");
    crate::error::AppError::Internal("internal server error".to_string()).into_response()
}

/// Waits for Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TemplatesRoot};
    use crate::instance::VirtualFs;

    fn test_config() -> Config {
        let mut vfs = VirtualFs::new();
        vfs.insert("/index.html", b"hello".to_vec());
        Config::new(TemplatesRoot::Embedded(Arc::new(vfs))).with_default_providers()
    }

    #[tokio::test]
    async fn build_then_current_returns_live_instance() {
        let server = Server::build(test_config()).await.unwrap();
        let id = server.current().id();
        assert!(id > 0);
    }

    #[tokio::test]
    async fn reload_swaps_in_a_new_instance_id_and_cancels_the_old() {
        let server = Server::build(test_config()).await.unwrap();
        let old = server.current();
        let new_id = server.reload(|_| {}).await.unwrap();
        assert_ne!(old.id(), new_id);
        assert!(old.cancellation().is_cancelled());
        assert!(!server.current().cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn failed_reload_leaves_previous_instance_live() {
        let server = Server::build(test_config()).await.unwrap();
        let before = server.current().id();
        let err = server
            .reload(|config| {
                config.left_delim = "same".to_string();
                config.right_delim = "same".to_string();
            })
            .await;
        assert!(err.is_err());
        assert_eq!(server.current().id(), before);
        assert!(!server.current().cancellation().is_cancelled());
    }
}
