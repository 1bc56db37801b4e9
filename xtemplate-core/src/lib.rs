//! `xtemplate-core`: the templating-language application server engine.
//! Build pipeline, request handlers, and logging generalize a compile-time
//! dependency-injected web framework shape into a runtime-built,
//! hot-reloadable template instance.

pub mod assets;
pub mod config;
pub mod content;
pub mod dot;
pub mod error;
pub mod functions;
pub mod handlers;
pub mod http;
pub mod instance;
pub mod logging;
pub mod router;
pub mod server;
pub mod template;

pub use config::{Config, ConfigMap, ConfigValue, DotProviderConfig, FromConfigValue, ProviderKind, TemplatesRoot};
pub use dot::{DotPlan, DotProvider, DotProviderFactory, DotRecord, DotValue, ExecError, ProviderContext, ProviderError};
pub use error::{AppError, BuildError, ConfigError, ExecOutcome, RouteError, SignalSlot};
pub use instance::{Instance, InstanceHandle, RouteTarget, VirtualFs};
pub use router::{Router, RouteMethod, RoutePattern};
pub use server::Server;
