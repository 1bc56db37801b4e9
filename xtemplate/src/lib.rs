//! xtemplate — a templating-language HTTP application server.
//!
//! This facade crate re-exports `xtemplate-core` behind a single dependency
//! with feature flags, the way the teacher's `r2e` facade re-exports
//! `r2e-core` (`r2e/src/lib.rs`). The engine itself lives in
//! `xtemplate-core`; this crate exists so a host only ever writes
//! `xtemplate = { version = "…", features = [...] }`.
//!
//! # Feature flags
//!
//! | Feature | Default | Adds |
//! |---------|---------|------|
//! | `sql`   | **yes** | the `sql` dot provider (`xtemplate-core/sql`, `sqlx`) |
//! | `fs`    | **yes** | the `fs` dot provider (`xtemplate-core/fs`) |
//! | `kv`    | **yes** | the `kv` dot provider (`xtemplate-core/kv`) |
//! | `bus`   | **yes** | the `bus` dot provider (`xtemplate-core/bus`) |

pub extern crate xtemplate_core;

pub use xtemplate_core::*;

/// Convenience glob import: `use xtemplate::prelude::*;`.
pub mod prelude {
    pub use crate::config::{Config, ConfigMap, ConfigValue, DotProviderConfig, ProviderKind, TemplatesRoot};
    pub use crate::dot::{DotPlan, DotProvider, DotProviderFactory, DotValue, ProviderContext};
    pub use crate::error::{AppError, BuildError, ExecOutcome};
    pub use crate::instance::{Instance, RouteTarget, VirtualFs};
    pub use crate::server::Server;
}
