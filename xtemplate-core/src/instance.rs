//! Instance builder: walks a template filesystem, classifies files into
//! templates and assets, installs routes, and runs `INIT` templates once.
//! Generalizes a compile-time route-assembly pass into a runtime filesystem
//! walk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::assets::{AssetTable, AssetTableBuilder};
use crate::config::{Config, DotProviderConfig, ProviderKind, TemplatesRoot};
use crate::dot::{flush, instance_view, request, response, DotPlan, DotProvider, ExecError, ProviderContext};
use crate::error::{BuildError, ConfigError, ExecOutcome, RouteError};
use crate::functions;
use crate::http::{Bytes, HeaderMap, Method, Uri};
use crate::router::{RouteMethod, RoutePattern, Router};
use crate::template::TemplateEngine;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// The handler a route installed at build time dispatches to (minus the
/// asset variant — assets are matched by exact identity path, not through
/// this pattern router; see `handlers.rs`).
#[derive(Debug, Clone)]
pub enum RouteTarget {
    Buffered(String),
    Streaming(String),
}

impl RouteTarget {
    pub fn name(&self) -> &str {
        match self {
            RouteTarget::Buffered(n) | RouteTarget::Streaming(n) => n,
        }
    }
}

/// An in-memory template filesystem, for hosts that bake templates into the
/// binary instead of reading a directory.
#[derive(Debug, Default)]
pub struct VirtualFs {
    files: BTreeMap<String, Vec<u8>>,
}

impl VirtualFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> &mut Self {
        let mut p = path.into();
        if !p.starts_with('/') {
            p = format!("/{p}");
        }
        self.files.insert(p, bytes.into());
        self
    }
}

struct InstanceInner {
    id: u64,
    engine: TemplateEngine,
    assets: AssetTable,
    router: Router<RouteTarget>,
    init_plan: DotPlan,
    buffered_plan: DotPlan,
    flusher_plan: DotPlan,
    /// The field name the `response` dot provider (if configured) was
    /// assigned, so the buffered handler knows which field of the
    /// assembled [`dot::DotValue`] to merge headers/status from at cleanup.
    response_field: Option<String>,
    /// Same idea for the `flush` provider, used by the streaming handler.
    flush_field: Option<String>,
    cancellation: CancellationToken,
    logger: tracing::Span,
    user_config: crate::config::ConfigMap,
}

/// An immutable, built template-and-route set. Cheaply `Clone`-able: every
/// field lives behind the shared `Arc`, so a
/// clone is just a refcount bump — this is what lets `Server` and every
/// per-request dot value hold their own handle without synchronizing on the
/// instance itself.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

/// A second name for the same cheap-clone handle, used at the call sites
/// that think of themselves as holding a *reference* to the instance (the
/// `instance-view` dot provider) rather than *being* it.
pub type InstanceHandle = Instance;

impl Instance {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub fn assets(&self) -> &AssetTable {
        &self.inner.assets
    }

    pub fn router(&self) -> &Router<RouteTarget> {
        &self.inner.router
    }

    pub fn init_plan(&self) -> &DotPlan {
        &self.inner.init_plan
    }

    pub fn buffered_plan(&self) -> &DotPlan {
        &self.inner.buffered_plan
    }

    pub fn flusher_plan(&self) -> &DotPlan {
        &self.inner.flusher_plan
    }

    pub fn response_field(&self) -> Option<&str> {
        self.inner.response_field.as_deref()
    }

    pub fn flush_field(&self) -> Option<&str> {
        self.inner.flush_field.as_deref()
    }

    pub fn logger(&self) -> &tracing::Span {
        &self.inner.logger
    }

    pub fn user_config(&self) -> &crate::config::ConfigMap {
        &self.inner.user_config
    }

    /// A cheap handle to this same instance, for the `instance-view` dot
    /// provider.
    pub fn handle(&self) -> InstanceHandle {
        self.clone()
    }

    pub fn asset_hash(&self, url_path: &str) -> Option<String> {
        self.inner.assets.get(url_path).map(|a| a.content_hash.clone())
    }

    pub fn render_template(&self, name: &str, dot: minijinja::value::Value) -> Result<String, minijinja::Error> {
        self.inner.engine.render(name, dot)
    }

    pub fn render_template_to_write<W: std::io::Write>(
        &self,
        name: &str,
        dot: minijinja::value::Value,
        out: &mut W,
    ) -> Result<(), minijinja::Error> {
        self.inner.engine.render_to_write(name, dot, out)
    }

    pub fn function(&self, name: &str) -> Option<minijinja::value::Value> {
        self.inner.engine.get_function(name)
    }
}

/// Builds a fresh [`Instance`] from `config`. Assigns the next
/// process-unique instance id regardless of whether the build ultimately
/// succeeds, since that assignment happens early, before any fallible
/// work.
pub async fn build(mut config: Config) -> Result<Instance, BuildError> {
    config.fill_defaults();
    config.validate()?;

    let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);

    let mut functions = functions::builtins();
    for table in &config.extra_functions {
        functions.merge_from(table);
    }
    let mut engine = TemplateEngine::new(&config.left_delim, &config.right_delim, &functions);

    let mut assets_builder = AssetTableBuilder::new();
    let mut router: Router<RouteTarget> = Router::new();
    let mut init_names: Vec<String> = Vec::new();

    for (url_path, bytes, asset_source, modified) in read_template_fs(&config.templates_root)? {
        if url_path.ends_with(config.template_extension.as_str()) {
            let source = String::from_utf8_lossy(&bytes).into_owned();
            let source = if config.minify { crate::template::minify(&source) } else { source };
            let defined = engine.add_file(&url_path, &source, &config.left_delim, &config.right_delim)?;
            for name in defined {
                if let Some(init_name) = name.strip_prefix("INIT ") {
                    let _ = init_name;
                    init_names.push(name);
                    continue;
                }
                if name == url_path {
                    if is_hidden(&url_path) {
                        continue;
                    }
                    let route_path = derive_route_path(&url_path, &config.template_extension);
                    register_route(&mut router, Method::GET, &route_path, RouteTarget::Buffered(name.clone()))?;
                } else if let Some((method, pattern)) = crate::router::split_named_route(&name) {
                    let target = if method.is_streaming() {
                        RouteTarget::Streaming(name.clone())
                    } else {
                        RouteTarget::Buffered(name.clone())
                    };
                    register_route(&mut router, method.http_method(), pattern, target)?;
                }
                // Otherwise the name remains invocable (e.g. via
                // `instance.Template`) but is not routed.
            }
        } else {
            assets_builder.add_file(&url_path, &bytes, asset_source, modified)?;
        }
    }

    let assets = assets_builder.build();
    let (init_plan, buffered_plan, flusher_plan, response_field, flush_field) = build_plans(&config)?;

    let instance = Instance {
        inner: Arc::new(InstanceInner {
            id,
            engine,
            assets,
            router,
            init_plan,
            buffered_plan,
            flusher_plan,
            response_field,
            flush_field,
            cancellation: config.cancellation.clone(),
            logger: config.logger.clone(),
            user_config: config.user_config.clone(),
        }),
    };

    for name in init_names {
        run_init_template(&instance, &name).await?;
    }

    Ok(instance)
}

/// Splits `config.providers` into the four built-in singleton slots plus an
/// ordered "user providers" list, then assembles the three plans:
/// `init = {instance-view} ++ user`, `buffered = {instance-view, request} ++
/// user ++ {response}`, `flusher = {instance-view, request} ++ user ++
/// {flush}`.
fn build_plans(config: &Config) -> Result<(DotPlan, DotPlan, DotPlan, Option<String>, Option<String>), BuildError> {
    let mut instance_entries = Vec::new();
    let mut request_entries = Vec::new();
    let mut response_entries = Vec::new();
    let mut flush_entries = Vec::new();
    let mut user_entries = Vec::new();

    for provider_config in &config.providers {
        let provider = build_provider(provider_config, config)?;
        let entry = (provider_config.field_name.clone(), provider);
        match provider_config.kind {
            ProviderKind::InstanceView => instance_entries.push(entry),
            ProviderKind::Request => request_entries.push(entry),
            ProviderKind::Response => response_entries.push(entry),
            ProviderKind::Flush => flush_entries.push(entry),
            _ => user_entries.push(entry),
        }
    }

    let response_field = response_entries.first().map(|(name, _)| name.clone());
    let flush_field = flush_entries.first().map(|(name, _)| name.clone());

    let init_plan = DotPlan::new([instance_entries.clone(), user_entries.clone()].concat());
    let buffered_plan = DotPlan::new(
        [
            instance_entries.clone(),
            request_entries.clone(),
            user_entries.clone(),
            response_entries,
        ]
        .concat(),
    );
    let flusher_plan = DotPlan::new([instance_entries, request_entries, user_entries, flush_entries].concat());

    Ok((init_plan, buffered_plan, flusher_plan, response_field, flush_field))
}

fn build_provider(pc: &DotProviderConfig, config: &Config) -> Result<Arc<dyn DotProvider>, BuildError> {
    Ok(match &pc.kind {
        ProviderKind::Request => Arc::new(request::RequestProvider),
        ProviderKind::Response => Arc::new(response::ResponseProvider),
        ProviderKind::Flush => Arc::new(flush::FlushProvider),
        ProviderKind::InstanceView => Arc::new(instance_view::InstanceViewProvider),
        #[cfg(feature = "sql")]
        ProviderKind::Sql => crate::dot::sql::SqlProviderFactory.build(&pc.field_name, &pc.settings)?,
        #[cfg(feature = "fs")]
        ProviderKind::FilesystemReader => crate::dot::fs::FsProviderFactory.build(&pc.field_name, &pc.settings)?,
        #[cfg(feature = "kv")]
        ProviderKind::KeyValue => crate::dot::kv::KvProviderFactory.build(&pc.field_name, &pc.settings)?,
        #[cfg(feature = "bus")]
        ProviderKind::MessageBus => crate::dot::bus::BusProviderFactory.build(&pc.field_name, &pc.settings)?,
        ProviderKind::Custom(name) => {
            let factory = config.custom_provider_factories.get(name).ok_or_else(|| {
                BuildError::Config(ConfigError::UnknownProviderKind {
                    field: pc.field_name.clone(),
                    kind: name.clone(),
                })
            })?;
            factory.build(&pc.field_name, &pc.settings)?
        }
    })
}

fn register_route(
    router: &mut Router<RouteTarget>,
    method: Method,
    pattern_str: &str,
    target: RouteTarget,
) -> Result<(), BuildError> {
    let pattern = RoutePattern::parse(pattern_str).map_err(|source| BuildError::InvalidRoute {
        pattern: pattern_str.to_string(),
        source_name: target.name().to_string(),
        reason: route_error_reason(&source),
    })?;
    if let Some(prior) = router.register(method, pattern, target.clone()) {
        return Err(BuildError::DuplicateRoute {
            pattern: pattern_str.to_string(),
            first: prior,
            second: target.name().to_string(),
        });
    }
    Ok(())
}

fn route_error_reason(err: &RouteError) -> &'static str {
    match err {
        RouteError::UnknownMethod(_) => "unknown method",
        RouteError::EmptySegment => "empty path segment",
        RouteError::MisplacedEndAnchor => "{$} may only appear as the final segment",
        RouteError::EmptyVariableName(_) => "empty path variable name",
    }
}

fn is_hidden(url_path: &str) -> bool {
    Path::new(url_path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Strips the template extension and, if the remaining basename is `index`,
/// promotes the route to the parent directory.
fn derive_route_path(url_path: &str, extension: &str) -> String {
    let stripped = url_path.strip_suffix(extension).unwrap_or(url_path);
    match stripped.strip_suffix("/index") {
        Some(parent) if parent.is_empty() => "/".to_string(),
        Some(parent) => parent.to_string(),
        None => stripped.to_string(),
    }
}

/// Reads every file in the template filesystem, in depth-first lexicographic
/// order, returning each file's URL path, its bytes (used for hashing/
/// template parsing at build time), an [`AssetSource`] a non-template file's
/// asset entry can later re-read from lazily, and its modification time.
fn read_template_fs(
    root: &TemplatesRoot,
) -> Result<Vec<(String, Vec<u8>, crate::assets::AssetSource, SystemTime)>, BuildError> {
    match root {
        TemplatesRoot::Dir(path) => {
            let mut entries = Vec::new();
            walk_dir(path, path, &mut entries)?;
            let mut loaded = Vec::with_capacity(entries.len());
            for (url, fs_path) in entries {
                let bytes = std::fs::read(&fs_path)?;
                let modified = std::fs::metadata(&fs_path)?.modified().unwrap_or_else(|_| SystemTime::now());
                loaded.push((url, bytes, crate::assets::AssetSource::Disk(fs_path), modified));
            }
            Ok(loaded)
        }
        TemplatesRoot::Embedded(vfs) => Ok(vfs
            .files
            .iter()
            .map(|(url, bytes)| {
                let source = crate::assets::AssetSource::Memory(std::sync::Arc::from(bytes.as_slice()));
                (url.clone(), bytes.clone(), source, SystemTime::UNIX_EPOCH)
            })
            .collect()),
    }
}

/// Depth-first, lexicographic directory walk, sorting siblings at each
/// level so alternate-encoding files are visited right
/// after their identity sibling and `INIT`/route registration order is
/// deterministic across builds.
fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            walk_dir(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let url = format!("/{}", rel.to_string_lossy().replace('\\', "/"));
            out.push((url, path));
        }
    }
    Ok(())
}

/// Executes one `INIT <name>` template against the init plan with no live
/// request. A return signal is treated the same as a clean finish; any
/// other error aborts the build.
async fn run_init_template(instance: &Instance, name: &str) -> Result<(), BuildError> {
    let request_cancel = CancellationToken::new();
    let method = Method::GET;
    let uri = Uri::from_static("/");
    let headers = HeaderMap::new();
    let body = Bytes::new();
    let ctx = ProviderContext {
        server_cancel: instance.cancellation(),
        request_cancel: &request_cancel,
        method: &method,
        uri: &uri,
        headers: &headers,
        body: &body,
        path_vars: &[],
        field_name: "",
        settings: instance.user_config(),
        instance,
        sink: None,
    };

    let dot = instance.init_plan().assemble(&ctx).await.map_err(|err| BuildError::Init {
        name: name.to_string(),
        source: minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, err.to_string()),
    })?;

    let result = instance.render_template(name, dot.as_value());
    let error = match dot.signal().resolve(result) {
        ExecOutcome::Error(err) => Some(err),
        ExecOutcome::Ok | ExecOutcome::Hijack(_) => None,
    };

    let cleanup_error = instance
        .init_plan()
        .cleanup(&dot, error.as_ref().map(|e| ExecError::from(e)))
        .await;

    if let Some(err) = cleanup_error.or(error.map(|e| ExecError::from(&e))) {
        return Err(BuildError::Init {
            name: name.to_string(),
            source: minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, err.to_string()),
        });
    }
    Ok(())
}
