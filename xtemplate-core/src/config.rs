//! Plain configuration data.
//!
//! Loading a `Config` from YAML/JSON/flags is left to an external
//! collaborator; this module only defines the struct that collaborator
//! builds, plus a small typed-value accessor generalized for the user
//! key-value map and for provider-specific settings.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

/// A typed configuration value, used both for `Config`'s user key-value map
/// and for a [`DotProviderConfig`]'s kind-specific settings.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::String(v.to_string())
    }
}
impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::String(v)
    }
}
impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}
impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}
impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

/// Ergonomic typed accessor over a [`ConfigValue`].
pub trait FromConfigValue: Sized {
    fn from_config_value(value: &ConfigValue) -> Option<Self>;
}

impl FromConfigValue for String {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}
impl FromConfigValue for i64 {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}
impl FromConfigValue for f64 {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}
impl FromConfigValue for bool {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// A flat map of [`ConfigValue`]s with typed getters, used for `Config`'s
/// user key-value map and for [`DotProviderConfig::settings`].
#[derive(Debug, Clone, Default)]
pub struct ConfigMap(BTreeMap<String, ConfigValue>);

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn get<V: FromConfigValue>(&self, key: &str) -> Option<V> {
        self.0.get(key).and_then(V::from_config_value)
    }

    pub fn get_or<V: FromConfigValue>(&self, key: &str, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    /// Looks up a required string setting, for use by provider constructors.
    pub fn require_str(&self, field: &str, key: &str) -> Result<String, ConfigError> {
        self.get::<String>(key).ok_or_else(|| ConfigError::MissingSetting {
            field: field.to_string(),
            key: key.to_string(),
        })
    }
}

/// Where the template filesystem is read from. `Dir` is the common case;
/// `Embedded` lets a host supply an in-memory tree (e.g. assets baked into
/// the binary) without this crate depending on any particular packaging
/// scheme.
#[derive(Clone)]
pub enum TemplatesRoot {
    Dir(PathBuf),
    Embedded(Arc<crate::instance::VirtualFs>),
}

impl From<PathBuf> for TemplatesRoot {
    fn from(path: PathBuf) -> Self {
        TemplatesRoot::Dir(path)
    }
}
impl From<&str> for TemplatesRoot {
    fn from(path: &str) -> Self {
        TemplatesRoot::Dir(PathBuf::from(path))
    }
}

/// The kind-specific shape of a dot provider declaration. `Custom` covers
/// user-defined kinds registered with [`Config::register_provider_factory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Request,
    Response,
    Flush,
    InstanceView,
    #[cfg(feature = "sql")]
    Sql,
    #[cfg(feature = "fs")]
    FilesystemReader,
    #[cfg(feature = "kv")]
    KeyValue,
    #[cfg(feature = "bus")]
    MessageBus,
    Custom(String),
}

/// A named, typed dot provider declaration.
#[derive(Debug, Clone)]
pub struct DotProviderConfig {
    pub field_name: String,
    pub kind: ProviderKind,
    pub settings: ConfigMap,
}

impl DotProviderConfig {
    pub fn new(field_name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            field_name: field_name.into(),
            kind,
            settings: ConfigMap::new(),
        }
    }

    pub fn with_settings(mut self, settings: ConfigMap) -> Self {
        self.settings = settings;
        self
    }
}

/// Plain configuration data. Built by an external caller/collaborator; this
/// crate never parses it from a file or the CLI.
#[derive(Clone)]
pub struct Config {
    pub templates_root: TemplatesRoot,
    pub template_extension: String,
    pub left_delim: String,
    pub right_delim: String,
    pub minify: bool,
    pub providers: Vec<DotProviderConfig>,
    pub extra_functions: Vec<crate::functions::FunctionTable>,
    pub cancellation: CancellationToken,
    pub logger: tracing::Span,
    pub user_config: ConfigMap,
    pub(crate) custom_provider_factories:
        BTreeMap<String, Arc<dyn crate::dot::DotProviderFactory>>,
}

impl Config {
    /// Builds a `Config` with just a templates root; every other field gets
    /// its built-in default. Callers still need to push at least the
    /// built-in `request`/`response`/`flush`/`instance-view` providers via
    /// [`Config::with_default_providers`] unless they want full manual
    /// control over the dot plan.
    pub fn new(templates_root: impl Into<TemplatesRoot>) -> Self {
        let mut config = Self {
            templates_root: templates_root.into(),
            template_extension: String::new(),
            left_delim: String::new(),
            right_delim: String::new(),
            minify: false,
            providers: Vec::new(),
            extra_functions: Vec::new(),
            cancellation: CancellationToken::new(),
            logger: tracing::Span::none(),
            user_config: ConfigMap::new(),
            custom_provider_factories: BTreeMap::new(),
        };
        config.fill_defaults();
        config
    }

    /// Fills every unset field with its default. Must run before any build
    /// step does. Idempotent.
    pub fn fill_defaults(&mut self) {
        if self.template_extension.is_empty() {
            self.template_extension = ".html".to_string();
        }
        if self.left_delim.is_empty() {
            self.left_delim = "{{".to_string();
        }
        if self.right_delim.is_empty() {
            self.right_delim = "}}".to_string();
        }
        if matches!(self.logger.metadata(), None) {
            self.logger = tracing::info_span!("xtemplate_instance");
        }
    }

    /// Appends the four built-in providers in the conventional order
    /// (`instance`, `request`, `response`, `flush`); callers that want a
    /// different field layout or extra providers should push
    /// [`DotProviderConfig`] entries directly instead.
    pub fn with_default_providers(mut self) -> Self {
        self.providers.push(DotProviderConfig::new("instance", ProviderKind::InstanceView));
        self.providers.push(DotProviderConfig::new("request", ProviderKind::Request));
        self.providers.push(DotProviderConfig::new("response", ProviderKind::Response));
        self.providers.push(DotProviderConfig::new("flush", ProviderKind::Flush));
        self
    }

    pub fn register_provider_factory(
        &mut self,
        kind_name: impl Into<String>,
        factory: Arc<dyn crate::dot::DotProviderFactory>,
    ) {
        self.custom_provider_factories.insert(kind_name.into(), factory);
    }

    /// Validates delimiter/provider-field invariants before a build attempts
    /// to use them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.left_delim == self.right_delim {
            return Err(ConfigError::InvalidDelimiters {
                left: self.left_delim.clone(),
                right: self.right_delim.clone(),
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.field_name.clone()) {
                return Err(ConfigError::DuplicateField(provider.field_name.clone()));
            }
            if let ProviderKind::Custom(kind) = &provider.kind {
                if !self.custom_provider_factories.contains_key(kind) {
                    return Err(ConfigError::UnknownProviderKind {
                        field: provider.field_name.clone(),
                        kind: kind.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Makes a shallow copy suitable for a reload with overrides applied:
    /// same providers/functions/paths, fresh cancellation context.
    pub fn clone_for_reload(&self) -> Self {
        let mut copy = self.clone();
        copy.cancellation = CancellationToken::new();
        copy
    }
}
