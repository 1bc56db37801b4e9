//! `key-value` dot provider: an immutable string map shared by every request
//! against one instance, accessed via `Value(key)`.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use minijinja::value::{Object, Value};
use minijinja::{Error, ErrorKind, State};

use super::{DotProvider, ProviderContext, ProviderError};
use crate::config::ConfigMap;

pub struct KvProviderFactory;

pub struct KvProvider {
    map: Arc<BTreeMap<String, String>>,
}

impl KvProvider {
    /// Builds the map from the provider's settings: every setting key whose
    /// value is a string becomes an entry. There is no separate `data` or
    /// `file` key — the settings map *is* the data, since this crate never
    /// parses configuration from a file.
    pub fn from_settings(_field: &str, settings: &ConfigMap) -> Result<Self, crate::error::ConfigError> {
        let mut map = BTreeMap::new();
        for key in settings.keys() {
            if let Some(value) = settings.get::<String>(key) {
                map.insert(key.to_string(), value);
            }
        }
        Ok(Self { map: Arc::new(map) })
    }
}

impl DotProvider for KvProvider {
    fn value<'a>(&'a self, _ctx: &'a ProviderContext<'a>) -> BoxFuture<'a, Result<Value, ProviderError>> {
        let map = self.map.clone();
        Box::pin(async move { Ok(Value::from_object(KvView { map })) })
    }
}

#[derive(Debug)]
struct KvView {
    map: Arc<BTreeMap<String, String>>,
}

impl Object for KvView {
    fn call_method(
        self: &Arc<Self>,
        _state: &State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "Value" => {
                let key = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::new(ErrorKind::MissingArgument, "Value: missing key"))?;
                Ok(self.map.get(key).cloned().map(Value::from).unwrap_or(Value::UNDEFINED))
            }
            other => Err(Error::new(ErrorKind::UnknownMethod, format!("kv has no method {other:?}"))),
        }
    }
}

impl crate::dot::DotProviderFactory for KvProviderFactory {
    fn build(&self, field_name: &str, settings: &ConfigMap) -> Result<Arc<dyn DotProvider>, crate::error::BuildError> {
        Ok(Arc::new(KvProvider::from_settings(field_name, settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_returns_undefined_for_unknown_key() {
        let mut settings = ConfigMap::new();
        settings.insert("greeting", "hello");
        let provider = KvProvider::from_settings("kv", &settings).unwrap();
        let view = KvView { map: provider.map.clone() };
        assert_eq!(view.map.get("greeting").map(String::as_str), Some("hello"));
        assert!(view.map.get("missing").is_none());
    }
}
