//! `request` dot provider: the parsed HTTP request, immutable from the
//! template's perspective.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use minijinja::value::{Object, Value};

use super::{DotProvider, ProviderContext, ProviderError};
use crate::http::{self, HeaderMap, Method};

pub struct RequestProvider;

impl DotProvider for RequestProvider {
    fn value<'a>(&'a self, ctx: &'a ProviderContext<'a>) -> BoxFuture<'a, Result<Value, ProviderError>> {
        Box::pin(async move {
            let form = if ctx.method == Method::POST || ctx.method == Method::PUT || ctx.method == Method::PATCH {
                parse_form_body(ctx.headers, ctx.body)
            } else {
                BTreeMap::new()
            };
            let view = RequestView {
                method: ctx.method.to_string(),
                uri: ctx.uri.to_string(),
                path: ctx.uri.path().to_string(),
                query: ctx.uri.query().unwrap_or("").to_string(),
                headers: ctx.headers.clone(),
                cookies: parse_cookies(ctx.headers),
                form,
                path_vars: ctx.path_vars.iter().cloned().collect(),
            };
            Ok(Value::from_object(view))
        })
    }
}

fn parse_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for value in headers.get_all(http::COOKIE) {
        let Ok(s) = value.to_str() else { continue };
        for pair in s.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                cookies.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    cookies
}

fn parse_form_body(headers: &HeaderMap, body: &[u8]) -> BTreeMap<String, String> {
    let is_form = headers
        .get(http::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if !is_form {
        return BTreeMap::new();
    }
    let body_str = String::from_utf8_lossy(body);
    let mut out = BTreeMap::new();
    for pair in body_str.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_encoding::percent_decode_str(k).decode_utf8_lossy().replace('+', " ");
        let val = percent_encoding::percent_decode_str(v).decode_utf8_lossy().replace('+', " ");
        out.insert(key, val);
    }
    out
}

#[derive(Debug)]
struct RequestView {
    method: String,
    uri: String,
    path: String,
    query: String,
    headers: HeaderMap,
    cookies: BTreeMap<String, String>,
    form: BTreeMap<String, String>,
    path_vars: BTreeMap<String, String>,
}

impl Object for RequestView {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "Method" => Some(Value::from(self.method.clone())),
            "URL" => Some(Value::from(self.uri.clone())),
            "Path" => Some(Value::from(self.path.clone())),
            "Query" => Some(Value::from(self.query.clone())),
            "PathVars" => Some(Value::from_serialize(&self.path_vars)),
            "Form" => Some(Value::from_serialize(&self.form)),
            "Cookies" => Some(Value::from_serialize(&self.cookies)),
            _ => None,
        }
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &minijinja::State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, minijinja::Error> {
        match method {
            "Header" => {
                let name = args.first().and_then(|v| v.as_str()).unwrap_or_default();
                let value = self
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                Ok(Value::from(value))
            }
            "Cookie" => {
                let name = args.first().and_then(|v| v.as_str()).unwrap_or_default();
                Ok(self.cookies.get(name).cloned().map(Value::from).unwrap_or(Value::UNDEFINED))
            }
            "FormValue" => {
                let name = args.first().and_then(|v| v.as_str()).unwrap_or_default();
                Ok(self.form.get(name).cloned().map(Value::from).unwrap_or(Value::from("")))
            }
            "PathValue" => {
                let name = args.first().and_then(|v| v.as_str()).unwrap_or_default();
                Ok(self.path_vars.get(name).cloned().map(Value::from).unwrap_or(Value::from("")))
            }
            other => Err(minijinja::Error::new(
                minijinja::ErrorKind::UnknownMethod,
                format!("request has no method {other:?}"),
            )),
        }
    }
}
