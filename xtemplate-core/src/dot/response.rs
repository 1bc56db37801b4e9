//! `response` dot provider: the buffered response controller.
//!
//! Header/status mutations accumulate in [`ResponseState`] rather than
//! touching the live response directly; the buffered handler merges them
//! into the outgoing response only after template execution finishes
//! successfully.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use minijinja::value::{Object, Value};
use minijinja::{Error, ErrorKind, State};

use super::{DotProvider, ProviderContext, ProviderError};
use crate::content::{self, ContentMeta};
use crate::functions::lookup_signal_slot;
use crate::http::{HeaderName, HeaderValue, IntoResponse};

pub struct ResponseProvider;

impl DotProvider for ResponseProvider {
    fn value<'a>(&'a self, _ctx: &'a ProviderContext<'a>) -> BoxFuture<'a, Result<Value, ProviderError>> {
        Box::pin(async move { Ok(Value::from_object(ResponseState::new())) })
    }
}

/// Accumulated header mutations and status code for one request.
#[derive(Debug)]
pub struct ResponseState {
    headers: Mutex<Vec<(HeaderName, HeaderValue)>>,
    removed: Mutex<Vec<HeaderName>>,
    status: AtomicU16,
}

impl ResponseState {
    fn new() -> Self {
        Self {
            headers: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            status: AtomicU16::new(200),
        }
    }

    pub fn status(&self) -> u16 {
        self.status.load(Ordering::Relaxed)
    }

    /// Applies the collected header mutations onto a live header map;
    /// called by the buffered handler, not by the provider's own `cleanup`
    /// (there is no external resource to release here, only bookkeeping the
    /// handler reads directly).
    pub fn apply_to(&self, headers: &mut crate::http::HeaderMap) {
        for name in self.removed.lock().unwrap().iter() {
            headers.remove(name);
        }
        for (name, value) in self.headers.lock().unwrap().iter() {
            headers.append(name.clone(), value.clone());
        }
    }
}

impl Object for ResponseState {
    fn call_method(
        self: &Arc<Self>,
        state: &State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "AddHeader" | "SetHeader" => {
                let name = header_name_arg(args, 0, method)?;
                let value = header_value_arg(args, 1, method)?;
                if method == "SetHeader" {
                    self.headers.lock().unwrap().retain(|(n, _)| *n != name);
                }
                self.headers.lock().unwrap().push((name, value));
                Ok(Value::from(()))
            }
            "DelHeader" => {
                let name = header_name_arg(args, 0, method)?;
                self.headers.lock().unwrap().retain(|(n, _)| *n != name);
                self.removed.lock().unwrap().push(name);
                Ok(Value::from(()))
            }
            "SetStatus" => {
                let code = status_arg(args, 0)?;
                self.status.store(code, Ordering::Relaxed);
                Ok(Value::from(()))
            }
            "ReturnStatus" => {
                let code = status_arg(args, 0)?;
                self.status.store(code, Ordering::Relaxed);
                let slot = lookup_signal_slot(state)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "ReturnStatus used outside a request"))?;
                slot.set_return();
                Err(slot.abort_error())
            }
            "ServeContent" => {
                let path = args.first().and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let modtime = modtime_arg(args, 1);
                let body = args
                    .get(2)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                let slot = lookup_signal_slot(state)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "ServeContent used outside a request"))?;
                let mut headers = crate::http::HeaderMap::new();
                self.apply_to(&mut headers);
                let meta = ContentMeta {
                    modified: Some(modtime),
                    content_type: mime_guess::from_path(&path).first_raw().map(str::to_string),
                    ..Default::default()
                };
                let mut response = content::serve_bytes(
                    crate::http::Bytes::from(body.into_bytes()),
                    &meta,
                    &headers,
                );
                for (name, value) in self.headers.lock().unwrap().iter() {
                    response.headers_mut().append(name.clone(), value.clone());
                }
                slot.set_hijack(response);
                Err(slot.abort_error())
            }
            other => Err(Error::new(ErrorKind::UnknownMethod, format!("response has no method {other:?}"))),
        }
    }
}

fn header_name_arg(args: &[Value], idx: usize, fname: &str) -> Result<HeaderName, Error> {
    let raw = args
        .get(idx)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::new(ErrorKind::MissingArgument, format!("{fname}: missing header name")))?;
    HeaderName::try_from(raw).map_err(|_| Error::new(ErrorKind::InvalidOperation, format!("{fname}: invalid header name {raw:?}")))
}

fn header_value_arg(args: &[Value], idx: usize, fname: &str) -> Result<HeaderValue, Error> {
    let raw = args
        .get(idx)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::new(ErrorKind::MissingArgument, format!("{fname}: missing header value")))?;
    HeaderValue::from_str(raw).map_err(|_| Error::new(ErrorKind::InvalidOperation, format!("{fname}: invalid header value {raw:?}")))
}

fn status_arg(args: &[Value], idx: usize) -> Result<u16, Error> {
    let code = args
        .get(idx)
        .and_then(|v| u16::try_from(v.clone()).ok())
        .ok_or_else(|| Error::new(ErrorKind::MissingArgument, "expected an integer status code"))?;
    Ok(code)
}

fn modtime_arg(args: &[Value], idx: usize) -> SystemTime {
    args.get(idx)
        .and_then(|v| i64::try_from(v.clone()).ok())
        .map(|secs| UNIX_EPOCH + std::time::Duration::from_secs(secs.max(0) as u64))
        .unwrap_or_else(SystemTime::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_200() {
        let state = ResponseState::new();
        assert_eq!(state.status(), 200);
    }

    #[test]
    fn set_header_replaces_prior_value() {
        let state = ResponseState::new();
        state.headers.lock().unwrap().push((HeaderName::from_static("x-a"), HeaderValue::from_static("1")));
        state.headers.lock().unwrap().retain(|(n, _)| n != "x-a");
        state.headers.lock().unwrap().push((HeaderName::from_static("x-a"), HeaderValue::from_static("2")));
        let mut headers = crate::http::HeaderMap::new();
        state.apply_to(&mut headers);
        assert_eq!(headers.get("x-a").unwrap(), "2");
    }
}
