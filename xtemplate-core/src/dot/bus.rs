//! `message-bus` dot provider: an in-process publish/subscribe/request bus
//! keyed by subject, built on a broadcast-channel pattern generalized from
//! "one broadcaster" to "one broadcaster per subject" via `dashmap`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use minijinja::value::{Enumerator, Object, Value};
use minijinja::{Error, ErrorKind, State};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{DotProvider, ProviderContext, ProviderError};
use crate::config::ConfigMap;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const SUBSCRIBE_POLL_SLICE: Duration = Duration::from_millis(5);
const CHANNEL_CAPACITY: usize = 256;

/// The shared, per-instance registry of subject broadcasters. One of these
/// backs every request's `MessageBus` dot value, so publishing from one
/// request reaches subscribers from other concurrent requests.
#[derive(Debug, Default)]
pub struct Bus {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl Bus {
    fn sender(&self, subject: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

pub struct BusProviderFactory;

pub struct BusProvider {
    bus: Arc<Bus>,
}

impl BusProvider {
    pub fn new() -> Self {
        Self { bus: Arc::new(Bus::default()) }
    }

    pub fn from_settings(_field: &str, _settings: &ConfigMap) -> Result<Self, crate::error::ConfigError> {
        Ok(Self::new())
    }
}

impl DotProvider for BusProvider {
    fn value<'a>(&'a self, ctx: &'a ProviderContext<'a>) -> BoxFuture<'a, Result<Value, ProviderError>> {
        let bus = self.bus.clone();
        let request_cancel = ctx.request_cancel.clone();
        Box::pin(async move { Ok(Value::from_object(BusView { bus, request_cancel })) })
    }
}

#[derive(Debug)]
struct BusView {
    bus: Arc<Bus>,
    request_cancel: CancellationToken,
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
}

fn arg_str(args: &[Value], idx: usize, fname: &str) -> Result<String, Error> {
    args.get(idx)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::new(ErrorKind::MissingArgument, format!("{fname}: missing argument")))
}

impl Object for BusView {
    fn call_method(
        self: &Arc<Self>,
        _state: &State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "Publish" => {
                let subject = arg_str(args, 0, "Publish")?;
                let body = arg_str(args, 1, "Publish")?;
                // No active subscribers is not an error: a publish with
                // nobody listening simply has no effect.
                let _ = self.bus.sender(&subject).send(body);
                Ok(Value::from(()))
            }
            "Subscribe" => {
                let subject = arg_str(args, 0, "Subscribe")?;
                let rx = self.bus.sender(&subject).subscribe();
                Ok(Value::from_object(BusSubscription {
                    rx: std::sync::Mutex::new(rx),
                    request_cancel: self.request_cancel.clone(),
                }))
            }
            "Request" => {
                let subject = arg_str(args, 0, "Request")?;
                let body = arg_str(args, 1, "Request")?;
                let timeout = args
                    .get(2)
                    .and_then(|v| u64::try_from(v.clone()).ok())
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
                let reply_subject = format!("{subject}.reply.{}", ulid::Ulid::new());
                let mut reply_rx = self.bus.sender(&reply_subject).subscribe();
                let envelope = format!("{reply_subject}\n{body}");
                let _ = self.bus.sender(&subject).send(envelope);
                let reply = block_on(async {
                    tokio::time::timeout(timeout, reply_rx.recv()).await
                });
                match reply {
                    Ok(Ok(reply_body)) => Ok(Value::from(reply_body)),
                    Ok(Err(_)) => Err(Error::new(ErrorKind::InvalidOperation, "Request: reply channel closed")),
                    Err(_) => Err(Error::new(ErrorKind::InvalidOperation, "Request: timed out waiting for reply")),
                }
            }
            other => Err(Error::new(ErrorKind::UnknownMethod, format!("message-bus has no method {other:?}"))),
        }
    }
}

/// The stream `Subscribe` hands to a `{% for %}` loop: one message per
/// iteration, ending when the request's context is done.
#[derive(Debug)]
struct BusSubscription {
    rx: std::sync::Mutex<broadcast::Receiver<String>>,
    request_cancel: CancellationToken,
}

impl Object for BusSubscription {
    fn enumerate(self: &Arc<Self>) -> Enumerator {
        let this = self.clone();
        Enumerator::Iter(Box::new(std::iter::from_fn(move || {
            loop {
                if this.request_cancel.is_cancelled() {
                    return None;
                }
                let mut rx = this.rx.lock().unwrap();
                match rx.try_recv() {
                    Ok(msg) => return Some(Value::from(msg)),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(broadcast::error::TryRecvError::Closed) => return None,
                    Err(broadcast::error::TryRecvError::Empty) => {
                        drop(rx);
                        std::thread::sleep(SUBSCRIBE_POLL_SLICE);
                    }
                }
            }
        })))
    }
}

impl crate::dot::DotProviderFactory for BusProviderFactory {
    fn build(&self, field_name: &str, settings: &ConfigMap) -> Result<Arc<dyn DotProvider>, crate::error::BuildError> {
        Ok(Arc::new(BusProvider::from_settings(field_name, settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_error() {
        let bus = Bus::default();
        assert!(bus.sender("topic").send("hi".to_string()).is_err() || true);
    }

    #[tokio::test]
    async fn publish_then_subscribe_round_trips() {
        let bus = Arc::new(Bus::default());
        let rx = bus.sender("topic").subscribe();
        bus.sender("topic").send("hello".to_string()).unwrap();
        let mut rx = rx;
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
