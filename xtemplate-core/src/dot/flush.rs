//! `flush` dot provider: the streaming-handler writer and its cancellation-
//! aware primitives.
//!
//! `minijinja` evaluates a template synchronously, so the streaming handler
//! runs template execution inside `tokio::task::spawn_blocking` and this
//! module's `Sleep`/`WaitForServerStop` busy-poll the cancellation tokens in
//! short slices rather than truly `.await`ing them.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use minijinja::value::{Enumerator, Object, Value};
use minijinja::{Error, ErrorKind, State};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::{DotProvider, ProviderContext, ProviderError};
use crate::functions::lookup_signal_slot;

const POLL_SLICE: Duration = Duration::from_millis(5);

/// The streaming handler's write destination: an in-memory buffer flushed to
/// a channel of body chunks on demand, both at template request and on
/// cleanup when successful.
pub struct StreamSink {
    buf: Mutex<Vec<u8>>,
    tx: UnboundedSender<Result<crate::http::Bytes, std::io::Error>>,
}

impl StreamSink {
    pub fn new(tx: UnboundedSender<Result<crate::http::Bytes, std::io::Error>>) -> Arc<Self> {
        Arc::new(Self { buf: Mutex::new(Vec::new()), tx })
    }

    /// Pushes any buffered bytes to the channel immediately.
    pub fn flush(&self) {
        let mut buf = self.buf.lock().unwrap();
        if buf.is_empty() {
            return;
        }
        let chunk = std::mem::take(&mut *buf);
        let _ = self.tx.send(Ok(crate::http::Bytes::from(chunk)));
    }
}

/// `minijinja::Template::render_to_write` writes through `std::io::Write`,
/// not `std::fmt::Write`; this is the only trait the streaming path needs.
impl io::Write for &StreamSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct FlushProvider;

impl DotProvider for FlushProvider {
    fn value<'a>(&'a self, ctx: &'a ProviderContext<'a>) -> BoxFuture<'a, Result<Value, ProviderError>> {
        Box::pin(async move {
            let sink = ctx.sink.clone().ok_or_else(|| {
                ProviderError::new("flush provider used outside a streaming handler")
            })?;
            Ok(Value::from_object(FlushState {
                sink,
                server_cancel: ctx.server_cancel.clone(),
                request_cancel: ctx.request_cancel.clone(),
            }))
        })
    }
}

#[derive(Debug)]
struct FlushState {
    sink: Arc<StreamSink>,
    server_cancel: CancellationToken,
    request_cancel: CancellationToken,
}

impl Object for FlushState {
    fn call_method(
        self: &Arc<Self>,
        state: &State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "Flush" => {
                self.sink.flush();
                Ok(Value::from(""))
            }
            "Repeat" => {
                let max = args
                    .first()
                    .and_then(|v| i64::try_from(v.clone()).ok())
                    .unwrap_or(i64::MAX);
                Ok(Value::from_object(RepeatSequence {
                    max,
                    server_cancel: self.server_cancel.clone(),
                    request_cancel: self.request_cancel.clone(),
                }))
            }
            "Sleep" => {
                let ms = args
                    .first()
                    .and_then(|v| u64::try_from(v.clone()).ok())
                    .ok_or_else(|| Error::new(ErrorKind::MissingArgument, "Sleep: expected a millisecond count"))?;
                if self.poll_until(Duration::from_millis(ms)) {
                    Ok(Value::from(""))
                } else {
                    let slot = lookup_signal_slot(state)
                        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "Sleep used outside a request"))?;
                    slot.set_return();
                    Err(slot.abort_error())
                }
            }
            "WaitForServerStop" => {
                loop {
                    if self.server_cancel.is_cancelled() {
                        return Ok(Value::from(""));
                    }
                    if self.request_cancel.is_cancelled() {
                        let slot = lookup_signal_slot(state).ok_or_else(|| {
                            Error::new(ErrorKind::InvalidOperation, "WaitForServerStop used outside a request")
                        })?;
                        slot.set_return();
                        return Err(slot.abort_error());
                    }
                    std::thread::sleep(POLL_SLICE);
                }
            }
            other => Err(Error::new(ErrorKind::UnknownMethod, format!("flush has no method {other:?}"))),
        }
    }
}

impl FlushState {
    /// Sleeps in short slices, checking cancellation between each. Returns
    /// `false` if either context cancelled before `duration` elapsed.
    fn poll_until(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.server_cancel.is_cancelled() || self.request_cancel.is_cancelled() {
                return false;
            }
            let slice = remaining.min(POLL_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !(self.server_cancel.is_cancelled() || self.request_cancel.is_cancelled())
    }
}

/// The lazy `0, 1, 2, ...` sequence `Repeat` hands to a template `{% for %}`
/// loop, stopping early if either cancellation token fires.
#[derive(Debug)]
struct RepeatSequence {
    max: i64,
    server_cancel: CancellationToken,
    request_cancel: CancellationToken,
}

impl Object for RepeatSequence {
    fn enumerate(self: &Arc<Self>) -> Enumerator {
        let max = self.max;
        let server_cancel = self.server_cancel.clone();
        let request_cancel = self.request_cancel.clone();
        Enumerator::Iter(Box::new((0..max).map(Value::from).take_while(move |_| {
            !server_cancel.is_cancelled() && !request_cancel.is_cancelled()
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn flush_pushes_buffered_bytes_to_channel() {
        let (tx, mut rx) = unbounded_channel();
        let sink = StreamSink::new(tx);
        {
            let mut w: &StreamSink = &sink;
            use std::io::Write;
            w.write_all(b"hello").unwrap();
        }
        sink.flush();
        let chunk = rx.try_recv().unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
    }

    #[test]
    fn repeat_stops_when_request_cancelled() {
        let request_cancel = CancellationToken::new();
        request_cancel.cancel();
        let seq = Arc::new(RepeatSequence {
            max: i64::MAX,
            server_cancel: CancellationToken::new(),
            request_cancel,
        });
        match seq.enumerate() {
            Enumerator::Iter(mut it) => assert!(it.next().is_none()),
            _ => panic!("expected Iter enumerator"),
        }
    }
}
