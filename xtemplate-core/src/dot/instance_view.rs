//! `instance-view` dot provider: read-only instance introspection available
//! to every plan, including the init plan.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use minijinja::value::{Object, Value};
use minijinja::{Error, ErrorKind, State};

use super::{DotProvider, ProviderContext, ProviderError};

pub struct InstanceViewProvider;

impl DotProvider for InstanceViewProvider {
    fn value<'a>(&'a self, ctx: &'a ProviderContext<'a>) -> BoxFuture<'a, Result<Value, ProviderError>> {
        let instance = ctx.instance.handle();
        Box::pin(async move { Ok(Value::from_object(InstanceView { instance })) })
    }
}

struct InstanceView {
    instance: crate::instance::InstanceHandle,
}

impl std::fmt::Debug for InstanceView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceView").field("id", &self.instance.id()).finish()
    }
}

impl Object for InstanceView {
    fn call_method(
        self: &Arc<Self>,
        _state: &State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "StaticFileHash" => {
                let path = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::new(ErrorKind::MissingArgument, "StaticFileHash: missing path"))?;
                self.instance
                    .asset_hash(path)
                    .map(Value::from)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, format!("no such static asset {path:?}")))
            }
            "Template" => {
                let name = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::new(ErrorKind::MissingArgument, "Template: missing name"))?;
                let dot = args.get(1).cloned().unwrap_or(Value::UNDEFINED);
                let rendered = self
                    .instance
                    .render_template(name, dot)
                    .map_err(|source| Error::new(ErrorKind::InvalidOperation, source.to_string()).with_source(source))?;
                Ok(Value::from_safe_string(rendered))
            }
            "Func" => {
                let name = args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::new(ErrorKind::MissingArgument, "Func: missing name"))?;
                self.instance
                    .function(name)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, format!("no such function {name:?}")))
            }
            other => Err(Error::new(ErrorKind::UnknownMethod, format!("instance has no method {other:?}"))),
        }
    }
}
