//! `filesystem-reader` dot provider: a rooted, read-only view over a
//! configured directory, distinct from the template filesystem itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use minijinja::value::{Object, Value};
use minijinja::{Error, ErrorKind, State};

use super::{DotProvider, ExecError, ProviderContext, ProviderError};
use crate::content::{self, ContentMeta};
use crate::functions::lookup_signal_slot;

pub struct FsProviderFactory;

pub struct FsProvider {
    root: PathBuf,
}

impl FsProvider {
    pub fn from_settings(field: &str, settings: &crate::config::ConfigMap) -> Result<Self, crate::error::ConfigError> {
        let root = settings.require_str(field, "root")?;
        Ok(Self { root: PathBuf::from(root) })
    }
}

impl DotProvider for FsProvider {
    fn value<'a>(&'a self, _ctx: &'a ProviderContext<'a>) -> BoxFuture<'a, Result<Value, ProviderError>> {
        let root = self.root.clone();
        Box::pin(async move { Ok(Value::from_object(FsSession::new(root))) })
    }

    fn needs_cleanup(&self) -> bool {
        true
    }

    fn cleanup<'a>(&'a self, value: Value, error: Option<ExecError>) -> BoxFuture<'a, Option<ExecError>> {
        Box::pin(async move {
            let Some(session) = value.downcast_object::<FsSession>() else { return error };
            session.close_all();
            error
        })
    }
}

/// Resolves a request-relative path against `root`, rejecting any attempt to
/// escape it via `..`.
fn resolve(root: &Path, requested: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(requested.trim_start_matches('/')).components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

/// A handle opened via `Open`, tracked so cleanup can close anything the
/// template forgot to.
struct OpenHandle {
    path: PathBuf,
    closed: bool,
}

#[derive(Debug)]
struct FsSession {
    root: PathBuf,
    handles: Mutex<BTreeMap<u64, OpenHandle>>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for OpenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenHandle").field("path", &self.path).field("closed", &self.closed).finish()
    }
}

impl FsSession {
    fn new(root: PathBuf) -> Self {
        Self { root, handles: Mutex::new(BTreeMap::new()), next_handle: AtomicU64::new(1) }
    }

    fn close_all(&self) {
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.values_mut() {
            handle.closed = true;
        }
    }
}

fn path_arg(args: &[Value], idx: usize, fname: &str) -> Result<String, Error> {
    args.get(idx)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::new(ErrorKind::MissingArgument, format!("{fname}: missing path")))
}

fn io_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::InvalidOperation, err.to_string())
}

impl Object for FsSession {
    fn call_method(
        self: &Arc<Self>,
        state: &State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "Read" => {
                let requested = path_arg(args, 0, "Read")?;
                let path = resolve(&self.root, &requested)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "Read: path escapes root"))?;
                let bytes = std::fs::read(&path).map_err(io_error)?;
                Ok(Value::from(String::from_utf8_lossy(&bytes).into_owned()))
            }
            "Stat" => {
                let requested = path_arg(args, 0, "Stat")?;
                let path = resolve(&self.root, &requested)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "Stat: path escapes root"))?;
                let meta = std::fs::metadata(&path).map_err(io_error)?;
                let mut map = BTreeMap::new();
                map.insert("Size".to_string(), Value::from(meta.len()));
                map.insert("IsDir".to_string(), Value::from(meta.is_dir()));
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                map.insert("ModTime".to_string(), Value::from(modified));
                Ok(Value::from_serialize(&map))
            }
            "Exists" => {
                let requested = path_arg(args, 0, "Exists")?;
                let exists = resolve(&self.root, &requested)
                    .map(|p| p.exists())
                    .unwrap_or(false);
                Ok(Value::from(exists))
            }
            "ListFiles" => {
                let requested = args.first().and_then(|v| v.as_str()).unwrap_or("").to_string();
                let dir = resolve(&self.root, &requested)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "ListFiles: path escapes root"))?;
                let mut names = Vec::new();
                for entry in std::fs::read_dir(&dir).map_err(io_error)? {
                    let entry = entry.map_err(io_error)?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(Value::from(names))
            }
            "Open" => {
                let requested = path_arg(args, 0, "Open")?;
                let path = resolve(&self.root, &requested)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "Open: path escapes root"))?;
                if !path.exists() {
                    return Err(Error::new(ErrorKind::InvalidOperation, format!("Open: no such file {requested:?}")));
                }
                let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
                self.handles.lock().unwrap().insert(id, OpenHandle { path, closed: false });
                Ok(Value::from_object(FileHandle { session: self.clone(), id }))
            }
            "ServeFile" => {
                let requested = path_arg(args, 0, "ServeFile")?;
                let path = resolve(&self.root, &requested)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "ServeFile: path escapes root"))?;
                let bytes = std::fs::read(&path).map_err(io_error)?;
                let modified = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
                let slot = lookup_signal_slot(state)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "ServeFile used outside a request"))?;
                let meta = ContentMeta {
                    modified,
                    content_type: mime_guess::from_path(&path).first_raw().map(str::to_string),
                    ..Default::default()
                };
                let response = content::serve_bytes(crate::http::Bytes::from(bytes), &meta, &crate::http::HeaderMap::new());
                slot.set_hijack(response);
                Err(slot.abort_error())
            }
            other => Err(Error::new(ErrorKind::UnknownMethod, format!("filesystem has no method {other:?}"))),
        }
    }
}

/// An `Open` handle; its only methods are reading its full content and
/// explicitly `Close`ing, after which further use errors.
#[derive(Debug)]
struct FileHandle {
    session: Arc<FsSession>,
    id: u64,
}

impl Object for FileHandle {
    fn call_method(
        self: &Arc<Self>,
        _state: &State,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        let mut handles = self.session.handles.lock().unwrap();
        let Some(handle) = handles.get_mut(&self.id) else {
            return Err(Error::new(ErrorKind::InvalidOperation, "handle no longer tracked"));
        };
        match method {
            "Read" => {
                if handle.closed {
                    return Err(Error::new(ErrorKind::InvalidOperation, "Read: handle is closed"));
                }
                let bytes = std::fs::read(&handle.path).map_err(io_error)?;
                Ok(Value::from(String::from_utf8_lossy(&bytes).into_owned()))
            }
            "Close" => {
                handle.closed = true;
                Ok(Value::from(()))
            }
            other => Err(Error::new(ErrorKind::UnknownMethod, format!("file handle has no method {other:?}"))),
        }
    }
}

impl crate::dot::DotProviderFactory for FsProviderFactory {
    fn build(&self, field_name: &str, settings: &crate::config::ConfigMap) -> Result<Arc<dyn DotProvider>, crate::error::BuildError> {
        Ok(Arc::new(FsProvider::from_settings(field_name, settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_parent_traversal() {
        let root = PathBuf::from("/srv/data");
        assert!(resolve(&root, "../../etc/passwd").is_none());
        assert_eq!(resolve(&root, "sub/file.txt").unwrap(), root.join("sub").join("file.txt"));
    }

    #[test]
    fn close_all_marks_open_handles_closed() {
        let session = FsSession::new(PathBuf::from("."));
        session.handles.lock().unwrap().insert(1, OpenHandle { path: PathBuf::from("x"), closed: false });
        session.close_all();
        assert!(session.handles.lock().unwrap().get(&1).unwrap().closed);
    }
}
