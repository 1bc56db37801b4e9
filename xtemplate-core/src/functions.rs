//! The built-in function table (spec.md §4.C) plus the small registry type
//! `Config.extra_functions` is built from.
//!
//! Functions are stored as `Rest<Value>`-taking closures so a `FunctionTable`
//! can hold entries of differing arity without one enum per signature,
//! mirroring how the teacher keeps its plugin/layer registries as trait
//! objects rather than a fixed set of variants.

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::value::{Object, Rest, Value};
use minijinja::{Error, ErrorKind, State};

use crate::error::SignalSlot;

pub type BoxedFunction =
    Arc<dyn Fn(&State, Rest<Value>) -> Result<Value, Error> + Send + Sync>;

/// A named bundle of template functions. Later tables override earlier ones
/// when merged (spec.md §4.C: "later definitions override earlier").
#[derive(Clone, Default)]
pub struct FunctionTable(BTreeMap<String, BoxedFunction>);

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&State, Rest<Value>) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.0.insert(name.into(), Arc::new(f));
        self
    }

    pub fn merge_from(&mut self, other: &FunctionTable) {
        for (name, f) in &other.0 {
            self.0.insert(name.clone(), f.clone());
        }
    }

    /// Installs every entry into a fresh `minijinja::Environment`, later
    /// tables having already overridden earlier ones in `self`.
    pub(crate) fn install(&self, env: &mut minijinja::Environment<'static>) {
        for (name, f) in self.0.clone() {
            let name_owned = name.clone();
            env.add_function(name_owned, move |state: &State, args: Rest<Value>| {
                f(state, args)
            });
        }
    }

    /// Builds a name -> callable [`Value`] snapshot of every entry, for
    /// `instance-view.Func`: `minijinja::Environment` has no stable public
    /// way to look a previously-registered function back up by name, so
    /// `TemplateEngine` keeps this alongside the entries it already passed
    /// to `install`.
    pub(crate) fn as_values(&self) -> BTreeMap<String, Value> {
        self.0
            .iter()
            .map(|(name, f)| (name.clone(), Value::from_object(CallableFunction(f.clone()))))
            .collect()
    }
}

/// Wraps a [`BoxedFunction`] as a callable `minijinja::value::Object`, so it
/// can be handed back out of the function table as an ordinary template
/// value (e.g. from `instance-view.Func`) and still be invoked with `()`.
struct CallableFunction(BoxedFunction);

impl std::fmt::Debug for CallableFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableFunction").finish()
    }
}

impl Object for CallableFunction {
    fn call(self: &Arc<Self>, state: &State, args: &[Value]) -> Result<Value, Error> {
        (self.0)(state, Rest(args.to_vec()))
    }
}

/// The reserved context key templates are rendered with, holding the current
/// request's [`SignalSlot`] so `return` and the response/flush provider
/// methods can raise it without threading it through every function call.
pub(crate) const SIGNAL_CONTEXT_KEY: &str = "__xtemplate_signal__";

impl Object for SignalSlot {}

pub(crate) fn lookup_signal_slot(state: &State) -> Option<SignalSlot> {
    state
        .lookup(SIGNAL_CONTEXT_KEY)
        .and_then(|v| v.downcast_object_ref::<SignalSlot>().cloned())
}

/// Registers the attribute/URL/script-context escaping filters SPEC_FULL.md
/// §C calls out: since the engine has no static whole-template contextual
/// analysis (it is a black box per spec.md §1), a template author escapes
/// into those three contexts explicitly with `|attr`, `|urlquery`, `|js`
/// rather than relying on automatic context detection the way Go's
/// `html/template` does.
pub(crate) fn register_builtin_filters(env: &mut minijinja::Environment<'static>) {
    // Each filter's output is already escaped for its target context, so it
    // is returned as a safe string; otherwise the HTML autoescaper (always
    // on, see `set_auto_escape_callback` above) would escape it a second
    // time and corrupt the attribute/URL/script-literal syntax these filters
    // exist to produce.
    env.add_filter("attr", |value: Value| -> Value {
        let s = value.to_string();
        let mut out = String::with_capacity(s.len());
        for ch in s.chars() {
            match ch {
                '&' => out.push_str("&amp;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                other => out.push(other),
            }
        }
        Value::from_safe_string(out)
    });

    env.add_filter("urlquery", |value: Value| -> Value {
        let encoded = percent_encoding::utf8_percent_encode(&value.to_string(), percent_encoding::NON_ALPHANUMERIC).to_string();
        Value::from_safe_string(encoded)
    });

    env.add_filter("js", |value: Value| -> Value {
        let s = value.to_string();
        let mut out = String::with_capacity(s.len());
        for ch in s.chars() {
            match ch {
                '\\' => out.push_str("\\\\"),
                '\'' => out.push_str("\\'"),
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '<' => out.push_str("\\u003c"),
                '>' => out.push_str("\\u003e"),
                '&' => out.push_str("\\u0026"),
                other => out.push(other),
            }
        }
        Value::from_safe_string(out)
    });
}

/// Builds the function table of spec.md §4.C's built-ins: `markdown`,
/// `html-sanitize`, `humanize-size`, `humanize-time`, `trust-html`,
/// `trust-js`, `trust-url`, `trust-attr`, `try`, `idx`, `split-front-matter`,
/// `return`.
pub fn builtins() -> FunctionTable {
    let mut table = FunctionTable::new();

    table.insert("markdown", |_state: &State, args: Rest<Value>| {
        let input = arg_str(&args, 0, "markdown")?;
        let parser = pulldown_cmark::Parser::new(&input);
        let mut html = String::new();
        pulldown_cmark::html::push_html(&mut html, parser);
        Ok(Value::from_safe_string(html))
    });

    table.insert("html-sanitize", |_state: &State, args: Rest<Value>| {
        let input = arg_str(&args, 0, "html-sanitize")?;
        let clean = ammonia::clean(&input);
        Ok(Value::from_safe_string(clean))
    });

    table.insert("humanize-size", |_state: &State, args: Rest<Value>| {
        let bytes = arg_u64(&args, 0, "humanize-size")?;
        Ok(Value::from(bytesize::ByteSize(bytes).to_string()))
    });

    table.insert("humanize-time", |_state: &State, args: Rest<Value>| {
        let secs = arg_u64(&args, 0, "humanize-time")?;
        let duration = std::time::Duration::from_secs(secs);
        Ok(Value::from(humantime::format_duration(duration).to_string()))
    });

    table.insert("trust-html", |_state: &State, args: Rest<Value>| {
        Ok(Value::from_safe_string(arg_str(&args, 0, "trust-html")?))
    });
    table.insert("trust-js", |_state: &State, args: Rest<Value>| {
        Ok(Value::from_safe_string(arg_str(&args, 0, "trust-js")?))
    });
    table.insert("trust-url", |_state: &State, args: Rest<Value>| {
        Ok(Value::from_safe_string(arg_str(&args, 0, "trust-url")?))
    });
    table.insert("trust-attr", |_state: &State, args: Rest<Value>| {
        Ok(Value::from_safe_string(arg_str(&args, 0, "trust-attr")?))
    });

    table.insert("idx", |_state: &State, args: Rest<Value>| {
        let collection = args
            .first()
            .ok_or_else(|| Error::new(ErrorKind::MissingArgument, "idx: missing collection"))?;
        let key = args
            .get(1)
            .ok_or_else(|| Error::new(ErrorKind::MissingArgument, "idx: missing key"))?;
        collection.get_item(key)
    });

    table.insert("split-front-matter", |_state: &State, args: Rest<Value>| {
        let input = arg_str(&args, 0, "split-front-matter")?;
        Ok(split_front_matter(&input))
    });

    table.insert("try", |state: &State, args: Rest<Value>| {
        let callable = args
            .first()
            .ok_or_else(|| Error::new(ErrorKind::MissingArgument, "try: missing callable"))?;
        let call_args: Vec<Value> = args.iter().skip(1).cloned().collect();
        match callable.call(state, &call_args) {
            Ok(value) => Ok(Value::from_object(TryResult {
                value,
                error: Value::from(()),
                ok: true,
            })),
            Err(err) => Ok(Value::from_object(TryResult {
                value: Value::from(()),
                error: Value::from(err.to_string()),
                ok: false,
            })),
        }
    });

    table.insert("return", |state: &State, _args: Rest<Value>| {
        let slot = lookup_signal_slot(state)
            .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "return used outside a request"))?;
        slot.set_return();
        Err(slot.abort_error())
    });

    table
}

fn arg_str(args: &[Value], idx: usize, fname: &'static str) -> Result<String, Error> {
    args.get(idx)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| Error::new(ErrorKind::MissingArgument, format!("{fname}: expected a string argument")))
}

fn arg_u64(args: &[Value], idx: usize, fname: &'static str) -> Result<u64, Error> {
    args.get(idx)
        .and_then(|v| u64::try_from(v.clone()).ok())
        .ok_or_else(|| Error::new(ErrorKind::MissingArgument, format!("{fname}: expected an integer argument")))
}

#[derive(Debug)]
struct TryResult {
    value: Value,
    error: Value,
    ok: bool,
}

impl Object for TryResult {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "Value" => Some(self.value.clone()),
            "Error" => Some(self.error.clone()),
            "OK" => Some(Value::from(self.ok)),
            _ => None,
        }
    }
}

/// Splits `---\n<front matter>\n---\n<body>` style content. Front matter is
/// returned as raw text (this crate does not depend on a YAML/TOML parser);
/// callers that need structured access parse it themselves with whatever
/// format their operator chose.
fn split_front_matter(input: &str) -> Value {
    const FENCE: &str = "---";
    let mut front_matter = String::new();
    let mut body = input;
    if let Some(rest) = input.strip_prefix(FENCE) {
        let rest = rest.strip_prefix('\n').unwrap_or(rest);
        if let Some(end) = rest.find(&format!("\n{FENCE}")) {
            front_matter = rest[..end].to_string();
            body = &rest[end + 1 + FENCE.len()..];
            body = body.strip_prefix('\n').unwrap_or(body);
        }
    }
    Value::from_object(FrontMatterSplit {
        front_matter,
        body: body.to_string(),
    })
}

#[derive(Debug)]
struct FrontMatterSplit {
    front_matter: String,
    body: String,
}

impl Object for FrontMatterSplit {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "FrontMatter" => Some(Value::from(self.front_matter.clone())),
            "Body" => Some(Value::from_safe_string(self.body.clone())),
            _ => None,
        }
    }
}
