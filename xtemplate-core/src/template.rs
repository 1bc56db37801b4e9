//! Template engine adapter.
//!
//! Backed by `minijinja`, chosen over a plain data-templating crate because
//! its `Object` trait gives dot-value fields real method dispatch. This
//! module owns the one Go-`html/template`-specific behavior `minijinja` has
//! no native equivalent for: a single file defining several independently
//! named templates via `{{define "name"}}...{{end}}`.

use std::collections::BTreeMap;

use minijinja::value::Value;
use minijinja::Environment;

use crate::error::BuildError;
use crate::functions::FunctionTable;

/// One `{{define "name"}}...{{end}}` region, or the content outside any
/// `define` block (named after the source file itself by the caller).
pub struct Definition {
    pub name: String,
    pub source: String,
}

enum Token<'a> {
    Text(&'a str),
    Action(&'a str),
}

fn tokenize<'a>(source: &'a str, left: &str, right: &str) -> Vec<Token<'a>> {
    let mut tokens = Vec::new();
    let mut rest = source;
    loop {
        match rest.find(left) {
            None => {
                if !rest.is_empty() {
                    tokens.push(Token::Text(rest));
                }
                break;
            }
            Some(start) => {
                if start > 0 {
                    tokens.push(Token::Text(&rest[..start]));
                }
                let after_left = &rest[start + left.len()..];
                match after_left.find(right) {
                    None => {
                        tokens.push(Token::Text(&rest[start..]));
                        break;
                    }
                    Some(end) => {
                        tokens.push(Token::Action(&after_left[..end]));
                        rest = &after_left[end + right.len()..];
                    }
                }
            }
        }
    }
    tokens
}

fn parse_quoted_name(action: &str) -> Option<String> {
    let start = action.find('"')? + 1;
    let rest = &action[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Splits a template file's source into its top-level `define`d templates
/// plus the content outside any `define` block.
///
/// `define`/`end` are the one pair this adapter intercepts: minijinja has no
/// native notion of several independently named templates sharing one source
/// file, so they're scanned out before the source ever reaches minijinja's
/// own parser. `{% if %}`/`{% for %}`/`{% with %}`/`{% block %}` and their
/// `{% end... %}` closers are minijinja's native statement delimiters
/// (`{%`/`%}`), never the configurable variable delimiter this tokenizer
/// scans on, so they pass through untouched and can't be confused with a
/// `define`'s own `{{end}}`. `define` blocks don't nest in practice, so the
/// stack only ever needs to track one enclosing frame at a time.
pub fn extract_definitions(source: &str, left: &str, right: &str) -> Vec<Definition> {
    let tokens = tokenize(source, left, right);
    let mut defs = Vec::new();
    // Stack of (name, buffer); the bottom frame is the file's outer content.
    let mut stack: Vec<(Option<String>, String)> = vec![(None, String::new())];

    for tok in tokens {
        match tok {
            Token::Text(t) => stack.last_mut().unwrap().1.push_str(t),
            Token::Action(inner) => {
                let trimmed = inner.trim();
                let keyword = trimmed.split_whitespace().next().unwrap_or("");
                match keyword {
                    "define" => {
                        let name = parse_quoted_name(trimmed).unwrap_or_default();
                        stack.push((Some(name), String::new()));
                    }
                    "end" if stack.len() > 1 => {
                        let (name, buf) = stack.pop().unwrap();
                        defs.push(Definition { name: name.unwrap_or_default(), source: buf });
                    }
                    _ => {
                        let top = stack.last_mut().unwrap();
                        top.1.push_str(left);
                        top.1.push_str(inner);
                        top.1.push_str(right);
                    }
                }
            }
        }
    }

    let outer = stack.pop().unwrap().1;
    if !outer.trim().is_empty() {
        // Caller fills in the real name (the file's own path/route name);
        // the sentinel is replaced by `TemplateEngine::add_file`.
        defs.push(Definition { name: String::new(), source: outer });
    }
    defs
}

/// Minifies HTML template source while action delimiters pass through
/// untouched, since a minifier only ever rewrites surrounding whitespace and
/// tag structure, never the text content the delimiters live in.
pub fn minify(source: &str) -> String {
    let cfg = minify_html::Cfg::spec_compliant();
    let minified = minify_html::minify(source.as_bytes(), &cfg);
    String::from_utf8(minified).unwrap_or_else(|_| source.to_string())
}

/// Owns the parsed template set and the combined function table.
///
/// `functions` duplicates, as plain [`Value`]s, every entry already installed
/// into `env` by [`FunctionTable::install`]: `minijinja::Environment` has no
/// stable public accessor for a previously registered global/function by
/// name (`get_global` is not part of its documented API), so `get_function`
/// is served from this crate-owned copy instead of reaching back into `env`.
pub struct TemplateEngine {
    env: Environment<'static>,
    names: BTreeMap<String, ()>,
    functions: BTreeMap<String, Value>,
}

impl TemplateEngine {
    pub fn new(left_delim: &str, right_delim: &str, functions: &FunctionTable) -> Self {
        // Only the variable (`{{ }}`-style) delimiter is configurable;
        // block tags (`{% if %}`, `{% for %}`, ...) keep minijinja's native
        // syntax. The crate-specific `{{define "name"}}`
        // extension (see `extract_definitions`) is scanned out of the source
        // before minijinja ever sees it, using this same variable delimiter.
        let mut env = Environment::new();
        let syntax = minijinja::syntax::SyntaxConfig::builder()
            .variable_delimiters(left_delim.to_string(), right_delim.to_string())
            .build()
            .unwrap_or_default();
        env.set_syntax(syntax);
        env.set_auto_escape_callback(|_name| minijinja::AutoEscape::Html);
        functions.install(&mut env);
        crate::functions::register_builtin_filters(&mut env);
        let function_values = functions.as_values();
        Self { env, names: BTreeMap::new(), functions: function_values }
    }

    /// Parses one template file's source (after optional minification),
    /// registering every `define`d name plus, if present, the outer content
    /// under `own_name`. Last registration of a given name wins; a warning
    /// is logged on overwrite.
    pub fn add_file(&mut self, own_name: &str, source: &str, left: &str, right: &str) -> Result<Vec<String>, BuildError> {
        let mut defined = Vec::new();
        for mut def in extract_definitions(source, left, right) {
            if def.name.is_empty() {
                def.name = own_name.to_string();
            }
            if self.names.contains_key(&def.name) {
                tracing::warn!(name = %def.name, "template name redefined; last parsed wins");
            }
            self.env
                .add_template_owned(def.name.clone(), def.source)
                .map_err(|source| BuildError::TemplateParse { name: def.name.clone(), source })?;
            self.names.insert(def.name.clone(), ());
            defined.push(def.name);
        }
        Ok(defined)
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    /// Executes a template into a freshly allocated `String` (buffered
    /// handlers, and `instance-view.Template`).
    pub fn render(&self, name: &str, dot: Value) -> Result<String, minijinja::Error> {
        let tmpl = self.env.get_template(name)?;
        tmpl.render(dot)
    }

    /// Executes a template directly into a writer (streaming handlers, and
    /// the buffered handler's owned-buffer render so a `return`/
    /// `ReturnStatus` abort signal doesn't throw away output already
    /// written before it fired).
    pub fn render_to_write<W: std::io::Write>(&self, name: &str, dot: Value, out: &mut W) -> Result<(), minijinja::Error> {
        let tmpl = self.env.get_template(name)?;
        tmpl.render_to_write(dot, out)
    }

    pub fn get_function(&self, name: &str) -> Option<Value> {
        self.functions.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_define_block() {
        let src = r#"{{define "GET /hello"}}Hi {{name}}{{end}}"#;
        let defs = extract_definitions(src, "{{", "}}");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "GET /hello");
        assert_eq!(defs[0].source.trim(), "Hi {{name}}");
    }

    #[test]
    fn nested_minijinja_block_inside_define_does_not_close_early() {
        // `{% if %}`/`{% endif %}` use minijinja's own statement delimiter,
        // never the configurable variable delimiter this tokenizer scans
        // on, so they pass straight through without touching the `define`
        // stack at all.
        let src = r#"{{define "x"}}{% if cond %}A{% endif %}B{{end}}"#;
        let defs = extract_definitions(src, "{{", "}}");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "x");
        assert!(defs[0].source.contains("{% if cond %}A{% endif %}B"));
    }

    #[test]
    fn outer_content_without_define_uses_sentinel_name() {
        let src = "plain body, no defines";
        let defs = extract_definitions(src, "{{", "}}");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "");
        assert_eq!(defs[0].source, src);
    }

    #[test]
    fn whitespace_only_outer_content_is_dropped() {
        let src = r#"   {{define "a"}}x{{end}}   "#;
        let defs = extract_definitions(src, "{{", "}}");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "a");
    }

    #[test]
    fn attr_urlquery_js_filters_escape_into_their_contexts() {
        let functions = FunctionTable::new();
        let mut engine = TemplateEngine::new("{{", "}}", &functions);
        engine
            .add_file("page", r#"<a href="/s?q={{ q | urlquery }}" title="{{ t | attr }}" onclick="go('{{ j | js }}')">x</a>"#, "{{", "}}")
            .unwrap();
        let mut ctx = BTreeMap::new();
        ctx.insert("q".to_string(), Value::from("a b&c"));
        ctx.insert("t".to_string(), Value::from(r#"say "hi""#));
        ctx.insert("j".to_string(), Value::from("it's \"quoted\""));
        let rendered = engine.render("page", Value::from_serialize(&ctx)).unwrap();
        assert!(rendered.contains("a%20b%26c"));
        assert!(rendered.contains("say &quot;hi&quot;"));
        assert!(rendered.contains(r#"it\'s \"quoted\""#));
    }
}
