//! Method + path pattern matching with path variables; longest-match wins.
//!
//! Patterns are always matched against the *full* request path: this
//! implementation does not give `{$}` any behavior beyond documenting intent,
//! since `GET /index` must 404 when only `/` is registered, ruling out
//! treating a trailing-slash pattern as a subtree/prefix match. Because of
//! that, `{$}` never changes which concrete paths a pattern matches, so two
//! patterns that agree on `segments` but disagree on `exact_end` (`/blog` vs
//! `/blog/{$}`) describe the same route and are rejected as a duplicate
//! registration rather than silently coexisting. See `DESIGN.md`.

use crate::error::RouteError;
use crate::http::Method;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Var(String),
}

/// A parsed route pattern's path half (grammar only, minus method).
#[derive(Debug, Clone)]
pub struct RoutePattern {
    pub segments: Vec<Segment>,
    pub exact_end: bool,
    pub raw: String,
}

impl RoutePattern {
    /// Parses the `path` half of a route pattern: `(segment "/")* (segment |
    /// "{$}")`.
    pub fn parse(path: &str) -> Result<Self, RouteError> {
        if !path.starts_with('/') {
            return Err(RouteError::EmptySegment);
        }
        let raw = path.to_string();
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Ok(RoutePattern { segments: Vec::new(), exact_end: false, raw });
        }
        let parts: Vec<&str> = trimmed.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut exact_end = false;
        for (i, part) in parts.iter().enumerate() {
            let is_last = i + 1 == parts.len();
            if *part == "{$}" {
                if !is_last {
                    return Err(RouteError::MisplacedEndAnchor);
                }
                exact_end = true;
                continue;
            }
            if part.is_empty() {
                return Err(RouteError::EmptySegment);
            }
            if let Some(name) = part.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                if name.is_empty() {
                    return Err(RouteError::EmptyVariableName(part.to_string()));
                }
                segments.push(Segment::Var(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(RoutePattern { segments, exact_end, raw })
    }

    /// Number of literal segments; used to break ties between patterns that
    /// could both match the same concrete path (more literals wins).
    fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    fn matches<'p>(&self, path_segments: &[&'p str]) -> Option<Vec<(&str, &'p str)>> {
        if path_segments.len() != self.segments.len() {
            return None;
        }
        let mut vars = Vec::new();
        for (pattern_seg, actual) in self.segments.iter().zip(path_segments.iter()) {
            match pattern_seg {
                Segment::Literal(lit) => {
                    if lit != actual {
                        return None;
                    }
                }
                Segment::Var(name) => vars.push((name.as_str(), *actual)),
            }
        }
        Some(vars)
    }
}

/// Parses a known HTTP method token, or `SSE`, which is translated to a GET
/// route installed with the streaming handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Sse,
}

impl RouteMethod {
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "GET" => RouteMethod::Get,
            "POST" => RouteMethod::Post,
            "PUT" => RouteMethod::Put,
            "PATCH" => RouteMethod::Patch,
            "DELETE" => RouteMethod::Delete,
            "SSE" => RouteMethod::Sse,
            _ => return None,
        })
    }

    /// The method a request must carry to reach this route; `SSE` installs
    /// under `GET`.
    pub fn http_method(self) -> Method {
        match self {
            RouteMethod::Get | RouteMethod::Sse => Method::GET,
            RouteMethod::Post => Method::POST,
            RouteMethod::Put => Method::PUT,
            RouteMethod::Patch => Method::PATCH,
            RouteMethod::Delete => Method::DELETE,
        }
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, RouteMethod::Sse)
    }
}

/// Splits a `"METHOD path"` template name into its method and pattern; a
/// template name that doesn't start with a known method token isn't a route
/// at all — it remains invocable by name but is not routed.
pub fn split_named_route(name: &str) -> Option<(RouteMethod, &str)> {
    let (token, rest) = name.split_once(' ')?;
    let method = RouteMethod::parse(token)?;
    Some((method, rest))
}

/// One entry in a [`Router`]: a parsed pattern plus the opaque handler id it
/// installs.
#[derive(Debug, Clone)]
struct RouteEntry<H> {
    pattern: RoutePattern,
    handler: H,
}

/// Method-bucketed collection of routes with longest-match (most-specific)
/// lookup.
#[derive(Debug, Clone, Default)]
pub struct Router<H> {
    routes: Vec<(Method, RouteEntry<H>)>,
}

impl<H: Clone> Router<H> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Registers a route. Returns the raw pattern string of a prior
    /// registration if this exact (method, pattern) collides, letting the
    /// caller turn it into a `BuildError::DuplicateRoute`. `exact_end` is
    /// deliberately excluded from the collision key: `matches` never
    /// consults it, so `/blog` and `/blog/{$}` already match exactly the
    /// same concrete paths and must be caught here rather than left to
    /// coexist as an order-dependent ambiguity.
    pub fn register(&mut self, method: Method, pattern: RoutePattern, handler: H) -> Option<String> {
        for (m, entry) in &self.routes {
            if *m == method && entry.pattern.segments == pattern.segments {
                return Some(entry.pattern.raw.clone());
            }
        }
        self.routes.push((method, RouteEntry { pattern, handler }));
        None
    }

    /// Finds the most specific route matching `method`/`path`, along with
    /// the path variables it captured.
    pub fn route<'p>(&self, method: &Method, path: &'p str) -> Option<(&H, Vec<(String, String)>)> {
        let path_segments: Vec<&str> = if path == "/" {
            Vec::new()
        } else {
            path.trim_start_matches('/').split('/').collect()
        };
        let mut best: Option<(usize, &H, Vec<(&str, &str)>)> = None;
        for (m, entry) in &self.routes {
            if m != method {
                continue;
            }
            if let Some(vars) = entry.pattern.matches(&path_segments) {
                let score = entry.pattern.specificity();
                if best.as_ref().map(|(s, ..)| score > *s).unwrap_or(true) {
                    best = Some((score, &entry.handler, vars));
                }
            }
        }
        best.map(|(_, h, vars)| {
            (
                h,
                vars.into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literal_and_var_segments() {
        let p = RoutePattern::parse("/contact/{id}").unwrap();
        assert_eq!(
            p.segments,
            vec![Segment::Literal("contact".into()), Segment::Var("id".into())]
        );
        assert!(!p.exact_end);
    }

    #[test]
    fn parses_end_anchor() {
        let p = RoutePattern::parse("/blog/{$}").unwrap();
        assert_eq!(p.segments, vec![Segment::Literal("blog".into())]);
        assert!(p.exact_end);
    }

    #[test]
    fn rejects_misplaced_end_anchor() {
        assert!(matches!(
            RoutePattern::parse("/{$}/more"),
            Err(RouteError::MisplacedEndAnchor)
        ));
    }

    #[test]
    fn root_path_has_no_segments() {
        let p = RoutePattern::parse("/").unwrap();
        assert!(p.segments.is_empty());
    }

    #[test]
    fn longest_match_prefers_literal_over_variable() {
        let mut router: Router<&'static str> = Router::new();
        router.register(Method::GET, RoutePattern::parse("/a/{id}").unwrap(), "var");
        router.register(Method::GET, RoutePattern::parse("/a/b").unwrap(), "literal");
        let (handler, vars) = router.route(&Method::GET, "/a/b").unwrap();
        assert_eq!(*handler, "literal");
        assert!(vars.is_empty());
    }

    #[test]
    fn captures_path_variables() {
        let mut router: Router<&'static str> = Router::new();
        router.register(Method::DELETE, RoutePattern::parse("/contact/{id}").unwrap(), "delete");
        let (handler, vars) = router.route(&Method::DELETE, "/contact/42").unwrap();
        assert_eq!(*handler, "delete");
        assert_eq!(vars, vec![("id".to_string(), "42".to_string())]);
    }

    #[test]
    fn root_index_does_not_match_other_paths() {
        let mut router: Router<&'static str> = Router::new();
        router.register(Method::GET, RoutePattern::parse("/").unwrap(), "index");
        assert!(router.route(&Method::GET, "/").is_some());
        assert!(router.route(&Method::GET, "/index").is_none());
    }

    #[test]
    fn duplicate_registration_is_reported() {
        let mut router: Router<&'static str> = Router::new();
        assert!(router
            .register(Method::GET, RoutePattern::parse("/x").unwrap(), "first")
            .is_none());
        assert_eq!(
            router.register(Method::GET, RoutePattern::parse("/x").unwrap(), "second"),
            Some("/x".to_string())
        );
    }

    #[test]
    fn end_anchor_spelling_is_a_duplicate_of_the_bare_pattern() {
        let mut router: Router<&'static str> = Router::new();
        assert!(router
            .register(Method::GET, RoutePattern::parse("/x").unwrap(), "bare")
            .is_none());
        assert_eq!(
            router.register(Method::GET, RoutePattern::parse("/x/{$}").unwrap(), "anchored"),
            Some("/x".to_string())
        );
    }
}
