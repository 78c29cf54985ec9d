//! Endpoint registry and path matching.
//!
//! Endpoints are method-agnostic: one path pattern, an ordered middleware
//! list, one terminal handler. Matching prefers an exact path over any
//! parameterized pattern; among parameterized patterns registration order
//! wins. Patterns use `:name` segments.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::error::{TejasError, TejasResult};
use crate::middleware::{AmmoStep, Handler, Middleware};

/// One registered endpoint.
pub struct Endpoint {
    path: String,
    middlewares: Vec<Middleware>,
    handler: Handler,
}

impl Endpoint {
    /// Creates an endpoint with a normalized path. Fails on an empty path,
    /// a path without a leading `/`, or a parameter segment with no name.
    pub fn new(path: &str, handler: impl AmmoStep) -> TejasResult<Self> {
        let path = normalize_path(path)?;
        validate_params(&path)?;
        Ok(Self {
            path,
            middlewares: Vec::new(),
            handler: Handler::new(handler),
        })
    }

    /// Appends a route-level middleware.
    pub fn with(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn middlewares(&self) -> &[Middleware] {
        &self.middlewares
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }

    fn prefixed(mut self, prefix: &str, extra: &[Middleware]) -> TejasResult<Self> {
        let joined = if prefix == "/" {
            self.path.clone()
        } else if self.path == "/" {
            prefix.to_string()
        } else {
            format!("{}{}", prefix, self.path)
        };
        self.path = normalize_path(&joined)?;
        let mut middlewares = extra.to_vec();
        middlewares.append(&mut self.middlewares);
        self.middlewares = middlewares;
        Ok(self)
    }
}

/// A namespace prefix plus the endpoints registered under it. Target-level
/// middlewares run before each endpoint's own.
pub struct Target {
    prefix: String,
    middlewares: Vec<Middleware>,
    endpoints: Vec<Endpoint>,
}

impl Target {
    pub fn new(prefix: &str) -> TejasResult<Self> {
        let prefix = normalize_path(prefix)?;
        validate_params(&prefix)?;
        Ok(Self {
            prefix,
            middlewares: Vec::new(),
            endpoints: Vec::new(),
        })
    }

    pub fn with(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Flattens the target into prefixed endpoints ready for registration.
    pub fn into_endpoints(self) -> TejasResult<Vec<Endpoint>> {
        let Target {
            prefix,
            middlewares,
            endpoints,
        } = self;
        endpoints
            .into_iter()
            .map(|ep| ep.prefixed(&prefix, &middlewares))
            .collect()
    }
}

/// Ordered endpoint registry plus the global middleware list. Mutated only
/// at startup; request serving reads it through a shared reference.
#[derive(Default)]
pub struct Registry {
    endpoints: Vec<Endpoint>,
    global: Vec<Middleware>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an endpoint. A duplicate normalized path replaces the earlier
    /// registration in place, with a warning.
    pub fn register(&mut self, endpoint: Endpoint) {
        if let Some(existing) = self
            .endpoints
            .iter_mut()
            .find(|e| e.path == endpoint.path)
        {
            warn!(path = %endpoint.path, "duplicate endpoint path, replacing earlier registration");
            *existing = endpoint;
            return;
        }
        self.endpoints.push(endpoint);
    }

    pub fn add_global(&mut self, middleware: Middleware) {
        self.global.push(middleware);
    }

    pub(crate) fn global(&self) -> &[Middleware] {
        &self.global
    }

    /// Matches a request path. Exact matches win; otherwise the first
    /// parameterized pattern in registration order with the same segment
    /// count and matching literals.
    pub fn find(&self, path: &str) -> Option<(&Endpoint, HashMap<String, String>)> {
        let normalized = normalize_path(path).ok()?;

        if let Some(endpoint) = self.endpoints.iter().find(|e| e.path == normalized) {
            return Some((endpoint, HashMap::new()));
        }

        let request_segments = segments(&normalized);
        for endpoint in &self.endpoints {
            if let Some(params) = match_segments(&endpoint.path, &request_segments) {
                return Some((endpoint, params));
            }
        }
        None
    }

    /// Flat list of registered paths, in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.path.as_str()).collect()
    }

    /// Paths grouped by their first segment; the root endpoint groups
    /// under `/`.
    pub fn list_grouped(&self) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for endpoint in &self.endpoints {
            let group = segments(&endpoint.path)
                .first()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "/".to_string());
            groups.entry(group).or_default().push(endpoint.path.clone());
        }
        groups
    }
}

/// Normalizes a path: must be non-empty and begin with `/`; trailing slashes
/// are stripped except for the root. Interior slashes are left alone.
pub fn normalize_path(path: &str) -> TejasResult<String> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(TejasError::InvalidPath(format!(
            "path must begin with '/': {:?}",
            path
        )));
    }
    let mut normalized = path.to_string();
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}

fn validate_params(path: &str) -> TejasResult<()> {
    for segment in segments(path) {
        if segment == ":" {
            return Err(TejasError::InvalidPath(format!(
                "parameter segment without a name in {:?}",
                path
            )));
        }
    }
    Ok(())
}

/// Splits on `/`, discarding empty segments.
fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn match_segments(pattern: &str, request: &[&str]) -> Option<HashMap<String, String>> {
    let pattern_segments = segments(pattern);
    if pattern_segments.len() != request.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (pat, seg) in pattern_segments.iter().zip(request) {
        if let Some(name) = pat.strip_prefix(':') {
            params.insert(name.to_string(), seg.to_string());
        } else if pat != seg {
            return None;
        }
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ammo::Ammo;
    use crate::middleware::{Flow, StepResult};

    async fn noop(_ammo: Ammo) -> StepResult {
        Ok(Flow::Halt)
    }

    fn endpoint(path: &str) -> Endpoint {
        Endpoint::new(path, noop).unwrap()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/users/").unwrap(), "/users");
        assert_eq!(normalize_path("/users///").unwrap(), "/users");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert!(normalize_path("").is_err());
        assert!(normalize_path("users").is_err());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for path in ["/a//b/", "/", "/x/:y/", "/trailing///"] {
            let once = normalize_path(path).unwrap();
            assert_eq!(normalize_path(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_empty_param_name_rejected() {
        assert!(Endpoint::new("/users/:", noop).is_err());
        assert!(Endpoint::new("/users/:id", noop).is_ok());
    }

    #[test]
    fn test_exact_match() {
        let mut registry = Registry::new();
        registry.register(endpoint("/users/me"));
        let (ep, params) = registry.find("/users/me").unwrap();
        assert_eq!(ep.path(), "/users/me");
        assert!(params.is_empty());
        assert!(registry.find("/users/other").is_none());
    }

    #[test]
    fn test_param_extraction() {
        let mut registry = Registry::new();
        registry.register(endpoint("/users/:id/posts/:post"));
        let (_, params) = registry.find("/users/42/posts/7").unwrap();
        assert_eq!(params["id"], "42");
        assert_eq!(params["post"], "7");
    }

    #[test]
    fn test_exact_beats_param() {
        let mut registry = Registry::new();
        registry.register(endpoint("/users/:id"));
        registry.register(endpoint("/users/me"));
        let (ep, params) = registry.find("/users/me").unwrap();
        assert_eq!(ep.path(), "/users/me");
        assert!(params.is_empty());

        let (ep, params) = registry.find("/users/7").unwrap();
        assert_eq!(ep.path(), "/users/:id");
        assert_eq!(params["id"], "7");
    }

    #[test]
    fn test_registration_order_breaks_param_ties() {
        let mut registry = Registry::new();
        registry.register(endpoint("/files/:name"));
        registry.register(endpoint("/files/:id"));
        let (ep, _) = registry.find("/files/x").unwrap();
        assert_eq!(ep.path(), "/files/:name");
    }

    #[test]
    fn test_duplicate_path_replaces() {
        let mut registry = Registry::new();
        registry.register(endpoint("/users"));
        registry.register(endpoint("/users/"));
        assert_eq!(registry.list(), vec!["/users"]);
    }

    #[test]
    fn test_segment_count_must_match() {
        let mut registry = Registry::new();
        registry.register(endpoint("/users/:id"));
        assert!(registry.find("/users").is_none());
        assert!(registry.find("/users/1/extra").is_none());
    }

    #[test]
    fn test_root_matches_only_root() {
        let mut registry = Registry::new();
        registry.register(endpoint("/"));
        assert!(registry.find("/").is_some());
        assert!(registry.find("/x").is_none());
    }

    #[test]
    fn test_empty_segments_discarded_on_request() {
        let mut registry = Registry::new();
        registry.register(endpoint("/a/b"));
        let (ep, _) = registry.find("/a//b/").unwrap();
        assert_eq!(ep.path(), "/a/b");
    }

    #[test]
    fn test_target_prefixes_endpoints() {
        let target = Target::new("/users")
            .unwrap()
            .endpoint(endpoint("/"))
            .endpoint(endpoint("/:id"));
        let endpoints = target.into_endpoints().unwrap();
        let paths: Vec<&str> = endpoints.iter().map(|e| e.path()).collect();
        assert_eq!(paths, vec!["/users", "/users/:id"]);
    }

    #[test]
    fn test_target_middleware_precedes_route() {
        let target = Target::new("/api")
            .unwrap()
            .with(Middleware::ammo(|_a: Ammo| async { Ok(Flow::Continue) }))
            .endpoint(endpoint("/x").with(Middleware::ammo(|_a: Ammo| async {
                Ok(Flow::Continue)
            })));
        let endpoints = target.into_endpoints().unwrap();
        assert_eq!(endpoints[0].middlewares().len(), 2);
    }

    #[test]
    fn test_grouped_listing() {
        let mut registry = Registry::new();
        registry.register(endpoint("/"));
        registry.register(endpoint("/users/me"));
        registry.register(endpoint("/users/:id"));
        registry.register(endpoint("/posts"));
        let groups = registry.list_grouped();
        assert_eq!(groups["users"], vec!["/users/me", "/users/:id"]);
        assert_eq!(groups["posts"], vec!["/posts"]);
        assert_eq!(groups["/"], vec!["/"]);
    }
}
