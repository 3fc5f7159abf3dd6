//! Built-in dispatchers that fan requests out across handlers.
//!
//! Both routers are themselves [`RequestHandler`]s, so they nest: a
//! [`HostRouter`] whose per-host handlers are [`PathRouter`]s is the
//! usual shape for a multi-site endpoint.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::handler::{HandlerResponse, RequestHandler};
use crate::path::{DuplicateKey, PathKey, TreePathMap};
use crate::request::IncomingRequest;
use crate::BoxError;

/// Routes requests to the most specific handler bound at or above their
/// path.
///
/// Non-wildcard bindings match one exact path; wildcard bindings match
/// their path and everything under it. When the most specific handler
/// declines a request (returns `Ok(None)`), dispatch falls back to the
/// next-most-specific wildcard binding. A handler error stops the
/// fallback walk and propagates.
pub struct PathRouter {
    routes: TreePathMap<Arc<dyn RequestHandler>>,
}

impl fmt::Debug for PathRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathRouter")
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl Default for PathRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PathRouter {
    pub fn new() -> Self {
        Self {
            routes: TreePathMap::new(),
        }
    }

    /// Bind a handler at `key`.
    pub fn route(
        mut self,
        key: &PathKey,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, DuplicateKey> {
        self.routes.add(key, handler)?;
        Ok(self)
    }
}

#[async_trait]
impl RequestHandler for PathRouter {
    async fn handle(
        &self,
        request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, BoxError> {
        let Some(path) = request.pathname() else {
            return Ok(None);
        };
        for found in self.routes.find_with_fallback(path) {
            if let Some(response) = found.value.handle(request.clone()).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

/// Routes requests by the host they were directed at.
///
/// Host patterns are DNS names, optionally with a leading `*.` label
/// matching any subdomain, or the bare `*` matching every host.
/// Matching prefers the most specific pattern.
pub struct HostRouter {
    hosts: TreePathMap<Arc<dyn RequestHandler>>,
}

impl fmt::Debug for HostRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRouter")
            .field("hosts", &self.hosts.len())
            .finish()
    }
}

impl Default for HostRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRouter {
    pub fn new() -> Self {
        Self {
            hosts: TreePathMap::new(),
        }
    }

    /// Bind a handler for a host pattern, e.g. `example.com`,
    /// `*.example.com`, or `*`.
    pub fn host(
        mut self,
        pattern: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, DuplicateKey> {
        self.hosts.add(&host_pattern_key(pattern), handler)?;
        Ok(self)
    }
}

/// A host pattern as a key of DNS labels, most significant first.
fn host_pattern_key(pattern: &str) -> PathKey {
    let lowered = pattern.to_ascii_lowercase();
    if lowered == "*" {
        return PathKey::empty().with_wildcard(true);
    }
    match lowered.strip_prefix("*.") {
        Some(base) => PathKey::new(base.split('.').rev(), true),
        None => PathKey::new(lowered.split('.').rev(), false),
    }
}

#[async_trait]
impl RequestHandler for HostRouter {
    async fn handle(
        &self,
        request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, BoxError> {
        let Some(host) = request.host_info() else {
            return Ok(None);
        };
        match self.hosts.find(&host.name_key()) {
            Some(found) => found.value.handle(request.clone()).await,
            None => Ok(None),
        }
    }
}
