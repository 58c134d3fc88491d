//! Route table: pattern matching and policy selection
//!
//! Route definitions and policies are loaded from the database into an
//! in-process snapshot with a TTL (default 5 minutes). Staleness up to the
//! TTL is accepted; a policy change is not guaranteed visible sooner.
//!
//! Patterns support `*` (one wildcard segment) and `:param` (named
//! parameter segment). Matching iterates enabled routes in registration
//! order and the first match wins; overlapping patterns are a configuration
//! error.

use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{ApiDefinition, RateLimitPolicy, Tier};
use crate::repository::RouteRepository;

/// A compiled route with its policies
#[derive(Debug)]
pub struct CompiledRoute {
    /// The route definition
    pub def: ApiDefinition,
    /// Compiled matcher for the route pattern
    regex: Regex,
    /// Policies for this route (tier-specific and default)
    pub policies: Vec<RateLimitPolicy>,
}

impl CompiledRoute {
    /// Select the policy for a caller tier
    ///
    /// Tier-specific policies override the default (`tier = None`); no
    /// policy at all means the route is not rate limited.
    pub fn policy_for(&self, tier: Tier) -> Option<&RateLimitPolicy> {
        self.policies
            .iter()
            .find(|p| p.tier() == Some(tier))
            .or_else(|| self.policies.iter().find(|p| p.tier.is_none()))
    }

    /// True when the pattern matches the path
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// A loaded snapshot of the route table
struct Snapshot {
    loaded_at: Instant,
    routes: Arc<Vec<Arc<CompiledRoute>>>,
}

/// Route table with a TTL-cached snapshot
pub struct RouteTable {
    repo: RouteRepository,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl RouteTable {
    /// Create a table over the repository
    pub fn new(repo: RouteRepository, ttl: Duration) -> Self {
        Self {
            repo,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    /// Resolve the route for a (method, path) pair
    ///
    /// Enabled routes are matched in registration order; the first match
    /// wins. A method mismatch is a 404 by contract, not a 405. When only a
    /// disabled route matches the path, the caller gets the 403-class
    /// `ApiDisabled` instead of a 404.
    pub async fn resolve(&self, method: &str, path: &str) -> Result<Arc<CompiledRoute>> {
        let routes = self.current().await?;

        for route in routes.iter() {
            if route.def.enabled && route.matches(path) {
                if !route.def.allows_method(method) {
                    continue;
                }
                return Ok(Arc::clone(route));
            }
        }

        if let Some(disabled) = routes
            .iter()
            .find(|route| !route.def.enabled && route.matches(path))
        {
            return Err(Error::ApiDisabled(disabled.def.name.clone()));
        }

        Err(Error::RouteNotFound {
            method: method.to_string(),
            path: path.to_string(),
        })
    }

    /// Current snapshot, reloading if it is stale or absent
    async fn current(&self) -> Result<Arc<Vec<Arc<CompiledRoute>>>> {
        {
            let guard = self.snapshot.read().await;
            if let Some(snap) = guard.as_ref() {
                if snap.loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&snap.routes));
                }
            }
        }

        let mut guard = self.snapshot.write().await;
        // Another task may have reloaded while we waited for the write lock
        if let Some(snap) = guard.as_ref() {
            if snap.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&snap.routes));
            }
        }

        match self.load().await {
            Ok(routes) => {
                let routes = Arc::new(routes);
                *guard = Some(Snapshot {
                    loaded_at: Instant::now(),
                    routes: Arc::clone(&routes),
                });
                Ok(routes)
            }
            Err(e) => {
                // Serve the stale snapshot rather than failing all traffic
                if let Some(snap) = guard.as_ref() {
                    tracing::warn!("route table reload failed, serving stale snapshot: {e}");
                    return Ok(Arc::clone(&snap.routes));
                }
                Err(e)
            }
        }
    }

    /// Load and compile all routes with their policies
    async fn load(&self) -> Result<Vec<Arc<CompiledRoute>>> {
        let defs = self.repo.list_all().await?;
        let ids: Vec<Uuid> = defs.iter().map(|d| d.id).collect();
        let policies = self.repo.list_policies(&ids).await?;

        let mut routes = Vec::with_capacity(defs.len());
        for def in defs {
            let regex = match compile_pattern(&def.route_pattern) {
                Ok(regex) => regex,
                Err(e) => {
                    tracing::error!(route = %def.name, "skipping route with bad pattern: {e}");
                    continue;
                }
            };
            let route_policies: Vec<RateLimitPolicy> = policies
                .iter()
                .filter(|p| p.api_definition_id == def.id)
                .cloned()
                .collect();
            routes.push(Arc::new(CompiledRoute {
                def,
                regex,
                policies: route_policies,
            }));
        }

        let enabled = routes.iter().filter(|r| r.def.enabled).count();
        tracing::info!(
            "route table loaded: {} route(s), {} enabled",
            routes.len(),
            enabled
        );
        Ok(routes)
    }

    /// Names of all known routes (for metrics snapshots)
    pub async fn route_names(&self) -> Vec<String> {
        match self.current().await {
            Ok(routes) => routes.iter().map(|r| r.def.name.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Force the next resolve to reload from the database
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }
}

/// Compile a glob pattern to an anchored regex
///
/// `*` matches exactly one path segment, `:name` matches one segment as a
/// named parameter. All other characters are literal.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    let mut regex_str = String::from("^");

    for segment in pattern.split('/') {
        if segment.is_empty() {
            continue;
        }
        regex_str.push('/');
        if segment == "*" {
            regex_str.push_str("[^/]+");
        } else if let Some(name) = segment.strip_prefix(':') {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::Validation(format!(
                    "invalid parameter segment in pattern: {pattern}"
                )));
            }
            regex_str.push_str("[^/]+");
        } else {
            regex_str.push_str(&regex::escape(segment));
        }
    }

    if regex_str == "^" {
        // Root pattern "/"
        regex_str.push('/');
    }
    regex_str.push('$');

    Regex::new(&regex_str)
        .map_err(|e| Error::Validation(format!("pattern does not compile: {pattern}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::model::{FailureMode, Strategy};

    #[test]
    fn test_compile_literal_pattern() {
        let re = compile_pattern("/orders/list").unwrap();
        assert!(re.is_match("/orders/list"));
        assert!(!re.is_match("/orders/list/extra"));
        assert!(!re.is_match("/orders"));
    }

    #[test]
    fn test_compile_wildcard_segment() {
        let re = compile_pattern("/orders/*").unwrap();
        assert!(re.is_match("/orders/123"));
        assert!(re.is_match("/orders/abc"));
        assert!(!re.is_match("/orders"));
        assert!(!re.is_match("/orders/123/items"));
    }

    #[test]
    fn test_compile_param_segment() {
        let re = compile_pattern("/orders/:id/items/*").unwrap();
        assert!(re.is_match("/orders/42/items/9"));
        assert!(!re.is_match("/orders/42/items"));
        assert!(!re.is_match("/orders/42/lines/9"));
    }

    #[test]
    fn test_compile_escapes_literals() {
        let re = compile_pattern("/v1.0/data").unwrap();
        assert!(re.is_match("/v1.0/data"));
        assert!(!re.is_match("/v1x0/data"));
    }

    #[test]
    fn test_compile_root() {
        let re = compile_pattern("/").unwrap();
        assert!(re.is_match("/"));
        assert!(!re.is_match("/x"));
    }

    #[test]
    fn test_invalid_param_name() {
        assert!(compile_pattern("/orders/:").is_err());
        assert!(compile_pattern("/orders/:bad-name").is_err());
    }

    fn compiled(pattern: &str, policies: Vec<RateLimitPolicy>) -> CompiledRoute {
        CompiledRoute {
            def: ApiDefinition {
                id: Uuid::new_v4(),
                name: "orders".to_string(),
                route_pattern: pattern.to_string(),
                backend_url: "http://orders.internal".to_string(),
                allowed_methods: vec!["GET".to_string()],
                enabled: true,
                created_at: Utc::now(),
            },
            regex: compile_pattern(pattern).unwrap(),
            policies,
        }
    }

    fn policy(route_id: Uuid, tier: Option<&str>, capacity: i64) -> RateLimitPolicy {
        RateLimitPolicy {
            id: Uuid::new_v4(),
            api_definition_id: route_id,
            tier: tier.map(|t| t.to_string()),
            strategy: Strategy::FixedWindow,
            capacity,
            refill_rate: None,
            window_seconds: Some(60),
            failure_mode: FailureMode::Open,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_policy_selection_prefers_tier() {
        let route_id = Uuid::new_v4();
        let route = compiled(
            "/orders/*",
            vec![
                policy(route_id, None, 100),
                policy(route_id, Some("pro"), 1000),
            ],
        );

        let selected = route.policy_for(Tier::Pro).unwrap();
        assert_eq!(selected.capacity, 1000);

        // Free tier has no specific policy, falls back to the default
        let selected = route.policy_for(Tier::Free).unwrap();
        assert_eq!(selected.capacity, 100);
    }

    #[test]
    fn test_policy_selection_none_when_unconfigured() {
        let route = compiled("/orders/*", vec![]);
        assert!(route.policy_for(Tier::Free).is_none());
    }
}
