//! Route and policy repository

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{ApiDefinition, RateLimitPolicy};

/// Repository for route definitions and their rate-limit policies
#[derive(Clone)]
pub struct RouteRepository {
    pool: PgPool,
}

impl RouteRepository {
    /// Create a repository over the shared pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All routes in registration order
    ///
    /// Registration order is creation order; the route table relies on it
    /// for first-match-wins resolution.
    pub async fn list_all(&self) -> Result<Vec<ApiDefinition>> {
        let routes = sqlx::query_as::<_, ApiDefinition>(
            r#"
            SELECT id, name, route_pattern, backend_url, allowed_methods, enabled, created_at
            FROM api_definitions
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(routes)
    }

    /// All policies for the given routes
    pub async fn list_policies(&self, route_ids: &[Uuid]) -> Result<Vec<RateLimitPolicy>> {
        let policies = sqlx::query_as::<_, RateLimitPolicy>(
            r#"
            SELECT id, api_definition_id, tier, strategy, capacity, refill_rate,
                   window_seconds, failure_mode, created_at
            FROM rate_limit_policies
            WHERE api_definition_id = ANY($1)
            "#,
        )
        .bind(route_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(policies)
    }

    /// Look up a route by id (enabled or not)
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ApiDefinition>> {
        let route = sqlx::query_as::<_, ApiDefinition>(
            r#"
            SELECT id, name, route_pattern, backend_url, allowed_methods, enabled, created_at
            FROM api_definitions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(route)
    }
}
