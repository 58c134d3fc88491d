//! Request metrics in the shared cache
//!
//! Counters and latency histograms are stored in Redis with a one-day TTL,
//! so they reset implicitly on expiry and aggregate across gateway
//! instances. Recording happens post-response and is fire-and-forget; the
//! snapshot feeds `/health/detailed`.

use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Counter TTL: one day
const METRIC_TTL_SECS: i64 = 86_400;

/// Error classification for counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    RateLimit,
    Server,
}

impl ErrorClass {
    /// Wire/cache-key representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
        }
    }

    /// Classify a response status; `None` for successes
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400 | 422 => Some(Self::Validation),
            401 => Some(Self::Authentication),
            403 => Some(Self::Authorization),
            404 => Some(Self::NotFound),
            429 => Some(Self::RateLimit),
            500..=599 => Some(Self::Server),
            _ => None,
        }
    }
}

/// Name of the histogram bucket a latency falls into
pub fn latency_bucket(latency_ms: u64) -> &'static str {
    match latency_ms {
        0..=10 => "0_10",
        11..=50 => "11_50",
        51..=100 => "51_100",
        101..=500 => "101_500",
        501..=1000 => "501_1000",
        _ => "1000_plus",
    }
}

/// All bucket names, in ascending order
const BUCKET_NAMES: &[&str] = &["0_10", "11_50", "51_100", "101_500", "501_1000", "1000_plus"];

/// Upper bound (ms) reported for a bucket when estimating percentiles
fn bucket_upper_bound(name: &str) -> u64 {
    match name {
        "0_10" => 10,
        "11_50" => 50,
        "51_100" => 100,
        "101_500" => 500,
        "501_1000" => 1000,
        _ => 2000,
    }
}

/// Latency percentiles estimated from histogram buckets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Percentiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

/// A point-in-time view of the gateway's counters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    /// Total requests in the current TTL window
    pub total_requests: u64,
    /// Errors by classified kind
    pub errors: HashMap<String, u64>,
    /// Per-route latency percentiles
    pub latency: HashMap<String, Percentiles>,
}

/// Records counters and histograms into the shared cache
pub struct MetricsRecorder {
    pool: Pool,
}

impl MetricsRecorder {
    /// Create a recorder over the shared pool
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Record one completed request
    ///
    /// One pipelined round-trip; the caller spawns this off the hot path.
    pub async fn record(
        &self,
        route: &str,
        method: &str,
        status: u16,
        latency_ms: u64,
    ) -> Result<()> {
        let mut pipe = redis::pipe();

        for key in [
            "metrics:requests:total".to_string(),
            format!("metrics:requests:{route}:{method}:{status}"),
            format!("metrics:latency:{route}:{}", latency_bucket(latency_ms)),
        ] {
            pipe.incr(&key, 1).ignore();
            pipe.expire(&key, METRIC_TTL_SECS).ignore();
        }

        if let Some(class) = ErrorClass::from_status(status) {
            let key = format!("metrics:errors:{}", class.as_str());
            pipe.incr(&key, 1).ignore();
            pipe.expire(&key, METRIC_TTL_SECS).ignore();
        }

        let mut conn = self.conn().await?;
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Snapshot totals, error counts, and per-route percentiles
    pub async fn snapshot(&self, routes: &[String]) -> Result<MetricsSnapshot> {
        let mut conn = self.conn().await?;

        let total: Option<u64> = conn.get("metrics:requests:total").await?;

        let mut errors = HashMap::new();
        for class in [
            ErrorClass::Validation,
            ErrorClass::Authentication,
            ErrorClass::Authorization,
            ErrorClass::NotFound,
            ErrorClass::RateLimit,
            ErrorClass::Server,
        ] {
            let count: Option<u64> = conn
                .get(format!("metrics:errors:{}", class.as_str()))
                .await?;
            if let Some(count) = count {
                errors.insert(class.as_str().to_string(), count);
            }
        }

        let mut latency = HashMap::new();
        for route in routes {
            let mut buckets = Vec::with_capacity(BUCKET_NAMES.len());
            for bucket in BUCKET_NAMES {
                let count: Option<u64> =
                    conn.get(format!("metrics:latency:{route}:{bucket}")).await?;
                buckets.push((*bucket, count.unwrap_or(0)));
            }
            if buckets.iter().any(|(_, count)| *count > 0) {
                latency.insert(route.clone(), estimate_percentiles(&buckets));
            }
        }

        Ok(MetricsSnapshot {
            total_requests: total.unwrap_or(0),
            errors,
            latency,
        })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::CachePool(e.to_string()))
    }
}

/// Estimate p50/p95/p99 from cumulative bucket counts
///
/// Each percentile reports the upper bound of the bucket it lands in; the
/// open-ended bucket reports a nominal 2000ms.
pub fn estimate_percentiles(buckets: &[(&str, u64)]) -> Percentiles {
    let total: u64 = buckets.iter().map(|(_, count)| count).sum();
    if total == 0 {
        return Percentiles { p50: 0, p95: 0, p99: 0 };
    }

    let percentile = |p: f64| -> u64 {
        let rank = (p * total as f64).ceil().max(1.0) as u64;
        let mut cumulative = 0;
        for (name, count) in buckets {
            cumulative += count;
            if cumulative >= rank {
                return bucket_upper_bound(name);
            }
        }
        bucket_upper_bound(buckets.last().map(|(name, _)| *name).unwrap_or("1000_plus"))
    };

    Percentiles {
        p50: percentile(0.50),
        p95: percentile(0.95),
        p99: percentile(0.99),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_bucket_edges() {
        assert_eq!(latency_bucket(0), "0_10");
        assert_eq!(latency_bucket(10), "0_10");
        assert_eq!(latency_bucket(11), "11_50");
        assert_eq!(latency_bucket(50), "11_50");
        assert_eq!(latency_bucket(51), "51_100");
        assert_eq!(latency_bucket(100), "51_100");
        assert_eq!(latency_bucket(101), "101_500");
        assert_eq!(latency_bucket(500), "101_500");
        assert_eq!(latency_bucket(501), "501_1000");
        assert_eq!(latency_bucket(1000), "501_1000");
        assert_eq!(latency_bucket(1001), "1000_plus");
        assert_eq!(latency_bucket(60_000), "1000_plus");
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(ErrorClass::from_status(400), Some(ErrorClass::Validation));
        assert_eq!(ErrorClass::from_status(422), Some(ErrorClass::Validation));
        assert_eq!(
            ErrorClass::from_status(401),
            Some(ErrorClass::Authentication)
        );
        assert_eq!(
            ErrorClass::from_status(403),
            Some(ErrorClass::Authorization)
        );
        assert_eq!(ErrorClass::from_status(404), Some(ErrorClass::NotFound));
        assert_eq!(ErrorClass::from_status(429), Some(ErrorClass::RateLimit));
        assert_eq!(ErrorClass::from_status(500), Some(ErrorClass::Server));
        assert_eq!(ErrorClass::from_status(503), Some(ErrorClass::Server));
        assert_eq!(ErrorClass::from_status(200), None);
        assert_eq!(ErrorClass::from_status(302), None);
    }

    #[test]
    fn test_percentiles_single_bucket() {
        let buckets = [
            ("0_10", 100u64),
            ("11_50", 0),
            ("51_100", 0),
            ("101_500", 0),
            ("501_1000", 0),
            ("1000_plus", 0),
        ];
        let p = estimate_percentiles(&buckets);
        assert_eq!(p, Percentiles { p50: 10, p95: 10, p99: 10 });
    }

    #[test]
    fn test_percentiles_spread() {
        // 90 fast, 9 mid, 1 slow: p50 fast, p95 mid, p99 slow
        let buckets = [
            ("0_10", 90u64),
            ("11_50", 0),
            ("51_100", 9),
            ("101_500", 0),
            ("501_1000", 0),
            ("1000_plus", 1),
        ];
        let p = estimate_percentiles(&buckets);
        assert_eq!(p.p50, 10);
        assert_eq!(p.p95, 100);
        assert_eq!(p.p99, 100);

        // With two slow requests the 99th rank crosses into the open bucket
        let buckets = [
            ("0_10", 90u64),
            ("11_50", 0),
            ("51_100", 8),
            ("101_500", 0),
            ("501_1000", 0),
            ("1000_plus", 2),
        ];
        let p = estimate_percentiles(&buckets);
        assert_eq!(p.p99, 2000);
    }

    #[test]
    fn test_percentiles_empty() {
        let buckets: [(&str, u64); 0] = [];
        assert_eq!(
            estimate_percentiles(&buckets),
            Percentiles { p50: 0, p95: 0, p99: 0 }
        );
    }
}
