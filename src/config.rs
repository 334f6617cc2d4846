//! All tunables for the consolidation engine in one injected structure.
//!
//! Values are read from the environment once at startup and frozen for the
//! lifetime of the process; there is no hot reload. Restart to apply changes.

use std::time::Duration;

/// Coefficients for segment temperature: `α·visits + β·pages + γ·exp(-Δh/τ)`.
#[derive(Debug, Clone, Copy)]
pub struct HeatParams {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub tau_hours: f64,
}

impl Default for HeatParams {
    fn default() -> Self {
        Self { alpha: 1.0, beta: 1.0, gamma: 1.0, tau_hours: 24.0 }
    }
}

/// Backoff schedule for distributed-lock acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockRetry {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Uniform random addition on top of each backoff step.
    pub jitter: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(6),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Weight pair for fusing dense (cosine) and sparse (BM25) scores.
#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    pub dense: f64,
    pub sparse: f64,
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Hot-tier capacity per user; overflow beyond this is clustered into segments.
    pub stm_capacity: usize,
    /// Minimum fused score for a page to join an existing segment.
    pub correlation_threshold: f64,
    /// Segments hotter than this are distilled into long-term knowledge.
    pub heat_threshold: f64,
    /// Fused similarity above which distilled knowledge is considered already captured.
    pub redundancy_threshold: f64,
    pub heat: HeatParams,
    /// How many pages the warm tier returns per retrieval.
    pub page_top_k: usize,
    pub stm_cache_ttl: Duration,
    pub ltm_cache_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_retry: LockRetry,
    /// Worker tasks consuming the consolidation queue.
    pub workers: usize,
    pub queue_depth: usize,
    /// Upper bound on a single user's consolidation cycle.
    pub job_timeout: Duration,
    /// Fusion weights for clustering and redundancy checks.
    pub correlation_weights: FusionWeights,
    /// Fusion weights for end-user retrieval ranking.
    pub answer_weights: FusionWeights,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            stm_capacity: 10,
            correlation_threshold: 0.5,
            heat_threshold: 15.0,
            redundancy_threshold: 0.4,
            heat: HeatParams::default(),
            page_top_k: 5,
            stm_cache_ttl: Duration::from_secs(12 * 3600),
            ltm_cache_ttl: Duration::from_secs(12 * 3600),
            lock_ttl: Duration::from_secs(120),
            lock_retry: LockRetry::default(),
            workers,
            queue_depth: 64,
            job_timeout: Duration::from_secs(35),
            correlation_weights: FusionWeights { dense: 0.4, sparse: 0.6 },
            answer_weights: FusionWeights { dense: 0.7, sparse: 0.3 },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl MemoryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            stm_capacity: env_parse("STRATA_STM_CAPACITY", d.stm_capacity),
            correlation_threshold: env_parse(
                "STRATA_CORRELATION_THRESHOLD",
                d.correlation_threshold,
            ),
            heat_threshold: env_parse("STRATA_HEAT_THRESHOLD", d.heat_threshold),
            redundancy_threshold: env_parse(
                "STRATA_REDUNDANCY_THRESHOLD",
                d.redundancy_threshold,
            ),
            page_top_k: env_parse("STRATA_PAGE_TOP_K", d.page_top_k),
            workers: env_parse("STRATA_WORKERS", d.workers),
            queue_depth: env_parse("STRATA_QUEUE_DEPTH", d.queue_depth),
            lock_ttl: Duration::from_secs(env_parse("STRATA_LOCK_TTL_SECS", 120)),
            job_timeout: Duration::from_secs(env_parse("STRATA_JOB_TIMEOUT_SECS", 35)),
            ..d
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let c = MemoryConfig::default();
        assert_eq!(c.stm_capacity, 10);
        assert_eq!(c.correlation_threshold, 0.5);
        assert_eq!(c.heat_threshold, 15.0);
        assert_eq!(c.redundancy_threshold, 0.4);
        assert_eq!(c.lock_ttl, Duration::from_secs(120));
        assert_eq!(c.lock_retry.max_attempts, 5);
        assert_eq!(c.lock_retry.initial_backoff, Duration::from_millis(100));
        assert_eq!(c.lock_retry.max_backoff, Duration::from_secs(6));
    }

    #[test]
    fn fusion_weight_pairs() {
        let c = MemoryConfig::default();
        assert!((c.correlation_weights.dense - 0.4).abs() < f64::EPSILON);
        assert!((c.correlation_weights.sparse - 0.6).abs() < f64::EPSILON);
        assert!((c.answer_weights.dense - 0.7).abs() < f64::EPSILON);
        assert!((c.answer_weights.sparse - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn workers_nonzero() {
        assert!(MemoryConfig::default().workers >= 1);
    }
}
