//! Execution layer: runs built queries against the external services with retry

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{AppError, Result};
use crate::models::{EntitySearchResult, RawResult, ResultRow, TimeWindow};
use crate::query::{BuiltQuery, Dialect};

/// A time-series query as sent to the query service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesRequest {
    pub account_id: u64,
    pub query: String,
    #[serde(default)]
    pub window: Option<TimeWindow>,
}

/// External time-series query execution service
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn run(&self, request: &TimeSeriesRequest) -> Result<Vec<ResultRow>>;

    /// Run several queries in one round trip. The outer error fails all of
    /// them; inner results are per query, in input order.
    async fn run_batch(
        &self,
        requests: &[TimeSeriesRequest],
    ) -> Result<Vec<Result<Vec<ResultRow>>>> {
        Ok(join_all(requests.iter().map(|r| self.run(r))).await)
    }
}

/// External entity search service
#[async_trait]
pub trait EntitySearchService: Send + Sync {
    async fn search(&self, filter_expression: &str) -> Result<EntitySearchResult>;
}

/// Exponential backoff with a ceiling, applied to retryable errors only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Each attempt is cut off after this long and counts as a timeout
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    async fn attempt<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.attempt_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.attempt_timeout)),
        }
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    /// The last error is returned as-is.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(op()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation = %what,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(operation = %what, attempts = attempt, error = %e, "Execution failed");
                    return Err(e);
                }
            }
        }
    }
}

#[derive(Default)]
struct ExecutorStats {
    attempts: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutorStatsSnapshot {
    pub attempts: u64,
    pub retries: u64,
}

/// Dispatches built queries to the service for their dialect
pub struct QueryExecutor {
    query_service: Arc<dyn QueryService>,
    search_service: Arc<dyn EntitySearchService>,
    retry: RetryPolicy,
    account_id: u64,
    stats: ExecutorStats,
}

impl QueryExecutor {
    pub fn new(
        query_service: Arc<dyn QueryService>,
        search_service: Arc<dyn EntitySearchService>,
        retry: RetryPolicy,
        account_id: u64,
    ) -> Self {
        Self {
            query_service,
            search_service,
            retry,
            account_id,
            stats: ExecutorStats::default(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn request_for(&self, query: &BuiltQuery) -> TimeSeriesRequest {
        TimeSeriesRequest {
            account_id: self.account_id,
            query: query.text.clone(),
            window: Some(query.descriptor.window),
        }
    }

    fn count_attempt(&self, first: &mut bool) {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        if !std::mem::replace(first, false) {
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Execute one query with retry.
    pub async fn execute(&self, query: &BuiltQuery) -> Result<RawResult> {
        debug!(dialect = %query.dialect, key = %query.cache_key, "Executing query");
        let mut first = true;
        match query.dialect {
            Dialect::Nrql => {
                let request = self.request_for(query);
                let rows = self
                    .retry
                    .run(&query.cache_key, || {
                        self.count_attempt(&mut first);
                        self.query_service.run(&request)
                    })
                    .await?;
                Ok(RawResult::Rows(rows))
            }
            Dialect::EntitySearch => {
                let entities = self
                    .retry
                    .run(&query.cache_key, || {
                        self.count_attempt(&mut first);
                        self.search_service.search(&query.text)
                    })
                    .await?;
                Ok(RawResult::Entities(entities))
            }
        }
    }

    /// Execute several queries, sharing round trips where the service allows.
    ///
    /// Time-series queries go out together; items that fail with a retryable
    /// error are retried on their own schedule while successful ones are kept.
    /// The outer error is returned only when the whole call fails before any
    /// item settles.
    pub async fn execute_batch(&self, queries: &[BuiltQuery]) -> Result<Vec<Result<RawResult>>> {
        if queries.len() == 1 {
            return Ok(vec![self.execute(&queries[0]).await]);
        }
        if !queries.iter().all(|q| q.dialect == Dialect::Nrql) {
            return Ok(join_all(queries.iter().map(|q| self.execute(q))).await);
        }

        let requests: Vec<TimeSeriesRequest> = queries.iter().map(|q| self.request_for(q)).collect();
        let mut results: Vec<Option<Result<RawResult>>> = vec![None; queries.len()];
        let mut pending: Vec<usize> = (0..queries.len()).collect();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut first = true;

        for attempt in 1..=max_attempts {
            let batch: Vec<TimeSeriesRequest> = pending.iter().map(|&i| requests[i].clone()).collect();
            self.count_attempt(&mut first);
            debug!(size = batch.len(), attempt = attempt, "Executing query batch");

            let last = attempt == max_attempts;
            match self.retry.attempt(self.query_service.run_batch(&batch)).await {
                Ok(items) if items.len() == pending.len() => {
                    let mut still_pending = Vec::new();
                    for (&index, item) in pending.iter().zip(items) {
                        match item {
                            Err(e) if e.is_retryable() && !last => still_pending.push(index),
                            other => results[index] = Some(other.map(RawResult::Rows)),
                        }
                    }
                    pending = still_pending;
                }
                Ok(items) => {
                    let e = AppError::InternalError(format!(
                        "service returned {} results for {} queries",
                        items.len(),
                        pending.len()
                    ));
                    return Err(e);
                }
                Err(e) if e.is_retryable() && !last => {
                    warn!(attempt = attempt, error = %e, "Query batch failed, retrying");
                }
                Err(e) => {
                    if pending.len() == queries.len() {
                        error!(attempts = attempt, error = %e, "Query batch failed");
                        return Err(e);
                    }
                    for &index in &pending {
                        results[index] = Some(Err(e.clone()));
                    }
                    pending.clear();
                }
            }

            if pending.is_empty() {
                break;
            }
            tokio::time::sleep(self.retry.delay_after(attempt)).await;
        }

        Ok(results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(AppError::InternalError("query left unsettled".into())))
            })
            .collect())
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Aggregation, AggregationOp, EntityKind, Provider, QueryDescriptor};
    use crate::query::build;
    use crate::services::fixture::FixtureService;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            attempt_timeout: Duration::from_secs(1),
        }
    }

    fn executor(service: Arc<FixtureService>) -> QueryExecutor {
        QueryExecutor::new(service.clone(), service, policy(), 1)
    }

    fn query(field: &str) -> BuiltQuery {
        let descriptor = QueryDescriptor::new(
            Provider::AwsMsk,
            EntityKind::Cluster,
            TimeWindow::last_seconds(60),
        )
        .aggregate(Aggregation::new(AggregationOp::Average, field));
        build(&descriptor, Dialect::Nrql).unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(250));
        assert_eq!(policy.delay_after(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_exhausts_attempts() {
        let service = Arc::new(FixtureService::new());
        service.fail_always(AppError::ServiceUnavailable("maintenance".into()));
        let executor = executor(service.clone());

        let err = executor.execute(&query("cpuPercent")).await.unwrap_err();

        assert_eq!(err, AppError::ServiceUnavailable("maintenance".into()));
        assert_eq!(service.query_calls(), 3);
        assert_eq!(executor.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let service = Arc::new(FixtureService::new());
        service.fail_always(AppError::PermissionDenied("no access".into()));
        let executor = executor(service.clone());

        let err = executor.execute(&query("cpuPercent")).await.unwrap_err();

        assert_eq!(err, AppError::PermissionDenied("no access".into()));
        assert_eq!(service.query_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let service = Arc::new(FixtureService::new());
        service.fail_next(AppError::RateLimited("429".into()));
        let executor = executor(service.clone());

        let result = executor.execute(&query("cpuPercent")).await;

        assert!(matches!(result, Ok(RawResult::Rows(_))));
        assert_eq!(service.query_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_retries() {
        let service = Arc::new(FixtureService::new().with_latency(Duration::from_secs(5)));
        let executor = executor(service.clone());

        let err = executor.execute(&query("cpuPercent")).await.unwrap_err();

        assert_eq!(err, AppError::Timeout(Duration::from_secs(1)));
        assert_eq!(service.query_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_retries_only_failed_items() {
        let service = Arc::new(FixtureService::new());
        let executor = executor(service.clone());
        let queries = vec![query("cpuPercent"), query("diskUsedPercent")];
        service.fail_matching("diskUsedPercent", AppError::Timeout(Duration::ZERO), 1);

        let results = executor.execute_batch(&queries).await.unwrap();

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(service.batch_sizes(), vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_outer_failure_is_returned() {
        let service = Arc::new(FixtureService::new());
        service.fail_always(AppError::InvalidQuery("syntax".into()));
        let executor = executor(service.clone());
        let queries = vec![query("cpuPercent"), query("diskUsedPercent")];

        let err = executor.execute_batch(&queries).await.unwrap_err();
        assert_eq!(err, AppError::InvalidQuery("syntax".into()));
    }
}
