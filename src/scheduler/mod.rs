//! Scheduler module: drives periodic query cycles.
//!
//! Each cycle loads the enabled statuses, fans their jobs out across a
//! bounded set of workers and waits for all of them before sleeping
//! until the next wall-clock-aligned tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::alert::{DisplayRefresher, Notifier};
use crate::config::{Config, DEFAULT_QUERY_INTERVAL_SECS, MIN_QUERY_INTERVAL_SECS};
use crate::db::{DbError, Store};
use crate::query::{self, JobError, QueryContext};

/// An error that aborts a whole query cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Failed to build query context: {0}")]
    Context(#[from] reqwest::Error),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Run query cycles forever.
///
/// Cycles are aligned to the wall clock, so a 60 second interval fires
/// on the minute regardless of how long the previous cycle took. The
/// interval is re-read from the `query-interval` setting every cycle.
pub async fn run<N, D>(store: Store, notifier: Arc<N>, displays: Arc<D>, cfg: Arc<Config>)
where
    N: Notifier + 'static,
    D: DisplayRefresher + 'static,
{
    loop {
        let interval = query_interval(&store);
        sleep_until_next_tick(interval).await;

        if let Err(e) = run_cycle(&store, &notifier, &displays, &cfg).await {
            tracing::warn!("Query cycle failed: {}", e);
        }
    }
}

/// Read the polling interval setting, enforcing the floor.
///
/// Anything missing, unparsable or below the floor falls back to the
/// default rather than the floor, so a misconfigured value is obvious.
fn query_interval(store: &Store) -> Duration {
    let secs = store
        .get_setting("query-interval")
        .ok()
        .flatten()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|&secs| secs >= MIN_QUERY_INTERVAL_SECS)
        .unwrap_or(DEFAULT_QUERY_INTERVAL_SECS);
    Duration::from_secs(secs)
}

async fn sleep_until_next_tick(interval: Duration) {
    let interval_ms = interval.as_millis().max(1) as u64;
    let now_ms = Utc::now().timestamp_millis().max(0) as u64;
    let wait = interval_ms - (now_ms % interval_ms);
    tokio::time::sleep(Duration::from_millis(wait)).await;
}

/// Run one query cycle over all enabled statuses.
///
/// Per-status failures are logged and absorbed; only a delivery outage
/// fails the cycle, since every remaining notification would hit the
/// same wall.
pub async fn run_cycle<N, D>(
    store: &Store,
    notifier: &Arc<N>,
    displays: &Arc<D>,
    cfg: &Arc<Config>,
) -> Result<(), CycleError>
where
    N: Notifier + 'static,
    D: DisplayRefresher + 'static,
{
    let statuses: Vec<_> = store
        .get_enabled_statuses()?
        .into_iter()
        .filter(|status| !status.queries.is_empty())
        .collect();
    if statuses.is_empty() {
        tracing::debug!("No statuses to query");
        return Ok(());
    }
    tracing::info!("Querying {} status(es)", statuses.len());

    let ctx = Arc::new(QueryContext::new()?);
    let max_concurrency = cfg.max_concurrency;

    let store = store.clone();
    let notifier = notifier.clone();
    let displays = displays.clone();
    let cfg = cfg.clone();
    let results = fan_out(statuses, max_concurrency, move |status| {
        let ctx = ctx.clone();
        let store = store.clone();
        let notifier = notifier.clone();
        let displays = displays.clone();
        let cfg = cfg.clone();
        async move {
            query::query_status(
                &ctx,
                &store,
                notifier.as_ref(),
                displays.as_ref(),
                &status,
                &cfg,
            )
            .await
        }
    })
    .await;

    let mut fatal = None;
    for result in results {
        if let Err(e) = result {
            if e.is_fatal() && fatal.is_none() {
                fatal = Some(e);
            } else {
                tracing::warn!("Query job failed: {}", e);
            }
        }
    }
    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Run one job per item with at most `max_concurrency` in flight, and
/// collect the results in completion order. Panicked jobs are logged
/// and dropped.
async fn fan_out<T, F, Fut, R>(items: Vec<T>, max_concurrency: usize, job: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut set = JoinSet::new();
    for item in items {
        let semaphore = semaphore.clone();
        let fut = job(item);
        set.spawn(async move {
            // The semaphore is never closed, so this only fails if the
            // runtime is shutting down.
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return None,
            };
            Some(fut.await)
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(e) => tracing::error!("Query job panicked: {}", e),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_fan_out_collects_results() {
        let results = fan_out(vec![1, 2, 3, 4, 5], 3, |n| async move { n * n }).await;
        let mut results = results;
        results.sort();
        assert_eq!(results, vec![1, 4, 9, 16, 25]);
    }

    #[tokio::test]
    async fn test_fan_out_respects_concurrency_bound() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = fan_out(vec![(); 5], 2, {
            let running = running.clone();
            let peak = peak.clone();
            move |()| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }
        })
        .await;

        assert_eq!(results.len(), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_query_interval_setting() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        assert_eq!(query_interval(&store), Duration::from_secs(60));

        store.set_setting("query-interval", "120").unwrap();
        assert_eq!(query_interval(&store), Duration::from_secs(120));

        // Below the floor or unparsable: fall back to the default.
        store.set_setting("query-interval", "10").unwrap();
        assert_eq!(query_interval(&store), Duration::from_secs(60));
        store.set_setting("query-interval", "soon").unwrap();
        assert_eq!(query_interval(&store), Duration::from_secs(60));
    }
}
