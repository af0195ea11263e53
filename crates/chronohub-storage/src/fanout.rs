//! Concurrent store fan-out with an overall deadline.
//!
//! Every contributing store runs on its own task inside the caller's span. A query succeeds only
//! when every store answered before the deadline: one failure or timeout fails the whole query,
//! so callers never mistake "could not ask" for "nothing there".

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{warn, Instrument};

use chronohub_core::{ContentKey, QueryResult};
use chronohub_observability::metrics::QUERY_FAILURES_TOTAL;

use crate::error::{Error, Result};

pub type StoreFuture<T> = BoxFuture<'static, Result<T>>;

/// Runs `tasks` concurrently and returns one result per task, in completion order.
///
/// Tasks still running at the deadline are aborted and reported as [`Error::Timeout`].
pub async fn run_all<T>(operation: &str, tasks: Vec<StoreFuture<T>>, timeout: Duration) -> Vec<Result<T>>
where
    T: Send + 'static,
{
    let total = tasks.len();
    let mut pending: FuturesUnordered<_> = tasks
        .into_iter()
        .map(|task| tokio::spawn(task.in_current_span()))
        .collect();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut results = Vec::with_capacity(total);

    loop {
        match tokio::time::timeout_at(deadline, pending.next()).await {
            Ok(Some(Ok(result))) => results.push(result),
            Ok(Some(Err(e))) => results.push(Err(Error::Join(e))),
            Ok(None) => break,
            Err(_) => {
                for handle in pending.iter() {
                    handle.abort();
                }
                warn!(
                    operation,
                    unfinished = pending.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Fan-out deadline passed"
                );
                for _ in 0..pending.len() {
                    results.push(Err(Error::Timeout(operation.to_string())));
                }
                break;
            }
        }
    }
    results
}

/// Unions the key sets of every store, failing closed.
pub async fn query_keys(
    operation: &str,
    tasks: Vec<StoreFuture<BTreeSet<ContentKey>>>,
    timeout: Duration,
) -> Result<BTreeSet<ContentKey>> {
    let mut result = QueryResult::new(tasks.len());
    for outcome in run_all(operation, tasks, timeout).await {
        match outcome {
            Ok(keys) => result.add_keys(keys),
            Err(e) => {
                warn!(operation, error = %e, "Store failed during fan-out query");
                result.add_failure();
            }
        }
    }
    complete(operation, result)
}

/// Converts an accumulated result into keys, or `QueryFailed` if any store failed.
pub fn complete(operation: &str, result: QueryResult) -> Result<BTreeSet<ContentKey>> {
    if result.is_complete() {
        Ok(result.into_keys())
    } else {
        QUERY_FAILURES_TOTAL.with_label_values(&[operation]).inc();
        Err(Error::QueryFailed {
            operation: operation.to_string(),
            failed: result.failures(),
            expected: result.expected(),
        })
    }
}
