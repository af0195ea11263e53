//! Object store access with bounded retries.
//!
//! Every call is retried with exponential backoff (100ms, 200ms, 400ms, ...) up to the configured
//! attempt count. A missing object is an answer, not a failure: it is never retried and
//! surfaces as `None`.

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use chronohub_observability::metrics::{TIER_ERRORS_TOTAL, TIER_LATENCY};

use crate::error::Result;

const TIER: &str = "s3";

#[derive(Clone)]
pub struct ObjectClient {
    store: Arc<dyn ObjectStore>,
    attempts: u32,
}

impl ObjectClient {
    pub fn new(store: Arc<dyn ObjectStore>, attempts: u32) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn put(&self, path: &Path, data: Bytes) -> Result<()> {
        self.with_retry("put", path, || self.store.put(path, data.clone()))
            .await?;
        debug!(path = %path, size = data.len(), "Object written");
        Ok(())
    }

    pub async fn get(&self, path: &Path) -> Result<Option<Bytes>> {
        match self.with_retry("get", path, || self.fetch(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every object location under `prefix`, in no particular order.
    pub async fn list(&self, prefix: &Path) -> Result<Vec<Path>> {
        let locations = self
            .with_retry("list", prefix, || {
                self.store
                    .list(Some(prefix))
                    .map_ok(|meta| meta.location)
                    .try_collect::<Vec<Path>>()
            })
            .await?;
        Ok(locations)
    }

    pub async fn delete(&self, path: &Path) -> Result<()> {
        match self.with_retry("delete", path, || self.store.delete(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes `paths`, stopping at the first failure. Returns how many were deleted.
    pub async fn delete_all(&self, paths: &[Path]) -> Result<usize> {
        for path in paths {
            self.delete(path).await?;
        }
        Ok(paths.len())
    }

    async fn fetch(&self, path: &Path) -> object_store::Result<Bytes> {
        self.store.get(path).await?.bytes().await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        path: &Path,
        mut call: F,
    ) -> object_store::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let start = Instant::now();
            let result = call().await;
            TIER_LATENCY
                .with_label_values(&[TIER, operation])
                .observe(start.elapsed().as_secs_f64());

            match result {
                Ok(value) => return Ok(value),
                Err(e @ object_store::Error::NotFound { .. }) => return Err(e),
                Err(e) if attempt + 1 < self.attempts => {
                    let backoff_ms = 100 * 2_u64.pow(attempt);
                    warn!(
                        operation,
                        path = %path,
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "Object store call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => {
                    TIER_ERRORS_TOTAL.with_label_values(&[TIER, operation]).inc();
                    error!(
                        operation,
                        path = %path,
                        attempts = attempt + 1,
                        error = %e,
                        "Object store call failed after all retries"
                    );
                    return Err(e);
                }
            }
        }
    }
}
