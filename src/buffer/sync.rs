//! Periodic background flush.

use super::batch::Batch;
use crate::error::{AdapterError, AdapterResult};
use crate::models::QueryOptions;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Flushes a batch every `interval` until stopped or until the batch is gone.
///
/// The task only holds a weak reference between ticks, so dropping the
/// owning buffer ends it. A tick that already started its flush is allowed
/// to finish unless [`stop`](Self::stop) is given a grace limit; cancellation
/// is otherwise observed between ticks only.
pub(crate) struct SyncTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SyncTask {
    pub(crate) fn spawn(batch: &Arc<Batch>, interval: Duration) -> AdapterResult<Self> {
        if interval.is_zero() {
            return Err(AdapterError::config("sync interval must be positive"));
        }
        let runtime = Handle::try_current()
            .map_err(|_| AdapterError::config("sync interval requires a tokio runtime"))?;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = Arc::downgrade(batch);

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(batch) = weak.upgrade() else { break };
                        let flush = AssertUnwindSafe(batch.flush(QueryOptions::default()))
                            .catch_unwind()
                            .await;
                        if flush.is_err() {
                            error!("Background flush panicked");
                        }
                    }
                }
            }
            debug!("Sync task stopped");
        });

        Ok(Self {
            token,
            handle: Some(handle),
        })
    }

    /// Stop the timer and wait for an in-flight flush to finish.
    ///
    /// With a `grace` limit, a flush still running when it elapses is
    /// aborted and the items it took are lost.
    pub(crate) async fn stop(mut self, grace: Option<Duration>) {
        self.token.cancel();
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        if let Some(grace) = grace {
            if tokio::time::timeout(grace, &mut handle).await.is_ok() {
                return;
            }
            warn!(grace_ms = grace.as_millis() as u64, "Aborting in-flight background flush");
            handle.abort();
        }
        let _ = handle.await;
    }
}

impl Drop for SyncTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
