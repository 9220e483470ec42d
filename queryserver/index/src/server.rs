//! Serializes updates and queries against the caches.
//!
//! A single task owns the [`CachedQuery`] and processes work in the order it is submitted, so a
//! query never observes a partially applied batch of updates.

use crate::{
    error::QueryError,
    metrics::IndexMetrics,
    query::CachedQuery,
    summary::{self, SummarySnapshot, TimeSeries},
};
use queryserver_core::{
    api::{ClusterRequest, QueryRequest, QueryResponse},
    ResourceUpdate,
};
use std::{sync::Arc, time::SystemTime};
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tracing::{debug, info, Instrument};

#[derive(Clone)]
pub struct QueryServer {
    tx: mpsc::UnboundedSender<Work>,
    history: Option<Arc<dyn TimeSeries>>,
    metrics: IndexMetrics,
}

enum Work {
    Updates(Vec<ResourceUpdate>, Option<oneshot::Sender<()>>),
    Query(
        QueryRequest,
        oneshot::Sender<Result<QueryResponse, QueryError>>,
    ),
}

// === impl QueryServer ===

impl QueryServer {
    /// Spawns the serializing task on the current runtime.
    pub fn spawn(metrics: IndexMetrics, history: Option<Arc<dyn TimeSeries>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            serve(CachedQuery::new(), rx, metrics.clone()).instrument(tracing::info_span!("queries")),
        );
        Self {
            tx,
            history,
            metrics,
        }
    }

    /// Submits a batch of updates without waiting for it to be applied.
    pub fn on_updates(&self, updates: Vec<ResourceUpdate>) -> Result<(), QueryError> {
        self.tx
            .send(Work::Updates(updates, None))
            .map_err(|_| QueryError::Unavailable)
    }

    /// Submits a batch of updates and waits until it has been applied.
    pub async fn apply_updates(&self, updates: Vec<ResourceUpdate>) -> Result<(), QueryError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Work::Updates(updates, Some(done_tx)))
            .map_err(|_| QueryError::Unavailable)?;
        done_rx.await.map_err(|_| QueryError::Unavailable)
    }

    pub async fn run_query(&self, req: QueryRequest) -> Result<QueryResponse, QueryError> {
        let observer = self.metrics.query(&req);
        let result = self.dispatch(req).await;
        observer.end(&result);
        result
    }

    /// Runs a query, failing if it has not completed within `timeout`.
    ///
    /// A query that times out after being dequeued still runs to completion; its result is
    /// discarded.
    pub async fn run_query_with_deadline(
        &self,
        req: QueryRequest,
        timeout: time::Duration,
    ) -> Result<QueryResponse, QueryError> {
        let observer = self.metrics.query(&req);
        let result = time::timeout(timeout, self.dispatch(req))
            .await
            .unwrap_or(Err(QueryError::DeadlineExceeded));
        observer.end(&result);
        result
    }

    async fn dispatch(&self, req: QueryRequest) -> Result<QueryResponse, QueryError> {
        match req {
            QueryRequest::Cluster(ClusterRequest {
                timestamp: Some(at),
            }) => self.historical_summary(at).await,
            req => self.query(req).await,
        }
    }

    async fn query(&self, req: QueryRequest) -> Result<QueryResponse, QueryError> {
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.tx
            .send(Work::Query(req, rsp_tx))
            .map_err(|_| QueryError::Unavailable)?;
        rsp_rx.await.map_err(|_| QueryError::Unavailable)?
    }

    async fn historical_summary(&self, at: SystemTime) -> Result<QueryResponse, QueryError> {
        let source = self.history.as_deref().ok_or(QueryError::NoHistory)?;
        let snapshot = SummarySnapshot::fetch(source, at)
            .await
            .map_err(QueryError::History)?;
        Ok(QueryResponse::Cluster(summary::summarize(&snapshot)))
    }
}

async fn serve(mut cache: CachedQuery, mut rx: mpsc::UnboundedReceiver<Work>, metrics: IndexMetrics) {
    info!("Serving queries");
    while let Some(work) = rx.recv().await {
        match work {
            Work::Updates(updates, done) => {
                for update in &updates {
                    metrics.update(update.key.kind, update.update_type);
                }
                cache.on_updates(&updates);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Work::Query(req, rsp) => {
                // The caller may have stopped waiting.
                let _ = rsp.send(cache.run_query(req));
            }
        }
    }
    debug!("All handles dropped; shutting down");
}
