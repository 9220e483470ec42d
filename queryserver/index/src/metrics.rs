use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use queryserver_core::{api::QueryRequest, Kind, UpdateType};
use tokio::time;

#[derive(Clone, Debug)]
pub struct IndexMetrics {
    updates: Family<UpdateLabels, Counter>,
    queries: Family<QueryLabels, Counter>,
    query_errors: Family<QueryLabels, Counter>,
    query_duration: Family<QueryLabels, Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UpdateLabels {
    kind: &'static str,
    update_type: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct QueryLabels {
    query: &'static str,
}

/// Records the outcome of a single query.
pub(crate) struct QueryObserver {
    start: time::Instant,
    labels: QueryLabels,
    errors: Family<QueryLabels, Counter>,
    durations: Family<QueryLabels, Histogram>,
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let updates = Family::default();
        prom.register(
            "updates",
            "Count of resource updates applied to the index",
            updates.clone(),
        );

        let queries = Family::default();
        prom.register("queries", "Count of queries received", queries.clone());

        let query_errors = Family::default();
        prom.register(
            "query_errors",
            "Count of queries that failed",
            query_errors.clone(),
        );

        let query_duration = Family::<QueryLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.001, 0.01, 0.1, 1.0, 10.0])
        });
        prom.register_with_unit(
            "query_duration",
            "Histogram of the time (seconds) taken to answer queries, including time queued",
            Unit::Seconds,
            query_duration.clone(),
        );

        Self {
            updates,
            queries,
            query_errors,
            query_duration,
        }
    }

    pub(crate) fn update(&self, kind: Kind, update_type: UpdateType) {
        self.updates
            .get_or_create(&UpdateLabels {
                kind: kind.as_str(),
                update_type: update_type.as_str(),
            })
            .inc();
    }

    pub(crate) fn query(&self, req: &QueryRequest) -> QueryObserver {
        let labels = QueryLabels {
            query: query_name(req),
        };
        self.queries.get_or_create(&labels).inc();
        QueryObserver {
            start: time::Instant::now(),
            labels,
            errors: self.query_errors.clone(),
            durations: self.query_duration.clone(),
        }
    }
}

impl Default for IndexMetrics {
    /// Metrics that are not exported.
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl QueryObserver ===

impl QueryObserver {
    pub(crate) fn end<T, E>(self, result: &Result<T, E>) {
        self.durations
            .get_or_create(&self.labels)
            .observe(self.start.elapsed().as_secs_f64());
        if result.is_err() {
            self.errors.get_or_create(&self.labels).inc();
        }
    }
}

fn query_name(req: &QueryRequest) -> &'static str {
    match req {
        QueryRequest::Cluster(_) => "cluster",
        QueryRequest::Endpoints(_) => "endpoints",
        QueryRequest::Policies(_) => "policies",
        QueryRequest::Nodes(_) => "nodes",
        QueryRequest::Labels(_) => "labels",
    }
}
