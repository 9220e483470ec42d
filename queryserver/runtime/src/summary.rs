//! Exports the cluster summary as gauges, so that summaries can later be reconstructed from a
//! time series database.

use parking_lot::RwLock;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use queryserver_core::api::{ClusterRequest, ClusterSummary, QueryRequest, QueryResponse};
use queryserver_index::{summary::gauges, QueryServer};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, warn};

/// The most recently computed cluster summary.
#[derive(Clone, Debug, Default)]
pub struct SummaryGauges(Arc<RwLock<Option<ClusterSummary>>>);

#[derive(Debug)]
struct Instrumented(SummaryGauges);

// === impl SummaryGauges ===

impl SummaryGauges {
    pub fn register(reg: &mut Registry) -> Self {
        let gauges = Self::default();
        reg.register_collector(Box::new(Instrumented(gauges.clone())));
        gauges
    }

    fn set(&self, summary: ClusterSummary) {
        *self.0.write() = Some(summary);
    }

    /// Periodically recomputes the summary.
    pub async fn refresh(self, server: QueryServer, period: time::Duration, timeout: time::Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let req = QueryRequest::Cluster(ClusterRequest::default());
            match server.run_query_with_deadline(req, timeout).await {
                Ok(QueryResponse::Cluster(summary)) => {
                    debug!(
                        endpoints = summary.num_workload_endpoints + summary.num_host_endpoints,
                        "Refreshed summary"
                    );
                    self.set(summary);
                }
                Ok(rsp) => warn!(?rsp, "Unexpected summary response"),
                Err(error) => warn!(%error, "Failed to refresh summary"),
            }
        }
    }
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0 .0.read();
        let Some(summary) = this.as_ref() else {
            return Ok(());
        };

        let mut gnp = encoder.encode_descriptor(
            gauges::GLOBAL_NETWORK_POLICIES,
            "The number of global network policies",
            None,
            MetricType::Gauge,
        )?;
        for (kind, value) in [
            (gauges::TOTAL, summary.num_global_network_policies),
            (gauges::UNMATCHED, summary.num_unmatched_global_network_policies),
        ] {
            let labels = [(gauges::TYPE_LABEL, kind)];
            ConstGauge::new(value as i64).encode(gnp.encode_family(&labels)?)?;
        }

        let mut np = encoder.encode_descriptor(
            gauges::NETWORK_POLICIES,
            "The number of namespaced network policies",
            None,
            MetricType::Gauge,
        )?;
        for (ns, counts) in &summary.namespace_counts {
            for (kind, value) in [
                (gauges::TOTAL, counts.num_network_policies),
                (gauges::UNMATCHED, counts.num_unmatched_network_policies),
            ] {
                let labels = [(gauges::NAMESPACE_LABEL, ns.as_str()), (gauges::TYPE_LABEL, kind)];
                ConstGauge::new(value as i64).encode(np.encode_family(&labels)?)?;
            }
        }

        let mut hep = encoder.encode_descriptor(
            gauges::HOST_ENDPOINTS,
            "The number of host endpoints",
            None,
            MetricType::Gauge,
        )?;
        for (kind, value) in [
            (gauges::TOTAL, summary.num_host_endpoints),
            (gauges::UNLABELLED, summary.num_unlabelled_host_endpoints),
            (gauges::UNPROTECTED, summary.num_unprotected_host_endpoints),
        ] {
            let labels = [(gauges::TYPE_LABEL, kind)];
            ConstGauge::new(value as i64).encode(hep.encode_family(&labels)?)?;
        }

        let mut wep = encoder.encode_descriptor(
            gauges::WORKLOAD_ENDPOINTS,
            "The number of workload endpoints",
            None,
            MetricType::Gauge,
        )?;
        for (ns, counts) in &summary.namespace_counts {
            for (kind, value) in [
                (gauges::TOTAL, counts.num_workload_endpoints),
                (gauges::UNLABELLED, counts.num_unlabelled_workload_endpoints),
                (gauges::UNPROTECTED, counts.num_unprotected_workload_endpoints),
                (gauges::FAILED, counts.num_failed_workload_endpoints),
            ] {
                let labels = [(gauges::NAMESPACE_LABEL, ns.as_str()), (gauges::TYPE_LABEL, kind)];
                ConstGauge::new(value as i64).encode(wep.encode_family(&labels)?)?;
            }
        }

        let mut nodes = encoder.encode_descriptor(
            gauges::NODES,
            "The number of nodes",
            None,
            MetricType::Gauge,
        )?;
        for (kind, value) in [
            (gauges::TOTAL, summary.num_nodes),
            (gauges::NO_ENDPOINTS, summary.num_nodes_with_no_endpoints),
            (gauges::NO_HOST_ENDPOINTS, summary.num_nodes_with_no_host_endpoints),
            (
                gauges::NO_WORKLOAD_ENDPOINTS,
                summary.num_nodes_with_no_workload_endpoints,
            ),
        ] {
            let labels = [(gauges::TYPE_LABEL, kind)];
            ConstGauge::new(value as i64).encode(nodes.encode_family(&labels)?)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use queryserver_core::api::NamespaceCounts;

    #[test]
    fn encodes_summary_gauges() {
        let mut reg = Registry::default();
        let gauges = SummaryGauges::register(&mut reg);

        let mut empty = String::new();
        prometheus_client::encoding::text::encode(&mut empty, &reg).unwrap();
        assert!(!empty.contains("workload_endpoints"));

        gauges.set(ClusterSummary {
            num_global_network_policies: 2,
            num_nodes: 3,
            namespace_counts: btreemap! {
                "prod".to_string() => NamespaceCounts {
                    num_workload_endpoints: 4,
                    num_failed_workload_endpoints: 1,
                    ..Default::default()
                },
            },
            ..Default::default()
        });
        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &reg).unwrap();
        assert!(text.contains("global_network_policies{type=\"\"} 2"), "{text}");
        assert!(text.contains("nodes{type=\"\"} 3"), "{text}");
        assert!(
            text.contains("workload_endpoints{namespace=\"prod\",type=\"failed\"} 1"),
            "{text}"
        );
    }
}
