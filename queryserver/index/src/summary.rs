//! Cluster summaries, computed from the live caches or reconstructed from a time series of the
//! exported summary gauges.

use crate::{
    endpoint::EndpointSummary, node::NodeSummary, policy::PolicySummary, state::CacheState,
};
use queryserver_core::api::{ClusterSummary, NamespaceCounts};
use std::{collections::BTreeMap, time::SystemTime};

/// Names and label values of the exported summary gauges.
pub mod gauges {
    pub const HOST_ENDPOINTS: &str = "host_endpoints";
    pub const WORKLOAD_ENDPOINTS: &str = "workload_endpoints";
    pub const NETWORK_POLICIES: &str = "network_policies";
    pub const GLOBAL_NETWORK_POLICIES: &str = "global_network_policies";
    pub const NODES: &str = "nodes";

    pub const TYPE_LABEL: &str = "type";
    pub const NAMESPACE_LABEL: &str = "namespace";

    pub const TOTAL: &str = "";
    pub const UNLABELLED: &str = "unlabeled";
    pub const UNPROTECTED: &str = "unprotected";
    pub const FAILED: &str = "failed";
    pub const UNMATCHED: &str = "unmatched";
    pub const NO_ENDPOINTS: &str = "no-endpoints";
    pub const NO_HOST_ENDPOINTS: &str = "no-host-endpoints";
    pub const NO_WORKLOAD_ENDPOINTS: &str = "no-workload-endpoints";
}

/// A source of the counts a cluster summary is built from.
pub trait SummaryReader {
    fn global_policies(&self) -> PolicySummary;
    fn namespaced_policies(&self) -> BTreeMap<String, PolicySummary>;
    fn host_endpoints(&self) -> EndpointSummary;
    fn workload_endpoints(&self) -> BTreeMap<String, EndpointSummary>;
    fn nodes(&self) -> NodeSummary;
}

/// A time series database holding the exported summary gauges.
#[async_trait::async_trait]
pub trait TimeSeries: Send + Sync {
    /// Returns the samples of a metric at an instant.
    async fn query(&self, metric: &str, at: SystemTime) -> anyhow::Result<Vec<Sample>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Summary counts as recorded at a point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SummarySnapshot {
    global_policies: PolicySummary,
    namespaced_policies: BTreeMap<String, PolicySummary>,
    host_endpoints: EndpointSummary,
    workload_endpoints: BTreeMap<String, EndpointSummary>,
    nodes: NodeSummary,
}

pub fn summarize(reader: &impl SummaryReader) -> ClusterSummary {
    let global = reader.global_policies();
    let namespaced = reader.namespaced_policies();
    let hosts = reader.host_endpoints();
    let workloads = reader.workload_endpoints();
    let nodes = reader.nodes();

    let mut summary = ClusterSummary {
        num_global_network_policies: global.total,
        num_unmatched_global_network_policies: global.num_unmatched,
        num_host_endpoints: hosts.total,
        num_unlabelled_host_endpoints: hosts.num_unlabelled,
        num_unprotected_host_endpoints: hosts.num_unprotected,
        num_nodes: nodes.total,
        num_nodes_with_no_endpoints: nodes.num_no_endpoints,
        num_nodes_with_no_workload_endpoints: nodes.num_no_workload_endpoints,
        num_nodes_with_no_host_endpoints: nodes.num_no_host_endpoints,
        ..Default::default()
    };

    for (ns, p) in namespaced {
        summary.num_network_policies += p.total;
        summary.num_unmatched_network_policies += p.num_unmatched;
        let counts = summary.namespace_counts.entry(ns).or_default();
        counts.num_network_policies = p.total;
        counts.num_unmatched_network_policies = p.num_unmatched;
    }
    for (ns, w) in workloads {
        summary.num_workload_endpoints += w.total;
        summary.num_unlabelled_workload_endpoints += w.num_unlabelled;
        summary.num_unprotected_workload_endpoints += w.num_unprotected;
        summary.num_failed_workload_endpoints += w.num_failed;
        let counts: &mut NamespaceCounts = summary.namespace_counts.entry(ns).or_default();
        counts.num_workload_endpoints = w.total;
        counts.num_unlabelled_workload_endpoints = w.num_unlabelled;
        counts.num_unprotected_workload_endpoints = w.num_unprotected;
        counts.num_failed_workload_endpoints = w.num_failed;
    }

    summary
}

// === impl CacheState ===

impl SummaryReader for CacheState {
    fn global_policies(&self) -> PolicySummary {
        self.policies.total_global()
    }

    fn namespaced_policies(&self) -> BTreeMap<String, PolicySummary> {
        self.policies.totals_by_namespace()
    }

    fn host_endpoints(&self) -> EndpointSummary {
        self.endpoints.total_host()
    }

    fn workload_endpoints(&self) -> BTreeMap<String, EndpointSummary> {
        self.endpoints.totals_by_namespace()
    }

    fn nodes(&self) -> NodeSummary {
        self.nodes.summary()
    }
}

// === impl SummarySnapshot ===

impl SummarySnapshot {
    pub async fn fetch(source: &dyn TimeSeries, at: SystemTime) -> anyhow::Result<Self> {
        let mut snapshot = Self::default();

        for sample in source.query(gauges::GLOBAL_NETWORK_POLICIES, at).await? {
            let (_, value) = sample.parts();
            match sample.kind() {
                gauges::TOTAL => snapshot.global_policies.total = value,
                gauges::UNMATCHED => snapshot.global_policies.num_unmatched = value,
                _ => {}
            }
        }

        for sample in source.query(gauges::NETWORK_POLICIES, at).await? {
            let (ns, value) = sample.parts();
            let Some(ns) = ns else { continue };
            let counts = snapshot.namespaced_policies.entry(ns).or_default();
            match sample.kind() {
                gauges::TOTAL => counts.total = value,
                gauges::UNMATCHED => counts.num_unmatched = value,
                _ => {}
            }
        }

        for sample in source.query(gauges::HOST_ENDPOINTS, at).await? {
            let (_, value) = sample.parts();
            set_endpoint_count(&mut snapshot.host_endpoints, sample.kind(), value);
        }

        for sample in source.query(gauges::WORKLOAD_ENDPOINTS, at).await? {
            let (ns, value) = sample.parts();
            let Some(ns) = ns else { continue };
            let counts = snapshot.workload_endpoints.entry(ns).or_default();
            set_endpoint_count(counts, sample.kind(), value);
        }

        for sample in source.query(gauges::NODES, at).await? {
            let (_, value) = sample.parts();
            let nodes = &mut snapshot.nodes;
            match sample.kind() {
                gauges::TOTAL => nodes.total = value,
                gauges::NO_ENDPOINTS => nodes.num_no_endpoints = value,
                gauges::NO_HOST_ENDPOINTS => nodes.num_no_host_endpoints = value,
                gauges::NO_WORKLOAD_ENDPOINTS => nodes.num_no_workload_endpoints = value,
                _ => {}
            }
        }

        Ok(snapshot)
    }
}

impl SummaryReader for SummarySnapshot {
    fn global_policies(&self) -> PolicySummary {
        self.global_policies
    }

    fn namespaced_policies(&self) -> BTreeMap<String, PolicySummary> {
        self.namespaced_policies.clone()
    }

    fn host_endpoints(&self) -> EndpointSummary {
        self.host_endpoints
    }

    fn workload_endpoints(&self) -> BTreeMap<String, EndpointSummary> {
        self.workload_endpoints.clone()
    }

    fn nodes(&self) -> NodeSummary {
        self.nodes
    }
}

// === impl Sample ===

impl Sample {
    fn kind(&self) -> &str {
        self.labels
            .get(gauges::TYPE_LABEL)
            .map(String::as_str)
            .unwrap_or(gauges::TOTAL)
    }

    /// Returns the sample's namespace and its value as a count.
    fn parts(&self) -> (Option<String>, usize) {
        let value = if self.value.is_finite() && self.value > 0.0 {
            self.value.round() as usize
        } else {
            0
        };
        (self.labels.get(gauges::NAMESPACE_LABEL).cloned(), value)
    }
}

fn set_endpoint_count(counts: &mut EndpointSummary, kind: &str, value: usize) {
    match kind {
        gauges::TOTAL => counts.total = value,
        gauges::UNLABELLED => counts.num_unlabelled = value,
        gauges::UNPROTECTED => counts.num_unprotected = value,
        gauges::FAILED => counts.num_failed = value,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    struct Recorded(BTreeMap<&'static str, Vec<Sample>>);

    #[async_trait::async_trait]
    impl TimeSeries for Recorded {
        async fn query(&self, metric: &str, _: SystemTime) -> anyhow::Result<Vec<Sample>> {
            Ok(self.0.get(metric).cloned().unwrap_or_default())
        }
    }

    fn sample(labels: &[(&str, &str)], value: f64) -> Sample {
        Sample {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value,
        }
    }

    #[tokio::test]
    async fn reconstructs_summary_from_gauges() {
        let source = Recorded(btreemap! {
            gauges::GLOBAL_NETWORK_POLICIES => vec![
                sample(&[("type", "")], 3.0),
                sample(&[("type", "unmatched")], 1.0),
            ],
            gauges::NETWORK_POLICIES => vec![
                sample(&[("namespace", "a"), ("type", "")], 2.0),
                sample(&[("type", "")], 7.0),
            ],
            gauges::WORKLOAD_ENDPOINTS => vec![
                sample(&[("namespace", "a"), ("type", "")], 4.0),
                sample(&[("namespace", "a"), ("type", "failed")], 1.0),
                sample(&[("namespace", "b"), ("type", "unprotected")], 2.0),
            ],
            gauges::NODES => vec![
                sample(&[("type", "")], 2.0),
                sample(&[("type", "no-endpoints")], f64::NAN),
            ],
        });

        let snapshot = SummarySnapshot::fetch(&source, SystemTime::UNIX_EPOCH)
            .await
            .expect("snapshot must be fetched");
        let summary = summarize(&snapshot);
        assert_eq!(summary.num_global_network_policies, 3);
        assert_eq!(summary.num_unmatched_global_network_policies, 1);
        assert_eq!(summary.num_network_policies, 2);
        assert_eq!(summary.num_workload_endpoints, 4);
        assert_eq!(summary.num_failed_workload_endpoints, 1);
        assert_eq!(summary.num_unprotected_workload_endpoints, 2);
        assert_eq!(summary.num_nodes, 2);
        assert_eq!(summary.num_nodes_with_no_endpoints, 0);
        assert_eq!(
            summary.namespace_counts["a"],
            NamespaceCounts {
                num_network_policies: 2,
                num_workload_endpoints: 4,
                num_failed_workload_endpoints: 1,
                ..Default::default()
            }
        );
        assert_eq!(summary.namespace_counts["b"].num_unprotected_workload_endpoints, 2);
    }
}
