//! Query requests and responses.

use crate::key::{Kind, ResourceKey};
use ahash::AHashMap as HashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::{
    collections::{BTreeMap, BTreeSet},
    time::SystemTime,
};

#[derive(Clone, Debug)]
pub enum QueryRequest {
    Cluster(ClusterRequest),
    Endpoints(EndpointsRequest),
    Policies(PoliciesRequest),
    Nodes(NodesRequest),
    Labels(LabelsRequest),
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryResponse {
    Cluster(ClusterSummary),
    Endpoints(Paged<Endpoint>),
    Policies(Paged<Policy>),
    Nodes(Paged<Node>),
    Labels(LabelsResponse),
}

/// A page of results together with the total number of results.
#[derive(Clone, Debug, PartialEq)]
pub struct Paged<T> {
    pub count: usize,
    pub items: Vec<T>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub page_num: i64,
    pub num_per_page: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sort<F> {
    /// Fields in decreasing significance.
    pub fields: Vec<F>,
    pub reverse: bool,
}

// === Cluster ===

#[derive(Clone, Debug, Default)]
pub struct ClusterRequest {
    /// Requests the summary as it was at a point in time.
    pub timestamp: Option<SystemTime>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterSummary {
    pub num_global_network_policies: usize,
    pub num_network_policies: usize,
    pub num_host_endpoints: usize,
    pub num_workload_endpoints: usize,
    pub num_unmatched_global_network_policies: usize,
    pub num_unmatched_network_policies: usize,
    pub num_unlabelled_host_endpoints: usize,
    pub num_unlabelled_workload_endpoints: usize,
    pub num_unprotected_host_endpoints: usize,
    pub num_unprotected_workload_endpoints: usize,
    pub num_failed_workload_endpoints: usize,
    pub num_nodes: usize,
    pub num_nodes_with_no_endpoints: usize,
    pub num_nodes_with_no_workload_endpoints: usize,
    pub num_nodes_with_no_host_endpoints: usize,
    pub namespace_counts: BTreeMap<String, NamespaceCounts>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceCounts {
    pub num_network_policies: usize,
    pub num_unmatched_network_policies: usize,
    pub num_workload_endpoints: usize,
    pub num_unlabelled_workload_endpoints: usize,
    pub num_unprotected_workload_endpoints: usize,
    pub num_failed_workload_endpoints: usize,
}

// === Endpoints ===

#[derive(Clone, Debug, Default)]
pub struct EndpointsRequest {
    /// Returns just this endpoint.
    pub endpoint: Option<ResourceKey>,
    pub selector: String,
    /// Selects the endpoints matched by this policy, or by one of its rules. Takes precedence
    /// over `selector`.
    pub policy: Option<ResourceKey>,
    pub rule: Option<RuleRef>,
    /// Restricts results to endpoints whose key contains one of these names.
    pub endpoints_list: Option<Vec<String>>,
    pub namespace: Option<String>,
    pub node: Option<String>,
    pub unprotected: bool,
    pub unlabelled: bool,
    pub pod_name_prefix: Option<String>,
    pub sort: Option<Sort<EndpointSortField>>,
    pub page: Option<Page>,
}

/// Identifies a single selector clause within a policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RuleRef {
    pub direction: RuleDirection,
    pub index: usize,
    pub entity: RuleEntity,
    pub negated: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuleDirection {
    Ingress,
    Egress,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuleEntity {
    Source,
    Destination,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointSortField {
    Name,
    Namespace,
    Kind,
    Node,
    NumGlobalNetworkPolicies,
    NumNetworkPolicies,
    Pod,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub node: String,
    pub workload: String,
    pub orchestrator: String,
    pub pod: String,
    pub interface_name: String,
    pub ip_networks: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub num_global_network_policies: usize,
    pub num_network_policies: usize,
}

// === Policies ===

#[derive(Clone, Debug, Default)]
pub struct PoliciesRequest {
    /// Returns just this policy.
    pub policy: Option<ResourceKey>,
    /// Selects policies applying to this endpoint.
    pub endpoint: Option<ResourceKey>,
    /// Selects policies with a rule selecting this network set.
    pub network_set: Option<ResourceKey>,
    /// Selects policies applying to an endpoint with these labels.
    pub labels: BTreeMap<String, String>,
    pub tiers: Vec<String>,
    pub unmatched: bool,
    pub permissions: Permissions,
    pub sort: Option<Sort<PolicySortField>>,
    pub page: Option<Page>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolicySortField {
    Index,
    Name,
    Namespace,
    Kind,
    Tier,
    NumHostEndpoints,
    NumWorkloadEndpoints,
    NumEndpoints,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Policy {
    pub uid: Option<String>,
    /// Position in the tier-ordered list of returned policies.
    pub index: usize,
    pub name: String,
    pub namespace: Option<String>,
    pub kind: String,
    pub tier: String,
    pub annotations: BTreeMap<String, String>,
    pub num_host_endpoints: usize,
    pub num_workload_endpoints: usize,
    pub ingress_rules: Vec<RuleCounts>,
    pub egress_rules: Vec<RuleCounts>,
    pub order: Option<f64>,
    pub creation_time: Option<Time>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointCounts {
    pub num_workload_endpoints: usize,
    pub num_host_endpoints: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleCounts {
    pub source: EndpointCounts,
    pub destination: EndpointCounts,
}

// === Nodes ===

#[derive(Clone, Debug, Default)]
pub struct NodesRequest {
    /// Returns just this node.
    pub node: Option<String>,
    pub sort: Option<Sort<NodeSortField>>,
    pub page: Option<Page>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeSortField {
    Name,
    NumHostEndpoints,
    NumWorkloadEndpoints,
    NumEndpoints,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub addresses: Vec<String>,
    pub bgp_ip_addresses: Vec<String>,
    pub num_host_endpoints: usize,
    pub num_workload_endpoints: usize,
}

// === Labels ===

#[derive(Clone, Debug)]
pub struct LabelsRequest {
    pub resource: LabelResource,
    pub permissions: Permissions,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LabelResource {
    Pods,
    Namespaces,
    ServiceAccounts,
    Policies,
    NetworkSets,
    ManagedClusters,
    ThreatFeeds,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelsResponse {
    pub labels: BTreeMap<String, BTreeSet<String>>,
}

// === Permissions ===

/// The resources a caller may list, by kind.
///
/// The default authorizes everything. Once any kind is granted, kinds with no entry are not
/// authorized at all.
#[derive(Clone, Debug, Default)]
pub struct Permissions {
    scopes: Option<HashMap<Kind, Scope>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Cluster,
    Namespaces(BTreeSet<String>),
}

// === impl Page ===

impl Page {
    pub fn new(page_num: i64, num_per_page: i64) -> Self {
        Self {
            page_num,
            num_per_page,
        }
    }
}

// === impl Sort ===

impl<F> Sort<F> {
    pub fn by(fields: impl IntoIterator<Item = F>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            reverse: false,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }
}

// === impl LabelResource ===

impl LabelResource {
    /// The kinds whose authorization governs access to labels in this category.
    pub fn kinds(&self) -> &'static [Kind] {
        match self {
            Self::Pods => &[Kind::WorkloadEndpoint],
            Self::Namespaces | Self::ServiceAccounts => &[Kind::Profile],
            Self::Policies => &Kind::POLICIES,
            Self::NetworkSets => &[Kind::GlobalNetworkSet, Kind::NetworkSet],
            Self::ManagedClusters => &[Kind::ManagedCluster],
            Self::ThreatFeeds => &[Kind::GlobalThreatFeed],
        }
    }
}

// === impl Permissions ===

impl Permissions {
    /// Permissions that authorize everything.
    pub fn all() -> Self {
        Self { scopes: None }
    }

    /// Permissions that authorize nothing until kinds are granted.
    pub fn none() -> Self {
        Self {
            scopes: Some(HashMap::default()),
        }
    }

    pub fn grant(mut self, kind: Kind, scope: Scope) -> Self {
        let scopes = self.scopes.get_or_insert_with(HashMap::default);
        let scope = match (scopes.remove(&kind), scope) {
            (Some(Scope::Namespaces(mut nss)), Scope::Namespaces(more)) => {
                nss.extend(more);
                Scope::Namespaces(nss)
            }
            (_, scope) => scope,
        };
        scopes.insert(kind, scope);
        self
    }

    /// True if the caller may list resources of `kind` in `namespace`. Cluster-scoped resources
    /// require cluster scope.
    pub fn is_authorized(&self, kind: Kind, namespace: Option<&str>) -> bool {
        let Some(scopes) = &self.scopes else {
            return true;
        };
        match (scopes.get(&kind), namespace) {
            (Some(Scope::Cluster), _) => true,
            (Some(Scope::Namespaces(nss)), Some(ns)) => nss.contains(ns),
            _ => false,
        }
    }

    /// True if the caller may list resources of `kind` in at least some scope.
    pub fn can_list(&self, kind: Kind) -> bool {
        self.scopes
            .as_ref()
            .is_none_or(|scopes| scopes.contains_key(&kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_permissions_authorize_nothing() {
        let perms = Permissions::none();
        assert!(!perms.is_authorized(Kind::NetworkPolicy, Some("ns")));
        assert!(!perms.can_list(Kind::NetworkPolicy));
        assert!(Permissions::all().is_authorized(Kind::GlobalNetworkPolicy, None));
    }

    #[test]
    fn namespace_scopes_accumulate() {
        let perms = Permissions::none()
            .grant(
                Kind::NetworkPolicy,
                Scope::Namespaces(["a".to_string()].into_iter().collect()),
            )
            .grant(
                Kind::NetworkPolicy,
                Scope::Namespaces(["b".to_string()].into_iter().collect()),
            )
            .grant(Kind::GlobalNetworkPolicy, Scope::Cluster);
        assert!(perms.is_authorized(Kind::NetworkPolicy, Some("a")));
        assert!(perms.is_authorized(Kind::NetworkPolicy, Some("b")));
        assert!(!perms.is_authorized(Kind::NetworkPolicy, Some("c")));
        assert!(!perms.is_authorized(Kind::NetworkPolicy, None));
        assert!(perms.is_authorized(Kind::GlobalNetworkPolicy, None));
        assert!(perms.can_list(Kind::NetworkPolicy));
        assert!(!perms.can_list(Kind::Tier));
    }
}
