use crate::{
    dispatcher::Dispatcher,
    endpoint::EndpointData,
    error::QueryError,
    node::NodeData,
    policy::PolicyView,
    state::CacheState,
    summary,
};
use ahash::AHashSet as HashSet;
use queryserver_core::{
    api::{
        ClusterRequest, ClusterSummary, Endpoint, EndpointSortField, EndpointsRequest, Node,
        NodeSortField, NodesRequest, Page, Paged, PoliciesRequest, Policy, PolicySortField,
        QueryRequest, QueryResponse, RuleDirection, RuleEntity, RuleRef, Sort,
    },
    model::DEFAULT_TIER,
    resource::Spec,
    Kind, ResourceKey, ResourceUpdate,
};
use std::{cmp::Ordering, ops::Range};
use tracing::{debug, instrument};

/// Answers queries from the caches built by applying resource updates.
///
/// Updates and queries must not be interleaved concurrently; see
/// [`QueryServer`](crate::QueryServer).
pub struct CachedQuery {
    dispatcher: Dispatcher<CacheState>,
    state: CacheState,
}

// === impl CachedQuery ===

impl Default for CachedQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedQuery {
    pub fn new() -> Self {
        Self {
            dispatcher: CacheState::dispatcher(),
            state: CacheState::default(),
        }
    }

    pub fn state(&self) -> &CacheState {
        &self.state
    }

    /// Applies a batch of updates in order.
    pub fn on_updates(&mut self, updates: &[ResourceUpdate]) {
        self.dispatcher.dispatch(&mut self.state, updates);
    }

    #[instrument(skip_all)]
    pub fn run_query(&mut self, req: QueryRequest) -> Result<QueryResponse, QueryError> {
        match req {
            QueryRequest::Cluster(req) => self.summary(req).map(QueryResponse::Cluster),
            QueryRequest::Endpoints(req) => self.endpoints(req).map(QueryResponse::Endpoints),
            QueryRequest::Policies(req) => self.policies(req).map(QueryResponse::Policies),
            QueryRequest::Nodes(req) => self.nodes(req).map(QueryResponse::Nodes),
            QueryRequest::Labels(req) => Ok(QueryResponse::Labels(self.state.aggregator.labels(&req))),
        }
    }

    fn summary(&self, req: ClusterRequest) -> Result<ClusterSummary, QueryError> {
        // Historical summaries are served without touching the caches.
        if req.timestamp.is_some() {
            return Err(QueryError::NoHistory);
        }
        Ok(summary::summarize(&self.state))
    }

    fn endpoints(&mut self, req: EndpointsRequest) -> Result<Paged<Endpoint>, QueryError> {
        if let Some(key) = &req.endpoint {
            if !key.kind.is_endpoint() {
                return Err(QueryError::InvalidRequest(format!("{key} is not an endpoint")));
            }
            let data = self
                .state
                .endpoints
                .get(key)
                .ok_or_else(|| QueryError::does_not_exist(key))?;
            return Ok(Paged {
                count: 1,
                items: vec![endpoint(key, data)],
            });
        }

        let selector = match &req.policy {
            Some(policy) => match self.policy_selector(policy, req.rule) {
                Ok(selector) => selector,
                // The policy may have been deleted since the caller observed it.
                Err(QueryError::DoesNotExist(_)) => return Ok(empty()),
                Err(error) => return Err(error),
            },
            None => req.selector.clone(),
        };

        if req.endpoints_list.as_ref().is_some_and(Vec::is_empty) {
            return Ok(empty());
        }
        let names = req
            .endpoints_list
            .as_deref()
            .map(substring_matcher)
            .transpose()?;

        let keys = self.state.labels.query_endpoints(&selector)?;
        let mut items = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(ns) = &req.namespace {
                if !key.namespace().unwrap_or_default().eq_ignore_ascii_case(ns) {
                    continue;
                }
            }
            if names.as_ref().is_some_and(|re| !re.is_match(&key.to_string())) {
                continue;
            }
            let Some(data) = self.state.endpoints.get(key) else {
                continue;
            };
            let ep = endpoint(key, data);
            if req.node.as_ref().is_some_and(|n| *n != ep.node) {
                continue;
            }
            if req.unprotected && !data.policies.is_unprotected() {
                continue;
            }
            if req.unlabelled && !data.resource.is_unlabelled() {
                continue;
            }
            if req.pod_name_prefix.as_ref().is_some_and(|p| !ep.pod.starts_with(p.as_str())) {
                continue;
            }
            items.push(ep);
        }
        debug!(%selector, matched = keys.len(), returned = items.len(), "Endpoints query");

        sort_by_fields(&mut items, req.sort.as_ref(), cmp_endpoint, |a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.namespace.cmp(&b.namespace))
                .then_with(|| a.kind.cmp(&b.kind))
        });
        paged(items, req.page.as_ref())
    }

    /// Returns the selector of a policy, or of one of its rule clauses.
    fn policy_selector(&self, key: &ResourceKey, rule: Option<RuleRef>) -> Result<String, QueryError> {
        if !key.kind.is_policy() {
            return Err(QueryError::InvalidRequest(format!("{key} is not a policy")));
        }
        let view = self
            .state
            .policies
            .get_policy(key)
            .ok_or_else(|| QueryError::does_not_exist(key))?;
        let model = &view.data.model;
        let Some(rule) = rule else {
            return Ok(model.selector.clone());
        };

        let (direction, rules) = match rule.direction {
            RuleDirection::Ingress => ("ingress", &model.inbound_rules),
            RuleDirection::Egress => ("egress", &model.outbound_rules),
        };
        if rules.is_empty() {
            return Err(QueryError::InvalidRequest(format!(
                "there are no {direction} rules configured"
            )));
        }
        let r = rules.get(rule.index).ok_or_else(|| {
            QueryError::InvalidRequest(format!(
                "rule index out of range, expected: 0-{}; requested index: {}",
                rules.len() - 1,
                rule.index
            ))
        })?;
        let selector = match (rule.entity, rule.negated) {
            (RuleEntity::Source, false) => &r.src_selector,
            (RuleEntity::Source, true) => &r.not_src_selector,
            (RuleEntity::Destination, false) => &r.dst_selector,
            (RuleEntity::Destination, true) => &r.not_dst_selector,
        };
        Ok(selector.clone())
    }

    fn policies(&mut self, req: PoliciesRequest) -> Result<Paged<Policy>, QueryError> {
        if let Some(key) = &req.policy {
            if !key.kind.is_policy() {
                return Err(QueryError::InvalidRequest(format!("{key} is not a policy")));
            }
            let view = self
                .state
                .policies
                .get_policy(key)
                .ok_or_else(|| QueryError::does_not_exist(key))?;
            if !req.permissions.is_authorized(key.kind, key.namespace()) {
                return Err(QueryError::NotAuthorized(key.clone()));
            }
            return Ok(Paged {
                count: 1,
                items: vec![policy(&view, 0)],
            });
        }

        // Each criterion narrows the set of policies to return. With no criteria every policy is
        // considered.
        let mut selected: Option<HashSet<ResourceKey>> = None;

        if let Some(key) = &req.endpoint {
            if !key.kind.is_endpoint() {
                return Err(QueryError::InvalidRequest(format!("{key} is not an endpoint")));
            }
            let data = self
                .state
                .endpoints
                .get(key)
                .ok_or_else(|| QueryError::does_not_exist(key))?;
            let (labels, profiles) = (data.model.labels.clone(), data.model.profile_ids.clone());
            let policies = self.state.labels.query_policies(labels, profiles);
            debug!(endpoint = %key, policies = policies.len(), "Policies by endpoint");
            selected = Some(policies.into_iter().collect());
        }

        if let Some(key) = &req.network_set {
            if !key.kind.is_network_set() {
                return Err(QueryError::InvalidRequest(format!("{key} is not a network set")));
            }
            let data = self
                .state
                .network_sets
                .get(key)
                .ok_or_else(|| QueryError::does_not_exist(key))?;
            let (labels, profiles) = (data.model.labels.clone(), data.model.profile_ids.clone());
            let selectors = self.state.labels.query_rule_selectors(labels, profiles);
            let policies = selectors
                .iter()
                .flat_map(|s| self.state.policies.policies_by_rule_selector(s))
                .cloned()
                .collect::<HashSet<_>>();
            debug!(network_set = %key, policies = policies.len(), "Policies by network set");
            selected = Some(policies);
        }

        if !req.labels.is_empty() {
            let matched = self
                .state
                .labels
                .query_policies(req.labels.clone().into(), Vec::new());
            selected = Some(match selected {
                Some(prior) => matched.into_iter().filter(|k| prior.contains(k)).collect(),
                None => matched.into_iter().collect(),
            });
        }

        let by_tier_only = selected.is_none() && !req.tiers.is_empty();
        let mut tiers = self.state.policies.ordered_policies(selected.as_ref());
        if by_tier_only {
            // Tiers are returned in the order they were requested.
            let mut remaining = tiers.into_iter().map(Some).collect::<Vec<_>>();
            tiers = req
                .tiers
                .iter()
                .filter_map(|name| {
                    let idx = remaining
                        .iter()
                        .position(|t| t.as_ref().is_some_and(|t| t.name == name.as_str()))?;
                    remaining[idx].take()
                })
                .collect();
        }

        let permissions = &req.permissions;
        let mut items = Vec::new();
        for tier in &tiers {
            if !req.tiers.is_empty() && !req.tiers.iter().any(|t| t == tier.name) {
                continue;
            }
            for view in &tier.policies {
                if req.unmatched && !view.data.is_unmatched() {
                    continue;
                }
                // Kubernetes policies outside of the default tier also require access to the
                // tier.
                if view.key.kind == Kind::KubernetesNetworkPolicy
                    && tier.name != DEFAULT_TIER
                    && !permissions.is_authorized(Kind::Tier, None)
                {
                    continue;
                }
                if !permissions.is_authorized(view.key.kind, view.key.namespace()) {
                    continue;
                }
                items.push(policy(view, items.len()));
            }
        }

        if req.sort.is_some() {
            sort_by_fields(&mut items, req.sort.as_ref(), cmp_policy, |a, b| {
                a.index.cmp(&b.index)
            });
        }
        paged(items, req.page.as_ref())
    }

    fn nodes(&self, req: NodesRequest) -> Result<Paged<Node>, QueryError> {
        if let Some(name) = &req.node {
            let data = self
                .state
                .nodes
                .get(name)
                .ok_or_else(|| QueryError::does_not_exist(ResourceKey::global(Kind::Node, name)))?;
            return Ok(Paged {
                count: 1,
                items: vec![node(name, data)],
            });
        }

        let mut items = self
            .state
            .nodes
            .iter()
            .map(|(name, data)| node(name, data))
            .collect::<Vec<_>>();
        sort_by_fields(&mut items, req.sort.as_ref(), cmp_node, |a, b| a.name.cmp(&b.name));
        paged(items, req.page.as_ref())
    }
}

fn empty<T>() -> Paged<T> {
    Paged {
        count: 0,
        items: Vec::new(),
    }
}

/// Builds a matcher for keys containing any of the given names.
fn substring_matcher(names: &[String]) -> Result<regex::Regex, QueryError> {
    let pattern = names
        .iter()
        .map(|n| regex::escape(n))
        .collect::<Vec<_>>()
        .join("|");
    regex::Regex::new(&pattern)
        .map_err(|error| QueryError::InvalidRequest(format!("invalid endpoints list: {error}")))
}

fn endpoint(key: &ResourceKey, data: &EndpointData) -> Endpoint {
    let mut ep = Endpoint {
        kind: key.kind.as_str().to_string(),
        name: key.name.clone(),
        namespace: key.namespace.clone(),
        labels: data.resource.metadata.labels.clone().unwrap_or_default(),
        num_global_network_policies: data.policies.num_global_network_policies,
        num_network_policies: data.policies.num_network_policies,
        ..Default::default()
    };
    match &data.resource.spec {
        Spec::WorkloadEndpoint(wep) => {
            ep.node = wep.node.clone();
            ep.workload = wep.workload.clone();
            ep.orchestrator = wep.orchestrator.clone();
            ep.pod = wep.pod.clone();
            ep.interface_name = wep.interface_name.clone();
            ep.ip_networks = wep.ip_networks.iter().map(ToString::to_string).collect();
        }
        Spec::HostEndpoint(hep) => {
            ep.node = hep.node.clone();
            ep.interface_name = hep.interface_name.clone();
            ep.ip_networks = hep.expected_ips.iter().map(ToString::to_string).collect();
        }
        _ => {}
    }
    ep
}

fn policy(view: &PolicyView<'_>, index: usize) -> Policy {
    let meta = &view.data.resource.metadata;
    Policy {
        uid: meta.uid.clone(),
        index,
        name: view.key.name.clone(),
        namespace: view.key.namespace.clone(),
        kind: view.key.kind.as_str().to_string(),
        tier: view.data.model.tier.clone(),
        annotations: view.data.resource.annotations(),
        num_host_endpoints: view.data.endpoints.num_host_endpoints,
        num_workload_endpoints: view.data.endpoints.num_workload_endpoints,
        ingress_rules: view.ingress.clone(),
        egress_rules: view.egress.clone(),
        order: view.data.model.order,
        creation_time: meta.creation_timestamp.clone(),
    }
}

fn node(name: &str, data: &NodeData) -> Node {
    Node {
        name: name.to_string(),
        addresses: data.addresses(),
        bgp_ip_addresses: data.bgp_ip_addresses(),
        num_host_endpoints: data.endpoints.num_host_endpoints,
        num_workload_endpoints: data.endpoints.num_workload_endpoints,
    }
}

fn cmp_endpoint(field: EndpointSortField, a: &Endpoint, b: &Endpoint) -> Ordering {
    match field {
        EndpointSortField::Name => a.name.cmp(&b.name),
        EndpointSortField::Namespace => a.namespace.cmp(&b.namespace),
        EndpointSortField::Kind => a.kind.cmp(&b.kind),
        EndpointSortField::Node => a.node.cmp(&b.node),
        EndpointSortField::NumGlobalNetworkPolicies => {
            a.num_global_network_policies.cmp(&b.num_global_network_policies)
        }
        EndpointSortField::NumNetworkPolicies => a.num_network_policies.cmp(&b.num_network_policies),
        EndpointSortField::Pod => a.pod.cmp(&b.pod),
    }
}

fn cmp_policy(field: PolicySortField, a: &Policy, b: &Policy) -> Ordering {
    match field {
        PolicySortField::Index => a.index.cmp(&b.index),
        PolicySortField::Name => a.name.cmp(&b.name),
        PolicySortField::Namespace => a.namespace.cmp(&b.namespace),
        PolicySortField::Kind => a.kind.cmp(&b.kind),
        PolicySortField::Tier => a.tier.cmp(&b.tier),
        PolicySortField::NumHostEndpoints => a.num_host_endpoints.cmp(&b.num_host_endpoints),
        PolicySortField::NumWorkloadEndpoints => {
            a.num_workload_endpoints.cmp(&b.num_workload_endpoints)
        }
        PolicySortField::NumEndpoints => (a.num_host_endpoints + a.num_workload_endpoints)
            .cmp(&(b.num_host_endpoints + b.num_workload_endpoints)),
    }
}

fn cmp_node(field: NodeSortField, a: &Node, b: &Node) -> Ordering {
    match field {
        NodeSortField::Name => a.name.cmp(&b.name),
        NodeSortField::NumHostEndpoints => a.num_host_endpoints.cmp(&b.num_host_endpoints),
        NodeSortField::NumWorkloadEndpoints => {
            a.num_workload_endpoints.cmp(&b.num_workload_endpoints)
        }
        NodeSortField::NumEndpoints => (a.num_host_endpoints + a.num_workload_endpoints)
            .cmp(&(b.num_host_endpoints + b.num_workload_endpoints)),
    }
}

/// Sorts by each requested field in turn, then by `tiebreak`. The whole order is inverted when the
/// sort is reversed.
fn sort_by_fields<T, F: Copy>(
    items: &mut [T],
    sort: Option<&Sort<F>>,
    cmp: impl Fn(F, &T, &T) -> Ordering,
    tiebreak: impl Fn(&T, &T) -> Ordering,
) {
    let fields = sort.map(|s| s.fields.as_slice()).unwrap_or_default();
    let reverse = sort.is_some_and(|s| s.reverse);
    items.sort_by(|a, b| {
        let ord = fields
            .iter()
            .fold(Ordering::Equal, |ord, f| ord.then_with(|| cmp(*f, a, b)))
            .then_with(|| tiebreak(a, b));
        if reverse {
            ord.reverse()
        } else {
            ord
        }
    });
}

fn paged<T>(mut items: Vec<T>, page: Option<&Page>) -> Result<Paged<T>, QueryError> {
    let count = items.len();
    if let Some(page) = page {
        let range = page_range(page, count)?;
        items.truncate(range.end);
        items.drain(..range.start);
    }
    Ok(Paged { count, items })
}

/// Returns the slice of `count` results on a page. Pages beyond the last page are empty.
pub(crate) fn page_range(page: &Page, count: usize) -> Result<Range<usize>, QueryError> {
    if page.num_per_page <= 0 {
        return Err(QueryError::InvalidPage(format!(
            "number of results must be >0, requested number: {}",
            page.num_per_page
        )));
    }
    if page.page_num < 0 {
        return Err(QueryError::InvalidPage(format!(
            "page number should be an integer >=0, requested number: {}",
            page.page_num
        )));
    }
    let per_page = usize::try_from(page.num_per_page).unwrap_or(usize::MAX);
    let page_num = usize::try_from(page.page_num).unwrap_or(usize::MAX);
    if count == 0 || page_num > (count - 1) / per_page {
        return Ok(0..0);
    }
    let from = page_num * per_page;
    Ok(from..count.min(from.saturating_add(per_page)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ranges() {
        assert_eq!(page_range(&Page::new(0, 10), 25).unwrap(), 0..10);
        assert_eq!(page_range(&Page::new(2, 10), 25).unwrap(), 20..25);
        assert_eq!(page_range(&Page::new(3, 10), 25).unwrap(), 0..0);
        assert_eq!(page_range(&Page::new(2, 10), 20).unwrap(), 0..0);
        assert_eq!(page_range(&Page::new(0, 10), 0).unwrap(), 0..0);
        assert!(matches!(
            page_range(&Page::new(0, 0), 10),
            Err(QueryError::InvalidPage(_))
        ));
        assert!(matches!(
            page_range(&Page::new(-1, 10), 10),
            Err(QueryError::InvalidPage(_))
        ));
    }

    #[test]
    fn sorts_by_fields_then_tiebreak() {
        let mut items = vec![(1, "b"), (0, "c"), (1, "a")];
        let sort = Sort::by([0usize]);
        let cmp = |_: usize, a: &(i32, &str), b: &(i32, &str)| a.0.cmp(&b.0);
        let tiebreak = |a: &(i32, &str), b: &(i32, &str)| a.1.cmp(b.1);
        sort_by_fields(&mut items, Some(&sort), cmp, tiebreak);
        assert_eq!(items, [(0, "c"), (1, "a"), (1, "b")]);

        sort_by_fields(&mut items, Some(&sort.reversed()), cmp, tiebreak);
        assert_eq!(items, [(1, "b"), (1, "a"), (0, "c")]);
    }

    #[test]
    fn substring_matcher_escapes_names() {
        let re = substring_matcher(&["pod.a".to_string(), "web(".to_string()]).unwrap();
        assert!(re.is_match("WorkloadEndpoint(ns/pod.a-eth0)"));
        assert!(!re.is_match("WorkloadEndpoint(ns/podxa-eth0)"));
        assert!(re.is_match("WorkloadEndpoint(ns/web(-0)"));
    }
}
