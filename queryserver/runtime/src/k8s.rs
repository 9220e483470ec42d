//! Translates Kubernetes resources into resource updates for the query server.
//!
//! Pods become workload endpoints, namespaces and service accounts become the profiles endpoints
//! inherit labels from, and Kubernetes network policies are indexed in the default tier.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{bail, Result};
use k8s_openapi::{
    api::{
        core::v1::{Namespace, Node, Pod, ServiceAccount},
        networking::v1::{NetworkPolicy, NetworkPolicyPeer},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::ResourceExt;
use parking_lot::RwLock;
use queryserver_core::{
    model::{self, DEFAULT_TIER, NAME_LABEL},
    resource::{
        EndpointPhase, EntityRule, NodeSpec, PolicySpec, ProfileSpec, Rule, WorkloadEndpointSpec,
    },
    Kind, ObjectMeta, Resource, ResourceKey, ResourceUpdate,
};
use queryserver_index::QueryServer;
use std::{net::IpAddr, sync::Arc};
use tracing::{debug, info_span, warn};

/// Kubernetes network policies are ordered after most tiered policies in the default tier.
const KUBERNETES_POLICY_ORDER: f64 = 1000.0;

const KUBERNETES_POLICY_PREFIX: &str = "knp.default.";

pub type SharedIndex = Arc<RwLock<Index>>;

/// Forwards watched resources to the query server as updates.
///
/// Tracks the keys it has submitted so that each update is reported as new or updated and deletes
/// are only submitted for resources the server knows about.
pub struct Index {
    server: QueryServer,
    known: HashSet<ResourceKey>,
    /// Workload endpoint keys by pod namespace and name, since an endpoint's name depends on the
    /// node its pod is scheduled on.
    pods: HashMap<(String, String), ResourceKey>,
}

// === impl Index ===

impl Index {
    pub fn shared(server: QueryServer) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            server,
            known: HashSet::default(),
            pods: HashMap::default(),
        }))
    }

    fn upsert(&mut self, key: ResourceKey, resource: Resource) {
        let update = if self.known.insert(key.clone()) {
            ResourceUpdate::new(key, resource)
        } else {
            ResourceUpdate::updated(key, resource)
        };
        self.submit(update);
    }

    fn remove(&mut self, key: ResourceKey) {
        if self.known.remove(&key) {
            self.submit(ResourceUpdate::deleted(key));
        }
    }

    fn submit(&self, update: ResourceUpdate) {
        debug!(key = %update.key, update = %update.update_type, "Submitting");
        if let Err(error) = self.server.on_updates(vec![update]) {
            warn!(%error, "Failed to submit update");
        }
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for Index {
    fn apply(&mut self, pod: Pod) {
        let Some(ns) = pod.namespace() else { return };
        let name = pod.name_unchecked();
        let _span = info_span!("apply", %ns, %name).entered();

        let endpoint = workload_endpoint(&pod);
        let id = (ns, name);
        let prior = match &endpoint {
            Some((key, _)) => self.pods.insert(id, key.clone()).filter(|k| k != key),
            None => self.pods.remove(&id),
        };
        if let Some(prior) = prior {
            self.remove(prior);
        }
        if let Some((key, resource)) = endpoint {
            self.upsert(key, resource);
        }
    }

    fn delete(&mut self, ns: String, name: String) {
        let _span = info_span!("delete", %ns, %name).entered();
        if let Some(key) = self.pods.remove(&(ns, name)) {
            self.remove(key);
        }
    }
}

impl kubert::index::IndexNamespacedResource<ServiceAccount> for Index {
    fn apply(&mut self, sa: ServiceAccount) {
        let Some(ns) = sa.namespace() else { return };
        let name = sa.name_unchecked();
        let profile = model::service_account_profile(&ns, &name);
        let resource = profile_resource(
            &profile,
            &sa.metadata,
            model::SERVICE_ACCOUNT_LABEL_PREFIX,
            &name,
        );
        self.upsert(ResourceKey::global(Kind::Profile, profile), resource);
    }

    fn delete(&mut self, ns: String, name: String) {
        let profile = model::service_account_profile(&ns, &name);
        self.remove(ResourceKey::global(Kind::Profile, profile));
    }
}

impl kubert::index::IndexNamespacedResource<NetworkPolicy> for Index {
    fn apply(&mut self, np: NetworkPolicy) {
        let Some(ns) = np.namespace() else { return };
        let name = np.name_unchecked();
        let key = kubernetes_policy_key(&ns, &name);
        match kubernetes_policy(&np) {
            Ok(spec) => self.upsert(key, Resource::new(np.metadata, spec)),
            Err(error) => {
                warn!(%ns, %name, %error, "Ignoring NetworkPolicy");
                self.remove(key);
            }
        }
    }

    fn delete(&mut self, ns: String, name: String) {
        self.remove(kubernetes_policy_key(&ns, &name));
    }
}

impl kubert::index::IndexClusterResource<Namespace> for Index {
    fn apply(&mut self, ns: Namespace) {
        let name = ns.name_unchecked();
        let profile = model::namespace_profile(&name);
        let resource = profile_resource(
            &profile,
            &ns.metadata,
            model::NAMESPACE_LABEL_PREFIX,
            &name,
        );
        self.upsert(ResourceKey::global(Kind::Profile, profile), resource);
    }

    fn delete(&mut self, name: String) {
        let profile = model::namespace_profile(&name);
        self.remove(ResourceKey::global(Kind::Profile, profile));
    }
}

impl kubert::index::IndexClusterResource<Node> for Index {
    fn apply(&mut self, node: Node) {
        let name = node.name_unchecked();
        let addresses = node
            .status
            .iter()
            .flat_map(|s| s.addresses.iter().flatten())
            .filter(|a| a.type_ == "InternalIP" || a.type_ == "ExternalIP")
            .map(|a| a.address.clone())
            .collect();
        let resource = Resource::new(
            node.metadata,
            NodeSpec {
                addresses,
                bgp: None,
            },
        );
        self.upsert(ResourceKey::global(Kind::Node, name), resource);
    }

    fn delete(&mut self, name: String) {
        self.remove(ResourceKey::global(Kind::Node, name));
    }
}

/// Builds the workload endpoint for a pod. Pods that have not been scheduled or that use the host
/// network have no endpoint.
fn workload_endpoint(pod: &Pod) -> Option<(ResourceKey, Resource)> {
    let ns = pod.namespace()?;
    let name = pod.name_unchecked();
    let spec = pod.spec.as_ref()?;
    if spec.host_network == Some(true) {
        return None;
    }
    let node = spec.node_name.clone().filter(|n| !n.is_empty())?;

    let status = pod.status.as_ref();
    let phase = match status.and_then(|s| s.phase.as_deref()) {
        Some("Pending") => EndpointPhase::Pending,
        Some("Running") => EndpointPhase::Running,
        Some("Succeeded") => EndpointPhase::Succeeded,
        Some("Failed") => EndpointPhase::Failed,
        _ => EndpointPhase::Unknown,
    };
    let ip_networks = status
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| match ip.parse::<IpAddr>() {
            Ok(ip) => Some(ipnet::IpNet::from(ip)),
            Err(error) => {
                warn!(%ip, %error, "Invalid pod IP");
                None
            }
        })
        .into_iter()
        .collect();

    let service_account_name = spec.service_account_name.clone().filter(|sa| !sa.is_empty());
    let mut profiles = vec![model::namespace_profile(&ns)];
    if let Some(sa) = &service_account_name {
        profiles.push(model::service_account_profile(&ns, sa));
    }

    let endpoint = "eth0";
    let key = ResourceKey::namespaced(
        Kind::WorkloadEndpoint,
        ns.clone(),
        format!(
            "{}-k8s-{}-{endpoint}",
            escape_name(&node),
            escape_name(&name)
        ),
    );
    let metadata = ObjectMeta {
        name: Some(key.name.clone()),
        namespace: Some(ns),
        uid: pod.metadata.uid.clone(),
        labels: pod.metadata.labels.clone(),
        creation_timestamp: pod.metadata.creation_timestamp.clone(),
        ..Default::default()
    };
    let spec = WorkloadEndpointSpec {
        orchestrator: "k8s".to_string(),
        workload: String::new(),
        node,
        pod: name,
        endpoint: endpoint.to_string(),
        interface_name: String::new(),
        ip_networks,
        profiles,
        service_account_name,
        phase,
    };
    Some((key, Resource::new(metadata, spec)))
}

/// Dashes separate the fields of an endpoint name, so dashes within a field are doubled.
fn escape_name(name: &str) -> String {
    name.replace('-', "--")
}

/// Builds the profile through which a namespace's or service account's labels are inherited.
fn profile_resource(profile: &str, meta: &ObjectMeta, prefix: &str, name: &str) -> Resource {
    let labels_to_apply = meta
        .labels
        .iter()
        .flatten()
        .map(|(k, v)| (format!("{prefix}{k}"), v.clone()))
        .chain(Some((format!("{prefix}{NAME_LABEL}"), name.to_string())))
        .collect();
    let metadata = ObjectMeta {
        name: Some(profile.to_string()),
        uid: meta.uid.clone(),
        creation_timestamp: meta.creation_timestamp.clone(),
        ..Default::default()
    };
    Resource::new(metadata, ProfileSpec { labels_to_apply })
}

fn kubernetes_policy_key(ns: &str, name: &str) -> ResourceKey {
    ResourceKey::namespaced(
        Kind::KubernetesNetworkPolicy,
        ns,
        format!("{KUBERNETES_POLICY_PREFIX}{name}"),
    )
}

fn kubernetes_policy(np: &NetworkPolicy) -> Result<PolicySpec> {
    let Some(spec) = np.spec.as_ref() else {
        bail!("missing spec");
    };
    // Optional in recent API versions.
    let pod_selector: Option<LabelSelector> = spec.pod_selector.clone().into();

    let mut ingress = Vec::new();
    for rule in spec.ingress.iter().flatten() {
        for source in peers(rule.from.as_deref())? {
            ingress.push(Rule {
                source,
                ..Default::default()
            });
        }
    }
    let mut egress = Vec::new();
    for rule in spec.egress.iter().flatten() {
        for destination in peers(rule.to.as_deref())? {
            egress.push(Rule {
                destination,
                ..Default::default()
            });
        }
    }

    Ok(PolicySpec {
        tier: Some(DEFAULT_TIER.to_string()),
        order: Some(KUBERNETES_POLICY_ORDER),
        selector: match &pod_selector {
            Some(sel) => label_selector(sel)?,
            None => String::new(),
        },
        ingress,
        egress,
        ..Default::default()
    })
}

/// Each peer of a rule becomes a separate rule. A rule without peers matches any peer.
fn peers(peers: Option<&[NetworkPolicyPeer]>) -> Result<Vec<EntityRule>> {
    let peers = peers.unwrap_or_default();
    if peers.is_empty() {
        return Ok(vec![EntityRule::default()]);
    }

    let mut rules = Vec::with_capacity(peers.len());
    for peer in peers {
        let mut rule = EntityRule::default();
        if let Some(sel) = &peer.pod_selector {
            rule.selector = label_selector(sel)?;
        }
        if let Some(sel) = &peer.namespace_selector {
            rule.namespace_selector = label_selector(sel)?;
        }
        if let Some(block) = &peer.ip_block {
            rule.nets.push(block.cidr.parse()?);
        }
        rules.push(rule);
    }
    Ok(rules)
}

/// Renders a Kubernetes label selector as a selector expression.
fn label_selector(sel: &LabelSelector) -> Result<String> {
    let quoted = |values: &Option<Vec<String>>| {
        values
            .iter()
            .flatten()
            .map(|v| format!("'{v}'"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut clauses = sel
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k} == '{v}'"))
        .collect::<Vec<_>>();
    for expr in sel.match_expressions.iter().flatten() {
        let key = &expr.key;
        clauses.push(match expr.operator.as_str() {
            "In" => format!("{key} in {{{}}}", quoted(&expr.values)),
            "NotIn" => format!("{key} not in {{{}}}", quoted(&expr.values)),
            "Exists" => format!("has({key})"),
            "DoesNotExist" => format!("!has({key})"),
            op => bail!("unsupported label selector operator: {op}"),
        });
    }

    if clauses.is_empty() {
        return Ok("all()".to_string());
    }
    Ok(clauses.join(" && "))
}
