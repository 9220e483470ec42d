//! Nodes and the endpoints hosted on each.
//!
//! A node entry exists while its resource is known or any endpoint references it.

use crate::dispatcher::Update;
use ahash::AHashMap as HashMap;
use queryserver_core::{api::EndpointCounts, Kind, Model, Resource, ResourceKey};
use tracing::trace;

#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: HashMap<String, NodeData>,
    /// The node each endpoint was last observed on.
    endpoint_nodes: HashMap<ResourceKey, String>,
}

#[derive(Clone, Debug, Default)]
pub struct NodeData {
    pub resource: Option<Resource>,
    pub endpoints: EndpointCounts,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSummary {
    pub total: usize,
    pub num_no_endpoints: usize,
    pub num_no_workload_endpoints: usize,
    pub num_no_host_endpoints: usize,
}

// === impl NodeCache ===

impl NodeCache {
    pub fn on_update(&mut self, update: &Update<'_>) {
        match update.key.kind {
            Kind::Node => self.on_node_update(update),
            Kind::WorkloadEndpoint | Kind::HostEndpoint => self.on_endpoint_update(update),
            _ => panic!("node cache received update for {}", update.key),
        }
    }

    pub fn get(&self, name: &str) -> Option<&NodeData> {
        self.nodes.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeData)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn summary(&self) -> NodeSummary {
        let mut summary = NodeSummary {
            total: self.nodes.len(),
            ..Default::default()
        };
        for node in self.nodes.values() {
            let EndpointCounts {
                num_workload_endpoints: weps,
                num_host_endpoints: heps,
            } = node.endpoints;
            if weps == 0 {
                summary.num_no_workload_endpoints += 1;
            }
            if heps == 0 {
                summary.num_no_host_endpoints += 1;
            }
            if weps == 0 && heps == 0 {
                summary.num_no_endpoints += 1;
            }
        }
        summary
    }

    fn on_node_update(&mut self, update: &Update<'_>) {
        let name = &update.key.name;
        if update.is_delete() {
            if let Some(node) = self.nodes.get_mut(name) {
                node.resource = None;
            }
            self.release_if_unused(name);
            return;
        }
        let Some((resource, model)) = update.live() else {
            return;
        };
        if !matches!(model, Model::Node) {
            panic!("unexpected model for {}: {model:?}", update.key);
        }
        self.nodes.entry(name.clone()).or_default().resource = Some(resource.clone());
    }

    /// Moves an endpoint between nodes. Both counts are adjusted before returning.
    fn on_endpoint_update(&mut self, update: &Update<'_>) {
        let key = update.key;
        let node = if update.is_delete() {
            None
        } else {
            match update.model {
                Some(Model::Labelled(m)) => m.node.clone().filter(|n| !n.is_empty()),
                Some(m) => panic!("unexpected model for {key}: {m:?}"),
                None => return,
            }
        };

        let previous = match &node {
            Some(node) => self.endpoint_nodes.insert(key.clone(), node.clone()),
            None => self.endpoint_nodes.remove(key),
        };
        if previous == node {
            return;
        }
        trace!(endpoint = %key, ?previous, ?node, "Endpoint moved");

        if let Some(previous) = previous {
            if let Some(data) = self.nodes.get_mut(&previous) {
                data.count(key.kind, |c| *c = c.saturating_sub(1));
            }
            self.release_if_unused(&previous);
        }
        if let Some(node) = node {
            self.nodes
                .entry(node)
                .or_default()
                .count(key.kind, |c| *c += 1);
        }
    }

    fn release_if_unused(&mut self, name: &str) {
        if self.nodes.get(name).is_some_and(|n| {
            n.resource.is_none()
                && n.endpoints.num_host_endpoints == 0
                && n.endpoints.num_workload_endpoints == 0
        }) {
            self.nodes.remove(name);
        }
    }
}

// === impl NodeData ===

impl NodeData {
    fn count(&mut self, kind: Kind, f: impl FnOnce(&mut usize)) {
        match kind {
            Kind::WorkloadEndpoint => f(&mut self.endpoints.num_workload_endpoints),
            Kind::HostEndpoint => f(&mut self.endpoints.num_host_endpoints),
            _ => {}
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        match self.resource.as_ref().map(|r| &r.spec) {
            Some(queryserver_core::Spec::Node(spec)) => spec.addresses.clone(),
            _ => Vec::new(),
        }
    }

    pub fn bgp_ip_addresses(&self) -> Vec<String> {
        match self.resource.as_ref().map(|r| &r.spec) {
            Some(queryserver_core::Spec::Node(spec)) => spec
                .bgp
                .iter()
                .flat_map(|bgp| [bgp.ipv4_address.clone(), bgp.ipv6_address.clone()])
                .flatten()
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queryserver_core::{
        model::LabelledModel,
        resource::{NodeBgpSpec, NodeSpec},
        ObjectMeta, UpdateType,
    };

    fn endpoint(cache: &mut NodeCache, key: &ResourceKey, node: Option<&str>) {
        let model = node.map(|n| {
            Model::Labelled(LabelledModel {
                node: Some(n.to_string()),
                ..Default::default()
            })
        });
        cache.on_update(&Update {
            update_type: if model.is_some() {
                UpdateType::Updated
            } else {
                UpdateType::Deleted
            },
            key,
            resource: None,
            model: model.as_ref(),
        });
    }

    fn node(cache: &mut NodeCache, name: &str, live: bool) {
        let key = ResourceKey::global(Kind::Node, name);
        let resource = Resource::new(
            ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            NodeSpec {
                addresses: vec!["10.0.0.1".to_string()],
                bgp: Some(NodeBgpSpec {
                    ipv4_address: Some("10.0.0.1/24".to_string()),
                    ipv6_address: None,
                }),
            },
        );
        cache.on_update(&Update {
            update_type: if live {
                UpdateType::New
            } else {
                UpdateType::Deleted
            },
            key: &key,
            resource: live.then_some(&resource),
            model: live.then_some(&Model::Node),
        });
    }

    #[test]
    fn endpoint_only_nodes_are_ephemeral() {
        let mut cache = NodeCache::default();
        let wep = ResourceKey::namespaced(Kind::WorkloadEndpoint, "ns", "w");
        endpoint(&mut cache, &wep, Some("n1"));
        assert_eq!(cache.get("n1").unwrap().endpoints.num_workload_endpoints, 1);
        assert!(cache.get("n1").unwrap().resource.is_none());

        endpoint(&mut cache, &wep, None);
        assert!(cache.is_empty());
    }

    #[test]
    fn endpoints_move_between_nodes() {
        let mut cache = NodeCache::default();
        node(&mut cache, "n1", true);
        let hep = ResourceKey::global(Kind::HostEndpoint, "eth0");
        endpoint(&mut cache, &hep, Some("n1"));
        endpoint(&mut cache, &hep, Some("n1"));
        assert_eq!(cache.get("n1").unwrap().endpoints.num_host_endpoints, 1);

        endpoint(&mut cache, &hep, Some("n2"));
        assert_eq!(cache.get("n1").unwrap().endpoints.num_host_endpoints, 0);
        assert_eq!(cache.get("n2").unwrap().endpoints.num_host_endpoints, 1);
        assert_eq!(
            cache.summary(),
            NodeSummary {
                total: 2,
                num_no_endpoints: 1,
                num_no_workload_endpoints: 2,
                num_no_host_endpoints: 1,
            }
        );

        // Deleting a node that still hosts endpoints keeps its entry.
        node(&mut cache, "n2", false);
        endpoint(&mut cache, &hep, Some("n1"));
        assert!(cache.get("n2").is_none());
        node(&mut cache, "n1", false);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reports_addresses() {
        let mut cache = NodeCache::default();
        node(&mut cache, "n1", true);
        let n1 = cache.get("n1").unwrap();
        assert_eq!(n1.addresses(), ["10.0.0.1"]);
        assert_eq!(n1.bgp_ip_addresses(), ["10.0.0.1/24"]);
    }
}
