//! Workload and host endpoints with the number of policies applying to each.

use crate::{dispatcher::Update, label_index::MatchKind};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use queryserver_core::{
    model::LabelledModel,
    resource::{EndpointPhase, Spec},
    Kind, Model, Resource, ResourceKey,
};
use std::collections::BTreeMap;

/// Host endpoints share a single bucket; workload endpoints are bucketed by namespace.
#[derive(Debug, Default)]
pub struct EndpointCache {
    host: EndpointBucket,
    workloads: HashMap<String, EndpointBucket>,
}

#[derive(Clone, Debug)]
pub struct EndpointData {
    pub resource: Resource,
    pub model: LabelledModel,
    pub policies: PolicyCounts,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyCounts {
    pub num_global_network_policies: usize,
    pub num_network_policies: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSummary {
    pub total: usize,
    pub num_unlabelled: usize,
    pub num_unprotected: usize,
    pub num_failed: usize,
}

#[derive(Debug, Default)]
struct EndpointBucket {
    endpoints: HashMap<ResourceKey, EndpointData>,
    unlabelled: HashSet<ResourceKey>,
    unprotected: HashSet<ResourceKey>,
    failed: HashSet<ResourceKey>,
}

// === impl EndpointCache ===

impl EndpointCache {
    pub fn on_update(&mut self, update: &Update<'_>) {
        let key = update.key;
        if update.is_delete() {
            let Some(bucket) = self.bucket_mut(key) else {
                return;
            };
            bucket.remove(key);
            if let Some(ns) = key.namespace() {
                if self.workloads.get(ns).is_some_and(|b| b.endpoints.is_empty()) {
                    self.workloads.remove(ns);
                }
            }
            return;
        }

        let Some((resource, model)) = update.live() else {
            return;
        };
        let Model::Labelled(model) = model else {
            panic!("unexpected model for {key}: {model:?}");
        };
        let bucket = match key.namespace() {
            _ if key.kind == Kind::HostEndpoint => &mut self.host,
            Some(ns) => self.workloads.entry(ns.to_string()).or_default(),
            None => panic!("workload endpoint without a namespace: {key}"),
        };
        bucket.upsert(key, resource, model);
    }

    /// Applies a policy selector match change to an endpoint.
    pub fn policy_endpoint_match(&mut self, kind: MatchKind, policy: &ResourceKey, endpoint: &ResourceKey) {
        let Some(bucket) = self.bucket_mut(endpoint) else {
            return;
        };
        let Some(data) = bucket.endpoints.get_mut(endpoint) else {
            return;
        };
        match policy.namespace() {
            None => kind.apply(&mut data.policies.num_global_network_policies),
            Some(_) => kind.apply(&mut data.policies.num_network_policies),
        }
        if data.policies.is_unprotected() {
            bucket.unprotected.insert(endpoint.clone());
        } else {
            bucket.unprotected.remove(endpoint);
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&EndpointData> {
        self.bucket(key)?.endpoints.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &EndpointData)> {
        std::iter::once(&self.host)
            .chain(self.workloads.values())
            .flat_map(|b| b.endpoints.iter())
    }

    pub fn is_unprotected(&self, key: &ResourceKey) -> bool {
        self.bucket(key)
            .is_some_and(|b| b.unprotected.contains(key))
    }

    pub fn total_host(&self) -> EndpointSummary {
        self.host.summary()
    }

    pub fn total_workload(&self) -> EndpointSummary {
        self.workloads
            .values()
            .map(EndpointBucket::summary)
            .fold(EndpointSummary::default(), |a, b| EndpointSummary {
                total: a.total + b.total,
                num_unlabelled: a.num_unlabelled + b.num_unlabelled,
                num_unprotected: a.num_unprotected + b.num_unprotected,
                num_failed: a.num_failed + b.num_failed,
            })
    }

    pub fn totals_by_namespace(&self) -> BTreeMap<String, EndpointSummary> {
        self.workloads
            .iter()
            .map(|(ns, b)| (ns.clone(), b.summary()))
            .collect()
    }

    fn bucket(&self, key: &ResourceKey) -> Option<&EndpointBucket> {
        match key.kind {
            Kind::HostEndpoint => Some(&self.host),
            Kind::WorkloadEndpoint => self.workloads.get(key.namespace()?),
            _ => panic!("endpoint cache received key {key}"),
        }
    }

    fn bucket_mut(&mut self, key: &ResourceKey) -> Option<&mut EndpointBucket> {
        match key.kind {
            Kind::HostEndpoint => Some(&mut self.host),
            Kind::WorkloadEndpoint => self.workloads.get_mut(key.namespace()?),
            _ => panic!("endpoint cache received key {key}"),
        }
    }
}

// === impl EndpointBucket ===

impl EndpointBucket {
    fn upsert(&mut self, key: &ResourceKey, resource: &Resource, model: &LabelledModel) {
        // Match counts are maintained by match events and survive resource updates.
        let policies = self
            .endpoints
            .get(key)
            .map(|d| d.policies)
            .unwrap_or_default();
        let data = EndpointData {
            resource: resource.clone(),
            model: model.clone(),
            policies,
        };
        set_membership(&mut self.unlabelled, key, resource.is_unlabelled());
        set_membership(&mut self.unprotected, key, policies.is_unprotected());
        set_membership(&mut self.failed, key, data.is_failed());
        self.endpoints.insert(key.clone(), data);
    }

    fn remove(&mut self, key: &ResourceKey) {
        self.endpoints.remove(key);
        self.unlabelled.remove(key);
        self.unprotected.remove(key);
        self.failed.remove(key);
    }

    fn summary(&self) -> EndpointSummary {
        EndpointSummary {
            total: self.endpoints.len(),
            num_unlabelled: self.unlabelled.len(),
            num_unprotected: self.unprotected.len(),
            num_failed: self.failed.len(),
        }
    }
}

// === impl EndpointData ===

impl EndpointData {
    pub fn is_failed(&self) -> bool {
        matches!(
            &self.resource.spec,
            Spec::WorkloadEndpoint(wep) if wep.phase == EndpointPhase::Failed
        )
    }
}

// === impl PolicyCounts ===

impl PolicyCounts {
    pub fn is_unprotected(&self) -> bool {
        self.num_global_network_policies == 0 && self.num_network_policies == 0
    }
}

fn set_membership(set: &mut HashSet<ResourceKey>, key: &ResourceKey, member: bool) {
    if member {
        set.insert(key.clone());
    } else {
        set.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use queryserver_core::{
        resource::{HostEndpointSpec, WorkloadEndpointSpec},
        ObjectMeta, UpdateType,
    };

    fn wep(ns: &str, name: &str, labels: Option<std::collections::BTreeMap<String, String>>, phase: EndpointPhase) -> (ResourceKey, Resource) {
        let key = ResourceKey::namespaced(Kind::WorkloadEndpoint, ns, name);
        let resource = Resource::new(
            ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels,
                ..Default::default()
            },
            WorkloadEndpointSpec {
                node: "node-0".to_string(),
                phase,
                ..Default::default()
            },
        );
        (key, resource)
    }

    fn apply(cache: &mut EndpointCache, update_type: UpdateType, key: &ResourceKey, resource: &Resource) {
        let model = Model::Labelled(LabelledModel {
            labels: resource.labels(),
            profile_ids: vec![],
            node: Some("node-0".to_string()),
        });
        cache.on_update(&Update {
            update_type,
            key,
            resource: Some(resource),
            model: Some(&model),
        });
    }

    #[test]
    fn tracks_derived_sets() {
        let mut cache = EndpointCache::default();
        let (k0, r0) = wep("ns", "w0", None, EndpointPhase::Running);
        let (k1, r1) = wep("ns", "w1", Some(btreemap! { "app".to_string() => "web".to_string() }), EndpointPhase::Failed);
        apply(&mut cache, UpdateType::New, &k0, &r0);
        apply(&mut cache, UpdateType::New, &k1, &r1);

        assert_eq!(
            cache.totals_by_namespace()["ns"],
            EndpointSummary {
                total: 2,
                num_unlabelled: 1,
                num_unprotected: 2,
                num_failed: 1,
            }
        );

        let gnp = ResourceKey::global(Kind::GlobalNetworkPolicy, "p");
        let np = ResourceKey::namespaced(Kind::NetworkPolicy, "ns", "p");
        cache.policy_endpoint_match(MatchKind::Started, &gnp, &k0);
        cache.policy_endpoint_match(MatchKind::Started, &np, &k0);
        assert_eq!(
            cache.get(&k0).unwrap().policies,
            PolicyCounts {
                num_global_network_policies: 1,
                num_network_policies: 1,
            }
        );
        assert!(!cache.is_unprotected(&k0));

        // Updating the resource keeps the counts.
        let (_, r0) = wep("ns", "w0", Some(btreemap! { "app".to_string() => "db".to_string() }), EndpointPhase::Running);
        apply(&mut cache, UpdateType::Updated, &k0, &r0);
        assert_eq!(cache.total_workload().num_unprotected, 1);
        assert_eq!(cache.total_workload().num_unlabelled, 0);

        cache.policy_endpoint_match(MatchKind::Stopped, &gnp, &k0);
        cache.policy_endpoint_match(MatchKind::Stopped, &np, &k0);
        assert!(cache.is_unprotected(&k0));
    }

    #[test]
    fn empty_namespaces_are_removed() {
        let mut cache = EndpointCache::default();
        let (key, resource) = wep("ns", "w0", None, EndpointPhase::Running);
        apply(&mut cache, UpdateType::New, &key, &resource);
        cache.on_update(&Update {
            update_type: UpdateType::Deleted,
            key: &key,
            resource: None,
            model: None,
        });
        assert!(cache.totals_by_namespace().is_empty());
        assert_eq!(cache.iter().count(), 0);
    }

    #[test]
    fn host_endpoints_share_a_bucket() {
        let mut cache = EndpointCache::default();
        let key = ResourceKey::global(Kind::HostEndpoint, "eth0");
        let resource = Resource::new(
            ObjectMeta {
                name: Some("eth0".to_string()),
                ..Default::default()
            },
            HostEndpointSpec {
                node: "node-0".to_string(),
                ..Default::default()
            },
        );
        apply(&mut cache, UpdateType::New, &key, &resource);
        assert_eq!(
            cache.total_host(),
            EndpointSummary {
                total: 1,
                num_unlabelled: 1,
                num_unprotected: 1,
                num_failed: 0,
            }
        );
        assert_eq!(cache.total_workload(), EndpointSummary::default());
    }
}
