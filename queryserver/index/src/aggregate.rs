//! Enumerates the label keys and values in use, by resource category.
//!
//! Every label value is reference counted by the resources carrying it, so that updates and
//! deletes retract values no longer observed.

use crate::dispatcher::Update;
use ahash::AHashMap as HashMap;
use queryserver_core::{
    api::{LabelResource, LabelsRequest, LabelsResponse},
    model::{
        CALICO_LABEL_PREFIX, NAMESPACE_LABEL_PREFIX, NAMESPACE_PROFILE_PREFIX,
        SERVICE_ACCOUNT_LABEL_PREFIX, SERVICE_ACCOUNT_PROFILE_PREFIX,
    },
    Kind, Resource, ResourceKey, Spec,
};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct LabelAggregator {
    values: HashMap<(LabelResource, Kind), Values>,
    contributions: HashMap<ResourceKey, Contribution>,
}

/// Label key to value to reference count.
type Values = HashMap<String, HashMap<String, usize>>;

#[derive(Debug)]
struct Contribution {
    resource: LabelResource,
    labels: BTreeMap<String, String>,
}

// === impl LabelAggregator ===

impl LabelAggregator {
    pub fn on_update(&mut self, update: &Update<'_>) {
        let key = update.key;
        let contribution = match update.live() {
            Some((resource, _)) => contribution(key, resource),
            None if update.is_delete() => None,
            // Filtered updates leave the previous contribution in place.
            None => return,
        };

        if let Some(previous) = self.contributions.remove(key) {
            self.retract(key.kind, previous);
        }
        if let Some(contribution) = contribution.filter(|c| !c.labels.is_empty()) {
            let values = self
                .values
                .entry((contribution.resource, key.kind))
                .or_default();
            for (k, v) in &contribution.labels {
                *values
                    .entry(k.clone())
                    .or_default()
                    .entry(v.clone())
                    .or_default() += 1;
            }
            self.contributions.insert(key.clone(), contribution);
        }
    }

    /// Returns the label keys and values of a category, restricted to the kinds the caller may
    /// list.
    pub fn labels(&self, req: &LabelsRequest) -> LabelsResponse {
        let mut labels = BTreeMap::<String, std::collections::BTreeSet<String>>::new();
        for kind in req.resource.kinds() {
            if !req.permissions.can_list(*kind) {
                continue;
            }
            let Some(values) = self.values.get(&(req.resource, *kind)) else {
                continue;
            };
            for (k, vs) in values {
                labels
                    .entry(k.clone())
                    .or_default()
                    .extend(vs.keys().cloned());
            }
        }
        LabelsResponse { labels }
    }

    fn retract(&mut self, kind: Kind, contribution: Contribution) {
        let category = (contribution.resource, kind);
        let Some(values) = self.values.get_mut(&category) else {
            return;
        };
        for (k, v) in contribution.labels {
            let Some(counts) = values.get_mut(&k) else {
                continue;
            };
            if let Some(n) = counts.get_mut(&v) {
                *n -= 1;
                if *n == 0 {
                    counts.remove(&v);
                }
            }
            if counts.is_empty() {
                values.remove(&k);
            }
        }
        if values.is_empty() {
            self.values.remove(&category);
        }
    }
}

fn contribution(key: &ResourceKey, resource: &Resource) -> Option<Contribution> {
    let metadata = || resource.metadata.labels.clone().unwrap_or_default();
    let (category, labels) = match key.kind {
        Kind::WorkloadEndpoint => {
            let mut labels = metadata();
            labels.retain(|k, _| !k.starts_with(CALICO_LABEL_PREFIX));
            (LabelResource::Pods, labels)
        }
        Kind::Profile => {
            let Spec::Profile(profile) = &resource.spec else {
                return None;
            };
            let (category, prefix) = if key.name.starts_with(NAMESPACE_PROFILE_PREFIX) {
                (LabelResource::Namespaces, NAMESPACE_LABEL_PREFIX)
            } else if key.name.starts_with(SERVICE_ACCOUNT_PROFILE_PREFIX) {
                (LabelResource::ServiceAccounts, SERVICE_ACCOUNT_LABEL_PREFIX)
            } else {
                return None;
            };
            let labels = profile
                .labels_to_apply
                .iter()
                .filter_map(|(k, v)| Some((k.strip_prefix(prefix)?.to_string(), v.clone())))
                .collect();
            (category, labels)
        }
        kind if kind.is_policy() => (LabelResource::Policies, metadata()),
        Kind::GlobalNetworkSet | Kind::NetworkSet => (LabelResource::NetworkSets, metadata()),
        Kind::ManagedCluster => (LabelResource::ManagedClusters, metadata()),
        Kind::GlobalThreatFeed => (LabelResource::ThreatFeeds, metadata()),
        _ => return None,
    };
    Some(Contribution {
        resource: category,
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, btreeset};
    use queryserver_core::{
        api::{Permissions, Scope},
        resource::{ProfileSpec, WorkloadEndpointSpec},
        Model, ObjectMeta, UpdateType,
    };

    fn apply(agg: &mut LabelAggregator, update_type: UpdateType, key: &ResourceKey, resource: Option<Resource>) {
        // The aggregator only inspects the raw resource.
        let model = Model::Node;
        agg.on_update(&Update {
            update_type,
            key,
            resource: resource.as_ref(),
            model: resource.as_ref().map(|_| &model),
        });
    }

    fn pod(labels: BTreeMap<String, String>) -> Resource {
        Resource::new(
            ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            },
            WorkloadEndpointSpec::default(),
        )
    }

    fn request(resource: LabelResource) -> LabelsRequest {
        LabelsRequest {
            resource,
            permissions: Permissions::all(),
        }
    }

    #[test]
    fn values_are_reference_counted() {
        let mut agg = LabelAggregator::default();
        let a = ResourceKey::namespaced(Kind::WorkloadEndpoint, "ns", "a");
        let b = ResourceKey::namespaced(Kind::WorkloadEndpoint, "ns", "b");
        apply(&mut agg, UpdateType::New, &a, Some(pod(btreemap! {
            "app".to_string() => "web".to_string(),
            "projectcalico.org/namespace".to_string() => "ns".to_string(),
        })));
        apply(&mut agg, UpdateType::New, &b, Some(pod(btreemap! {
            "app".to_string() => "web".to_string(),
        })));
        assert_eq!(
            agg.labels(&request(LabelResource::Pods)).labels,
            btreemap! { "app".to_string() => btreeset! { "web".to_string() } }
        );

        apply(&mut agg, UpdateType::Updated, &a, Some(pod(btreemap! {
            "app".to_string() => "db".to_string(),
        })));
        assert_eq!(
            agg.labels(&request(LabelResource::Pods)).labels,
            btreemap! { "app".to_string() => btreeset! { "db".to_string(), "web".to_string() } }
        );

        apply(&mut agg, UpdateType::Deleted, &b, None);
        apply(&mut agg, UpdateType::Deleted, &a, None);
        assert!(agg.labels(&request(LabelResource::Pods)).labels.is_empty());
        assert!(agg.values.is_empty());
    }

    #[test]
    fn profiles_are_split_by_prefix() {
        let mut agg = LabelAggregator::default();
        let profile = |labels: BTreeMap<String, String>| {
            Some(Resource::new(
                ObjectMeta::default(),
                ProfileSpec {
                    labels_to_apply: labels,
                },
            ))
        };
        apply(
            &mut agg,
            UpdateType::New,
            &ResourceKey::global(Kind::Profile, "kns.prod"),
            profile(btreemap! {
                "pcns.env".to_string() => "prod".to_string(),
                "pcns.projectcalico.org/name".to_string() => "prod".to_string(),
            }),
        );
        apply(
            &mut agg,
            UpdateType::New,
            &ResourceKey::global(Kind::Profile, "ksa.prod.default"),
            profile(btreemap! { "pcsa.team".to_string() => "a".to_string() }),
        );

        let namespaces = agg.labels(&request(LabelResource::Namespaces)).labels;
        assert_eq!(
            namespaces.keys().collect::<Vec<_>>(),
            ["env", "projectcalico.org/name"]
        );
        assert_eq!(
            agg.labels(&request(LabelResource::ServiceAccounts)).labels,
            btreemap! { "team".to_string() => btreeset! { "a".to_string() } }
        );
    }

    #[test]
    fn unauthorized_kinds_are_omitted() {
        let mut agg = LabelAggregator::default();
        let meta = |name: &str| ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(btreemap! { "owner".to_string() => name.to_string() }),
            ..Default::default()
        };
        let policy = |name: &str| Some(Resource::new(meta(name), queryserver_core::resource::PolicySpec::default()));
        apply(&mut agg, UpdateType::New, &ResourceKey::global(Kind::GlobalNetworkPolicy, "g"), policy("g"));
        apply(&mut agg, UpdateType::New, &ResourceKey::namespaced(Kind::NetworkPolicy, "ns", "n"), policy("n"));

        let req = LabelsRequest {
            resource: LabelResource::Policies,
            permissions: Permissions::none().grant(
                Kind::NetworkPolicy,
                Scope::Namespaces(btreeset! { "ns".to_string() }),
            ),
        };
        assert_eq!(
            agg.labels(&req).labels,
            btreemap! { "owner".to_string() => btreeset! { "n".to_string() } }
        );
    }
}
