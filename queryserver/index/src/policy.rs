//! Policies and tiers, with per-policy and per-rule endpoint match counts.
//!
//! Rule selectors are consolidated by their effective selector string: each distinct string is
//! registered with the label index once, while any rule references it, and its endpoint counts are
//! shared by every rule using it.

use crate::{
    dispatcher::Update,
    label_index::{EntityId, LabelIndex, MatchKind, SelectorId},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use queryserver_core::{
    api::{EndpointCounts, RuleCounts},
    model::{PolicyModel, RuleModel},
    Kind, Model, Resource, ResourceKey, Selector,
};
use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct PolicyCache {
    global: PolicyBucket,
    namespaced: HashMap<String, PolicyBucket>,
    tiers: HashMap<String, TierData>,
    rule_selectors: HashMap<Arc<str>, RuleSelector>,

    /// Tiers and their policies in evaluation order, computed on demand.
    ordered: Option<Vec<OrderedTier>>,
}

#[derive(Clone, Debug)]
pub struct PolicyData {
    pub resource: Resource,
    pub model: PolicyModel,
    pub endpoints: EndpointCounts,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicySummary {
    pub total: usize,
    pub num_unmatched: usize,
}

#[derive(Debug)]
pub struct TierView<'c> {
    pub name: &'c str,
    pub resource: Option<&'c Resource>,
    pub policies: Vec<PolicyView<'c>>,
}

#[derive(Debug)]
pub struct PolicyView<'c> {
    pub key: &'c ResourceKey,
    pub data: &'c PolicyData,
    pub ingress: Vec<RuleCounts>,
    pub egress: Vec<RuleCounts>,
}

#[derive(Debug, Default)]
struct PolicyBucket {
    policies: HashMap<ResourceKey, PolicyData>,
    unmatched: HashSet<ResourceKey>,
}

#[derive(Debug)]
struct TierData {
    resource: Resource,
    order: Option<f64>,
}

#[derive(Debug, Default)]
struct RuleSelector {
    /// The number of rule clauses using this selector.
    refs: usize,
    policies: HashSet<ResourceKey>,
    endpoints: EndpointCounts,
}

#[derive(Debug)]
struct OrderedTier {
    name: String,
    policies: Vec<ResourceKey>,
}

// === impl PolicyCache ===

impl PolicyCache {
    pub fn on_update(&mut self, update: &Update<'_>, labels: &mut LabelIndex) {
        match update.key.kind {
            Kind::Tier => self.on_tier_update(update),
            kind if kind.is_policy() => self.on_policy_update(update, labels),
            _ => panic!("policy cache received update for {}", update.key),
        }
    }

    pub fn total_global(&self) -> PolicySummary {
        self.global.summary()
    }

    pub fn totals_by_namespace(&self) -> BTreeMap<String, PolicySummary> {
        self.namespaced
            .iter()
            .map(|(ns, bucket)| (ns.clone(), bucket.summary()))
            .collect()
    }

    pub fn get_policy(&self, key: &ResourceKey) -> Option<PolicyView<'_>> {
        let (key, data) = self.bucket(key)?.policies.get_key_value(key)?;
        Some(self.view(key, data))
    }

    pub fn is_unmatched(&self, key: &ResourceKey) -> bool {
        self.bucket(key)
            .is_some_and(|b| b.unmatched.contains(key))
    }

    /// Returns the policies that have a rule using the given effective selector.
    pub fn policies_by_rule_selector(&self, selector: &str) -> impl Iterator<Item = &ResourceKey> {
        self.rule_selectors
            .get(selector)
            .into_iter()
            .flat_map(|rs| rs.policies.iter())
    }

    /// The number of rule clauses referencing a selector.
    pub fn rule_selector_refs(&self, selector: &str) -> usize {
        self.rule_selectors.get(selector).map_or(0, |rs| rs.refs)
    }

    /// Returns tiers in order, each with its policies in order.
    ///
    /// When `keys` is provided only those policies are returned and tiers left without policies
    /// are omitted.
    pub fn ordered_policies(&mut self, keys: Option<&HashSet<ResourceKey>>) -> Vec<TierView<'_>> {
        if self.ordered.is_none() {
            self.ordered = Some(self.compute_order());
        }
        let this: &Self = self;
        let ordered = this.ordered.as_deref().unwrap_or_default();

        let mut tiers = Vec::with_capacity(ordered.len());
        for tier in ordered {
            let policies = tier
                .policies
                .iter()
                .filter(|k| keys.is_none_or(|keys| keys.contains(*k)))
                .filter_map(|k| this.get_policy(k))
                .collect::<Vec<_>>();
            if keys.is_some() && policies.is_empty() {
                continue;
            }
            tiers.push(TierView {
                name: &tier.name,
                resource: this.tiers.get(&tier.name).map(|t| &t.resource),
                policies,
            });
        }
        tiers
    }

    /// Applies a policy selector match change.
    pub fn policy_endpoint_match(&mut self, kind: MatchKind, policy: &ResourceKey, endpoint: &ResourceKey) {
        // A policy that was deleted before its selector was unregistered is ignored.
        let Some(bucket) = self.bucket_mut(policy) else {
            return;
        };
        let Some(data) = bucket.policies.get_mut(policy) else {
            return;
        };
        count_endpoint(&mut data.endpoints, kind, endpoint);
        if data.is_unmatched() {
            bucket.unmatched.insert(policy.clone());
        } else {
            bucket.unmatched.remove(policy);
        }
    }

    /// Applies a rule selector match change.
    pub fn rule_endpoint_match(&mut self, kind: MatchKind, selector: &str, entity: &EntityId) {
        // The selector may have been released by a policy update in the same batch.
        let Some(rs) = self.rule_selectors.get_mut(selector) else {
            return;
        };
        if let Some(key) = entity.resource().filter(|k| k.kind.is_endpoint()) {
            count_endpoint(&mut rs.endpoints, kind, key);
        }
    }

    fn on_tier_update(&mut self, update: &Update<'_>) {
        let name = &update.key.name;
        if update.is_delete() {
            if self.tiers.remove(name).is_some() {
                self.ordered = None;
            }
            return;
        }
        let Some((resource, model)) = update.live() else {
            return;
        };
        let Model::Tier(tier) = model else {
            panic!("unexpected model for {}: {model:?}", update.key);
        };
        let previous = self.tiers.insert(
            name.clone(),
            TierData {
                resource: resource.clone(),
                order: tier.order,
            },
        );
        if previous.is_none_or(|p| p.order != tier.order) {
            self.ordered = None;
        }
    }

    fn on_policy_update(&mut self, update: &Update<'_>, labels: &mut LabelIndex) {
        let key = update.key;

        if update.is_delete() {
            let Some(bucket) = self.bucket_mut(key) else {
                return;
            };
            // Staged deletions are filtered on add, so the policy may be unknown.
            let Some(existing) = bucket.policies.remove(key) else {
                return;
            };
            bucket.unmatched.remove(key);
            self.remove_rule_selector_references(key, &existing.model);
            self.release_rule_selectors(&existing.model, labels);
            self.ordered = None;
            if let Some(ns) = key.namespace() {
                if self.namespaced.get(ns).is_some_and(|b| b.policies.is_empty()) {
                    self.namespaced.remove(ns);
                }
            }
            return;
        }

        let Some((resource, model)) = update.live() else {
            return;
        };
        let Model::Policy(model) = model else {
            panic!("unexpected model for {key}: {model:?}");
        };

        let bucket = match key.namespace() {
            Some(ns) => self.namespaced.entry(ns.to_string()).or_default(),
            None => &mut self.global,
        };
        match bucket.policies.get_mut(key) {
            Some(existing) => {
                existing.resource = resource.clone();
                let previous = std::mem::replace(&mut existing.model, model.clone());
                if previous.tier != model.tier || previous.order != model.order {
                    self.ordered = None;
                }
                // Acquire the new selectors before releasing the old ones so that a selector still
                // in use is never transiently unregistered.
                self.remove_rule_selector_references(key, &previous);
                self.acquire_rule_selectors(key, model, labels);
                self.release_rule_selectors(&previous, labels);
            }
            None => {
                bucket.policies.insert(
                    key.clone(),
                    PolicyData {
                        resource: resource.clone(),
                        model: model.clone(),
                        endpoints: EndpointCounts::default(),
                    },
                );
                bucket.unmatched.insert(key.clone());
                self.acquire_rule_selectors(key, model, labels);
                self.ordered = None;
            }
        }
    }

    fn acquire_rule_selectors(&mut self, key: &ResourceKey, model: &PolicyModel, labels: &mut LabelIndex) {
        let mut added = Vec::new();
        for selector in rule_selectors(model) {
            let id = match self.rule_selectors.get_key_value(selector.as_str()) {
                Some((id, _)) => id.clone(),
                None => Arc::from(selector.as_str()),
            };
            let rs = self.rule_selectors.entry(id.clone()).or_default();
            rs.refs += 1;
            rs.policies.insert(key.clone());
            if rs.refs == 1 {
                added.push(id);
            }
        }

        for selector in added {
            match selector.parse::<Selector>() {
                Ok(parsed) => {
                    debug!(%selector, "Registering rule selector");
                    let events = labels.register_selector(SelectorId::Rule(selector.clone()), parsed);
                    for event in events {
                        self.rule_endpoint_match(event.kind, &selector, &event.entity);
                    }
                }
                Err(error) => {
                    warn!(policy = %key, %selector, %error, "Invalid rule selector; its endpoints will not be counted");
                }
            }
        }
    }

    fn release_rule_selectors(&mut self, model: &PolicyModel, labels: &mut LabelIndex) {
        for selector in rule_selectors(model) {
            let Some((id, _)) = self.rule_selectors.get_key_value(selector.as_str()) else {
                continue;
            };
            let id = id.clone();
            let Some(rs) = self.rule_selectors.get_mut(&id) else {
                continue;
            };
            rs.refs -= 1;
            if rs.refs == 0 {
                self.rule_selectors.remove(&id);
                debug!(%selector, "Unregistering rule selector");
                labels.unregister_selector(&SelectorId::Rule(id));
            }
        }
    }

    fn remove_rule_selector_references(&mut self, key: &ResourceKey, model: &PolicyModel) {
        for selector in rule_selectors(model) {
            if let Some(rs) = self.rule_selectors.get_mut(selector.as_str()) {
                rs.policies.remove(key);
            }
        }
    }

    fn view<'c>(&'c self, key: &'c ResourceKey, data: &'c PolicyData) -> PolicyView<'c> {
        let counts = |s: String| -> EndpointCounts {
            if s.is_empty() {
                return EndpointCounts::default();
            }
            self.rule_selectors
                .get(s.as_str())
                .map(|rs| rs.endpoints)
                .unwrap_or_default()
        };
        let rule = |r: &RuleModel| RuleCounts {
            source: counts(combine(&r.src_selector, &r.not_src_selector)),
            destination: counts(combine(&r.dst_selector, &r.not_dst_selector)),
        };
        PolicyView {
            key,
            data,
            ingress: data.model.inbound_rules.iter().map(&rule).collect(),
            egress: data.model.outbound_rules.iter().map(&rule).collect(),
        }
    }

    fn compute_order(&self) -> Vec<OrderedTier> {
        let mut tiers = HashMap::<&str, (Option<f64>, Vec<(&ResourceKey, &PolicyData)>)>::default();
        for (name, tier) in &self.tiers {
            tiers.entry(name.as_str()).or_default().0 = tier.order;
        }
        // Tiers that are referenced by policies but have no resource are still ordered (last).
        for bucket in std::iter::once(&self.global).chain(self.namespaced.values()) {
            for (key, data) in &bucket.policies {
                tiers
                    .entry(data.model.tier.as_str())
                    .or_default()
                    .1
                    .push((key, data));
            }
        }

        let mut tiers = tiers.into_iter().collect::<Vec<_>>();
        tiers.sort_by(|(a, (ao, _)), (b, (bo, _))| cmp_order(*ao, *bo).then_with(|| a.cmp(b)));
        tiers
            .into_iter()
            .map(|(name, (_, mut policies))| {
                policies.sort_by(|(ak, ad), (bk, bd)| {
                    cmp_order(ad.model.order, bd.model.order)
                        .then_with(|| ak.name.cmp(&bk.name))
                        .then_with(|| ak.namespace.cmp(&bk.namespace))
                        .then_with(|| ak.kind.cmp(&bk.kind))
                });
                OrderedTier {
                    name: name.to_string(),
                    policies: policies.into_iter().map(|(k, _)| k.clone()).collect(),
                }
            })
            .collect()
    }

    fn bucket(&self, key: &ResourceKey) -> Option<&PolicyBucket> {
        assert!(key.kind.is_policy(), "not a policy: {key}");
        match key.namespace() {
            Some(ns) => self.namespaced.get(ns),
            None => Some(&self.global),
        }
    }

    fn bucket_mut(&mut self, key: &ResourceKey) -> Option<&mut PolicyBucket> {
        assert!(key.kind.is_policy(), "not a policy: {key}");
        match key.namespace() {
            Some(ns) => self.namespaced.get_mut(ns),
            None => Some(&mut self.global),
        }
    }
}

// === impl PolicyBucket ===

impl PolicyBucket {
    fn summary(&self) -> PolicySummary {
        PolicySummary {
            total: self.policies.len(),
            num_unmatched: self.unmatched.len(),
        }
    }
}

// === impl PolicyData ===

impl PolicyData {
    pub fn is_unmatched(&self) -> bool {
        self.endpoints.num_host_endpoints == 0 && self.endpoints.num_workload_endpoints == 0
    }
}

fn count_endpoint(counts: &mut EndpointCounts, kind: MatchKind, endpoint: &ResourceKey) {
    match endpoint.kind {
        Kind::WorkloadEndpoint => kind.apply(&mut counts.num_workload_endpoints),
        Kind::HostEndpoint => kind.apply(&mut counts.num_host_endpoints),
        _ => {}
    }
}

/// Orders by ascending order value, with unordered entries last.
fn cmp_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// The non-empty effective selectors of every rule clause of a policy.
fn rule_selectors(model: &PolicyModel) -> impl Iterator<Item = String> + '_ {
    model
        .inbound_rules
        .iter()
        .chain(&model.outbound_rules)
        .flat_map(|r| {
            [
                combine(&r.src_selector, &r.not_src_selector),
                combine(&r.dst_selector, &r.not_dst_selector),
            ]
        })
        .filter(|s| !s.is_empty())
}

/// Combines a selector and a negated selector into one effective selector. An empty result
/// selects anything and is never tracked.
pub(crate) fn combine(selector: &str, not_selector: &str) -> String {
    match (selector.is_empty(), not_selector.is_empty()) {
        (true, true) => String::new(),
        (true, false) => format!("!({not_selector})"),
        (false, true) => selector.to_string(),
        (false, false) => format!("({selector}) && !({not_selector})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Update;
    use queryserver_core::{
        model::TierModel,
        resource::{PolicySpec, TierSpec},
        ObjectMeta, UpdateType,
    };

    fn policy_model(tier: &str, order: Option<f64>, rules: &[(&str, &str)]) -> PolicyModel {
        PolicyModel {
            tier: tier.to_string(),
            order,
            selector: "all()".to_string(),
            inbound_rules: rules
                .iter()
                .map(|(src, not_src)| RuleModel {
                    src_selector: src.to_string(),
                    not_src_selector: not_src.to_string(),
                    ..Default::default()
                })
                .collect(),
            outbound_rules: vec![],
            staged_action: None,
        }
    }

    fn apply(cache: &mut PolicyCache, labels: &mut LabelIndex, update_type: UpdateType, key: &ResourceKey, model: Option<Model>) {
        let resource = Resource::new(
            ObjectMeta {
                name: Some(key.name.clone()),
                ..Default::default()
            },
            match &model {
                Some(Model::Tier(t)) => TierSpec { order: t.order }.into(),
                _ => queryserver_core::Spec::Policy(PolicySpec::default()),
            },
        );
        let update = Update {
            update_type,
            key,
            resource: (update_type != UpdateType::Deleted).then_some(&resource),
            model: model.as_ref(),
        };
        cache.on_update(&update, labels);
    }

    fn gnp(name: &str) -> ResourceKey {
        ResourceKey::global(Kind::GlobalNetworkPolicy, name)
    }

    #[test]
    fn combine_selectors() {
        assert_eq!(combine("", ""), "");
        assert_eq!(combine("", "a == 'x'"), "!(a == 'x')");
        assert_eq!(combine("b == 'y'", ""), "b == 'y'");
        assert_eq!(combine("b == 'y'", "a == 'x'"), "(b == 'y') && !(a == 'x')");
    }

    #[test]
    fn rule_selectors_are_shared_across_policies() {
        let mut cache = PolicyCache::default();
        let mut labels = LabelIndex::default();
        let db = "role == 'db'";
        let rule = SelectorId::Rule(Arc::from(db));

        let p1 = Some(Model::Policy(policy_model("t1", Some(1.0), &[(db, "")])));
        let p2 = Some(Model::Policy(policy_model("t2", Some(1.0), &[(db, ""), ("", "")])));
        apply(&mut cache, &mut labels, UpdateType::New, &gnp("p1"), p1);
        apply(&mut cache, &mut labels, UpdateType::New, &gnp("p2"), p2);
        assert_eq!(cache.rule_selector_refs(db), 2);
        assert!(labels.is_registered(&rule));
        let mut policies = cache.policies_by_rule_selector(db).cloned().collect::<Vec<_>>();
        policies.sort();
        assert_eq!(policies, [gnp("p1"), gnp("p2")]);

        apply(&mut cache, &mut labels, UpdateType::Deleted, &gnp("p1"), None);
        assert_eq!(cache.rule_selector_refs(db), 1);
        assert!(labels.is_registered(&rule));

        apply(&mut cache, &mut labels, UpdateType::Deleted, &gnp("p2"), None);
        assert_eq!(cache.rule_selector_refs(db), 0);
        assert!(!labels.is_registered(&rule));
    }

    #[test]
    fn updates_keep_shared_selectors_registered() {
        let mut cache = PolicyCache::default();
        let mut labels = LabelIndex::default();
        let db = "role == 'db'";
        labels.update_labels(
            EntityId::Resource(ResourceKey::namespaced(Kind::WorkloadEndpoint, "ns", "db-0")),
            [("role", "db")].into_iter().collect(),
            vec![],
        );

        let v1 = Some(Model::Policy(policy_model("default", None, &[(db, "")])));
        apply(&mut cache, &mut labels, UpdateType::New, &gnp("p"), v1.clone());
        let counts = cache.get_policy(&gnp("p")).unwrap().ingress[0];
        assert_eq!(counts.source.num_workload_endpoints, 1);

        // Reapplying the same policy, or adding a second rule with the same selector, never
        // releases the registration, so counts are preserved.
        apply(&mut cache, &mut labels, UpdateType::Updated, &gnp("p"), v1);
        let v2 = Some(Model::Policy(policy_model("default", None, &[(db, ""), (db, "")])));
        apply(&mut cache, &mut labels, UpdateType::Updated, &gnp("p"), v2);
        assert_eq!(cache.rule_selector_refs(db), 2);
        let view = cache.get_policy(&gnp("p")).unwrap();
        assert_eq!(view.ingress.len(), 2);
        assert!(view
            .ingress
            .iter()
            .all(|r| r.source.num_workload_endpoints == 1));
    }

    #[test]
    fn unmatched_tracks_endpoint_counts() {
        let mut cache = PolicyCache::default();
        let mut labels = LabelIndex::default();
        let p = gnp("p");
        let wep = ResourceKey::namespaced(Kind::WorkloadEndpoint, "ns", "w");
        let hep = ResourceKey::global(Kind::HostEndpoint, "h");
        apply(&mut cache, &mut labels, UpdateType::New, &p, Some(Model::Policy(policy_model("default", None, &[]))));
        assert!(cache.is_unmatched(&p));

        cache.policy_endpoint_match(MatchKind::Started, &p, &wep);
        cache.policy_endpoint_match(MatchKind::Started, &p, &hep);
        assert!(!cache.is_unmatched(&p));
        cache.policy_endpoint_match(MatchKind::Stopped, &p, &wep);
        assert!(!cache.is_unmatched(&p));
        cache.policy_endpoint_match(MatchKind::Stopped, &p, &hep);
        assert!(cache.is_unmatched(&p));
        assert_eq!(cache.total_global(), PolicySummary { total: 1, num_unmatched: 1 });

        // Events for deleted policies are ignored.
        cache.policy_endpoint_match(MatchKind::Started, &gnp("gone"), &wep);
    }

    #[test]
    fn orders_tiers_and_policies() {
        let mut cache = PolicyCache::default();
        let mut labels = LabelIndex::default();
        for (name, order) in [("t2", 2.0), ("t1", 1.0)] {
            apply(
                &mut cache,
                &mut labels,
                UpdateType::New,
                &ResourceKey::global(Kind::Tier, name),
                Some(Model::Tier(TierModel { order: Some(order) })),
            );
        }
        for (name, tier, order) in [
            ("b", "t1", Some(5.0)),
            ("a", "t1", Some(5.0)),
            ("c", "t1", Some(1.0)),
            ("z", "t2", None),
            ("y", "t2", Some(100.0)),
            ("x", "orphan", None),
        ] {
            apply(
                &mut cache,
                &mut labels,
                UpdateType::New,
                &gnp(name),
                Some(Model::Policy(policy_model(tier, order, &[]))),
            );
        }

        let ordered = cache
            .ordered_policies(None)
            .into_iter()
            .map(|t| {
                let names = t.policies.iter().map(|p| p.key.name.clone()).collect::<Vec<_>>();
                (t.name.to_string(), names)
            })
            .collect::<Vec<_>>();
        assert_eq!(
            ordered,
            [
                ("t1".to_string(), vec!["c".to_string(), "a".to_string(), "b".to_string()]),
                ("t2".to_string(), vec!["y".to_string(), "z".to_string()]),
                ("orphan".to_string(), vec!["x".to_string()]),
            ]
        );

        // Reordering a policy invalidates the cached order.
        apply(
            &mut cache,
            &mut labels,
            UpdateType::Updated,
            &gnp("b"),
            Some(Model::Policy(policy_model("t1", Some(0.0), &[]))),
        );
        let keys = [gnp("b"), gnp("y")].into_iter().collect::<HashSet<_>>();
        let filtered = cache.ordered_policies(Some(&keys));
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].policies[0].key, &gnp("b"));
        assert_eq!(filtered[1].policies[0].key, &gnp("y"));
    }

    #[test]
    fn empty_namespaces_are_removed() {
        let mut cache = PolicyCache::default();
        let mut labels = LabelIndex::default();
        let key = ResourceKey::namespaced(Kind::NetworkPolicy, "ns-0", "p");
        apply(&mut cache, &mut labels, UpdateType::New, &key, Some(Model::Policy(policy_model("default", None, &[]))));
        assert_eq!(cache.totals_by_namespace().len(), 1);
        apply(&mut cache, &mut labels, UpdateType::Deleted, &key, None);
        assert!(cache.totals_by_namespace().is_empty());
    }
}
