//! Maintains the match relation between registered selectors and labelled entities.
//!
//! Entities carry their own labels plus a list of parents (profiles) whose labels they inherit.
//! Every mutation re-evaluates the affected side of the relation and returns the resulting
//! [`MatchEvent`]s so that the owner can route them to the caches.
//!
//! Ad-hoc queries are answered by registering a transient selector or entity, collecting the
//! matches produced by that single registration and removing it again before returning.

use crate::dispatcher::Update;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use queryserver_core::{
    selector::ParseError, Kind, LabelLookup, Labels, Model, ResourceKey, Selector,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifies a selector registered with the index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SelectorId {
    Policy(ResourceKey),
    /// A consolidated rule selector, identified by its selector string.
    Rule(Arc<str>),
    Query(QueryId),
}

/// Identifies an entity registered with the index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntityId {
    Resource(ResourceKey),
    Query(QueryId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchKind {
    Started,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchEvent {
    pub kind: MatchKind,
    pub selector: SelectorId,
    pub entity: EntityId,
}

#[derive(Debug, Default)]
pub struct LabelIndex {
    selectors: HashMap<SelectorId, Selector>,
    entities: HashMap<EntityId, Entity>,
    parents: HashMap<String, Parent>,
    by_selector: HashMap<SelectorId, HashSet<EntityId>>,
    by_entity: HashMap<EntityId, HashSet<SelectorId>>,
    next_query: u64,
}

#[derive(Debug)]
struct Entity {
    labels: Labels,
    parents: Vec<String>,
}

#[derive(Debug, Default)]
struct Parent {
    labels: Option<Labels>,
    entities: HashSet<EntityId>,
}

/// An entity's own labels layered over the labels of its parents, in order.
struct EffectiveLabels<'a> {
    own: &'a Labels,
    parents: &'a [String],
    table: &'a HashMap<String, Parent>,
}

// === impl MatchKind ===

impl MatchKind {
    /// Adjusts a match count by this event.
    #[inline]
    pub fn apply(self, count: &mut usize) {
        match self {
            Self::Started => *count += 1,
            Self::Stopped => *count = count.saturating_sub(1),
        }
    }
}

// === impl EntityId ===

impl EntityId {
    pub fn resource(&self) -> Option<&ResourceKey> {
        match self {
            Self::Resource(key) => Some(key),
            Self::Query(_) => None,
        }
    }
}

// === impl LabelIndex ===

impl LabelIndex {
    /// Handles resource updates for labelled entities, profiles and policies.
    pub fn on_update(&mut self, update: &Update<'_>) -> Vec<MatchEvent> {
        let key = update.key;
        match key.kind {
            Kind::WorkloadEndpoint
            | Kind::HostEndpoint
            | Kind::GlobalNetworkSet
            | Kind::NetworkSet => {
                let id = EntityId::Resource(key.clone());
                if update.is_delete() {
                    return self.delete_labels(&id);
                }
                match update.model {
                    Some(Model::Labelled(m)) => {
                        self.update_labels(id, m.labels.clone(), m.profile_ids.clone())
                    }
                    Some(m) => panic!("unexpected model for {key}: {m:?}"),
                    None => Vec::new(),
                }
            }

            Kind::Profile => {
                if update.is_delete() {
                    return self.delete_parent_labels(&key.name);
                }
                match update.model {
                    Some(Model::Profile(p)) => self.update_parent_labels(&key.name, p.labels.clone()),
                    Some(m) => panic!("unexpected model for {key}: {m:?}"),
                    None => Vec::new(),
                }
            }

            kind if kind.is_policy() => {
                let id = SelectorId::Policy(key.clone());
                if update.is_delete() {
                    return self.unregister_selector(&id);
                }
                match update.model {
                    Some(Model::Policy(p)) => match p.selector.parse::<Selector>() {
                        Ok(selector) => self.register_selector(id, selector),
                        Err(error) => {
                            warn!(%key, selector = %p.selector, %error, "Invalid policy selector; removing policy from matching");
                            self.unregister_selector(&id)
                        }
                    },
                    Some(m) => panic!("unexpected model for {key}: {m:?}"),
                    None => Vec::new(),
                }
            }

            _ => panic!("label index received update for {key}"),
        }
    }

    /// Adds or replaces a selector, returning the resulting match changes.
    pub fn register_selector(&mut self, id: SelectorId, selector: Selector) -> Vec<MatchEvent> {
        self.selectors.insert(id.clone(), selector);
        self.refresh_selector(&id)
    }

    pub fn unregister_selector(&mut self, id: &SelectorId) -> Vec<MatchEvent> {
        if self.selectors.remove(id).is_none() {
            return Vec::new();
        }
        let matched = self.by_selector.remove(id).unwrap_or_default();
        let mut events = Vec::with_capacity(matched.len());
        for entity in matched {
            self.unlink_entity(&entity, id);
            events.push(MatchEvent {
                kind: MatchKind::Stopped,
                selector: id.clone(),
                entity,
            });
        }
        events
    }

    /// Adds or replaces an entity's own labels and parents.
    pub fn update_labels(&mut self, id: EntityId, labels: Labels, parents: Vec<String>) -> Vec<MatchEvent> {
        if let Some(old) = self.entities.remove(&id) {
            for name in old.parents.iter().filter(|p| !parents.contains(p)) {
                self.release_parent(name, &id);
            }
        }
        for name in &parents {
            self.parents
                .entry(name.clone())
                .or_default()
                .entities
                .insert(id.clone());
        }
        self.entities.insert(id.clone(), Entity { labels, parents });
        self.refresh_entity(&id)
    }

    pub fn delete_labels(&mut self, id: &EntityId) -> Vec<MatchEvent> {
        let Some(old) = self.entities.remove(id) else {
            return Vec::new();
        };
        for name in &old.parents {
            self.release_parent(name, id);
        }
        let matched = self.by_entity.remove(id).unwrap_or_default();
        let mut events = Vec::with_capacity(matched.len());
        for selector in matched {
            if let Some(entities) = self.by_selector.get_mut(&selector) {
                entities.remove(id);
            }
            events.push(MatchEvent {
                kind: MatchKind::Stopped,
                selector,
                entity: id.clone(),
            });
        }
        events
    }

    /// Sets the labels contributed by a parent and re-evaluates every entity that references it.
    pub fn update_parent_labels(&mut self, name: &str, labels: Labels) -> Vec<MatchEvent> {
        let parent = self.parents.entry(name.to_string()).or_default();
        parent.labels = Some(labels);
        let entities = parent.entities.iter().cloned().collect::<Vec<_>>();
        entities
            .iter()
            .flat_map(|id| self.refresh_entity(id))
            .collect()
    }

    pub fn delete_parent_labels(&mut self, name: &str) -> Vec<MatchEvent> {
        let Some(parent) = self.parents.get_mut(name) else {
            return Vec::new();
        };
        parent.labels = None;
        if parent.entities.is_empty() {
            self.parents.remove(name);
            return Vec::new();
        }
        let entities = parent.entities.iter().cloned().collect::<Vec<_>>();
        entities
            .iter()
            .flat_map(|id| self.refresh_entity(id))
            .collect()
    }

    /// Returns the endpoints selected by a selector expression.
    pub fn query_endpoints(&mut self, selector: &str) -> Result<Vec<ResourceKey>, ParseError> {
        let selector = selector.parse::<Selector>()?;
        let matched = self.with_transient_selector(selector);
        Ok(matched
            .into_iter()
            .filter_map(|id| match id {
                EntityId::Resource(key) if key.kind.is_endpoint() => Some(key),
                _ => None,
            })
            .collect())
    }

    /// Returns the policies whose selector matches an entity with the given labels and parents.
    pub fn query_policies(&mut self, labels: Labels, parents: Vec<String>) -> Vec<ResourceKey> {
        self.with_transient_entity(labels, parents)
            .into_iter()
            .filter_map(|id| match id {
                SelectorId::Policy(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    /// Returns the rule selectors that match an entity with the given labels and parents.
    pub fn query_rule_selectors(&mut self, labels: Labels, parents: Vec<String>) -> Vec<Arc<str>> {
        self.with_transient_entity(labels, parents)
            .into_iter()
            .filter_map(|id| match id {
                SelectorId::Rule(selector) => Some(selector),
                _ => None,
            })
            .collect()
    }

    pub fn is_registered(&self, id: &SelectorId) -> bool {
        self.selectors.contains_key(id)
    }

    pub fn selector_matches(&self, id: &SelectorId) -> impl Iterator<Item = &EntityId> + '_ {
        self.by_selector.get(id).into_iter().flatten()
    }

    /// True if no transient query objects remain registered.
    pub fn is_quiescent(&self) -> bool {
        !self
            .selectors
            .keys()
            .any(|id| matches!(id, SelectorId::Query(_)))
            && !self
                .entities
                .keys()
                .any(|id| matches!(id, EntityId::Query(_)))
    }

    fn next_query_id(&mut self) -> QueryId {
        self.next_query += 1;
        QueryId(self.next_query)
    }

    fn with_transient_selector(&mut self, selector: Selector) -> Vec<EntityId> {
        let id = SelectorId::Query(self.next_query_id());
        let started = self.register_selector(id.clone(), selector);
        let stopped = self.unregister_selector(&id);
        debug_assert_eq!(started.len(), stopped.len());
        debug!(matches = started.len(), "Transient selector query");
        started.into_iter().map(|e| e.entity).collect()
    }

    fn with_transient_entity(&mut self, labels: Labels, parents: Vec<String>) -> Vec<SelectorId> {
        let id = EntityId::Query(self.next_query_id());
        let started = self.update_labels(id.clone(), labels, parents);
        let stopped = self.delete_labels(&id);
        debug_assert_eq!(started.len(), stopped.len());
        debug!(matches = started.len(), "Transient entity query");
        started.into_iter().map(|e| e.selector).collect()
    }

    fn effective_labels<'a>(&'a self, entity: &'a Entity) -> EffectiveLabels<'a> {
        EffectiveLabels {
            own: &entity.labels,
            parents: &entity.parents,
            table: &self.parents,
        }
    }

    /// Re-evaluates a selector against every entity.
    fn refresh_selector(&mut self, id: &SelectorId) -> Vec<MatchEvent> {
        let Some(selector) = self.selectors.get(id) else {
            return Vec::new();
        };
        let current = self
            .entities
            .iter()
            .filter(|(_, e)| selector.matches(&self.effective_labels(e)))
            .map(|(id, _)| id.clone())
            .collect::<HashSet<_>>();
        let previous = self.by_selector.remove(id).unwrap_or_default();

        let mut events = Vec::new();
        for entity in previous.difference(&current) {
            self.unlink_entity(entity, id);
            events.push(MatchEvent {
                kind: MatchKind::Stopped,
                selector: id.clone(),
                entity: entity.clone(),
            });
        }
        for entity in current.difference(&previous) {
            self.by_entity
                .entry(entity.clone())
                .or_default()
                .insert(id.clone());
            events.push(MatchEvent {
                kind: MatchKind::Started,
                selector: id.clone(),
                entity: entity.clone(),
            });
        }
        if !current.is_empty() {
            self.by_selector.insert(id.clone(), current);
        }
        events
    }

    /// Re-evaluates an entity against every selector.
    fn refresh_entity(&mut self, id: &EntityId) -> Vec<MatchEvent> {
        let Some(entity) = self.entities.get(id) else {
            return Vec::new();
        };
        let labels = self.effective_labels(entity);
        let current = self
            .selectors
            .iter()
            .filter(|(_, s)| s.matches(&labels))
            .map(|(id, _)| id.clone())
            .collect::<HashSet<_>>();
        let previous = self.by_entity.remove(id).unwrap_or_default();

        let mut events = Vec::new();
        for selector in previous.difference(&current) {
            if let Some(entities) = self.by_selector.get_mut(selector) {
                entities.remove(id);
                if entities.is_empty() {
                    self.by_selector.remove(selector);
                }
            }
            events.push(MatchEvent {
                kind: MatchKind::Stopped,
                selector: selector.clone(),
                entity: id.clone(),
            });
        }
        for selector in current.difference(&previous) {
            self.by_selector
                .entry(selector.clone())
                .or_default()
                .insert(id.clone());
            events.push(MatchEvent {
                kind: MatchKind::Started,
                selector: selector.clone(),
                entity: id.clone(),
            });
        }
        if !current.is_empty() {
            self.by_entity.insert(id.clone(), current);
        }
        events
    }

    fn unlink_entity(&mut self, entity: &EntityId, selector: &SelectorId) {
        if let Some(selectors) = self.by_entity.get_mut(entity) {
            selectors.remove(selector);
            if selectors.is_empty() {
                self.by_entity.remove(entity);
            }
        }
    }

    fn release_parent(&mut self, name: &str, id: &EntityId) {
        if let Some(parent) = self.parents.get_mut(name) {
            parent.entities.remove(id);
            if parent.entities.is_empty() && parent.labels.is_none() {
                self.parents.remove(name);
            }
        }
    }
}

// === impl EffectiveLabels ===

impl LabelLookup for EffectiveLabels<'_> {
    fn get_label(&self, key: &str) -> Option<&str> {
        self.own.get(key).or_else(|| {
            self.parents
                .iter()
                .find_map(|name| self.table.get(name)?.labels.as_ref()?.get(key))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&'static str, &'static str)]) -> Labels {
        pairs.iter().copied().collect()
    }

    fn ep(name: &str) -> EntityId {
        EntityId::Resource(ResourceKey::namespaced(Kind::WorkloadEndpoint, "ns-0", name))
    }

    fn policy(name: &str) -> SelectorId {
        SelectorId::Policy(ResourceKey::global(Kind::GlobalNetworkPolicy, name))
    }

    fn started(selector: SelectorId, entity: EntityId) -> MatchEvent {
        MatchEvent {
            kind: MatchKind::Started,
            selector,
            entity,
        }
    }

    fn stopped(selector: SelectorId, entity: EntityId) -> MatchEvent {
        MatchEvent {
            kind: MatchKind::Stopped,
            selector,
            entity,
        }
    }

    #[test]
    fn selector_and_label_updates_emit_match_changes() {
        let mut index = LabelIndex::default();
        let sel = Selector::parse("app == 'web'").unwrap();
        assert_eq!(index.register_selector(policy("p"), sel), vec![]);

        assert_eq!(
            index.update_labels(ep("a"), labels(&[("app", "web")]), vec![]),
            vec![started(policy("p"), ep("a"))],
        );
        // Identical updates are idempotent.
        assert_eq!(
            index.update_labels(ep("a"), labels(&[("app", "web")]), vec![]),
            vec![],
        );
        assert_eq!(
            index.update_labels(ep("a"), labels(&[("app", "db")]), vec![]),
            vec![stopped(policy("p"), ep("a"))],
        );

        index.update_labels(ep("b"), labels(&[("app", "web")]), vec![]);
        assert_eq!(
            index.delete_labels(&ep("b")),
            vec![stopped(policy("p"), ep("b"))],
        );
        assert_eq!(index.unregister_selector(&policy("p")), vec![]);
    }

    #[test]
    fn parent_labels_are_inherited() {
        let mut index = LabelIndex::default();
        index.register_selector(policy("p"), Selector::parse("pcns.env == 'prod'").unwrap());
        assert_eq!(
            index.update_labels(ep("a"), labels(&[]), vec!["kns.ns-0".to_string()]),
            vec![],
        );

        assert_eq!(
            index.update_parent_labels("kns.ns-0", labels(&[("pcns.env", "prod")])),
            vec![started(policy("p"), ep("a"))],
        );
        assert_eq!(
            index.update_parent_labels("kns.ns-0", labels(&[("pcns.env", "dev")])),
            vec![stopped(policy("p"), ep("a"))],
        );
        index.update_parent_labels("kns.ns-0", labels(&[("pcns.env", "prod")]));
        assert_eq!(
            index.delete_parent_labels("kns.ns-0"),
            vec![stopped(policy("p"), ep("a"))],
        );
    }

    #[test]
    fn own_labels_take_precedence_over_parents() {
        let mut index = LabelIndex::default();
        index.update_parent_labels("a", labels(&[("role", "parent-a")]));
        index.update_parent_labels("b", labels(&[("role", "parent-b"), ("zone", "b")]));
        index.update_labels(
            ep("x"),
            labels(&[("role", "own")]),
            vec!["a".to_string(), "b".to_string()],
        );
        index.update_labels(ep("y"), labels(&[]), vec!["a".to_string(), "b".to_string()]);

        let own = index.query_endpoints("role == 'own'").unwrap();
        assert_eq!(own, vec![ep("x").resource().cloned().unwrap()]);
        let first_parent = index.query_endpoints("role == 'parent-a'").unwrap();
        assert_eq!(first_parent, vec![ep("y").resource().cloned().unwrap()]);
        assert_eq!(index.query_endpoints("zone == 'b'").unwrap().len(), 2);
        assert!(index.query_endpoints("role == 'parent-b'").unwrap().is_empty());
    }

    #[test]
    fn transient_queries_leave_no_registrations() {
        let mut index = LabelIndex::default();
        index.register_selector(policy("p"), Selector::parse("app == 'web'").unwrap());
        let rule: Arc<str> = "has(app)".into();
        index.register_selector(
            SelectorId::Rule(rule.clone()),
            Selector::parse(&rule).unwrap(),
        );
        index.update_labels(ep("a"), labels(&[("app", "web")]), vec![]);

        assert_eq!(
            index.query_policies(labels(&[("app", "web")]), vec![]),
            vec![ResourceKey::global(Kind::GlobalNetworkPolicy, "p")],
        );
        assert_eq!(
            index.query_rule_selectors(labels(&[("app", "db")]), vec![]),
            vec![rule.clone()],
        );
        assert_eq!(index.query_endpoints("").unwrap().len(), 1);
        assert!(index.query_endpoints("app ==").is_err());
        assert!(index.is_quiescent());

        // Persistent registrations are untouched by transient queries.
        assert_eq!(index.selector_matches(&policy("p")).count(), 1);
        assert_eq!(
            index.selector_matches(&SelectorId::Rule(rule)).count(),
            1
        );
    }

    #[test]
    fn network_sets_are_not_endpoints() {
        let mut index = LabelIndex::default();
        index.update_labels(
            EntityId::Resource(ResourceKey::global(Kind::GlobalNetworkSet, "ns")),
            labels(&[("app", "web")]),
            vec![],
        );
        assert!(index.query_endpoints("app == 'web'").unwrap().is_empty());
    }
}
