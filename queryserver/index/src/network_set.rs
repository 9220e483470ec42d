use crate::dispatcher::Update;
use ahash::AHashMap as HashMap;
use queryserver_core::{model::LabelledModel, Kind, Model, Resource, ResourceKey};

/// Global and namespaced network sets, bucketed by namespace.
#[derive(Debug, Default)]
pub struct NetworkSetCache {
    global: HashMap<ResourceKey, NetworkSetData>,
    namespaced: HashMap<String, HashMap<ResourceKey, NetworkSetData>>,
}

#[derive(Clone, Debug)]
pub struct NetworkSetData {
    pub resource: Resource,
    pub model: LabelledModel,
}

// === impl NetworkSetCache ===

impl NetworkSetCache {
    pub fn on_update(&mut self, update: &Update<'_>) {
        let key = update.key;
        assert!(
            matches!(key.kind, Kind::GlobalNetworkSet | Kind::NetworkSet),
            "network set cache received update for {key}"
        );

        if update.is_delete() {
            match key.namespace() {
                None => {
                    self.global.remove(key);
                }
                Some(ns) => {
                    if let Some(sets) = self.namespaced.get_mut(ns) {
                        sets.remove(key);
                        if sets.is_empty() {
                            self.namespaced.remove(ns);
                        }
                    }
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
        let data = NetworkSetData {
            resource: resource.clone(),
            model: model.clone(),
        };
        match key.namespace() {
            None => self.global.insert(key.clone(), data),
            Some(ns) => self
                .namespaced
                .entry(ns.to_string())
                .or_default()
                .insert(key.clone(), data),
        };
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&NetworkSetData> {
        match key.namespace() {
            None => self.global.get(key),
            Some(ns) => self.namespaced.get(ns)?.get(key),
        }
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.namespaced.values().map(|sets| sets.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queryserver_core::{resource::NetworkSetSpec, ObjectMeta, UpdateType};

    fn update(cache: &mut NetworkSetCache, update_type: UpdateType, key: &ResourceKey) {
        let resource = Resource::new(
            ObjectMeta {
                name: Some(key.name.clone()),
                namespace: key.namespace.clone(),
                ..Default::default()
            },
            NetworkSetSpec::default(),
        );
        let model = Model::Labelled(LabelledModel::default());
        let live = update_type != UpdateType::Deleted;
        cache.on_update(&Update {
            update_type,
            key,
            resource: live.then_some(&resource),
            model: live.then_some(&model),
        });
    }

    #[test]
    fn stores_by_namespace() {
        let mut cache = NetworkSetCache::default();
        let gns = ResourceKey::global(Kind::GlobalNetworkSet, "external");
        let ns = ResourceKey::namespaced(Kind::NetworkSet, "ns-0", "internal");
        update(&mut cache, UpdateType::New, &gns);
        update(&mut cache, UpdateType::New, &ns);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ns).is_some());
        assert!(cache
            .get(&ResourceKey::namespaced(Kind::NetworkSet, "ns-1", "internal"))
            .is_none());

        update(&mut cache, UpdateType::Deleted, &ns);
        update(&mut cache, UpdateType::Deleted, &gns);
        assert!(cache.is_empty());
        assert!(cache.namespaced.is_empty());
    }
}
