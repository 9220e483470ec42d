use crate::convert;
use ahash::AHashMap as HashMap;
use queryserver_core::{Kind, Model, Resource, ResourceKey, ResourceUpdate, UpdateType};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Normalizes a raw resource update for the index.
///
/// Returning `None` filters the update out: handlers observe the update with no model and ignore
/// it.
pub trait Converter: Send + Sync {
    fn convert(&self, update: &ResourceUpdate) -> Option<Model>;
}

/// An update as observed by handlers, carrying both the raw and the normalized resource.
#[derive(Copy, Clone, Debug)]
pub struct Update<'u> {
    pub update_type: UpdateType,
    pub key: &'u ResourceKey,
    pub resource: Option<&'u Resource>,
    pub model: Option<&'u Model>,
}

pub type Handler<S> = Box<dyn Fn(&mut S, &Update<'_>) + Send + Sync>;

/// Fans out resource updates to the handlers registered for each kind.
pub struct Dispatcher<S> {
    kinds: HashMap<Kind, Entry<S>>,
}

struct Entry<S> {
    converter: Option<Arc<dyn Converter>>,
    handlers: Vec<Handler<S>>,
}

// === impl Update ===

impl Update<'_> {
    /// Returns the resource and its model for a live (non-deleted) update that was not filtered.
    pub fn live(&self) -> Option<(&Resource, &Model)> {
        match self.update_type {
            UpdateType::Deleted => None,
            UpdateType::New | UpdateType::Updated => Some((self.resource?, self.model?)),
        }
    }

    #[inline]
    pub fn is_delete(&self) -> bool {
        self.update_type == UpdateType::Deleted
    }
}

// === impl Dispatcher ===

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self {
            kinds: HashMap::default(),
        }
    }
}

impl<S> Dispatcher<S> {
    /// Sets the converter used for a kind. Kinds without a converter are normalized directly from
    /// the raw resource.
    pub fn set_converter(&mut self, kind: Kind, converter: Arc<dyn Converter>) {
        self.entry(kind).converter = Some(converter);
    }

    /// Registers a handler for a kind. Handlers are invoked in registration order.
    pub fn register(&mut self, kind: Kind, handler: impl Fn(&mut S, &Update<'_>) + Send + Sync + 'static) {
        self.entry(kind).handlers.push(Box::new(handler));
    }

    pub fn is_registered(&self, kind: Kind) -> bool {
        self.kinds.contains_key(&kind)
    }

    /// Converts a raw update into its normalized form.
    pub fn convert(&self, update: &ResourceUpdate) -> Option<Model> {
        if update.update_type == UpdateType::Deleted {
            return None;
        }
        match self.kinds.get(&update.key.kind).and_then(|e| e.converter.as_ref()) {
            Some(converter) => converter.convert(update),
            None => convert::normalize(update),
        }
    }

    /// Applies a batch of updates, in order, to the state.
    pub fn dispatch(&self, state: &mut S, updates: &[ResourceUpdate]) {
        for update in updates {
            let Some(entry) = self.kinds.get(&update.key.kind) else {
                warn!(key = %update.key, "Ignoring update for unhandled resource kind");
                continue;
            };

            let model = self.convert(update);
            if model.is_none() && update.update_type != UpdateType::Deleted {
                debug!(key = %update.key, update_type = %update.update_type, "Update filtered by conversion");
            }
            trace!(key = %update.key, update_type = %update.update_type, "Dispatching");

            let u = Update {
                update_type: update.update_type,
                key: &update.key,
                resource: update.value.as_ref(),
                model: model.as_ref(),
            };
            for handler in &entry.handlers {
                handler(state, &u);
            }
        }
    }

    fn entry(&mut self, kind: Kind) -> &mut Entry<S> {
        self.kinds.entry(kind).or_insert_with(|| Entry {
            converter: None,
            handlers: Vec::new(),
        })
    }
}
