use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

/// An immutable, cheaply-cloned label set.
#[derive(Clone, Debug, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// Provides label values to a selector.
///
/// Entities in the index expose their effective labels (their own labels layered over the labels
/// of the profiles they reference) through this trait so that selectors never need a merged copy.
pub trait LabelLookup {
    fn get_label(&self, key: &str) -> Option<&str>;
}

// === impl Labels ===

impl Labels {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Returns a copy of these labels with additional entries. Existing keys are overwritten.
    pub fn with<K, V>(&self, extra: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = (*self.0).clone();
        for (k, v) in extra {
            map.insert(k.into(), v.into());
        }
        Self(Arc::new(map))
    }
}

impl LabelLookup for Labels {
    #[inline]
    fn get_label(&self, key: &str) -> Option<&str> {
        self.get(key)
    }
}

impl LabelLookup for Map {
    #[inline]
    fn get_label(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.map(Self::from).unwrap_or_default()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
