#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod api;
pub mod key;
pub mod labels;
pub mod model;
pub mod resource;
pub mod selector;

pub use self::{
    key::{Kind, ResourceKey},
    labels::{LabelLookup, Labels},
    model::Model,
    resource::{Resource, ResourceUpdate, Spec, UpdateType},
    selector::Selector,
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
