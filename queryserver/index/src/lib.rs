//! Query server index
//!
//! Maintains incremental indexes over network policy resources so that questions about them can
//! be answered without scanning:
//!
//! - Which endpoints does a policy (or one of its rules) select?
//! - Which policies apply to an endpoint, or to any entity with a given set of labels?
//! - Which policies have a rule selecting a network set?
//! - How many endpoints are unprotected, and how many policies are unmatched?
//!
//! Resource updates flow through a [`Dispatcher`](dispatcher::Dispatcher), which converts each
//! update to its normalized [`Model`](queryserver_core::Model) and hands it to the caches and the
//! [`LabelIndex`](label_index::LabelIndex), in that order. The label index maintains the relation
//! between selectors and labelled entities and reports every change as a match event, which is
//! routed back to the caches to maintain their counts.
//!
//! ```text
//! [ ResourceUpdate ] -> [ Dispatcher ] -> [ Caches ] ... [ LabelIndex ] -> (match events) -> [ Caches ]
//! ```
//!
//! Ad-hoc queries register a transient selector or entity with the label index, collect its
//! matches and remove it before returning, so queries reuse the same matching as persistent
//! policy selectors. All of this state is owned by a single task behind a [`QueryServer`], which
//! serializes updates with queries.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod aggregate;
pub mod convert;
pub mod dispatcher;
pub mod endpoint;
mod error;
pub mod label_index;
mod metrics;
pub mod network_set;
pub mod node;
pub mod policy;
mod query;
mod server;
pub mod state;
pub mod summary;


pub use self::{
    error::QueryError,
    metrics::IndexMetrics,
    query::CachedQuery,
    server::QueryServer,
    summary::{Sample, TimeSeries},
};
