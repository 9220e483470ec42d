#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use queryserver_core as core;
pub use queryserver_index as index;

mod args;
mod k8s;
mod summary;

pub use self::{args::Args, summary::SummaryGauges};
