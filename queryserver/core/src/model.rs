//! The normalized form of resources consumed by the label index and the caches.
//!
//! Converters reduce each raw resource to the subset that matters for label matching: effective
//! selectors with namespace scoping applied, effective endpoint labels and the profiles an entity
//! inherits labels from.

use crate::{labels::Labels, resource::StagedAction};

#[derive(Clone, Debug, PartialEq)]
pub enum Model {
    Tier(TierModel),
    Policy(PolicyModel),
    /// Workload endpoints, host endpoints and network sets.
    Labelled(LabelledModel),
    Profile(ProfileModel),
    Node,
    /// Resources that only contribute metadata labels.
    Metadata(Labels),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TierModel {
    pub order: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyModel {
    pub tier: String,
    pub order: Option<f64>,
    pub selector: String,
    pub inbound_rules: Vec<RuleModel>,
    pub outbound_rules: Vec<RuleModel>,
    pub staged_action: Option<StagedAction>,
}

/// The selectors of a single rule. Empty strings denote an unconstrained clause.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleModel {
    pub src_selector: String,
    pub not_src_selector: String,
    pub dst_selector: String,
    pub not_dst_selector: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelledModel {
    pub labels: Labels,
    /// Profiles whose labels are inherited, in precedence order.
    pub profile_ids: Vec<String>,
    pub node: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProfileModel {
    pub labels: Labels,
}

pub const DEFAULT_TIER: &str = "default";

/// Prefix of the labels maintained by the control plane itself.
pub const CALICO_LABEL_PREFIX: &str = "projectcalico.org/";
pub const ORCHESTRATOR_LABEL: &str = "projectcalico.org/orchestrator";
pub const SERVICE_ACCOUNT_LABEL: &str = "projectcalico.org/serviceaccount";
/// The label a namespace or service account profile carries with its own name.
pub const NAME_LABEL: &str = "projectcalico.org/name";

pub const NAMESPACE_PROFILE_PREFIX: &str = "kns.";
pub const SERVICE_ACCOUNT_PROFILE_PREFIX: &str = "ksa.";
/// Namespace labels are applied to endpoints through the namespace profile with this prefix.
pub const NAMESPACE_LABEL_PREFIX: &str = "pcns.";
/// Service account labels are applied to endpoints through the service account profile with this
/// prefix.
pub const SERVICE_ACCOUNT_LABEL_PREFIX: &str = "pcsa.";

pub fn namespace_profile(namespace: &str) -> String {
    format!("{NAMESPACE_PROFILE_PREFIX}{namespace}")
}

pub fn service_account_profile(namespace: &str, service_account: &str) -> String {
    format!("{SERVICE_ACCOUNT_PROFILE_PREFIX}{namespace}.{service_account}")
}
