//! Resources as delivered by the update stream.

use crate::{key::ResourceKey, labels::Labels};
use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::{collections::BTreeMap, net::IpAddr};

#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub metadata: ObjectMeta,
    pub spec: Spec,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Spec {
    Tier(TierSpec),
    Policy(PolicySpec),
    WorkloadEndpoint(WorkloadEndpointSpec),
    HostEndpoint(HostEndpointSpec),
    Profile(ProfileSpec),
    Node(NodeSpec),
    NetworkSet(NetworkSetSpec),
    /// Resources that are only indexed by their metadata labels.
    Metadata,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateType {
    New,
    Updated,
    Deleted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResourceUpdate {
    pub update_type: UpdateType,
    pub key: ResourceKey,
    /// Absent for deletes.
    pub value: Option<Resource>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TierSpec {
    pub order: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolicySpec {
    /// Defaults to the `default` tier.
    pub tier: Option<String>,
    pub order: Option<f64>,
    pub selector: String,
    /// Only meaningful for global policies.
    pub namespace_selector: String,
    pub ingress: Vec<Rule>,
    pub egress: Vec<Rule>,
    pub staged_action: Option<StagedAction>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StagedAction {
    Set,
    Delete,
    Learn,
    Ignore,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Action {
    #[default]
    Allow,
    Deny,
    Log,
    Pass,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rule {
    pub action: Action,
    pub source: EntityRule,
    pub destination: EntityRule,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityRule {
    pub selector: String,
    pub not_selector: String,
    pub namespace_selector: String,
    pub nets: Vec<IpNet>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadEndpointSpec {
    pub orchestrator: String,
    pub workload: String,
    pub node: String,
    pub pod: String,
    pub endpoint: String,
    pub interface_name: String,
    pub ip_networks: Vec<IpNet>,
    pub profiles: Vec<String>,
    pub service_account_name: Option<String>,
    pub phase: EndpointPhase,
}

/// The lifecycle phase of the workload behind an endpoint.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EndpointPhase {
    Pending,
    #[default]
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostEndpointSpec {
    pub node: String,
    pub interface_name: String,
    pub expected_ips: Vec<IpAddr>,
    pub profiles: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProfileSpec {
    pub labels_to_apply: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeSpec {
    pub addresses: Vec<String>,
    pub bgp: Option<NodeBgpSpec>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeBgpSpec {
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkSetSpec {
    pub nets: Vec<IpNet>,
    pub allowed_egress_domains: Vec<String>,
}

// === impl Resource ===

impl Resource {
    pub fn new(metadata: ObjectMeta, spec: impl Into<Spec>) -> Self {
        Self {
            metadata,
            spec: spec.into(),
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn labels(&self) -> Labels {
        self.metadata.labels.clone().into()
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    /// True when the resource carries no labels of its own.
    pub fn is_unlabelled(&self) -> bool {
        self.metadata.labels.as_ref().is_none_or(|l| l.is_empty())
    }
}

macro_rules! impl_spec_from {
    ($($spec:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$spec> for Spec {
                fn from(spec: $spec) -> Self {
                    Self::$variant(spec)
                }
            }
        )*
    };
}

impl_spec_from! {
    TierSpec => Tier,
    PolicySpec => Policy,
    WorkloadEndpointSpec => WorkloadEndpoint,
    HostEndpointSpec => HostEndpoint,
    ProfileSpec => Profile,
    NodeSpec => Node,
    NetworkSetSpec => NetworkSet,
}

// === impl ResourceUpdate ===

impl ResourceUpdate {
    pub fn new(key: ResourceKey, value: Resource) -> Self {
        Self {
            update_type: UpdateType::New,
            key,
            value: Some(value),
        }
    }

    pub fn updated(key: ResourceKey, value: Resource) -> Self {
        Self {
            update_type: UpdateType::Updated,
            key,
            value: Some(value),
        }
    }

    pub fn deleted(key: ResourceKey) -> Self {
        Self {
            update_type: UpdateType::Deleted,
            key,
            value: None,
        }
    }
}

// === impl UpdateType ===

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
