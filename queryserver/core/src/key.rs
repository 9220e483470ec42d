use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The resource kinds known to the index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Tier,
    GlobalNetworkPolicy,
    NetworkPolicy,
    StagedGlobalNetworkPolicy,
    StagedNetworkPolicy,
    StagedKubernetesNetworkPolicy,
    KubernetesNetworkPolicy,
    WorkloadEndpoint,
    HostEndpoint,
    Profile,
    Node,
    GlobalNetworkSet,
    NetworkSet,
    ManagedCluster,
    GlobalThreatFeed,
}

/// Identifies a single resource. Cluster-scoped resources have no namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(String);

// === impl Kind ===

impl Kind {
    pub const ALL: [Kind; 15] = [
        Kind::Tier,
        Kind::GlobalNetworkPolicy,
        Kind::NetworkPolicy,
        Kind::StagedGlobalNetworkPolicy,
        Kind::StagedNetworkPolicy,
        Kind::StagedKubernetesNetworkPolicy,
        Kind::KubernetesNetworkPolicy,
        Kind::WorkloadEndpoint,
        Kind::HostEndpoint,
        Kind::Profile,
        Kind::Node,
        Kind::GlobalNetworkSet,
        Kind::NetworkSet,
        Kind::ManagedCluster,
        Kind::GlobalThreatFeed,
    ];

    pub const POLICIES: [Kind; 6] = [
        Kind::GlobalNetworkPolicy,
        Kind::NetworkPolicy,
        Kind::StagedGlobalNetworkPolicy,
        Kind::StagedNetworkPolicy,
        Kind::StagedKubernetesNetworkPolicy,
        Kind::KubernetesNetworkPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tier => "Tier",
            Self::GlobalNetworkPolicy => "GlobalNetworkPolicy",
            Self::NetworkPolicy => "NetworkPolicy",
            Self::StagedGlobalNetworkPolicy => "StagedGlobalNetworkPolicy",
            Self::StagedNetworkPolicy => "StagedNetworkPolicy",
            Self::StagedKubernetesNetworkPolicy => "StagedKubernetesNetworkPolicy",
            Self::KubernetesNetworkPolicy => "KubernetesNetworkPolicy",
            Self::WorkloadEndpoint => "WorkloadEndpoint",
            Self::HostEndpoint => "HostEndpoint",
            Self::Profile => "Profile",
            Self::Node => "Node",
            Self::GlobalNetworkSet => "GlobalNetworkSet",
            Self::NetworkSet => "NetworkSet",
            Self::ManagedCluster => "ManagedCluster",
            Self::GlobalThreatFeed => "GlobalThreatFeed",
        }
    }

    pub fn is_namespaced(&self) -> bool {
        matches!(
            self,
            Self::NetworkPolicy
                | Self::StagedNetworkPolicy
                | Self::StagedKubernetesNetworkPolicy
                | Self::KubernetesNetworkPolicy
                | Self::WorkloadEndpoint
                | Self::NetworkSet
        )
    }

    pub fn is_policy(&self) -> bool {
        Self::POLICIES.contains(self)
    }

    pub fn is_staged(&self) -> bool {
        matches!(
            self,
            Self::StagedGlobalNetworkPolicy
                | Self::StagedNetworkPolicy
                | Self::StagedKubernetesNetworkPolicy
        )
    }

    pub fn is_endpoint(&self) -> bool {
        matches!(self, Self::WorkloadEndpoint | Self::HostEndpoint)
    }

    pub fn is_network_set(&self) -> bool {
        matches!(self, Self::GlobalNetworkSet | Self::NetworkSet)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

// === impl ResourceKey ===

impl ResourceKey {
    pub fn global(kind: Kind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    #[inline]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}({}/{})", self.kind, ns, self.name),
            None => write!(f, "{}({})", self.kind, self.name),
        }
    }
}
