use crate::{
    aggregate::LabelAggregator,
    convert::{NetworkSetConverter, PolicyConverter, WorkloadEndpointConverter},
    dispatcher::{Dispatcher, Update},
    endpoint::EndpointCache,
    label_index::{EntityId, LabelIndex, MatchEvent, SelectorId},
    network_set::NetworkSetCache,
    node::NodeCache,
    policy::PolicyCache,
};
use queryserver_core::Kind;
use std::sync::Arc;

/// All of the state maintained from the update stream.
#[derive(Debug, Default)]
pub struct CacheState {
    pub labels: LabelIndex,
    pub policies: PolicyCache,
    pub endpoints: EndpointCache,
    pub nodes: NodeCache,
    pub network_sets: NetworkSetCache,
    pub aggregator: LabelAggregator,
}

// === impl CacheState ===

impl CacheState {
    /// Builds a dispatcher that feeds this state.
    ///
    /// The caches observe each update before the label index so that the entries that match events
    /// refer to already exist when the index reports them.
    pub fn dispatcher() -> Dispatcher<Self> {
        let mut d = Dispatcher::default();

        let policies = Arc::new(PolicyConverter);
        for kind in Kind::POLICIES {
            d.set_converter(kind, policies.clone());
        }
        d.set_converter(Kind::WorkloadEndpoint, Arc::new(WorkloadEndpointConverter));
        d.set_converter(Kind::NetworkSet, Arc::new(NetworkSetConverter));

        for kind in [Kind::WorkloadEndpoint, Kind::HostEndpoint] {
            d.register(kind, |s: &mut Self, u: &Update<'_>| s.endpoints.on_update(u));
        }

        d.register(Kind::Tier, |s: &mut Self, u: &Update<'_>| {
            s.policies.on_update(u, &mut s.labels)
        });
        for kind in Kind::POLICIES {
            d.register(kind, |s: &mut Self, u: &Update<'_>| {
                s.policies.on_update(u, &mut s.labels)
            });
        }

        for kind in [Kind::Node, Kind::WorkloadEndpoint, Kind::HostEndpoint] {
            d.register(kind, |s: &mut Self, u: &Update<'_>| s.nodes.on_update(u));
        }

        for kind in [Kind::GlobalNetworkSet, Kind::NetworkSet] {
            d.register(kind, |s: &mut Self, u: &Update<'_>| s.network_sets.on_update(u));
        }

        for kind in Kind::POLICIES.into_iter().chain([
            Kind::WorkloadEndpoint,
            Kind::Profile,
            Kind::GlobalNetworkSet,
            Kind::NetworkSet,
            Kind::ManagedCluster,
            Kind::GlobalThreatFeed,
        ]) {
            d.register(kind, |s: &mut Self, u: &Update<'_>| s.aggregator.on_update(u));
        }

        for kind in Kind::POLICIES.into_iter().chain([
            Kind::WorkloadEndpoint,
            Kind::HostEndpoint,
            Kind::Profile,
            Kind::GlobalNetworkSet,
            Kind::NetworkSet,
        ]) {
            d.register(kind, |s: &mut Self, u: &Update<'_>| {
                let events = s.labels.on_update(u);
                s.route(events);
            });
        }

        d
    }

    /// Delivers match events from the label index to the caches that track them.
    pub(crate) fn route(&mut self, events: Vec<MatchEvent>) {
        for event in events {
            let EntityId::Resource(entity) = &event.entity else {
                continue;
            };
            if !entity.kind.is_endpoint() {
                continue;
            }
            match &event.selector {
                SelectorId::Policy(policy) => {
                    self.policies
                        .policy_endpoint_match(event.kind, policy, entity);
                    self.endpoints
                        .policy_endpoint_match(event.kind, policy, entity);
                }
                SelectorId::Rule(selector) => {
                    self.policies
                        .rule_endpoint_match(event.kind, selector, &event.entity);
                }
                SelectorId::Query(_) => {}
            }
        }
    }
}
