//! Converters from raw resources to the normalized model.

use crate::dispatcher::Converter;
use queryserver_core::{
    model::{
        self, LabelledModel, PolicyModel, ProfileModel, RuleModel, TierModel,
        NAMESPACE_LABEL_PREFIX, ORCHESTRATOR_LABEL, SERVICE_ACCOUNT_LABEL,
    },
    resource::{EntityRule, PolicySpec, StagedAction},
    selector::NAMESPACE_LABEL,
    Kind, Model, Resource, ResourceKey, ResourceUpdate, Selector, Spec,
};
use tracing::{debug, warn};

/// Converts policies of every kind, scoping namespaced policies to their namespace.
///
/// Staged policies that stage a deletion are filtered out.
#[derive(Copy, Clone, Debug, Default)]
pub struct PolicyConverter;

/// Converts workload endpoints, applying the namespace, orchestrator and service account labels
/// and the namespace and service account profiles.
#[derive(Copy, Clone, Debug, Default)]
pub struct WorkloadEndpointConverter;

/// Converts namespaced network sets, applying the namespace label and profile.
#[derive(Copy, Clone, Debug, Default)]
pub struct NetworkSetConverter;

// === impl PolicyConverter ===

impl Converter for PolicyConverter {
    fn convert(&self, update: &ResourceUpdate) -> Option<Model> {
        let resource = update.value.as_ref()?;
        let Spec::Policy(spec) = &resource.spec else {
            return mismatch(&update.key, resource);
        };
        if update.key.kind.is_staged() && spec.staged_action == Some(StagedAction::Delete) {
            debug!(key = %update.key, "Filtering staged policy deletion");
            return None;
        }
        Some(Model::Policy(policy_model(&update.key, spec)))
    }
}

pub fn policy_model(key: &ResourceKey, spec: &PolicySpec) -> PolicyModel {
    let namespace = key.namespace();
    let selector = match namespace {
        Some(ns) => scoped(namespace_clause(ns), &spec.selector),
        None if spec.namespace_selector.trim().is_empty() => {
            if spec.selector.trim().is_empty() {
                Selector::all().to_string()
            } else {
                spec.selector.clone()
            }
        }
        None => scoped(
            prefixed_namespace_selector(&spec.namespace_selector),
            &spec.selector,
        ),
    };

    let rule = |r: &queryserver_core::resource::Rule| RuleModel {
        src_selector: entity_selector(namespace, &r.source),
        not_src_selector: r.source.not_selector.clone(),
        dst_selector: entity_selector(namespace, &r.destination),
        not_dst_selector: r.destination.not_selector.clone(),
    };

    PolicyModel {
        tier: spec
            .tier
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| model::DEFAULT_TIER.to_string()),
        order: spec.order,
        selector,
        inbound_rules: spec.ingress.iter().map(&rule).collect(),
        outbound_rules: spec.egress.iter().map(&rule).collect(),
        staged_action: spec.staged_action,
    }
}

/// The selector of a rule peer. A namespace selector is evaluated against the namespace labels
/// applied through profiles; otherwise namespaced policies only select within their namespace.
fn entity_selector(namespace: Option<&str>, entity: &EntityRule) -> String {
    if !entity.namespace_selector.trim().is_empty() {
        return scoped(
            prefixed_namespace_selector(&entity.namespace_selector),
            &entity.selector,
        );
    }
    match namespace {
        Some(ns) if !entity.selector.trim().is_empty() => {
            scoped(namespace_clause(ns), &entity.selector)
        }
        _ => entity.selector.clone(),
    }
}

fn namespace_clause(namespace: &str) -> String {
    format!("{NAMESPACE_LABEL} == \"{namespace}\"")
}

fn prefixed_namespace_selector(selector: &str) -> String {
    match selector.parse::<Selector>() {
        Ok(sel) => format!("({})", sel.with_key_prefix(NAMESPACE_LABEL_PREFIX)),
        // Leave it unparsable so the combined selector is rejected where it is registered.
        Err(_) => format!("({selector})"),
    }
}

fn scoped(scope: String, selector: &str) -> String {
    if selector.trim().is_empty() {
        return scope;
    }
    format!("{scope} && ({selector})")
}

// === impl WorkloadEndpointConverter ===

impl Converter for WorkloadEndpointConverter {
    fn convert(&self, update: &ResourceUpdate) -> Option<Model> {
        let resource = update.value.as_ref()?;
        let Spec::WorkloadEndpoint(spec) = &resource.spec else {
            return mismatch(&update.key, resource);
        };
        let Some(ns) = update.key.namespace() else {
            debug!(key = %update.key, "Filtering workload endpoint without a namespace");
            return None;
        };

        let mut extra = vec![
            (NAMESPACE_LABEL, ns.to_string()),
            (ORCHESTRATOR_LABEL, spec.orchestrator.clone()),
        ];
        let mut profile_ids = vec![model::namespace_profile(ns)];
        if let Some(sa) = spec.service_account_name.as_deref().filter(|sa| !sa.is_empty()) {
            extra.push((SERVICE_ACCOUNT_LABEL, sa.to_string()));
            profile_ids.push(model::service_account_profile(ns, sa));
        }
        for profile in &spec.profiles {
            if !profile_ids.contains(profile) {
                profile_ids.push(profile.clone());
            }
        }

        Some(Model::Labelled(LabelledModel {
            labels: resource.labels().with(extra),
            profile_ids,
            node: Some(spec.node.clone()),
        }))
    }
}

// === impl NetworkSetConverter ===

impl Converter for NetworkSetConverter {
    fn convert(&self, update: &ResourceUpdate) -> Option<Model> {
        let resource = update.value.as_ref()?;
        if !matches!(resource.spec, Spec::NetworkSet(_)) {
            return mismatch(&update.key, resource);
        }
        let Some(ns) = update.key.namespace() else {
            debug!(key = %update.key, "Filtering network set without a namespace");
            return None;
        };
        Some(Model::Labelled(LabelledModel {
            labels: resource.labels().with([(NAMESPACE_LABEL, ns)]),
            profile_ids: vec![model::namespace_profile(ns)],
            node: None,
        }))
    }
}

/// Normalizes resources of kinds that have no dedicated converter.
pub fn normalize(update: &ResourceUpdate) -> Option<Model> {
    let resource = update.value.as_ref()?;
    let key = &update.key;
    let model = match (&resource.spec, key.kind) {
        (Spec::Tier(t), Kind::Tier) => Model::Tier(TierModel { order: t.order }),
        (Spec::Policy(p), kind) if kind.is_policy() => Model::Policy(policy_model(key, p)),
        (Spec::WorkloadEndpoint(wep), Kind::WorkloadEndpoint) => Model::Labelled(LabelledModel {
            labels: resource.labels(),
            profile_ids: wep.profiles.clone(),
            node: Some(wep.node.clone()),
        }),
        (Spec::HostEndpoint(hep), Kind::HostEndpoint) => Model::Labelled(LabelledModel {
            labels: resource.labels(),
            profile_ids: hep.profiles.clone(),
            node: Some(hep.node.clone()),
        }),
        (Spec::NetworkSet(_), Kind::GlobalNetworkSet | Kind::NetworkSet) => {
            Model::Labelled(LabelledModel {
                labels: resource.labels(),
                profile_ids: Vec::new(),
                node: None,
            })
        }
        (Spec::Profile(p), Kind::Profile) => Model::Profile(ProfileModel {
            labels: p.labels_to_apply.clone().into(),
        }),
        (Spec::Node(_), Kind::Node) => Model::Node,
        (Spec::Metadata, Kind::ManagedCluster | Kind::GlobalThreatFeed) => {
            Model::Metadata(resource.labels())
        }
        _ => return mismatch(key, resource),
    };
    Some(model)
}

fn mismatch(key: &ResourceKey, resource: &Resource) -> Option<Model> {
    warn!(%key, spec = ?resource.spec, "Resource does not match its kind; ignoring");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use queryserver_core::{
        resource::{Rule, WorkloadEndpointSpec},
        ObjectMeta, Selector,
    };

    fn policy(key: ResourceKey, spec: PolicySpec) -> ResourceUpdate {
        let meta = ObjectMeta {
            name: Some(key.name.clone()),
            namespace: key.namespace.clone(),
            ..Default::default()
        };
        ResourceUpdate::new(key, Resource::new(meta, spec))
    }

    fn convert_policy(update: &ResourceUpdate) -> PolicyModel {
        match PolicyConverter.convert(update) {
            Some(Model::Policy(p)) => p,
            m => panic!("expected a policy model, got {m:?}"),
        }
    }

    #[test]
    fn namespaced_policies_are_scoped() {
        let update = policy(
            ResourceKey::namespaced(Kind::NetworkPolicy, "ns-0", "p"),
            PolicySpec {
                selector: "app == 'web'".to_string(),
                ingress: vec![Rule {
                    source: EntityRule {
                        selector: "role == 'db'".to_string(),
                        not_selector: "env == 'test'".to_string(),
                        ..Default::default()
                    },
                    destination: EntityRule {
                        namespace_selector: "env == 'prod'".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let p = convert_policy(&update);
        assert_eq!(p.tier, "default");
        assert_eq!(
            p.selector,
            "projectcalico.org/namespace == \"ns-0\" && (app == 'web')"
        );
        let rule = &p.inbound_rules[0];
        assert_eq!(
            rule.src_selector,
            "projectcalico.org/namespace == \"ns-0\" && (role == 'db')"
        );
        assert_eq!(rule.not_src_selector, "env == 'test'");
        assert_eq!(rule.dst_selector, "(pcns.env == \"prod\")");

        // Every produced selector parses.
        for sel in [&p.selector, &rule.src_selector, &rule.dst_selector] {
            Selector::parse(sel).expect("selector must parse");
        }
    }

    #[test]
    fn global_policies_default_to_all() {
        let update = policy(
            ResourceKey::global(Kind::GlobalNetworkPolicy, "p"),
            PolicySpec {
                tier: Some("security".to_string()),
                order: Some(10.0),
                ..Default::default()
            },
        );
        let p = convert_policy(&update);
        assert_eq!(p.selector, "all()");
        assert_eq!(p.tier, "security");
        assert_eq!(p.order, Some(10.0));

        let update = policy(
            ResourceKey::global(Kind::GlobalNetworkPolicy, "p"),
            PolicySpec {
                selector: "has(app)".to_string(),
                namespace_selector: "team == 'a'".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(
            convert_policy(&update).selector,
            "(pcns.team == \"a\") && (has(app))"
        );
    }

    #[test]
    fn staged_deletions_are_filtered() {
        let update = policy(
            ResourceKey::namespaced(Kind::StagedNetworkPolicy, "ns-0", "p"),
            PolicySpec {
                staged_action: Some(StagedAction::Delete),
                ..Default::default()
            },
        );
        assert_eq!(PolicyConverter.convert(&update), None);

        let update = policy(
            ResourceKey::namespaced(Kind::StagedNetworkPolicy, "ns-0", "p"),
            PolicySpec {
                staged_action: Some(StagedAction::Set),
                ..Default::default()
            },
        );
        assert!(PolicyConverter.convert(&update).is_some());
    }

    #[test]
    fn workload_endpoints_inherit_namespace_and_service_account() {
        let key = ResourceKey::namespaced(Kind::WorkloadEndpoint, "ns-0", "pod-a-eth0");
        let update = ResourceUpdate::new(
            key,
            Resource::new(
                ObjectMeta {
                    labels: Some(btreemap! { "app".to_string() => "web".to_string() }),
                    ..Default::default()
                },
                WorkloadEndpointSpec {
                    orchestrator: "k8s".to_string(),
                    node: "node-0".to_string(),
                    service_account_name: Some("sa".to_string()),
                    profiles: vec!["kns.ns-0".to_string(), "extra".to_string()],
                    ..Default::default()
                },
            ),
        );
        let Some(Model::Labelled(m)) = WorkloadEndpointConverter.convert(&update) else {
            panic!("expected a labelled model");
        };
        assert_eq!(
            m.labels.as_ref(),
            &btreemap! {
                "app".to_string() => "web".to_string(),
                NAMESPACE_LABEL.to_string() => "ns-0".to_string(),
                ORCHESTRATOR_LABEL.to_string() => "k8s".to_string(),
                SERVICE_ACCOUNT_LABEL.to_string() => "sa".to_string(),
            }
        );
        assert_eq!(m.profile_ids, ["kns.ns-0", "ksa.ns-0.sa", "extra"]);
        assert_eq!(m.node.as_deref(), Some("node-0"));
    }

    #[test]
    fn mismatched_specs_are_filtered() {
        let update = ResourceUpdate::new(
            ResourceKey::global(Kind::Tier, "t"),
            Resource::new(ObjectMeta::default(), Spec::Metadata),
        );
        assert_eq!(normalize(&update), None);
    }
}
