//! Pod-level overlay fields of a [`ProfileTemplate`](super::ProfileTemplate).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorTerm, PodAffinity, PodAntiAffinity,
    PodSecurityContext, Toleration, Volume,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::merge::{self, Merge, merge_distinct};

/// Everything a profile can change on the pod itself, outside of its containers.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<SchedulingTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<ServiceAccountTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageTemplate>,

    /// Volumes added to the pod. A volume with the name of an existing volume replaces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceTemplate>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Affinity terms are added to the terms of the pod. Required node selector terms are
    /// combined with every existing term, as all of them must hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Tolerations are identified by key, operator, value and effect. A toleration with the
    /// identity of an existing one replaces it, which updates its `tolerationSeconds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTemplate {
    /// Names of secrets used to pull images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<String>>,
}

/// Linux namespaces shared with the host or between the containers of the pod.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,

    #[serde(default, rename = "hostPID", skip_serializing_if = "Option::is_none")]
    pub host_pid: Option<bool>,

    #[serde(default, rename = "hostIPC", skip_serializing_if = "Option::is_none")]
    pub host_ipc: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_process_namespace: Option<bool>,
}

impl Merge for Affinity {
    fn merge(&mut self, defaults: &Self) {
        self.node_affinity.merge(&defaults.node_affinity);
        self.pod_affinity.merge(&defaults.pod_affinity);
        self.pod_anti_affinity.merge(&defaults.pod_anti_affinity);
    }
}

impl Merge for PodAffinity {
    fn merge(&mut self, defaults: &Self) {
        merge_distinct(
            &mut self.required_during_scheduling_ignored_during_execution,
            defaults.required_during_scheduling_ignored_during_execution.as_deref(),
        );
        merge_distinct(
            &mut self.preferred_during_scheduling_ignored_during_execution,
            defaults.preferred_during_scheduling_ignored_during_execution.as_deref(),
        );
    }
}

impl Merge for PodAntiAffinity {
    fn merge(&mut self, defaults: &Self) {
        merge_distinct(
            &mut self.required_during_scheduling_ignored_during_execution,
            defaults.required_during_scheduling_ignored_during_execution.as_deref(),
        );
        merge_distinct(
            &mut self.preferred_during_scheduling_ignored_during_execution,
            defaults.preferred_during_scheduling_ignored_during_execution.as_deref(),
        );
    }
}

impl Merge for NodeAffinity {
    fn merge(&mut self, defaults: &Self) {
        self.required_during_scheduling_ignored_during_execution
            .merge(&defaults.required_during_scheduling_ignored_during_execution);
        merge_distinct(
            &mut self.preferred_during_scheduling_ignored_during_execution,
            defaults.preferred_during_scheduling_ignored_during_execution.as_deref(),
        );
    }
}

/// Node selector terms are ORed, so requiring both selectors means requiring every pair of
/// terms at once: the result holds one combined term per pair, `defaults` terms outermost.
/// A `defaults` term that already contains one of the terms of `self` satisfies both selectors
/// and is kept as it is.
impl Merge for NodeSelector {
    fn merge(&mut self, defaults: &Self) {
        if defaults.node_selector_terms.is_empty() {
            return;
        }
        if self.node_selector_terms.is_empty() {
            self.node_selector_terms = defaults.node_selector_terms.clone();
            return;
        }

        let combined = defaults
            .node_selector_terms
            .iter()
            .flat_map(|defaults_term| {
                if self
                    .node_selector_terms
                    .iter()
                    .any(|term| is_contained_in(term, defaults_term))
                {
                    return vec![defaults_term.clone()];
                }
                self.node_selector_terms
                    .iter()
                    .map(|term| merge::merge(term.clone(), defaults_term))
                    .collect()
            })
            .collect::<Vec<_>>();
        self.node_selector_terms = combined;
    }
}

/// Whether every requirement of `term` is also a requirement of `other`.
fn is_contained_in(term: &NodeSelectorTerm, other: &NodeSelectorTerm) -> bool {
    fn subset<T: PartialEq>(entries: Option<&[T]>, other: Option<&[T]>) -> bool {
        let other = other.unwrap_or_default();
        entries.unwrap_or_default().iter().all(|entry| other.contains(entry))
    }
    subset(
        term.match_expressions.as_deref(),
        other.match_expressions.as_deref(),
    ) && subset(term.match_fields.as_deref(), other.match_fields.as_deref())
}

impl Merge for NodeSelectorTerm {
    fn merge(&mut self, defaults: &Self) {
        merge_distinct(&mut self.match_expressions, defaults.match_expressions.as_deref());
        merge_distinct(&mut self.match_fields, defaults.match_fields.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn affinity(yaml: &str) -> Affinity {
        serde_yaml::from_str(yaml).expect("invalid test affinity")
    }

    fn topology_keys(affinity: &Affinity) -> Vec<&str> {
        affinity
            .pod_affinity
            .iter()
            .flat_map(|pod| pod.required_during_scheduling_ignored_during_execution.iter())
            .flatten()
            .map(|term| term.topology_key.as_str())
            .collect()
    }

    fn node_term_keys(affinity: &Affinity) -> Vec<Vec<&str>> {
        affinity
            .node_affinity
            .iter()
            .flat_map(|node| node.required_during_scheduling_ignored_during_execution.iter())
            .flat_map(|selector| selector.node_selector_terms.iter())
            .map(|term| {
                term.match_expressions
                    .iter()
                    .flatten()
                    .map(|requirement| requirement.key.as_str())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn pod_affinity_terms_are_concatenated() {
        let merged = merge::merge(
            affinity(indoc! {"
                podAffinity:
                  requiredDuringSchedulingIgnoredDuringExecution:
                    - topologyKey: rack
                  preferredDuringSchedulingIgnoredDuringExecution:
                    - weight: 1
                      podAffinityTerm: {topologyKey: rack}
            "}),
            &affinity(indoc! {"
                podAffinity:
                  requiredDuringSchedulingIgnoredDuringExecution:
                    - topologyKey: zone
                  preferredDuringSchedulingIgnoredDuringExecution:
                    - weight: 1
                      podAffinityTerm: {topologyKey: zone}
            "}),
        );

        assert_eq!(topology_keys(&merged), vec!["zone", "rack"]);
        let preferred = merged
            .pod_affinity
            .as_ref()
            .and_then(|pod| pod.preferred_during_scheduling_ignored_during_execution.as_ref())
            .unwrap();
        assert_eq!(preferred.len(), 2);
    }

    #[test]
    fn empty_pod_affinity_keeps_existing_terms() {
        let merged = merge::merge(
            affinity("podAntiAffinity: {}"),
            &affinity(indoc! {"
                podAntiAffinity:
                  requiredDuringSchedulingIgnoredDuringExecution:
                    - topologyKey: host
            "}),
        );

        let required = merged
            .pod_anti_affinity
            .and_then(|pod| pod.required_during_scheduling_ignored_during_execution)
            .unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0].topology_key, "host");
    }

    #[test]
    fn required_node_terms_are_combined_pairwise() {
        let merged = merge::merge(
            affinity(indoc! {"
                nodeAffinity:
                  requiredDuringSchedulingIgnoredDuringExecution:
                    nodeSelectorTerms:
                      - matchExpressions: [{key: term3, operator: Exists}]
                      - matchExpressions: [{key: term4, operator: Exists}]
                  preferredDuringSchedulingIgnoredDuringExecution:
                    - weight: 1
                      preference:
                        matchExpressions: [{key: term3, operator: Exists}]
            "}),
            &affinity(indoc! {"
                nodeAffinity:
                  requiredDuringSchedulingIgnoredDuringExecution:
                    nodeSelectorTerms:
                      - matchExpressions: [{key: term1, operator: Exists}]
                      - matchExpressions: [{key: term2, operator: Exists}]
                  preferredDuringSchedulingIgnoredDuringExecution:
                    - weight: 1
                      preference:
                        matchExpressions: [{key: term1, operator: Exists}]
            "}),
        );

        assert_eq!(
            node_term_keys(&merged),
            vec![
                vec!["term1", "term3"],
                vec!["term1", "term4"],
                vec!["term2", "term3"],
                vec!["term2", "term4"],
            ]
        );
        let preferred = merged
            .node_affinity
            .and_then(|node| node.preferred_during_scheduling_ignored_during_execution)
            .unwrap();
        assert_eq!(preferred.len(), 2);
    }

    #[test]
    fn node_terms_that_already_hold_are_kept() {
        let overlay = affinity(indoc! {"
            nodeAffinity:
              requiredDuringSchedulingIgnoredDuringExecution:
                nodeSelectorTerms:
                  - matchExpressions: [{key: term3, operator: Exists}]
                  - matchExpressions: [{key: term4, operator: Exists}]
        "});
        let once = merge::merge(
            overlay.clone(),
            &affinity(indoc! {"
                nodeAffinity:
                  requiredDuringSchedulingIgnoredDuringExecution:
                    nodeSelectorTerms:
                      - matchExpressions: [{key: term1, operator: Exists}]
                      - matchExpressions: [{key: term2, operator: Exists}]
            "}),
        );
        let twice = merge::merge(overlay, &once);

        assert_eq!(node_term_keys(&twice).len(), 4);
        assert_eq!(twice, once);
    }

    #[test]
    fn merging_an_affinity_into_itself_is_stable() {
        let original = affinity(indoc! {"
            nodeAffinity:
              requiredDuringSchedulingIgnoredDuringExecution:
                nodeSelectorTerms:
                  - matchExpressions: [{key: gpu, operator: Exists}]
            podAffinity:
              requiredDuringSchedulingIgnoredDuringExecution:
                - topologyKey: zone
        "});

        assert_eq!(merge::merge(original.clone(), &original), original);
    }
}
