//! This module contains the [`Profile`] custom resource.
//!
//! A Profile is a named, prioritized overlay that administrators attach to workloads, either
//! implicitly through a label selector or explicitly by name.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::template::ProfileTemplate;

/// A reusable, prioritized pod configuration overlay.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "scheduler.dbcluster.dev",
    version = "v1beta1",
    kind = "Profile",
    plural = "profiles",
    status = "ProfileStatus",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    ),
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    /// Selects the workloads this profile applies to implicitly.
    /// Without selectors the profile is only applied when requested by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<ProfileSelectors>,

    /// The configuration overlay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<ProfileTemplate>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSelectors {
    /// An empty label selector selects every workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<LabelSelector>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ProfileCondition>,

    /// The validated template that is applied to workloads, absent until the profile is valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<AcceptedTemplate>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedTemplate {
    #[serde(default)]
    pub template: ProfileTemplate,

    /// SHA-256 of the canonical JSON serialization of `template`.
    pub checksum: String,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// A human readable message indicating details about the transition.
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// The reason for the condition's last transition.
    pub reason: Option<String>,
    /// Status of the condition, one of True, False, Unknown.
    pub status: ConditionStatus,
    #[serde(rename = "type")]
    pub type_: ProfileConditionType,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum ProfileConditionType {
    /// The authored template passed validation.
    SpecValid,
    /// The profile can be applied to workloads.
    Ready,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ProfileStatus {
    pub fn condition(&self, type_: ProfileConditionType) -> Option<&ProfileCondition> {
        self.conditions
            .iter()
            .find(|condition| condition.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: ProfileConditionType) -> bool {
        self.condition(type_)
            .is_some_and(|condition| condition.status == ConditionStatus::True)
    }
}

impl Profile {
    /// The label selector used for implicit selection, [`None`] if the profile has no selectors.
    ///
    /// A `selectors` object without a `label` selects everything.
    pub fn label_selector(&self) -> Option<LabelSelector> {
        self.spec
            .selectors
            .as_ref()
            .map(|selectors| selectors.label.clone().unwrap_or_default())
    }

    /// The accepted template, if the profile has been accepted.
    pub fn accepted(&self) -> Option<&AcceptedTemplate> {
        self.status.as_ref()?.accepted.as_ref()
    }

    /// A profile is usable once its `Ready` condition is true and it carries an accepted
    /// template.
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|status| {
            status.is_condition_true(ProfileConditionType::Ready) && status.accepted.is_some()
        })
    }

    pub fn display_name(&self) -> String {
        match self.namespace() {
            Some(namespace) => format!("{namespace}/{name}", name = self.name_any()),
            None => self.name_any(),
        }
    }
}
