//! Container-level overlay fields of a [`ProfileTemplate`](super::ProfileTemplate).

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{ContainerPort, EnvFromSource, EnvVar, Probe, SecurityContext, VolumeMount},
    apimachinery::pkg::api::resource::Quantity,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::merge::{Atomic, Merge};

/// The container part of a profile, split into three layers.
///
/// The layers are rendered in a fixed order: `all`, then `containers`, then `default`.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileContainerTemplate {
    /// Overlays for individual containers, keyed by exact container name.
    /// Containers that don't exist in the pod are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<BTreeMap<String, ContainerTemplate>>,

    /// Overlay applied to every container of the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<GenericContainerTemplate>,

    /// Overlay applied to the first container of the pod only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ContainerTemplate>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Replaces the container entrypoint as a whole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Atomic<Vec<String>>>,

    /// Replaces the container arguments as a whole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Atomic<Vec<String>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_from: Option<Vec<EnvFromSource>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<ContainerPort>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    /// Health checks are updated field by field. Setting a handler replaces the existing handler,
    /// otherwise the existing one is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,
}

/// The subset of [`ContainerTemplate`] that makes sense for every container of a pod.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericContainerTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_from: Option<Vec<EnvFromSource>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,
}

/// Resource limits and requests, merged per resource name.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, Quantity>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<BTreeMap<String, Quantity>>,
}

impl Merge for Probe {
    fn merge(&mut self, defaults: &Self) {
        let has_handler = self.exec.is_some()
            || self.grpc.is_some()
            || self.http_get.is_some()
            || self.tcp_socket.is_some();
        if !has_handler {
            self.exec.clone_from(&defaults.exec);
            self.grpc.clone_from(&defaults.grpc);
            self.http_get.clone_from(&defaults.http_get);
            self.tcp_socket.clone_from(&defaults.tcp_socket);
        }

        self.failure_threshold.merge(&defaults.failure_threshold);
        self.initial_delay_seconds.merge(&defaults.initial_delay_seconds);
        self.period_seconds.merge(&defaults.period_seconds);
        self.success_threshold.merge(&defaults.success_threshold);
        self.termination_grace_period_seconds
            .merge(&defaults.termination_grace_period_seconds);
        self.timeout_seconds.merge(&defaults.timeout_seconds);
    }
}
