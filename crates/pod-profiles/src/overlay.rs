//! Applying templates onto pod templates.
//!
//! Every render stage is an [`Overlay`] over the whole [`PodTemplateSpec`]. Container level
//! templates implement [`ContainerOverlay`] and are lifted into pod overlays by
//! [`AllContainers`], [`NamedContainers`] and [`DefaultContainer`], which decide which
//! containers they touch.
//!
//! Applying is an upsert: a list entry whose identity already exists on the pod replaces that
//! entry in place, any other entry is appended. Maps are applied key by key, scalars overwrite.
//! Affinities and container health checks are merged into the existing value with [`Merge`],
//! and a zero resource quantity removes that resource.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Container, ContainerPort, EnvFromSource, EnvVar, LocalObjectReference, PodSpec,
        PodTemplateSpec, ResourceRequirements, Toleration, VolumeMount,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use snafu::{OptionExt, Snafu};

use crate::{
    config::merge::{self, Merge},
    quantity,
    template::{
        ContainerTemplate, GenericContainerTemplate, NamespaceTemplate, PodTemplate,
        ResourcesTemplate,
    },
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("pod has no containers to apply the default container overlay to"))]
    NoDefaultContainer,
}

/// Something that can be applied onto a pod template.
pub trait Overlay {
    fn apply_to(&self, template: &mut PodTemplateSpec) -> Result<()>;
}

/// Something that can be applied onto a single container.
pub trait ContainerOverlay {
    fn apply_to_container(&self, container: &mut Container);
}

impl Overlay for PodTemplate {
    fn apply_to(&self, template: &mut PodTemplateSpec) -> Result<()> {
        if let Some(metadata) = &self.metadata {
            let target = template.metadata.get_or_insert_with(Default::default);
            apply_map(&mut target.labels, metadata.labels.as_ref());
            apply_map(&mut target.annotations, metadata.annotations.as_ref());
        }

        if !self.touches_spec() {
            return Ok(());
        }
        let spec = template.spec.get_or_insert_with(Default::default);

        if let Some(scheduling) = &self.scheduling {
            apply_map(&mut spec.node_selector, scheduling.node_selector.as_ref());
            apply_merged(&mut spec.affinity, scheduling.affinity.as_ref());
            upsert(
                &mut spec.tolerations,
                scheduling.tolerations.as_deref(),
                toleration_identity,
            );
            apply_scalar(&mut spec.scheduler_name, scheduling.scheduler_name.as_ref());
            apply_scalar(
                &mut spec.priority_class_name,
                scheduling.priority_class_name.as_ref(),
            );
        }

        if let Some(security) = &self.security {
            apply_scalar(
                &mut spec.security_context,
                security.pod_security_context.as_ref(),
            );
        }

        if let Some(service_account) = &self.service_account {
            apply_scalar(
                &mut spec.service_account_name,
                service_account.service_account_name.as_ref(),
            );
            apply_scalar(
                &mut spec.automount_service_account_token,
                service_account.automount_service_account_token.as_ref(),
            );
        }

        if let Some(image) = &self.image {
            let secrets = image.image_pull_secrets.as_ref().map(|names| {
                names
                    .iter()
                    .map(|name| LocalObjectReference { name: name.clone() })
                    .collect::<Vec<_>>()
            });
            upsert(&mut spec.image_pull_secrets, secrets.as_deref(), |secret| {
                secret.name.clone()
            });
        }

        upsert(&mut spec.volumes, self.volumes.as_deref(), |volume| {
            volume.name.clone()
        });

        if let Some(namespace) = &self.namespace {
            apply_namespaces(spec, namespace);
        }

        Ok(())
    }
}

impl PodTemplate {
    fn touches_spec(&self) -> bool {
        self.scheduling.is_some()
            || self.security.is_some()
            || self.service_account.is_some()
            || self.image.is_some()
            || self.volumes.is_some()
            || self.namespace.is_some()
    }
}

fn apply_namespaces(spec: &mut PodSpec, namespace: &NamespaceTemplate) {
    apply_scalar(&mut spec.host_network, namespace.host_network.as_ref());
    apply_scalar(&mut spec.host_pid, namespace.host_pid.as_ref());
    apply_scalar(&mut spec.host_ipc, namespace.host_ipc.as_ref());
    apply_scalar(
        &mut spec.share_process_namespace,
        namespace.share_process_namespace.as_ref(),
    );
}

impl ContainerOverlay for GenericContainerTemplate {
    fn apply_to_container(&self, container: &mut Container) {
        apply_env(&mut container.env, self.env.as_deref());
        apply_env_from(&mut container.env_from, self.env_from.as_deref());
        apply_resources(&mut container.resources, self.resources.as_ref());
        apply_volume_mounts(&mut container.volume_mounts, self.volume_mounts.as_deref());
    }
}

impl ContainerOverlay for ContainerTemplate {
    fn apply_to_container(&self, container: &mut Container) {
        apply_scalar(&mut container.image, self.image.as_ref());
        apply_scalar(&mut container.image_pull_policy, self.image_pull_policy.as_ref());
        apply_scalar(
            &mut container.command,
            self.command.as_ref().map(|command| &command.0),
        );
        apply_scalar(&mut container.args, self.args.as_ref().map(|args| &args.0));
        apply_scalar(&mut container.working_dir, self.working_dir.as_ref());
        apply_env(&mut container.env, self.env.as_deref());
        apply_env_from(&mut container.env_from, self.env_from.as_deref());
        apply_resources(&mut container.resources, self.resources.as_ref());
        apply_volume_mounts(&mut container.volume_mounts, self.volume_mounts.as_deref());
        upsert(&mut container.ports, self.ports.as_deref(), port_identity);
        apply_scalar(&mut container.security_context, self.security_context.as_ref());
        apply_merged(&mut container.liveness_probe, self.liveness_probe.as_ref());
        apply_merged(&mut container.readiness_probe, self.readiness_probe.as_ref());
        apply_merged(&mut container.startup_probe, self.startup_probe.as_ref());
    }
}

/// Applies a container overlay to every container of the pod.
pub struct AllContainers<'a, O>(pub &'a O);

impl<O: ContainerOverlay> Overlay for AllContainers<'_, O> {
    fn apply_to(&self, template: &mut PodTemplateSpec) -> Result<()> {
        for container in containers_mut(template) {
            self.0.apply_to_container(container);
        }
        Ok(())
    }
}

/// Applies container overlays to the containers with matching names.
///
/// Overlays for containers that don't exist are ignored, no containers are created.
pub struct NamedContainers<'a, O>(pub &'a BTreeMap<String, O>);

impl<O: ContainerOverlay> Overlay for NamedContainers<'_, O> {
    fn apply_to(&self, template: &mut PodTemplateSpec) -> Result<()> {
        for container in containers_mut(template) {
            if let Some(overlay) = self.0.get(&container.name) {
                overlay.apply_to_container(container);
            }
        }
        Ok(())
    }
}

/// Applies a container overlay to the first container of the pod.
pub struct DefaultContainer<'a, O>(pub &'a O);

impl<O: ContainerOverlay> Overlay for DefaultContainer<'_, O> {
    fn apply_to(&self, template: &mut PodTemplateSpec) -> Result<()> {
        let container = containers_mut(template)
            .next()
            .context(NoDefaultContainerSnafu)?;
        self.0.apply_to_container(container);
        Ok(())
    }
}

fn containers_mut(template: &mut PodTemplateSpec) -> impl Iterator<Item = &mut Container> {
    template
        .spec
        .iter_mut()
        .flat_map(|spec| spec.containers.iter_mut())
}

fn apply_scalar<T: Clone>(target: &mut Option<T>, overlay: Option<&T>) {
    if let Some(value) = overlay {
        *target = Some(value.clone());
    }
}

/// Merges the overlay into the existing value. An overlay without any field set is ignored.
fn apply_merged<T>(target: &mut Option<T>, overlay: Option<&T>)
where
    T: Merge + Clone + Default + PartialEq,
{
    let Some(overlay) = overlay.filter(|overlay| **overlay != T::default()) else {
        return;
    };
    *target = merge::merge(Some(overlay.clone()), target);
}

fn apply_map<V: Clone>(target: &mut Option<BTreeMap<String, V>>, overlay: Option<&BTreeMap<String, V>>) {
    if let Some(overlay) = overlay {
        target.get_or_insert_with(BTreeMap::new).extend(
            overlay
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
    }
}

/// Replaces entries with the same identity in place and appends the others, in overlay order.
fn upsert<T: Clone, K: PartialEq>(
    target: &mut Option<Vec<T>>,
    overlay: Option<&[T]>,
    identity: impl Fn(&T) -> K,
) {
    let Some(overlay) = overlay else {
        return;
    };
    let target = target.get_or_insert_with(Vec::new);
    for entry in overlay {
        let key = identity(entry);
        match target.iter_mut().find(|existing| identity(existing) == key) {
            Some(existing) => *existing = entry.clone(),
            None => target.push(entry.clone()),
        }
    }
}

fn apply_env(target: &mut Option<Vec<EnvVar>>, overlay: Option<&[EnvVar]>) {
    upsert(target, overlay, |var| var.name.clone());
}

fn apply_env_from(target: &mut Option<Vec<EnvFromSource>>, overlay: Option<&[EnvFromSource]>) {
    upsert(target, overlay, Clone::clone);
}

fn apply_volume_mounts(target: &mut Option<Vec<VolumeMount>>, overlay: Option<&[VolumeMount]>) {
    upsert(target, overlay, |mount| mount.mount_path.clone());
}

/// Applies limits and requests, then raises every limit that ended up below its request.
fn apply_resources(target: &mut Option<ResourceRequirements>, overlay: Option<&ResourcesTemplate>) {
    let Some(overlay) = overlay else {
        return;
    };
    let target = target.get_or_insert_with(Default::default);
    apply_resource_list(&mut target.limits, overlay.limits.as_ref());
    apply_resource_list(&mut target.requests, overlay.requests.as_ref());
    raise_limits_to_requests(target);
}

/// A zero quantity removes the resource, any other quantity sets it.
fn apply_resource_list(
    target: &mut Option<BTreeMap<String, Quantity>>,
    overlay: Option<&BTreeMap<String, Quantity>>,
) {
    let Some(overlay) = overlay.filter(|overlay| !overlay.is_empty()) else {
        return;
    };
    let list = target.get_or_insert_with(BTreeMap::new);
    for (name, value) in overlay {
        if parse_quantity(value).is_some_and(quantity::Quantity::is_zero) {
            list.remove(name);
        } else {
            list.insert(name.clone(), value.clone());
        }
    }
    if list.is_empty() {
        *target = None;
    }
}

/// Only limits that are set are raised, a request never adds a limit.
fn raise_limits_to_requests(resources: &mut ResourceRequirements) {
    let (Some(limits), Some(requests)) = (&mut resources.limits, &resources.requests) else {
        return;
    };
    for (name, request) in requests {
        let Some(limit) = limits.get_mut(name) else {
            continue;
        };
        if let (Some(current), Some(requested)) = (parse_quantity(limit), parse_quantity(request))
            && current < requested
        {
            limit.clone_from(request);
        }
    }
}

/// Unparsable quantities are passed through untouched and never compared.
fn parse_quantity(value: &Quantity) -> Option<quantity::Quantity> {
    quantity::Quantity::try_from(value).ok()
}

/// Tolerations are identified by everything except `tolerationSeconds`. A missing operator
/// means `Equal`.
fn toleration_identity(
    toleration: &Toleration,
) -> (Option<String>, String, Option<String>, Option<String>) {
    (
        toleration.key.clone(),
        toleration
            .operator
            .clone()
            .unwrap_or_else(|| "Equal".to_owned()),
        toleration.value.clone(),
        toleration.effect.clone(),
    )
}

/// Ports are identified by name, unnamed ports by their number.
fn port_identity(port: &ContainerPort) -> String {
    port.name
        .clone()
        .unwrap_or_else(|| port.container_port.to_string())
}
