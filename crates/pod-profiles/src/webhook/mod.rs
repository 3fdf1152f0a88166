//! The pod mutating admission webhook.
//!
//! Pods opt in on creation, either by referring to a deployment or by carrying the apply
//! label. The selected profiles are rendered onto the pod, which is then stamped with the
//! applied profile list and their combined checksum. Every failure denies the pod: a pod is
//! never admitted with a partial or unvalidated set of profiles.
//!
//! Stamps already present on an incoming pod are never trusted. Every handled pod is rendered
//! again, which leaves a pod that already carries the selected profiles unchanged.

use std::{sync::Arc, time::Duration};

use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation, jsonptr::PointerBuf};
use k8s_openapi::{
    api::core::v1::{Pod, PodTemplateSpec},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation, SerializePatchError};
use serde::Serialize;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info, instrument, warn};

use crate::{
    catalog::ProfileCatalog,
    constants::{
        APPLIED_ANNOTATION, APPLY_LABEL, CHECKSUM_ANNOTATION, DEPLOYMENT_LABEL, LIST_ANNOTATION,
        PROFILES_KEY,
    },
    render,
    selection::{self, Selection},
    webhook::deployment::DeploymentLookup,
};

pub mod deployment;
pub mod server;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("admission request carries no pod"))]
    MissingPod,

    #[snafu(display("admission request carries no namespace"))]
    MissingNamespace,

    #[snafu(display("failed to check deployment {name:?}"))]
    LookupDeployment {
        source: deployment::Error,
        name: String,
    },

    #[snafu(display("deployment {name:?} does not exist in namespace {namespace:?}"))]
    DeploymentNotFound { name: String, namespace: String },

    #[snafu(display("failed to select profiles"))]
    SelectProfiles { source: selection::Error },

    #[snafu(display("failed to render profiles onto the pod"))]
    RenderPod { source: render::Error },

    #[snafu(display("failed to serialize the rendered {path}"))]
    SerializeField {
        source: serde_json::Error,
        path: String,
    },

    #[snafu(display("failed to serialize patch"))]
    SerializePatch { source: SerializePatchError },
}

/// Everything the mutator needs to handle a request, shared between all requests.
pub struct MutatorContext {
    catalog: Arc<dyn ProfileCatalog>,
    deployments: Arc<dyn DeploymentLookup>,
    catalog_timeout: Duration,
    watch_namespace: Option<String>,
}

impl MutatorContext {
    pub fn new(
        catalog: Arc<dyn ProfileCatalog>,
        deployments: Arc<dyn DeploymentLookup>,
        catalog_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            deployments,
            catalog_timeout,
            watch_namespace: None,
        }
    }

    /// Lists profiles from `namespace` instead of the namespace of each pod.
    pub fn with_watch_namespace(mut self, namespace: Option<String>) -> Self {
        self.watch_namespace = namespace;
        self
    }

    /// Computes the patch for a pod that [`can_handle`] accepted.
    pub async fn patch_for(&self, request: &AdmissionRequest<Pod>) -> Result<Patch> {
        let pod = request.object.as_ref().context(MissingPodSnafu)?;
        let namespace = request
            .namespace
            .as_deref()
            .or(pod.metadata.namespace.as_deref())
            .context(MissingNamespaceSnafu)?;
        let labels = pod.metadata.labels.clone().unwrap_or_default();

        if let Some(name) = labels.get(DEPLOYMENT_LABEL) {
            let exists = self
                .deployments
                .exists(namespace, name)
                .await
                .context(LookupDeploymentSnafu { name })?;
            ensure!(exists, DeploymentNotFoundSnafu { name, namespace });
        }

        let selection = selection::select(
            self.catalog.as_ref(),
            self.watch_namespace.as_deref().unwrap_or(namespace),
            &labels,
            &requested_profiles(&pod.metadata),
            self.catalog_timeout,
        )
        .await
        .context(SelectProfilesSnafu)?;

        let base = PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: pod.metadata.labels.clone(),
                annotations: pod.metadata.annotations.clone(),
                ..ObjectMeta::default()
            }),
            spec: pod.spec.clone(),
        };
        let ranked = selection.templates().collect::<Vec<_>>();
        let mut rendered = render::render(&base, &ranked, &[]).context(RenderPodSnafu)?;
        stamp(&mut rendered, &selection);

        info!(
            profiles = %selection.names().join(","),
            checksum = %selection.checksum,
            "rendered profiles onto pod"
        );
        build_patch(pod, rendered)
    }
}

/// Handles a single admission request for a pod.
///
/// Requests the mutator has no opinion on are allowed untouched, every error is turned into a
/// denial carrying the full error chain.
#[instrument(
    name = "mutate_pod",
    skip_all,
    fields(
        request.uid = %request.uid,
        pod.name = %request.name,
        k8s.namespace = request.namespace.as_deref().unwrap_or_default(),
    )
)]
pub async fn mutate_pod(
    context: Arc<MutatorContext>,
    request: AdmissionRequest<Pod>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(&request);
    if !can_handle(&request) {
        debug!("skipping pod that did not opt in");
        return response;
    }

    let result = match context.patch_for(&request).await {
        Ok(patch) => response.clone().with_patch(patch).context(SerializePatchSnafu),
        Err(error) => Err(error),
    };

    result.unwrap_or_else(|error| {
        let reason = full_message(&error);
        warn!(%reason, "denying pod");
        response.deny(reason)
    })
}

/// Whether the mutator has an opinion on the request: only newly created pods that refer to a
/// deployment or carry the apply label are handled.
pub fn can_handle(request: &AdmissionRequest<Pod>) -> bool {
    if !matches!(request.operation, Operation::Create) {
        return false;
    }

    request
        .object
        .as_ref()
        .and_then(|pod| pod.metadata.labels.as_ref())
        .is_some_and(|labels| {
            labels.contains_key(DEPLOYMENT_LABEL) || labels.contains_key(APPLY_LABEL)
        })
}

/// The explicitly requested profile names from both the profiles label and annotation.
///
/// Both hold comma-separated lists. Names are trimmed, empty entries dropped and duplicates
/// removed, keeping the first occurrence.
pub fn requested_profiles(metadata: &ObjectMeta) -> Vec<String> {
    let lists = [metadata.labels.as_ref(), metadata.annotations.as_ref()]
        .into_iter()
        .flatten()
        .filter_map(|map| map.get(PROFILES_KEY));

    let mut names: Vec<String> = Vec::new();
    for name in lists
        .flat_map(|list| list.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_owned());
        }
    }
    names
}

fn stamp(rendered: &mut PodTemplateSpec, selection: &Selection) {
    let annotations = rendered
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .annotations
        .get_or_insert_with(Default::default);

    annotations.insert(APPLIED_ANNOTATION.to_owned(), "true".to_owned());
    annotations.insert(CHECKSUM_ANNOTATION.to_owned(), selection.checksum.clone());
    annotations.insert(LIST_ANNOTATION.to_owned(), selection.names().join(","));
}

/// Replaces labels, annotations and spec of the pod wholesale with the rendered values.
fn build_patch(pod: &Pod, rendered: PodTemplateSpec) -> Result<Patch> {
    let metadata = rendered.metadata.unwrap_or_default();

    Ok(Patch(vec![
        whole_field(
            &["metadata", "labels"],
            pod.metadata.labels.is_some(),
            &metadata.labels.unwrap_or_default(),
        )?,
        whole_field(
            &["metadata", "annotations"],
            pod.metadata.annotations.is_some(),
            &metadata.annotations.unwrap_or_default(),
        )?,
        whole_field(
            &["spec"],
            pod.spec.is_some(),
            &rendered.spec.unwrap_or_default(),
        )?,
    ]))
}

// A replace on a missing member is rejected, so those are added instead
fn whole_field(path: &[&str], exists: bool, value: &impl Serialize) -> Result<PatchOperation> {
    let value = serde_json::to_value(value).with_context(|_| SerializeFieldSnafu {
        path: path.join("."),
    })?;
    let path = PointerBuf::from_tokens(path.iter().copied());

    Ok(if exists {
        PatchOperation::Replace(ReplaceOperation { path, value })
    } else {
        PatchOperation::Add(AddOperation { path, value })
    })
}

fn full_message(error: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(error), |error| error.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}
