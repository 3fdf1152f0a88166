//! Existence checks for the deployments pods refer to through their deployment label.

use std::collections::BTreeSet;

use async_trait::async_trait;
use kube::{
    Api, Client,
    core::{ApiResource, DynamicObject, GroupVersionKind},
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up deployment {name:?} in namespace {namespace:?}"))]
    GetDeployment {
        source: kube::Error,
        namespace: String,
        name: String,
    },
}

/// Coordinates of the custom resource that backs a deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl DeploymentResource {
    fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

#[async_trait]
pub trait DeploymentLookup: Send + Sync {
    /// Returns whether the deployment `name` exists in `namespace`.
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// Looks deployments up in the Kubernetes API server.
pub struct KubeDeploymentLookup {
    client: Client,
    api_resource: ApiResource,
}

impl KubeDeploymentLookup {
    pub fn new(client: Client, resource: &DeploymentResource) -> Self {
        Self {
            client,
            api_resource: resource.api_resource(),
        }
    }
}

#[async_trait]
impl DeploymentLookup for KubeDeploymentLookup {
    #[instrument(skip(self))]
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.api_resource);
        let deployment = api
            .get_opt(name)
            .await
            .context(GetDeploymentSnafu { namespace, name })?;
        debug!(found = deployment.is_some(), "looked up deployment");
        Ok(deployment.is_some())
    }
}

/// A fixed set of `(namespace, name)` deployments.
#[derive(Debug, Default)]
pub struct StaticDeploymentLookup {
    deployments: BTreeSet<(String, String)>,
}

impl StaticDeploymentLookup {
    pub fn new<N, D>(deployments: impl IntoIterator<Item = (N, D)>) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Self {
            deployments: deployments
                .into_iter()
                .map(|(namespace, name)| (namespace.into(), name.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl DeploymentLookup for StaticDeploymentLookup {
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .deployments
            .contains(&(namespace.to_owned(), name.to_owned())))
    }
}
