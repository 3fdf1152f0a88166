//! Command line interface of the `pod-profiles` binary.
//!
//! Every option can also be provided through a `POD_PROFILES_` prefixed environment variable.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use k8s_openapi::{
    api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};

use crate::{
    catalog::DEFAULT_PAGE_SIZE,
    webhook::{deployment::DeploymentResource, server::TlsFiles},
};

#[derive(Debug, Parser)]
#[command(
    name = "pod-profiles",
    author,
    version,
    about = "Selects, merges and renders pod profiles onto workloads"
)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Print the Profile CustomResourceDefinition.
    Crd,

    /// Run the pod mutating admission webhook.
    Run(RunArguments),

    /// Render the profiles selected for a workload onto a pod template and print it as YAML.
    Render(RenderArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct CatalogOptions {
    /// Maximum time to spend listing all profiles, e.g. `5s` or `1m`
    #[arg(
        long,
        env = "POD_PROFILES_CATALOG_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub catalog_timeout: Duration,

    /// Number of profiles requested per page when listing the cluster
    #[arg(long, env = "POD_PROFILES_CATALOG_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub catalog_page_size: u32,
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// Lists profiles from this namespace instead of the namespace of each pod
    #[arg(long, env = "POD_PROFILES_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    #[arg(long, env = "POD_PROFILES_BIND_ADDRESS", default_value = "0.0.0.0:8443")]
    pub bind_address: SocketAddr,

    /// PEM encoded certificate chain served by the webhook
    #[arg(long, env = "POD_PROFILES_TLS_CERT", value_name = "FILE")]
    pub tls_cert: PathBuf,

    /// PEM encoded private key of the served certificate
    #[arg(long, env = "POD_PROFILES_TLS_KEY", value_name = "FILE")]
    pub tls_key: PathBuf,

    #[arg(
        long,
        env = "POD_PROFILES_DEPLOYMENT_GROUP",
        default_value = "database.dbcluster.dev"
    )]
    pub deployment_group: String,

    #[arg(long, env = "POD_PROFILES_DEPLOYMENT_VERSION", default_value = "v1")]
    pub deployment_version: String,

    #[arg(
        long,
        env = "POD_PROFILES_DEPLOYMENT_KIND",
        default_value = "DatabaseDeployment"
    )]
    pub deployment_kind: String,

    #[arg(
        long,
        env = "POD_PROFILES_DEPLOYMENT_PLURAL",
        default_value = "databasedeployments"
    )]
    pub deployment_plural: String,

    #[command(flatten)]
    pub catalog: CatalogOptions,
}

impl RunArguments {
    pub fn deployment_resource(&self) -> DeploymentResource {
        DeploymentResource {
            group: self.deployment_group.clone(),
            version: self.deployment_version.clone(),
            kind: self.deployment_kind.clone(),
            plural: self.deployment_plural.clone(),
        }
    }

    pub fn tls_files(&self) -> TlsFiles {
        TlsFiles {
            certificate: self.tls_cert.clone(),
            private_key: self.tls_key.clone(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RenderArguments {
    /// Workload label used for selection, can be repeated
    #[arg(long = "label", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub labels: Vec<(String, String)>,

    /// Environment variable of the workload container, can be repeated
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Explicitly requested profile, can be repeated
    #[arg(long = "profile", value_name = "NAME")]
    pub profiles: Vec<String>,

    /// Name of the workload container
    #[arg(long, default_value = "job")]
    pub container: String,

    /// Image of the workload container
    #[arg(long)]
    pub image: Option<String>,

    #[arg(long, env = "POD_PROFILES_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Multi-document YAML file of profiles to select from instead of the cluster
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Accept profiles from the catalog file that don't carry a status yet
    #[arg(long, requires = "catalog")]
    pub accept: bool,

    #[command(flatten)]
    pub catalog_options: CatalogOptions,
}

impl RenderArguments {
    /// The pod template profiles are rendered onto: a single workload container.
    pub fn base_template(&self) -> PodTemplateSpec {
        let env = self
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..EnvVar::default()
            })
            .collect::<Vec<_>>();

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: (!self.labels.is_empty()).then(|| self.labels.iter().cloned().collect()),
                ..ObjectMeta::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: self.container.clone(),
                    image: self.image.clone(),
                    env: (!env.is_empty()).then_some(env),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
        }
    }
}

fn parse_key_value(input: &str) -> Result<(String, String), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {input:?}"))?;
    if key.is_empty() {
        return Err(format!("empty key in {input:?}"));
    }
    Ok((key.to_owned(), value.to_owned()))
}
