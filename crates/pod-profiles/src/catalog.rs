//! Read access to the [`Profile`]s available for selection.
//!
//! The catalog is listed page by page. [`list_all`] follows continuation tokens until the last
//! page and bounds the whole listing with a timeout. Both a failed page and a timeout are
//! reported as retryable errors, distinct from a profile that simply doesn't exist.

use std::time::Duration;

use async_trait::async_trait;
use kube::{Api, Client, ResourceExt, api::ListParams};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{checksum, crd::profile::Profile};

pub const DEFAULT_PAGE_SIZE: u32 = 100;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list profiles in namespace {namespace:?}"))]
    ListProfiles {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("listing profiles in namespace {namespace:?} timed out after {timeout:?}"))]
    Timeout {
        source: tokio::time::error::Elapsed,
        namespace: String,
        timeout: Duration,
    },

    #[snafu(display("failed to parse profile catalog"))]
    ParseProfiles { source: serde_yaml::Error },

    #[snafu(display("failed to accept profile {name:?}"))]
    AcceptProfile {
        source: checksum::Error,
        name: String,
    },
}

impl Error {
    /// Whether the operation may succeed when retried later, without any change to the inputs.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ListProfiles { .. } | Self::Timeout { .. } => true,
            Self::ParseProfiles { .. } | Self::AcceptProfile { .. } => false,
        }
    }
}

/// One page of a profile listing.
#[derive(Debug, Default)]
pub struct ProfilePage {
    pub items: Vec<Profile>,

    /// Token to request the next page with, [`None`] on the last page.
    pub continue_token: Option<String>,
}

/// A listable collection of [`Profile`]s.
#[async_trait]
pub trait ProfileCatalog: Send + Sync {
    async fn list_page(&self, namespace: &str, continue_token: Option<&str>)
    -> Result<ProfilePage>;
}

/// Lists every profile in `namespace`, following continuation tokens.
///
/// Fails with [`Error::Timeout`] if the listing as a whole takes longer than `timeout`.
#[instrument(skip(catalog), fields(profiles.count = tracing::field::Empty))]
pub async fn list_all(
    catalog: &dyn ProfileCatalog,
    namespace: &str,
    timeout: Duration,
) -> Result<Vec<Profile>> {
    let profiles = tokio::time::timeout(timeout, async {
        let mut profiles = Vec::new();
        let mut continue_token = None;
        loop {
            let page = catalog
                .list_page(namespace, continue_token.as_deref())
                .await?;
            profiles.extend(page.items);
            match page.continue_token {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }
        Ok::<_, Error>(profiles)
    })
    .await
    .context(TimeoutSnafu { namespace, timeout })??;

    tracing::Span::current().record("profiles.count", profiles.len());
    Ok(profiles)
}

/// Lists profiles from the Kubernetes API server.
pub struct KubeCatalog {
    client: Client,
    page_size: u32,
}

impl KubeCatalog {
    pub fn new(client: Client, page_size: u32) -> Self {
        Self { client, page_size }
    }
}

#[async_trait]
impl ProfileCatalog for KubeCatalog {
    async fn list_page(
        &self,
        namespace: &str,
        continue_token: Option<&str>,
    ) -> Result<ProfilePage> {
        let api: Api<Profile> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default().limit(self.page_size);
        if let Some(token) = continue_token {
            params = params.continue_token(token);
        }

        let list = api
            .list(&params)
            .await
            .context(ListProfilesSnafu { namespace })?;
        debug!(
            profiles.count = list.items.len(),
            has_more = list.metadata.continue_.is_some(),
            "listed page of profiles"
        );

        Ok(ProfilePage {
            items: list.items,
            continue_token: list.metadata.continue_,
        })
    }
}

/// An in-memory catalog, used for file based rendering and in tests.
///
/// Profiles without a namespace are visible in every namespace.
#[derive(Debug)]
pub struct StaticCatalog {
    profiles: Vec<Profile>,
    page_size: usize,
}

impl StaticCatalog {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self {
            profiles,
            page_size: DEFAULT_PAGE_SIZE as usize,
        }
    }

    /// Parses a multi-document YAML stream of profiles.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let profiles = serde_yaml::Deserializer::from_str(yaml)
            .map(Profile::deserialize)
            .collect::<Result<Vec<_>, _>>()
            .context(ParseProfilesSnafu)?;
        Ok(Self::new(profiles))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Runs acceptance for every profile that doesn't carry a status yet.
    pub fn accept_missing(&mut self) -> Result<()> {
        for profile in self.profiles.iter_mut().filter(|p| p.status.is_none()) {
            let status = checksum::accept(&profile.spec).context(AcceptProfileSnafu {
                name: profile.name_any(),
            })?;
            profile.status = Some(status);
        }
        Ok(())
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ProfileCatalog for StaticCatalog {
    async fn list_page(
        &self,
        namespace: &str,
        continue_token: Option<&str>,
    ) -> Result<ProfilePage> {
        let visible = self
            .profiles
            .iter()
            .filter(|profile| profile.namespace().is_none_or(|ns| ns == namespace))
            .collect::<Vec<_>>();

        // Tokens are offsets into the visible profiles
        let offset = continue_token
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or_default();
        let end = visible.len().min(offset.saturating_add(self.page_size));

        Ok(ProfilePage {
            items: visible
                .get(offset..end)
                .unwrap_or_default()
                .iter()
                .map(|profile| (*profile).clone())
                .collect(),
            continue_token: (end < visible.len()).then(|| end.to_string()),
        })
    }
}
