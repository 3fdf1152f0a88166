//! Selection and ranking of the profiles that apply to a workload.
//!
//! Profiles are picked up implicitly when their selector matches the workload labels, or
//! explicitly by name. Explicit references are a hard requirement: a missing profile fails the
//! selection, while a selector that matches nothing simply contributes nothing. Every selected
//! profile must be ready, partial application is never allowed.

use std::{cmp::Ordering, collections::BTreeMap, time::Duration};

use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument, warn};

use crate::{
    catalog::{self, ProfileCatalog},
    checksum::combined_checksum,
    crd::profile::Profile,
    selector,
    template::{Priority, ProfileTemplate},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list profiles from the catalog"))]
    ListProfiles { source: catalog::Error },

    #[snafu(display("profile {name:?} is missing"))]
    ProfileMissing { name: String },

    #[snafu(display("profile {name:?} is not ready"))]
    ProfileNotReady { name: String },
}

impl Error {
    /// Whether the selection may succeed when retried later, without any change to the inputs.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ListProfiles { source } => source.is_retryable(),
            Self::ProfileMissing { .. } | Self::ProfileNotReady { .. } => false,
        }
    }
}

/// A selected profile, reduced to what is needed to render and stamp it.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedProfile {
    pub name: String,
    pub priority: Priority,
    pub template: ProfileTemplate,
    pub checksum: String,
}

/// The result of a selection: the applied profiles ordered by descending priority, and the
/// combined checksum over their accepted checksums in that order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selection {
    pub profiles: Vec<AppliedProfile>,
    pub checksum: String,
}

impl Selection {
    pub fn names(&self) -> Vec<&str> {
        self.profiles
            .iter()
            .map(|profile| profile.name.as_str())
            .collect()
    }

    pub fn templates(&self) -> impl DoubleEndedIterator<Item = &ProfileTemplate> {
        self.profiles.iter().map(|profile| &profile.template)
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Lists the catalog and selects the profiles for a workload, see [`select_profiles`].
#[instrument(skip(catalog, labels), fields(profiles.selected = tracing::field::Empty))]
pub async fn select(
    catalog: &dyn ProfileCatalog,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    explicit_names: &[String],
    timeout: Duration,
) -> Result<Selection> {
    let profiles = catalog::list_all(catalog, namespace, timeout)
        .await
        .context(ListProfilesSnafu)?;
    let selection = select_profiles(&profiles, labels, explicit_names)?;
    tracing::Span::current().record("profiles.selected", selection.names().join(",").as_str());
    Ok(selection)
}

/// Selects and ranks the profiles for a workload from a snapshot of the catalog.
///
/// Profiles with a template whose selector matches `labels` are selected implicitly, profiles
/// named in `explicit_names` are selected regardless of their selector. Duplicates are dropped,
/// and the result is ordered by descending priority, then descending name, then descending
/// creation time. Repeated calls with the same inputs produce identical results.
pub fn select_profiles(
    profiles: &[Profile],
    labels: &BTreeMap<String, String>,
    explicit_names: &[String],
) -> Result<Selection> {
    let implicit = profiles
        .iter()
        .filter(|profile| profile.spec.template.is_some())
        .filter(|profile| matches_implicitly(profile, labels));

    let explicit = explicit_names
        .iter()
        .map(|name| {
            profiles
                .iter()
                .find(|profile| profile.name_any() == *name)
                .ok_or_else(|| ProfileMissingSnafu { name }.build())
        })
        .collect::<Result<Vec<_>>>()?;

    let mut selected: Vec<&Profile> = Vec::new();
    for profile in implicit.chain(explicit) {
        if !selected.iter().any(|s| s.name_any() == profile.name_any()) {
            selected.push(profile);
        }
    }

    let mut applied = selected
        .into_iter()
        .map(|profile| {
            let name = profile.name_any();
            match profile.accepted() {
                Some(accepted) if profile.is_ready() => Ok((
                    profile,
                    AppliedProfile {
                        priority: accepted.template.priority,
                        template: accepted.template.clone(),
                        checksum: accepted.checksum.clone(),
                        name,
                    },
                )),
                _ => ProfileNotReadySnafu { name }.fail(),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    applied.sort_by(|(a_profile, a), (b_profile, b)| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.name.cmp(&a.name))
            .then_with(|| newest_first(a_profile, b_profile))
    });

    let profiles = applied
        .into_iter()
        .map(|(_, applied)| applied)
        .collect::<Vec<_>>();
    let checksum = combined_checksum(profiles.iter().map(|profile| profile.checksum.as_str()));
    debug!(
        profiles.count = profiles.len(),
        checksum = %checksum,
        "selected profiles"
    );

    Ok(Selection { profiles, checksum })
}

fn matches_implicitly(profile: &Profile, labels: &BTreeMap<String, String>) -> bool {
    let selector = profile.label_selector();
    match selector::select(selector.as_ref(), labels) {
        Ok(matched) => matched,
        Err(error) => {
            warn!(
                profile = %profile.display_name(),
                error = &error as &dyn std::error::Error,
                "ignoring profile with invalid selector"
            );
            false
        }
    }
}

/// Orders newer profiles first, profiles without a creation timestamp last.
fn newest_first(a: &Profile, b: &Profile) -> Ordering {
    match (
        a.metadata.creation_timestamp.as_ref(),
        b.metadata.creation_timestamp.as_ref(),
    ) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use indoc::formatdoc;
    use rstest::rstest;

    use super::*;
    use crate::{catalog::StaticCatalog, checksum};

    /// Builds an accepted, ready profile from a YAML spec.
    pub(crate) fn ready_profile(name: &str, spec: &str) -> Profile {
        let mut profile: Profile = serde_yaml::from_str(&formatdoc! {"
            apiVersion: scheduler.dbcluster.dev/v1beta1
            kind: Profile
            metadata:
              name: {name}
            spec: {spec}
        "})
        .expect("invalid test profile");
        profile.status = Some(checksum::accept(&profile.spec).expect("test profile must be accepted"));
        assert!(profile.is_ready(), "test profile {name} must be valid");
        profile
    }

    pub(crate) fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    fn base_and_override() -> Vec<Profile> {
        vec![
            ready_profile(
                "base",
                "{selectors: {label: {}}, template: {container: {default: {image: 'ubuntu:20.04'}}}}",
            ),
            ready_profile(
                "override",
                "{selectors: {label: {matchLabels: {type: training}}}, template: {priority: 5, container: {default: {image: 'ubuntu:22.04'}}}}",
            ),
        ]
    }

    #[test]
    fn selects_by_priority() {
        let selection =
            select_profiles(&base_and_override(), &labels(&[("type", "training")]), &[]).unwrap();
        assert_eq!(selection.names(), vec!["override", "base"]);
    }

    #[rstest]
    #[case(&[])]
    #[case(&[("type", "serving")])]
    fn select_all_profile_matches_any_labels(#[case] pairs: &[(&str, &str)]) {
        let selection = select_profiles(&base_and_override(), &labels(pairs), &[]).unwrap();
        assert_eq!(selection.names(), vec!["base"]);
    }

    #[test]
    fn profiles_without_selector_or_template_are_not_selected_implicitly() {
        let profiles = vec![
            ready_profile("no-selector", "{template: {priority: 1}}"),
            ready_profile("no-template", "{selectors: {label: {}}}"),
        ];
        let selection = select_profiles(&profiles, &labels(&[]), &[]).unwrap();
        assert!(selection.is_empty());
        assert_eq!(selection.checksum, checksum::sha256_hex(""));

        // Both can still be requested by name
        let selection =
            select_profiles(&profiles, &labels(&[]), &names(&["no-template", "no-selector"]))
                .unwrap();
        assert_eq!(selection.names(), vec!["no-template", "no-selector"]);
    }

    #[test]
    fn explicit_missing_is_fatal() {
        let error = select_profiles(&[], &labels(&[]), &names(&["ghost"])).unwrap_err();
        assert!(matches!(&error, Error::ProfileMissing { name } if name == "ghost"));
        assert!(error.to_string().contains("ghost"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn explicit_and_implicit_are_deduplicated() {
        let selection = select_profiles(
            &base_and_override(),
            &labels(&[("type", "training")]),
            &names(&["base", "override", "base"]),
        )
        .unwrap();
        assert_eq!(selection.names(), vec!["override", "base"]);
    }

    #[test]
    fn not_ready_profile_is_fatal() {
        let mut profiles = base_and_override();
        profiles[0].status = None;

        let error = select_profiles(&profiles, &labels(&[]), &[]).unwrap_err();
        assert!(matches!(&error, Error::ProfileNotReady { name } if name == "base"));

        // Unselected profiles don't need to be ready
        let mut profiles = base_and_override();
        profiles[1].status = None;
        assert!(select_profiles(&profiles, &labels(&[]), &[]).is_ok());
    }

    #[test]
    fn equal_priorities_are_ordered_by_descending_name() {
        let profiles = vec![
            ready_profile("test", "{selectors: {label: {}}, template: {}}"),
            ready_profile("test2", "{selectors: {label: {}}, template: {}}"),
            ready_profile("a", "{selectors: {label: {}}, template: {}}"),
        ];
        let selection = select_profiles(&profiles, &labels(&[]), &[]).unwrap();
        assert_eq!(selection.names(), vec!["test2", "test", "a"]);
    }

    #[test]
    fn newest_first_puts_missing_timestamps_last() {
        let mut old = ready_profile("old", "{}");
        old.metadata.creation_timestamp =
            serde_json::from_str("\"2024-01-01T00:00:00Z\"").unwrap();
        let mut new = ready_profile("new", "{}");
        new.metadata.creation_timestamp =
            serde_json::from_str("\"2025-01-01T00:00:00Z\"").unwrap();
        let none = ready_profile("none", "{}");

        assert_eq!(newest_first(&new, &old), Ordering::Less);
        assert_eq!(newest_first(&old, &new), Ordering::Greater);
        assert_eq!(newest_first(&old, &none), Ordering::Less);
        assert_eq!(newest_first(&none, &none), Ordering::Equal);
    }

    #[test]
    fn selection_is_deterministic() {
        let mut profiles = base_and_override();
        profiles.push(ready_profile(
            "gpu",
            "{selectors: {label: {matchExpressions: [{key: type, operator: Exists}]}}, template: {priority: 5}}",
        ));
        let labels = labels(&[("type", "training")]);

        let first = select_profiles(&profiles, &labels, &[]).unwrap();
        profiles.reverse();
        let second = select_profiles(&profiles, &labels, &[]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.names(), vec!["override", "gpu", "base"]);
    }

    #[test]
    fn checksum_follows_order() {
        let a = ready_profile("a", "{selectors: {label: {}}, template: {priority: 1, pod: {volumes: [{name: a}]}}}");
        let b = ready_profile("b", "{selectors: {label: {}}, template: {priority: 2, pod: {volumes: [{name: b}]}}}");
        let b_low = ready_profile("b", "{selectors: {label: {}}, template: {priority: 0, pod: {volumes: [{name: b}]}}}");

        let ba = select_profiles(&[a.clone(), b], &labels(&[]), &[]).unwrap();
        let ab = select_profiles(&[a.clone(), b_low], &labels(&[]), &[]).unwrap();
        assert_eq!(ba.names(), vec!["b", "a"]);
        assert_eq!(ab.names(), vec!["a", "b"]);
        assert_ne!(ba.checksum, ab.checksum);
        assert_eq!(
            ba.checksum,
            combined_checksum(ba.profiles.iter().map(|p| p.checksum.as_str()))
        );
    }

    #[test]
    fn invalid_selector_is_skipped() {
        let mut broken = ready_profile("broken", "{selectors: {label: {}}, template: {}}");
        broken.spec.selectors = serde_yaml::from_str(
            "{label: {matchExpressions: [{key: a, operator: Maybe}]}}",
        )
        .unwrap();
        let selection = select_profiles(&[broken], &labels(&[("a", "b")]), &[]).unwrap();
        assert!(selection.is_empty());
    }

    #[tokio::test]
    async fn select_lists_the_catalog() {
        let catalog = StaticCatalog::new(base_and_override()).with_page_size(1);
        let selection = select(
            &catalog,
            "default",
            &labels(&[("type", "training")]),
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(selection.names(), vec!["override", "base"]);
    }
}
