//! The mergeable configuration carried by a profile.
//!
//! A [`ProfileTemplate`] is a partially specified overlay: every field is optional, and an
//! unset field never clobbers a value contributed by a lower priority template. Templates are
//! combined with [`Merge`], and a priority ordered list of templates is combined with
//! [`reduce_ranked`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    config::merge::{self, Merge},
    validation::{self, is_rfc_1123_label, no_duplicates, validate_all_nested},
};

mod container;
mod pod;

pub use container::*;
pub use pod::*;

/// Ordering key of a template. Higher priorities are applied later and win conflicts.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

impl Merge for Priority {
    fn merge(&mut self, defaults: &Self) {
        self.0 = self.0.max(defaults.0);
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Merge, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileTemplate {
    /// Templates with a higher priority are applied last, and win conflicts. Defaults to 0.
    #[serde(default, skip_serializing_if = "Priority::is_default")]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ProfileContainerTemplate>,
}

impl ProfileTemplate {
    /// Checks that the template can be rendered onto a pod: container names must be valid
    /// Kubernetes names, and no list may contain two entries with the same identity.
    pub fn validate(&self) -> Result<(), validation::Errors> {
        let mut checks = Vec::new();

        if let Some(pod) = &self.pod {
            checks.push(no_duplicates(
                "pod.volumes",
                pod.volumes.iter().flatten().map(|volume| volume.name.as_str()),
            ));
        }

        if let Some(container) = &self.container {
            for (name, template) in container.containers.iter().flatten() {
                checks.push(is_rfc_1123_label("container.containers", name));
                checks.extend(validate_container_lists(
                    &format!("container.containers[{name}]"),
                    template.env.as_deref(),
                    template.volume_mounts.as_deref(),
                ));
            }
            if let Some(all) = &container.all {
                checks.extend(validate_container_lists(
                    "container.all",
                    all.env.as_deref(),
                    all.volume_mounts.as_deref(),
                ));
            }
            if let Some(default) = &container.default {
                checks.extend(validate_container_lists(
                    "container.default",
                    default.env.as_deref(),
                    default.volume_mounts.as_deref(),
                ));
            }
        }

        validate_all_nested(checks)
    }
}

fn validate_container_lists(
    path: &str,
    env: Option<&[k8s_openapi::api::core::v1::EnvVar]>,
    volume_mounts: Option<&[k8s_openapi::api::core::v1::VolumeMount]>,
) -> [Result<(), validation::Errors>; 2] {
    [
        no_duplicates(
            &format!("{path}.env"),
            env.into_iter().flatten().map(|var| var.name.as_str()),
        ),
        no_duplicates(
            &format!("{path}.volumeMounts"),
            volume_mounts
                .into_iter()
                .flatten()
                .map(|mount| mount.mount_path.as_str()),
        ),
    ]
}

/// Merges two optional templates, `b` wins conflicts.
///
/// A missing operand is the identity element: the other operand is returned unchanged.
pub fn merge_templates(
    a: Option<&ProfileTemplate>,
    b: Option<&ProfileTemplate>,
) -> Option<ProfileTemplate> {
    merge::merge(b.cloned(), &a.cloned())
}

/// Combines a list of templates ordered by descending priority into a single template.
///
/// The fold starts at the lowest priority (the end of the list), so the explicitly set fields
/// of the first template win, while list fields accumulate the contributions of every template
/// in ascending priority order.
pub fn reduce_ranked<'a>(
    ranked: impl IntoIterator<Item = &'a ProfileTemplate, IntoIter: DoubleEndedIterator>,
) -> Option<ProfileTemplate> {
    ranked
        .into_iter()
        .rev()
        .fold(None, |result, template| {
            merge_templates(result.as_ref(), Some(template))
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use indoc::indoc;
    use k8s_openapi::api::core::v1::Volume;
    use rstest::rstest;

    use super::*;

    fn template(yaml: &str) -> ProfileTemplate {
        serde_yaml::from_str(yaml).expect("invalid test template")
    }

    fn default_image(template: &ProfileTemplate) -> Option<&str> {
        template
            .container
            .as_ref()?
            .default
            .as_ref()?
            .image
            .as_deref()
    }

    fn volume_names(template: &ProfileTemplate) -> Vec<&str> {
        template
            .pod
            .iter()
            .flat_map(|pod| pod.volumes.iter().flatten())
            .map(|volume| volume.name.as_str())
            .collect()
    }

    #[test]
    fn empty_template_serializes_to_empty_object() {
        let json = serde_json::to_string(&ProfileTemplate::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn parse_full_template() {
        let template = template(indoc! {"
            priority: 3
            pod:
              metadata:
                annotations:
                  team: ml
              scheduling:
                nodeSelector:
                  gpu: a100
                tolerations:
                  - key: gpu
                    operator: Exists
              namespace:
                hostIPC: true
              volumes:
                - name: data
                  emptyDir: {}
            container:
              containers:
                sidecar:
                  image: busybox
              all:
                env:
                  - name: A
                    value: a
              default:
                image: ubuntu:22.04
                command: [sleep]
                resources:
                  limits:
                    memory: 1Gi
        "});

        assert_eq!(template.priority, Priority(3));
        assert_eq!(default_image(&template), Some("ubuntu:22.04"));
        assert_eq!(volume_names(&template), vec!["data"]);
        let pod = template.pod.as_ref().unwrap();
        assert_eq!(
            pod.namespace.as_ref().unwrap().host_ipc,
            Some(true),
            "hostIPC must keep its Kubernetes spelling"
        );
    }

    #[test]
    fn missing_operand_is_identity() {
        let a = template("priority: 1\ncontainer: {default: {image: a}}");
        assert_eq!(merge_templates(None, Some(&a)), Some(a.clone()));
        assert_eq!(merge_templates(Some(&a), None), Some(a));
        assert_eq!(merge_templates(None, None), None);
    }

    #[rstest]
    #[case(0, 5, 5)]
    #[case(5, 0, 5)]
    #[case(-3, -7, -3)]
    fn priority_is_max(#[case] a: i32, #[case] b: i32, #[case] expected: i32) {
        let merged = merge_templates(
            Some(&ProfileTemplate {
                priority: Priority(a),
                ..Default::default()
            }),
            Some(&ProfileTemplate {
                priority: Priority(b),
                ..Default::default()
            }),
        )
        .unwrap();
        assert_eq!(merged.priority, Priority(expected));
    }

    #[test]
    fn second_operand_wins_scalars_but_unset_never_clobbers() {
        let a = template(indoc! {"
            container:
              default:
                image: a
                workingDir: /a
        "});
        let b = template(indoc! {"
            container:
              default:
                image: b
        "});

        let merged = merge_templates(Some(&a), Some(&b)).unwrap();
        let default = merged.container.unwrap().default.unwrap();
        assert_eq!(default.image.as_deref(), Some("b"));
        assert_eq!(default.working_dir.as_deref(), Some("/a"));
    }

    #[test]
    fn maps_union_and_lists_concatenate() {
        let a = template(indoc! {"
            pod:
              metadata:
                annotations: {x: a, y: a}
              volumes:
                - name: one
        "});
        let b = template(indoc! {"
            pod:
              metadata:
                annotations: {y: b, z: b}
              volumes:
                - name: two
        "});

        let merged = merge_templates(Some(&a), Some(&b)).unwrap();
        assert_eq!(volume_names(&merged), vec!["one", "two"]);
        assert_eq!(
            merged.pod.unwrap().metadata.unwrap().annotations.unwrap(),
            BTreeMap::from([
                ("x".to_owned(), "a".to_owned()),
                ("y".to_owned(), "b".to_owned()),
                ("z".to_owned(), "b".to_owned()),
            ])
        );
    }

    #[test]
    fn command_is_replaced_not_concatenated() {
        let a = template("container: {default: {command: [bash, -c], args: [x]}}");
        let b = template("container: {default: {command: [sleep]}}");

        let merged = merge_templates(Some(&a), Some(&b)).unwrap();
        let default = merged.container.unwrap().default.unwrap();
        assert_eq!(default.command.unwrap().0, vec!["sleep".to_owned()]);
        assert_eq!(default.args.unwrap().0, vec!["x".to_owned()]);
    }

    #[test]
    fn per_container_overlays_merge_by_key() {
        let a = template("container: {containers: {main: {image: a, workingDir: /a}, side: {image: s}}}");
        let b = template("container: {containers: {main: {image: b}}}");

        let merged = merge_templates(Some(&a), Some(&b)).unwrap();
        let containers = merged.container.unwrap().containers.unwrap();
        assert_eq!(containers["main"].image.as_deref(), Some("b"));
        assert_eq!(containers["main"].working_dir.as_deref(), Some("/a"));
        assert_eq!(containers["side"].image.as_deref(), Some("s"));
    }

    #[test]
    fn merge_is_associative() {
        let a = template("priority: 1\npod: {volumes: [{name: a}], metadata: {labels: {k: a}}}");
        let b = template("priority: 3\ncontainer: {default: {image: b}}\npod: {volumes: [{name: b}]}");
        let c = template("priority: 2\npod: {metadata: {labels: {k: c}}, volumes: [{name: c}]}");

        let left = merge_templates(merge_templates(Some(&a), Some(&b)).as_ref(), Some(&c));
        let right = merge_templates(Some(&a), merge_templates(Some(&b), Some(&c)).as_ref());
        assert_eq!(left, right);
        assert_eq!(volume_names(left.as_ref().unwrap()), vec!["a", "b", "c"]);
    }

    #[test]
    fn reduce_ranked_lets_highest_priority_win() {
        let high = template("priority: 2\ncontainer: {default: {image: b}}\npod: {volumes: [{name: high}]}");
        let low = template("priority: 1\ncontainer: {default: {image: a}}\npod: {volumes: [{name: low}]}");

        let reduced = reduce_ranked([&high, &low]).unwrap();
        assert_eq!(default_image(&reduced), Some("b"));
        assert_eq!(reduced.priority, Priority(2));
        // Lists accumulate in ascending priority order
        assert_eq!(volume_names(&reduced), vec!["low", "high"]);
    }

    #[test]
    fn reduce_ranked_of_nothing_is_none() {
        assert_eq!(reduce_ranked(std::iter::empty::<&ProfileTemplate>()), None);
    }

    #[test]
    fn validate_rejects_invalid_container_names() {
        let invalid = template(r#"container: {containers: {"^%$@#": {image: a}}}"#);
        let errors = invalid.validate().unwrap_err();
        assert!(errors.to_string().contains("container.containers"));
    }

    #[test]
    fn validate_rejects_duplicates() {
        let mut invalid = ProfileTemplate::default();
        invalid.pod = Some(PodTemplate {
            volumes: Some(vec![
                Volume {
                    name: "data".to_owned(),
                    ..Default::default()
                },
                Volume {
                    name: "data".to_owned(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        });
        assert_eq!(
            invalid.validate().unwrap_err().to_string(),
            r#"pod.volumes contains "data" more than once"#
        );

        let invalid = template(indoc! {"
            container:
              all:
                volumeMounts:
                  - {name: a, mountPath: /data}
                  - {name: b, mountPath: /data}
              default:
                env: [{name: X}, {name: X}]
        "});
        assert_eq!(invalid.validate().unwrap_err().iter().count(), 2);
    }

    #[test]
    fn validate_accepts_valid_template() {
        let valid = template(indoc! {"
            pod:
              volumes: [{name: a}, {name: b}]
            container:
              containers:
                main:
                  env: [{name: X}, {name: Y}]
        "});
        assert_eq!(valid.validate(), Ok(()));
    }
}
