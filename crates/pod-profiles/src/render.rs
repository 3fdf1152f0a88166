//! Renders a reduced profile template onto a base pod template.
//!
//! The stages run in a fixed order: the pod overlay, the overlay for all containers, the
//! per-container overlays and finally the default container overlay. Any failing stage aborts
//! the render.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use snafu::{ResultExt, Snafu};
use strum::Display;
use tracing::{debug, instrument};

use crate::{
    overlay::{self, AllContainers, DefaultContainer, NamedContainers, Overlay},
    template::{ProfileTemplate, reduce_ranked},
    validation,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("merged profile template is invalid"))]
    InvalidTemplate { source: validation::Errors },

    #[snafu(display("failed to apply the {stage} stage"))]
    ApplyPod {
        source: overlay::Error,
        stage: Stage,
    },

    #[snafu(display("failed to apply the {stage} stage"))]
    ApplyGeneric {
        source: overlay::Error,
        stage: Stage,
    },

    #[snafu(display("failed to apply the {stage} stage"))]
    ApplyContainers {
        source: overlay::Error,
        stage: Stage,
    },

    #[snafu(display("failed to apply the {stage} stage"))]
    ApplyDefault {
        source: overlay::Error,
        stage: Stage,
    },
}

/// The render stages, in the order they are applied.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Pod,
    #[strum(serialize = "all-containers")]
    Generic,
    #[strum(serialize = "named-containers")]
    Containers,
    #[strum(serialize = "default-container")]
    Default,
}

/// Renders `ranked` (ordered by descending priority) and the caller supplied `inline`
/// templates onto `base`.
///
/// Inline templates are ranked together with the profiles by their priority. At equal
/// priority profiles outrank inline templates. The base template is left untouched.
#[instrument(skip_all, fields(profiles.count = ranked.len(), inline.count = inline.len()))]
pub fn render(
    base: &PodTemplateSpec,
    ranked: &[&ProfileTemplate],
    inline: &[ProfileTemplate],
) -> Result<PodTemplateSpec> {
    let mut combined = ranked.to_vec();
    combined.extend(inline);
    // Stable, so profiles stay ahead of inline templates with the same priority
    combined.sort_by(|a, b| b.priority.cmp(&a.priority));

    let template = reduce_ranked(combined).unwrap_or_default();
    template.validate().context(InvalidTemplateSnafu)?;

    let mut rendered = base.clone();
    apply(&template, &mut rendered)?;
    debug!(priority = template.priority.0, "rendered profile template");
    Ok(rendered)
}

/// Applies an already reduced template onto `target`, stage by stage.
pub fn apply(template: &ProfileTemplate, target: &mut PodTemplateSpec) -> Result<()> {
    if let Some(pod) = &template.pod {
        pod.apply_to(target)
            .context(ApplyPodSnafu { stage: Stage::Pod })?;
    }

    let Some(container) = &template.container else {
        return Ok(());
    };

    if let Some(all) = &container.all {
        AllContainers(all)
            .apply_to(target)
            .context(ApplyGenericSnafu {
                stage: Stage::Generic,
            })?;
    }

    if let Some(containers) = &container.containers {
        NamedContainers(containers)
            .apply_to(target)
            .context(ApplyContainersSnafu {
                stage: Stage::Containers,
            })?;
    }

    if let Some(default) = &container.default {
        DefaultContainer(default)
            .apply_to(target)
            .context(ApplyDefaultSnafu {
                stage: Stage::Default,
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::selection::{
        select_profiles,
        tests::{labels, ready_profile},
    };

    fn template(yaml: &str) -> ProfileTemplate {
        serde_yaml::from_str(yaml).expect("invalid test template")
    }

    fn base() -> PodTemplateSpec {
        serde_yaml::from_str(indoc! {"
            metadata:
              labels: {app: job}
            spec:
              containers:
                - name: job
                  image: ubuntu:18.04
                - name: sidecar
                  image: busybox
        "})
        .expect("invalid test pod template")
    }

    fn image(rendered: &PodTemplateSpec, index: usize) -> Option<&str> {
        rendered.spec.as_ref()?.containers.get(index)?.image.as_deref()
    }

    fn env_names(rendered: &PodTemplateSpec, index: usize) -> Vec<&str> {
        rendered
            .spec
            .iter()
            .flat_map(|spec| spec.containers.get(index))
            .flat_map(|container| container.env.iter().flatten())
            .map(|var| var.name.as_str())
            .collect()
    }

    #[test]
    fn empty_render_is_identity() {
        assert_eq!(render(&base(), &[], &[]).unwrap(), base());
    }

    #[test]
    fn higher_priority_wins() {
        let p = template("priority: 1\ncontainer: {default: {image: a}}");
        let q = template("priority: 2\ncontainer: {default: {image: b}}");

        let rendered = render(&base(), &[&q, &p], &[]).unwrap();
        assert_eq!(image(&rendered, 0), Some("b"));
    }

    #[test]
    fn stages_apply_in_order() {
        let template = template(indoc! {"
            container:
              all:
                env: [{name: ALL, value: all}]
              containers:
                job:
                  image: named
                  env: [{name: ALL, value: named}, {name: NAMED}]
                sidecar:
                  image: busybox:1.36
              default:
                image: default
                env: [{name: DEFAULT}]
        "});

        let rendered = render(&base(), &[&template], &[]).unwrap();
        assert_eq!(image(&rendered, 0), Some("default"));
        assert_eq!(image(&rendered, 1), Some("busybox:1.36"));
        assert_eq!(env_names(&rendered, 0), vec!["ALL", "NAMED", "DEFAULT"]);
        assert_eq!(env_names(&rendered, 1), vec!["ALL"]);

        let job_env = rendered.spec.as_ref().unwrap().containers[0]
            .env
            .as_ref()
            .unwrap();
        assert_eq!(job_env[0].value.as_deref(), Some("named"));
    }

    #[test]
    fn inline_templates_are_ranked_with_profiles() {
        let profile = template("priority: 1\ncontainer: {default: {image: profile}}");
        let inline_low = template("container: {default: {image: inline-low, workingDir: /inline}}");
        let inline_high = template("priority: 5\ncontainer: {default: {env: [{name: INLINE}]}}");

        let rendered = render(&base(), &[&profile], &[inline_low, inline_high]).unwrap();
        assert_eq!(image(&rendered, 0), Some("profile"));
        assert_eq!(env_names(&rendered, 0), vec!["INLINE"]);
        let working_dir = rendered.spec.as_ref().unwrap().containers[0]
            .working_dir
            .as_deref();
        assert_eq!(working_dir, Some("/inline"));
    }

    #[test]
    fn default_stage_fails_without_containers() {
        let template = template("container: {default: {image: a}}");
        let error = render(&PodTemplateSpec::default(), &[&template], &[]).unwrap_err();

        assert!(matches!(
            error,
            Error::ApplyDefault {
                stage: Stage::Default,
                ..
            }
        ));
        assert_eq!(error.to_string(), "failed to apply the default-container stage");
    }

    #[test]
    fn other_stages_tolerate_missing_containers() {
        let template = template(indoc! {"
            pod: {metadata: {annotations: {a: b}}}
            container:
              all: {env: [{name: A}]}
              containers: {job: {image: a}}
        "});
        let rendered = render(&PodTemplateSpec::default(), &[&template], &[]).unwrap();
        assert!(rendered.spec.unwrap().containers.is_empty());
    }

    #[test]
    fn duplicates_across_profiles_are_rejected() {
        let a = template("priority: 1\npod: {volumes: [{name: data}]}");
        let b = template("priority: 2\npod: {volumes: [{name: data, emptyDir: {}}]}");

        let error = render(&base(), &[&b, &a], &[]).unwrap_err();
        assert!(matches!(error, Error::InvalidTemplate { .. }));
    }

    #[test]
    fn render_is_idempotent() {
        let profiles = vec![
            ready_profile(
                "volumes",
                "{selectors: {label: {}}, template: {pod: {volumes: [{name: data}]}, container: {all: {volumeMounts: [{name: data, mountPath: /data}]}}}}",
            ),
            ready_profile(
                "image",
                "{selectors: {label: {}}, template: {priority: 3, container: {default: {image: 'ubuntu:22.04'}}}}",
            ),
        ];
        let selection = select_profiles(&profiles, &labels(&[]), &[]).unwrap();
        let ranked = selection.templates().collect::<Vec<_>>();

        let first = render(&base(), &ranked, &[]).unwrap();
        let second = render(&base(), &ranked, &[]).unwrap();
        assert_eq!(first, second);

        // Rendering onto an already rendered pod changes nothing either
        let again = render(&first, &ranked, &[]).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn end_to_end_base_and_override() {
        let profiles = vec![
            ready_profile(
                "base",
                "{selectors: {label: {}}, template: {container: {default: {image: 'ubuntu:20.04'}}}}",
            ),
            ready_profile(
                "override",
                "{selectors: {label: {matchLabels: {type: training}}}, template: {priority: 5, container: {default: {image: 'ubuntu:22.04'}}}}",
            ),
        ];
        let selection = select_profiles(&profiles, &labels(&[("type", "training")]), &[]).unwrap();
        assert_eq!(selection.names(), vec!["override", "base"]);

        let ranked = selection.templates().collect::<Vec<_>>();
        let rendered = render(&base(), &ranked, &[]).unwrap();
        assert_eq!(image(&rendered, 0), Some("ubuntu:22.04"));
    }
}
