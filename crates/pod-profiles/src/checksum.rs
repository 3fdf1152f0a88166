//! Content addressing of profile templates.
//!
//! Every profile carries the checksum of its accepted template, computed once by [`accept`].
//! The admission mutator stamps pods with a [`combined_checksum`] over the ordered checksums
//! of all applied profiles, so re-rendering can be skipped when nothing changed.

use serde::Serialize;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::{
    crd::profile::{
        AcceptedTemplate, ConditionStatus, ProfileCondition, ProfileConditionType, ProfileSpec,
        ProfileStatus,
    },
    selector::LabelSelectorExt,
    template::ProfileTemplate,
};

/// Separates the individual checksums that make up a combined checksum.
pub const COMBINED_CHECKSUM_SEPARATOR: &str = "|";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize template"))]
    SerializeTemplate { source: serde_json::Error },
}

/// Lower-case hex encoded SHA-256 of `data`.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Checksum of the canonical JSON serialization of a value.
///
/// Serialization is canonical for the template types: struct fields are written in declaration
/// order, maps are sorted, and unset fields are omitted.
pub fn checksum_of<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).context(SerializeTemplateSnafu)?;
    Ok(sha256_hex(json))
}

/// Checksum over the ordered list of accepted checksums of the applied profiles.
///
/// It changes whenever a profile is added, removed, changed, or moved to another position.
pub fn combined_checksum<'a>(checksums: impl IntoIterator<Item = &'a str>) -> String {
    sha256_hex(
        checksums
            .into_iter()
            .collect::<Vec<_>>()
            .join(COMBINED_CHECKSUM_SEPARATOR),
    )
}

/// Validates the authored profile and computes the status a profile controller would store.
///
/// A valid profile is accepted with its template and the template checksum, and both the
/// `SpecValid` and `Ready` conditions are true. An invalid profile is not accepted, and both
/// conditions carry the validation message. A profile without a template is accepted with the
/// empty template.
pub fn accept(spec: &ProfileSpec) -> Result<ProfileStatus> {
    let template = spec.template.clone().unwrap_or_default();

    let problems = validate(spec, &template);
    if let Some(message) = problems {
        debug!(reason = %message, "profile was not accepted");
        return Ok(ProfileStatus {
            conditions: conditions(ConditionStatus::False, "InvalidSpec", Some(message)),
            accepted: None,
        });
    }

    let checksum = checksum_of(&template)?;
    Ok(ProfileStatus {
        conditions: conditions(ConditionStatus::True, "Accepted", None),
        accepted: Some(AcceptedTemplate { template, checksum }),
    })
}

fn validate(spec: &ProfileSpec, template: &ProfileTemplate) -> Option<String> {
    let selector = spec
        .selectors
        .as_ref()
        .and_then(|selectors| selectors.label.as_ref())
        .map(LabelSelectorExt::validate)
        .transpose();

    match (selector, template.validate()) {
        (Ok(_), Ok(())) => None,
        (Err(selector), Ok(())) => Some(format!("invalid selector: {selector}")),
        (Ok(_), Err(template)) => Some(format!("invalid template: {template}")),
        (Err(selector), Err(template)) => Some(format!(
            "invalid selector: {selector}, invalid template: {template}"
        )),
    }
}

fn conditions(
    status: ConditionStatus,
    reason: &str,
    message: Option<String>,
) -> Vec<ProfileCondition> {
    [ProfileConditionType::SpecValid, ProfileConditionType::Ready]
        .into_iter()
        .map(|type_| ProfileCondition {
            message: message.clone(),
            reason: Some(reason.to_owned()),
            status,
            type_,
        })
        .collect()
}
