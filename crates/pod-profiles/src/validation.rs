//! Checks run against profile templates before they are accepted or rendered.
//!
//! Name validation follows the Kubernetes rules for DNS labels, see
//! apimachinery/pkg/util/validation/validation.go in the Kubernetes source.

use std::{collections::BTreeSet, fmt::Display, sync::LazyLock};

use regex::Regex;
use snafu::Snafu;

/// Minimal length required by RFC 1123 is 63. Up to 255 allowed, unsupported by k8s.
const RFC_1123_LABEL_MAX_LENGTH: usize = 63;
const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";
const RFC_1123_LABEL_ERROR_MSG: &str = "a lowercase RFC 1123 label must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character";

static RFC_1123_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_LABEL_FMT}$")).expect("failed to compile RFC 1123 label regex")
});

type Result<T = (), E = Errors> = std::result::Result<T, E>;

/// A collection of errors discovered during validation.
#[derive(Debug, PartialEq, Eq)]
pub struct Errors(Vec<Error>);

impl Errors {
    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }
}

impl Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            let prefix = match i {
                0 => "",
                _ => ", ",
            };
            write!(f, "{prefix}{error}")?;
        }
        Ok(())
    }
}
impl std::error::Error for Errors {}

/// A single validation error.
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("{field} {value:?} is invalid: {msg} (regex used for validation is {regex:?})"))]
    Regex {
        field: String,
        value: String,
        msg: &'static str,
        regex: &'static str,
    },

    #[snafu(display(
        "{field} {value:?} is {length} bytes long but must be no more than {max_length}"
    ))]
    TooLong {
        field: String,
        value: String,
        length: usize,
        max_length: usize,
    },

    #[snafu(display("{field} contains {identity:?} more than once"))]
    Duplicate { field: String, identity: String },
}

/// Returns [`Ok`] if *all* validations are [`Ok`], otherwise returns all errors.
pub fn validate_all(validations: impl IntoIterator<Item = Result<(), Error>>) -> Result {
    let errors = validations
        .into_iter()
        .filter_map(|res| res.err())
        .collect::<Vec<_>>();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Errors(errors))
    }
}

/// Like [`validate_all`], but flattens nested collections of errors.
pub fn validate_all_nested(validations: impl IntoIterator<Item = Result>) -> Result {
    let errors = validations
        .into_iter()
        .filter_map(|res| res.err())
        .flat_map(|errors| errors.0)
        .collect::<Vec<_>>();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Errors(errors))
    }
}

/// Tests for a string that conforms to the definition of a lowercase label in DNS (RFC 1123),
/// which is what Kubernetes requires for container names.
///
/// `field` is only used to produce readable error messages.
pub fn is_rfc_1123_label(field: &str, value: &str) -> Result {
    let too_long = if value.len() > RFC_1123_LABEL_MAX_LENGTH {
        TooLongSnafu {
            field,
            value,
            length: value.len(),
            max_length: RFC_1123_LABEL_MAX_LENGTH,
        }
        .fail()
    } else {
        Ok(())
    };
    let malformed = if RFC_1123_LABEL_REGEX.is_match(value) {
        Ok(())
    } else {
        RegexSnafu {
            field,
            value,
            msg: RFC_1123_LABEL_ERROR_MSG,
            regex: RFC_1123_LABEL_FMT,
        }
        .fail()
    };
    validate_all([too_long, malformed])
}

/// Fails for every identity that appears more than once in `identities`.
///
/// Each duplicated identity is reported once, in order of its second occurrence.
pub fn no_duplicates<'a>(field: &str, identities: impl IntoIterator<Item = &'a str>) -> Result {
    let mut seen = BTreeSet::new();
    let mut reported = BTreeSet::new();
    validate_all(identities.into_iter().map(|identity| {
        if seen.insert(identity) || !reported.insert(identity) {
            Ok(())
        } else {
            DuplicateSnafu { field, identity }.fail()
        }
    }))
}
