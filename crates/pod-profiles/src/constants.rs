//! Well-known label and annotation keys read and written by the admission mutator.

use const_format::concatcp;

/// Prefix shared by every key owned by this crate.
pub const KEY_PREFIX: &str = "profiles.dbcluster.dev/";

/// Pod label naming the deployment the pod belongs to. The deployment must exist.
pub const DEPLOYMENT_LABEL: &str = concatcp!(KEY_PREFIX, "deployment");

/// Pod label opting a pod into profile rendering without a deployment reference.
pub const APPLY_LABEL: &str = concatcp!(KEY_PREFIX, "apply");

/// Label and annotation holding a comma-separated list of explicitly requested profiles.
pub const PROFILES_KEY: &str = concatcp!(KEY_PREFIX, "profiles");

/// Annotation set to `"true"` once profiles have been rendered onto a pod.
pub const APPLIED_ANNOTATION: &str = concatcp!(KEY_PREFIX, "applied");

/// Annotation holding the combined checksum of the applied profiles.
pub const CHECKSUM_ANNOTATION: &str = concatcp!(KEY_PREFIX, "checksum");

/// Annotation holding the comma-joined names of the applied profiles, in application order.
pub const LIST_ANNOTATION: &str = concatcp!(KEY_PREFIX, "list");

/// Environment variable prefix of the `pod-profiles` binary.
pub const ENV_PREFIX: &str = "POD_PROFILES";

pub const APP_NAME: &str = "pod-profiles";
