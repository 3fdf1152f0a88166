//! Selection, merge and rendering of pod profiles.
//!
//! A [`Profile`](crd::profile::Profile) carries a partial pod template and a label selector.
//! For a workload, the matching and explicitly requested profiles are selected and ranked by
//! priority ([`selection`]), their templates are merged ([`template`]) and the result is
//! rendered onto the workload's pod template ([`render`]). The [`webhook`] applies this to pods
//! on creation.

// Allows the derive macros to refer to this crate by name from within itself
extern crate self as pod_profiles;

pub mod catalog;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod constants;
pub mod crd;
pub mod logging;
pub mod overlay;
pub mod quantity;
pub mod render;
pub mod selection;
pub mod selector;
pub mod template;
pub mod validation;
pub mod webhook;
