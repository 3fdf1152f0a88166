//! Custom resources owned by this crate.

pub mod profile;
