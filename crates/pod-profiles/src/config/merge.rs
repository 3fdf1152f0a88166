use std::collections::{BTreeMap, btree_map};

use k8s_openapi::{
    api::core::v1::{PodSecurityContext, SecurityContext},
    apimachinery::pkg::api::resource::Quantity,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use pod_profiles_derive::Merge;

/// An overlay that can be combined with a lower priority overlay of the same type.
///
/// `self` is the higher priority overlay and `defaults` the lower priority one. Merging never
/// lets an unset value clobber a set one:
///
/// - Scalars and [`Atomic`] values keep the value of `self`, unset (`None`) values fall back
///   to `defaults`.
/// - Maps are unioned key by key, colliding values are merged recursively.
/// - Lists are concatenated, `defaults` first. Nothing is de-duplicated.
///
/// Structs usually derive it, see [the derive macro](`derive@Merge`).
///
/// ```
/// # use std::collections::BTreeMap;
/// # use pod_profiles::config::merge::Merge;
/// #[derive(Merge, Debug, PartialEq, Eq)]
/// struct Overlay {
///     image: Option<String>,
///     labels: Option<BTreeMap<String, String>>,
///     args: Option<Vec<String>>,
/// }
///
/// let mut training = Overlay {
///     image: Some("ubuntu:22.04".to_owned()),
///     labels: None,
///     args: Some(vec!["--epochs=10".to_owned()]),
/// };
/// training.merge(&Overlay {
///     image: Some("ubuntu:20.04".to_owned()),
///     labels: Some(BTreeMap::from([("team".to_owned(), "ml".to_owned())])),
///     args: Some(vec!["--verbose".to_owned()]),
/// });
///
/// assert_eq!(training.image.as_deref(), Some("ubuntu:22.04"));
/// assert_eq!(training.labels.unwrap()["team"], "ml");
/// assert_eq!(training.args.unwrap(), ["--verbose", "--epochs=10"]);
/// ```
pub trait Merge {
    /// Merge with `defaults`, preferring values from `self` if they are set there
    fn merge(&mut self, defaults: &Self);
}

impl<T: Merge + Clone> Merge for Option<T> {
    fn merge(&mut self, defaults: &Self) {
        match (self.as_mut(), defaults) {
            (Some(this), Some(defaults)) => this.merge(defaults),
            (None, defaults) => *self = defaults.clone(),
            (Some(_), None) => {}
        }
    }
}

impl<K: Ord + Clone, V: Merge + Clone> Merge for BTreeMap<K, V> {
    fn merge(&mut self, defaults: &Self) {
        for (k, default_v) in defaults {
            match self.entry(k.clone()) {
                btree_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().merge(default_v);
                }
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(default_v.clone());
                }
            }
        }
    }
}

impl<T: Clone> Merge for Vec<T> {
    fn merge(&mut self, defaults: &Self) {
        if defaults.is_empty() {
            return;
        }
        let mut merged = defaults.clone();
        merged.append(self);
        *self = merged;
    }
}

/// Moving version of [`Merge::merge`].
pub fn merge<T: Merge>(mut overrides: T, defaults: &T) -> T {
    overrides.merge(defaults);
    overrides
}

/// Merges two optional lists like the [`Vec`] implementation of [`Merge`], but entries that are
/// already present are not repeated.
pub fn merge_distinct<T: Clone + PartialEq>(this: &mut Option<Vec<T>>, defaults: Option<&[T]>) {
    let Some(defaults) = defaults else {
        return;
    };
    let mut merged = defaults.to_vec();
    for entry in this.take().into_iter().flatten() {
        if !merged.contains(&entry) {
            merged.push(entry);
        }
    }
    *this = Some(merged);
}

/// Wraps a value that is merged atomically (as one single value) rather than
/// trying to merge each field or element individually. The value of `self` always wins.
///
/// This is mostly useful for lists that must be replaced as a whole, such as container
/// commands, where concatenating two overlays would produce nonsense.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Atomic<T>(pub T);

impl<T> Merge for Atomic<T> {
    fn merge(&mut self, _defaults: &Self) {}
}

macro_rules! atomic {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Merge for $ty {
                fn merge(&mut self, _defaults: &Self) {}
            }
        )*
    };
}

atomic!(
    u8,
    u16,
    u32,
    u64,
    i32,
    i64,
    bool,
    String,
    Quantity,
    PodSecurityContext,
    SecurityContext,
);
