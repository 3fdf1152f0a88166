use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod merge;

/// Derives `Merge` for structs whose fields all implement `Merge`.
///
/// Every field is merged independently, in declaration order. The generated
/// implementation refers to `::pod_profiles::config::merge` by default, which
/// can be changed with `#[merge(path_overrides(merge = "..."))]`.
#[proc_macro_derive(Merge, attributes(merge))]
pub fn derive_merge(input: TokenStream) -> TokenStream {
    merge::derive(parse_macro_input!(input as DeriveInput)).into()
}
