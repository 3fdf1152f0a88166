use darling::{FromDeriveInput, FromField, FromMeta, ast::Data, util::Ignored};
use proc_macro2::{Ident, TokenStream};
use quote::{format_ident, quote};
use syn::{DeriveInput, Generics, Index, Path, parse_quote};

#[derive(FromMeta)]
struct PathOverrides {
    #[darling(default = "PathOverrides::default_merge")]
    merge: Path,
}

impl Default for PathOverrides {
    fn default() -> Self {
        Self {
            merge: Self::default_merge(),
        }
    }
}

impl PathOverrides {
    fn default_merge() -> Path {
        parse_quote!(::pod_profiles::config::merge)
    }
}

#[derive(FromDeriveInput)]
#[darling(attributes(merge), supports(struct_named, struct_tuple, struct_unit))]
struct MergeInput {
    ident: Ident,
    generics: Generics,
    data: Data<Ignored, MergeField>,
    #[darling(default)]
    path_overrides: PathOverrides,
}

#[derive(FromField)]
struct MergeField {
    ident: Option<Ident>,
}

pub fn derive(input: DeriveInput) -> TokenStream {
    let MergeInput {
        ident,
        generics,
        data,
        path_overrides: PathOverrides { merge: merge_mod },
    } = match MergeInput::from_derive_input(&input) {
        Ok(input) => input,
        Err(err) => return err.write_errors(),
    };

    // `supports(..)` above rejects enums before we get here
    let fields = data.take_struct().map(|f| f.fields).unwrap_or_default();

    let body = fields
        .iter()
        .enumerate()
        .map(|(index, field)| {
            let accessor = match &field.ident {
                Some(field_ident) => quote! { #field_ident },
                None => {
                    let index = Index::from(index);
                    quote! { #index }
                }
            };
            quote! {
                #merge_mod::Merge::merge(&mut self.#accessor, &defaults.#accessor);
            }
        })
        .collect::<TokenStream>();

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    // Unit structs have nothing to merge, silence the unused parameter lint
    let defaults_ident = if fields.is_empty() {
        format_ident!("_defaults")
    } else {
        format_ident!("defaults")
    };

    quote! {
        impl #impl_generics #merge_mod::Merge for #ident #ty_generics #where_clause {
            fn merge(&mut self, #defaults_ident: &Self) {
                #body
            }
        }
    }
}
