extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Implements `meshcall_protocol::MeshParam` for a serde type.
///
/// The type must be `Serialize + DeserializeOwned`, and the crate using the
/// derive must depend on `meshcall_protocol`.
#[proc_macro_derive(MeshParam)]
pub fn mesh_param(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let name = input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics ::meshcall_protocol::MeshParam for #name #ty_generics #where_clause {
            fn into_bytes(
                &self,
                st: ::meshcall_protocol::SerializeType,
            ) -> ::meshcall_protocol::Result<::std::vec::Vec<u8>> {
                ::meshcall_protocol::encode(self, st)
            }
            fn from_slice(
                &mut self,
                st: ::meshcall_protocol::SerializeType,
                data: &[u8],
            ) -> ::meshcall_protocol::Result<()> {
                *self = ::meshcall_protocol::decode(st, data)?;
                Ok(())
            }
        }
    };

    TokenStream::from(expanded)
}
