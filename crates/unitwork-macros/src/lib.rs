//! Procedural macros for unitwork.
//!
//! `unitwork-macros` is the **compile-time mapping layer**. `#[derive(Entity)]`
//! turns a plain struct into an `Entity` implementation: the declared field
//! list consumed by the metadata resolver, plus the `read_field` /
//! `write_field` pair the session uses instead of reflection.
//!
//! These macros are used by application crates via the `unitwork` facade.

use proc_macro::TokenStream;
use quote::quote;

mod parse;

use parse::{EntityDef, FieldDef, FieldShape, parse_entity};

/// Derive macro for the `Entity` trait.
///
/// The struct must also implement `Default`; hydration starts from the
/// default value and assigns every mapped field.
///
/// # Field types
///
/// - `Option<EntityRef<T>>` is a to-one reference stored as `T`'s identifier
/// - `LazyList<T>` is a to-many collection loaded on first access
/// - anything else is a plain column and must implement `Clone`,
///   `Into<Value>` and `FromValue`
///
/// # Attributes
///
/// - `#[entity(table = "name")]` - Override table name (defaults to the struct name)
/// - `#[entity(id)]` - Mark the identifier field (exactly one is required)
/// - `#[entity(column = "name")]` - Override column name
/// - `#[entity(mapped_by = "field")]` - Back-reference field of a collection
/// - `#[entity(skip)]` - Leave the field out of the mapping
///
/// # Example
///
/// ```ignore
/// use unitwork::prelude::*;
///
/// #[derive(Entity, Debug, Default)]
/// #[entity(table = "persons")]
/// struct Person {
///     #[entity(id)]
///     id: i64,
///     first_name: String,
///     last_name: String,
///     notes: LazyList<Note>,
/// }
///
/// #[derive(Entity, Debug, Default)]
/// #[entity(table = "notes")]
/// struct Note {
///     #[entity(id)]
///     id: i64,
///     body: String,
///     #[entity(column = "person_id")]
///     person: Option<EntityRef<Person>>,
/// }
/// ```
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as syn::DeriveInput);

    let entity = match parse_entity(&input) {
        Ok(e) => e,
        Err(e) => return e.to_compile_error().into(),
    };

    generate_entity_impl(&entity).into()
}

/// Generate the Entity trait implementation from a parsed definition.
fn generate_entity_impl(entity: &EntityDef) -> proc_macro2::TokenStream {
    let name = &entity.name;
    let name_str = name.to_string();

    let table_name = match &entity.table_name {
        Some(table) => quote! { ::core::option::Option::Some(#table) },
        None => quote! { ::core::option::Option::None },
    };

    let declarations = entity.fields.iter().map(generate_declaration);
    let read_arms = entity.fields.iter().filter_map(generate_read_arm);
    let write_arms = entity.fields.iter().map(generate_write_arm);

    quote! {
        #[automatically_derived]
        impl unitwork_core::Entity for #name {
            const NAME: &'static str = #name_str;
            const TABLE_NAME: ::core::option::Option<&'static str> = #table_name;

            fn fields() -> ::std::vec::Vec<unitwork_core::FieldDeclaration> {
                ::std::vec![
                    #(#declarations),*
                ]
            }

            fn read_field(
                &self,
                field: &str,
            ) -> unitwork_core::Result<unitwork_core::FieldValue> {
                match field {
                    #(#read_arms)*
                    other => ::core::result::Result::Err(
                        unitwork_core::Error::unknown_field(Self::NAME, other),
                    ),
                }
            }

            fn write_field(
                &mut self,
                field: &str,
                value: unitwork_core::FieldValue,
            ) -> unitwork_core::Result<()> {
                match field {
                    #(#write_arms)*
                    other => {
                        return ::core::result::Result::Err(
                            unitwork_core::Error::unknown_field(Self::NAME, other),
                        );
                    }
                }
                ::core::result::Result::Ok(())
            }
        }
    }
}

/// `FieldDeclaration` builder expression for one field.
fn generate_declaration(field: &FieldDef) -> proc_macro2::TokenStream {
    let field_name = field.name.to_string();

    let mut decl = match &field.shape {
        FieldShape::Scalar => quote! {
            unitwork_core::FieldDeclaration::scalar(#field_name)
        },
        FieldShape::Reference(target) => quote! {
            unitwork_core::FieldDeclaration::reference(
                #field_name,
                unitwork_core::EntityType::of::<#target>(),
            )
        },
        FieldShape::Collection(Some(element)) => quote! {
            unitwork_core::FieldDeclaration::collection(
                #field_name,
                ::core::option::Option::Some(unitwork_core::EntityType::of::<#element>()),
            )
        },
        FieldShape::Collection(None) => quote! {
            unitwork_core::FieldDeclaration::collection(#field_name, ::core::option::Option::None)
        },
    };

    if field.id {
        decl = quote! { #decl.id() };
    }
    if let Some(column) = &field.column {
        decl = quote! { #decl.column(#column) };
    }
    if let Some(mapped_by) = &field.mapped_by {
        decl = quote! { #decl.mapped_by(#mapped_by) };
    }
    decl
}

/// `read_field` arm for one field. Collections are never read back.
fn generate_read_arm(field: &FieldDef) -> Option<proc_macro2::TokenStream> {
    let ident = &field.name;
    let field_name = ident.to_string();
    match &field.shape {
        FieldShape::Scalar => Some(quote! {
            #field_name => ::core::result::Result::Ok(
                unitwork_core::FieldValue::scalar(::core::clone::Clone::clone(&self.#ident)),
            ),
        }),
        FieldShape::Reference(_) => Some(quote! {
            #field_name => ::core::result::Result::Ok(
                unitwork_core::FieldValue::reference(self.#ident.as_ref()),
            ),
        }),
        FieldShape::Collection(_) => None,
    }
}

/// `write_field` arm for one field; the target type is inferred from the
/// field.
fn generate_write_arm(field: &FieldDef) -> proc_macro2::TokenStream {
    let ident = &field.name;
    let field_name = ident.to_string();
    let convert = match &field.shape {
        FieldShape::Scalar => quote! { into_scalar },
        FieldShape::Reference(_) => quote! { into_reference },
        FieldShape::Collection(_) => quote! { into_collection },
    };
    quote! {
        #field_name => self.#ident = value.#convert(field)?,
    }
}
