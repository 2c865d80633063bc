//! Parsing logic for the Entity derive macro.
//!
//! This module extracts struct-level and field-level `#[entity(...)]`
//! attributes and classifies every field by its Rust type.

use proc_macro2::Span;
use syn::{
    Attribute, Data, DeriveInput, Error, Field, Fields, GenericArgument, Ident, Lit, PathArguments,
    Result, Type,
};

/// Parsed entity definition from a struct with `#[derive(Entity)]`.
#[derive(Debug)]
pub struct EntityDef {
    /// The struct name (e.g., `Person`).
    pub name: Ident,
    /// Table name override from `#[entity(table = "...")]`.
    pub table_name: Option<String>,
    /// Mapped fields, in declaration order. Skipped fields are not included.
    pub fields: Vec<FieldDef>,
}

/// How a field is stored, derived from its type.
#[derive(Debug)]
pub enum FieldShape {
    /// Any other type; stored as a column value.
    Scalar,
    /// `Option<EntityRef<T>>`: a to-one reference to `T`.
    Reference(Type),
    /// `LazyList<T>`: a to-many collection of `T`. `None` when the element
    /// type is not spelled out.
    Collection(Option<Type>),
}

/// Parsed field definition from a struct field.
#[derive(Debug)]
pub struct FieldDef {
    /// The Rust field name (e.g., `first_name`).
    pub name: Ident,
    /// Column name override.
    pub column: Option<String>,
    /// Whether this field is the identifier.
    pub id: bool,
    /// Back-reference field on the element type (collections only).
    pub mapped_by: Option<String>,
    pub shape: FieldShape,
}

/// Parse a `DeriveInput` into an `EntityDef`.
///
/// Returns an error if:
/// - The input is not a struct with named fields
/// - The struct is generic
/// - Unknown or misplaced attributes are present
/// - No field, or more than one field, is marked `#[entity(id)]`
pub fn parse_entity(input: &DeriveInput) -> Result<EntityDef> {
    let name = input.ident.clone();

    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "Entity cannot be derived for generic structs",
        ));
    }

    let table_name = parse_struct_attrs(&input.attrs)?;

    let fields = match &input.data {
        Data::Struct(data) => parse_fields(&data.fields)?,
        Data::Enum(_) => {
            return Err(Error::new_spanned(
                input,
                "Entity can only be derived for structs, not enums",
            ));
        }
        Data::Union(_) => {
            return Err(Error::new_spanned(
                input,
                "Entity can only be derived for structs, not unions",
            ));
        }
    };

    let ids: Vec<&FieldDef> = fields.iter().filter(|f| f.id).collect();
    match ids.as_slice() {
        [_] => {}
        [] => {
            return Err(Error::new_spanned(
                &input.ident,
                "Entity requires exactly one field marked #[entity(id)]",
            ));
        }
        [_, second, ..] => {
            return Err(Error::new_spanned(
                &second.name,
                "only one field can be marked #[entity(id)]",
            ));
        }
    }

    Ok(EntityDef {
        name,
        table_name,
        fields,
    })
}

/// Parse struct-level `#[entity(...)]` attributes.
///
/// Supported keys:
/// - `table = "name"` (overrides the table name, which defaults to the
///   struct name)
fn parse_struct_attrs(attrs: &[Attribute]) -> Result<Option<String>> {
    let mut table_name: Option<String> = None;

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                if table_name.is_some() {
                    return Err(Error::new_spanned(
                        meta.path,
                        "duplicate entity attribute: table",
                    ));
                }
                table_name = Some(string_value(&meta, "table name")?);
                Ok(())
            } else {
                Err(meta.error("unknown entity attribute; expected `table`"))
            }
        })?;
    }

    Ok(table_name)
}

fn string_value(meta: &syn::meta::ParseNestedMeta<'_>, what: &str) -> Result<String> {
    let value: Lit = meta.value()?.parse()?;
    match value {
        Lit::Str(lit_str) => Ok(lit_str.value()),
        other => Err(Error::new_spanned(
            other,
            format!("expected string literal for {what}"),
        )),
    }
}

/// Parse all mapped fields from a struct.
fn parse_fields(fields: &Fields) -> Result<Vec<FieldDef>> {
    match fields {
        Fields::Named(named) => {
            let mut parsed = Vec::new();
            for field in &named.named {
                if let Some(def) = parse_field(field)? {
                    parsed.push(def);
                }
            }
            Ok(parsed)
        }
        Fields::Unnamed(_) => Err(Error::new(
            Span::call_site(),
            "Entity requires a struct with named fields, not a tuple struct",
        )),
        Fields::Unit => Err(Error::new(
            Span::call_site(),
            "Entity requires a struct with fields, not a unit struct",
        )),
    }
}

/// Intermediate struct for collecting field attributes.
#[derive(Default)]
struct FieldAttrs {
    id: bool,
    skip: bool,
    column: Option<String>,
    mapped_by: Option<String>,
}

/// Parse a single field. Returns `None` for `#[entity(skip)]` fields.
fn parse_field(field: &Field) -> Result<Option<FieldDef>> {
    let name = field
        .ident
        .clone()
        .ok_or_else(|| Error::new_spanned(field, "expected named field"))?;

    let attrs = parse_field_attrs(&field.attrs)?;
    if attrs.skip {
        if attrs.id || attrs.column.is_some() || attrs.mapped_by.is_some() {
            return Err(Error::new_spanned(
                &name,
                "a skipped field cannot carry other entity attributes",
            ));
        }
        return Ok(None);
    }

    let shape = detect_shape(&field.ty);
    match shape {
        FieldShape::Scalar | FieldShape::Reference(_) if attrs.mapped_by.is_some() => {
            return Err(Error::new_spanned(
                &name,
                "mapped_by is only valid on LazyList<T> fields",
            ));
        }
        FieldShape::Reference(_) | FieldShape::Collection(_) if attrs.id => {
            return Err(Error::new_spanned(
                &name,
                "the identifier must be a plain column, not a relation",
            ));
        }
        FieldShape::Collection(_) if attrs.column.is_some() => {
            return Err(Error::new_spanned(
                &name,
                "LazyList<T> fields are not stored in a column",
            ));
        }
        _ => {}
    }

    Ok(Some(FieldDef {
        name,
        column: attrs.column,
        id: attrs.id,
        mapped_by: attrs.mapped_by,
        shape,
    }))
}

/// Parse all `#[entity(...)]` attributes on a field.
fn parse_field_attrs(attrs: &[Attribute]) -> Result<FieldAttrs> {
    let mut result = FieldAttrs::default();

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("id") {
                result.id = true;
            } else if meta.path.is_ident("skip") {
                result.skip = true;
            } else if meta.path.is_ident("column") {
                result.column = Some(string_value(&meta, "column name")?);
            } else if meta.path.is_ident("mapped_by") {
                result.mapped_by = Some(string_value(&meta, "mapped_by field")?);
            } else {
                return Err(meta.error(
                    "unknown entity attribute; expected one of `id`, `skip`, `column`, `mapped_by`",
                ));
            }
            Ok(())
        })?;
    }

    Ok(result)
}

/// Classify a field by its type.
///
/// - `Option<EntityRef<T>>` (or `Option<Rc<RefCell<T>>>`) is a reference
/// - `LazyList<T>` is a collection
/// - anything else is a scalar
pub fn detect_shape(ty: &Type) -> FieldShape {
    if let Some(args) = last_segment_args(ty, "LazyList") {
        return FieldShape::Collection(single_type_arg(args).cloned());
    }
    if let Some(inner) = last_segment_args(ty, "Option").and_then(single_type_arg) {
        if let Some(target) = entity_ref_target(inner) {
            return FieldShape::Reference(target.clone());
        }
    }
    FieldShape::Scalar
}

/// `T` in `EntityRef<T>` or `Rc<RefCell<T>>`.
fn entity_ref_target(ty: &Type) -> Option<&Type> {
    if let Some(args) = last_segment_args(ty, "EntityRef") {
        return single_type_arg(args);
    }
    let cell = last_segment_args(ty, "Rc").and_then(single_type_arg)?;
    last_segment_args(cell, "RefCell").and_then(single_type_arg)
}

/// Generic arguments of `ty` if its last path segment is `ident`.
fn last_segment_args<'a>(ty: &'a Type, ident: &str) -> Option<&'a PathArguments> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    (segment.ident == ident).then_some(&segment.arguments)
}

fn single_type_arg(args: &PathArguments) -> Option<&Type> {
    let PathArguments::AngleBracketed(bracketed) = args else {
        return None;
    };
    let mut types = bracketed.args.iter().filter_map(|arg| match arg {
        GenericArgument::Type(ty) => Some(ty),
        _ => None,
    });
    let first = types.next()?;
    types.next().is_none().then_some(first)
}
