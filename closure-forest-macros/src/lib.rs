use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::{
    parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Fields, Ident, Type,
};

#[proc_macro_derive(TreeNodeModel, attributes(tree_node))]
pub fn derive_tree_node_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match impl_tree_node_model(&input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct Options {
    id_field: Option<String>,
    parent_field: Option<String>,
    priority_field: Option<String>,
    closure_field: Option<String>,
    entity_name: Option<String>,
}

fn impl_tree_node_model(input: &DeriveInput) -> syn::Result<TokenStream> {
    let struct_ident = &input.ident;

    let data_struct = match &input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                "TreeNodeModel can only be derived for structs",
            ))
        }
    };

    let mut options = Options::default();
    let mut table_name: Option<String> = None;

    for attr in &input.attrs {
        if attr.path().is_ident("tree_node") {
            parse_tree_node_attr(attr, &mut options)?;
        }

        if attr.path().is_ident("sea_orm") {
            if let Some(name) = parse_sea_orm_table_name(attr)? {
                table_name = Some(name);
            }
        }
    }

    let id_field_name = options.id_field.unwrap_or_else(|| "id".to_string());
    let parent_field_name = options
        .parent_field
        .unwrap_or_else(|| "parent_id".to_string());
    let priority_field_name = options
        .priority_field
        .unwrap_or_else(|| "priority".to_string());
    let closure_field_name = options
        .closure_field
        .unwrap_or_else(|| "closure".to_string());

    let id_field_ident = Ident::new(&id_field_name, struct_ident.span());
    let parent_field_ident = Ident::new(&parent_field_name, struct_ident.span());
    let priority_field_ident = Ident::new(&priority_field_name, struct_ident.span());
    let closure_field_ident = Ident::new(&closure_field_name, struct_ident.span());

    let fields = match &data_struct.fields {
        Fields::Named(fields) => fields,
        _ => {
            return Err(syn::Error::new(
                data_struct.fields.span(),
                "TreeNodeModel requires named fields",
            ))
        }
    };

    let field_type = |wanted: &Ident| -> syn::Result<Type> {
        fields
            .named
            .iter()
            .find(|field| field.ident.as_ref() == Some(wanted))
            .map(|field| field.ty.clone())
            .ok_or_else(|| {
                syn::Error::new(
                    struct_ident.span(),
                    format!("TreeNodeModel expects a `{wanted}` field"),
                )
            })
    };

    let id_type = field_type(&id_field_ident)?;
    let priority_type = field_type(&priority_field_ident)?;
    field_type(&parent_field_ident)?;
    field_type(&closure_field_ident)?;

    let entity_name = options
        .entity_name
        .unwrap_or_else(|| struct_ident.unraw().to_string());
    let table_name = table_name.unwrap_or_else(|| struct_ident.unraw().to_string());

    let id_column_variant = format_ident!("{}", to_pascal_case(&id_field_name));
    let parent_column_variant = format_ident!("{}", to_pascal_case(&parent_field_name));
    let priority_column_variant = format_ident!("{}", to_pascal_case(&priority_field_name));
    let closure_column_variant = format_ident!("{}", to_pascal_case(&closure_field_name));

    let entity_name_literal = syn::LitStr::new(&entity_name, struct_ident.span());
    let table_name_literal = syn::LitStr::new(&table_name, struct_ident.span());
    let id_column_literal = syn::LitStr::new(&id_field_name, struct_ident.span());
    let priority_field_literal = syn::LitStr::new(&priority_field_name, struct_ident.span());

    let generated = quote! {
        impl ::closure_forest::TreeNodeModel for #struct_ident {
            type Entity = Entity;
            type ActiveModel = ActiveModel;

            fn forest_config() -> &'static ::closure_forest::ForestConfig {
                static CONFIG: ::closure_forest::once_cell::sync::Lazy<::closure_forest::ForestConfig> =
                    ::closure_forest::once_cell::sync::Lazy::new(|| {
                        let base = ::closure_forest::ForestConfig::new(
                            #entity_name_literal,
                            #table_name_literal,
                        );
                        ::closure_forest::ForestOptions::default()
                            .id_column(#id_column_literal)
                            .apply(base)
                    });
                &CONFIG
            }

            fn id_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#id_column_variant
            }

            fn parent_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#parent_column_variant
            }

            fn priority_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#priority_column_variant
            }

            fn closure_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#closure_column_variant
            }

            fn id_to_value(
                id: ::closure_forest::NodeId,
            ) -> ::core::result::Result<::sea_orm::Value, ::closure_forest::StoreError> {
                let raw = <#id_type as ::core::convert::TryFrom<i64>>::try_from(id.get())
                    .map_err(|_| ::closure_forest::StoreError::out_of_range("id", id.get()))?;
                ::core::result::Result::Ok(::sea_orm::Value::from(raw))
            }

            fn into_node(
                self,
            ) -> ::core::result::Result<::closure_forest::Node, ::closure_forest::StoreError> {
                let to_id = |raw: #id_type| {
                    ::closure_forest::NodeId::new(::core::convert::Into::<i64>::into(raw))
                };
                let closure = ::closure_forest::ClosureFields::from_json(self.#closure_field_ident)?;
                ::core::result::Result::Ok(::closure_forest::Node::rehydrate(
                    to_id(self.#id_field_ident),
                    self.#parent_field_ident.map(to_id),
                    ::core::convert::Into::<i64>::into(self.#priority_field_ident),
                    closure,
                ))
            }

            fn active_from_node(
                node: &::closure_forest::Node,
            ) -> ::core::result::Result<Self::ActiveModel, ::closure_forest::StoreError> {
                let from_id = |id: ::closure_forest::NodeId| {
                    <#id_type as ::core::convert::TryFrom<i64>>::try_from(id.get())
                        .map_err(|_| ::closure_forest::StoreError::out_of_range("id", id.get()))
                };
                let priority = <#priority_type as ::core::convert::TryFrom<i64>>::try_from(node.priority())
                    .map_err(|_| {
                        ::closure_forest::StoreError::out_of_range(#priority_field_literal, node.priority())
                    })?;

                #[allow(clippy::needless_update)]
                let active = ActiveModel {
                    #id_field_ident: ::sea_orm::ActiveValue::Set(from_id(node.id())?),
                    #parent_field_ident: ::sea_orm::ActiveValue::Set(
                        node.parent_id().map(from_id).transpose()?,
                    ),
                    #priority_field_ident: ::sea_orm::ActiveValue::Set(priority),
                    #closure_field_ident: ::sea_orm::ActiveValue::Set(node.closure().to_json()?),
                    ..::core::default::Default::default()
                };
                ::core::result::Result::Ok(active)
            }
        }
    };

    Ok(generated.into())
}

fn parse_tree_node_attr(attr: &Attribute, options: &mut Options) -> syn::Result<()> {
    attr.parse_nested_meta(|meta| {
        let ident = meta
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new(meta.path.span(), "Invalid option key"))?
            .to_string();

        let value: syn::LitStr = meta.value()?.parse()?;
        match ident.as_str() {
            "id_field" => options.id_field = Some(value.value()),
            "parent_field" => options.parent_field = Some(value.value()),
            "priority_field" => options.priority_field = Some(value.value()),
            "closure_field" => options.closure_field = Some(value.value()),
            "entity_name" => options.entity_name = Some(value.value()),
            other => {
                return Err(syn::Error::new(
                    meta.path.span(),
                    format!("Unsupported tree_node option `{other}`"),
                ));
            }
        }

        Ok(())
    })
}

fn parse_sea_orm_table_name(attr: &Attribute) -> syn::Result<Option<String>> {
    let mut table_name: Option<String> = None;
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("table_name") {
            let value: syn::LitStr = meta.value()?.parse()?;
            table_name = Some(value.value());
        } else if meta.input.peek(syn::Token![=]) {
            let _: syn::Expr = meta.value()?.parse()?;
        }
        Ok(())
    })?;
    Ok(table_name)
}

fn to_pascal_case(value: &str) -> String {
    value
        .split('_')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
