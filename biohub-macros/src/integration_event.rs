use crate::utils::apply_derives;
use proc_macro::TokenStream;
use quote::{ToTokens, quote};
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Ident, Item, Result, Token, parse::Parse, parse::ParseStream, parse_macro_input};

const EVENT_SUFFIX: &str = "Event";

/// #[integration_event] 宏实现
/// - 仅支持具名字段结构体
/// - 合并默认派生：Debug, Clone, PartialEq, Serialize, Deserialize
/// - 生成 `::biohub_eventing::IntegrationEvent` 实现
/// - `name = "..."` 指定稳定的类型标签，缺省为去掉 `Event` 后缀的结构体名
/// - `correlation = field` 指定作为关联 ID 的字段（需实现 `ToString`）
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as IntegrationEventAttrConfig);
    let mut input = parse_macro_input!(item as Item);

    let st = match &mut input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(
                other.span(),
                "#[integration_event] can only be used on struct types",
            )
            .to_compile_error()
            .into();
        }
    };

    let fields_named = match &st.fields {
        syn::Fields::Named(f) => f,
        _ => {
            return syn::Error::new(
                st.span(),
                "#[integration_event] supports only named-field structs",
            )
            .to_compile_error()
            .into();
        }
    };

    if let Some(field) = &cfg.correlation {
        let exists = fields_named
            .named
            .iter()
            .any(|f| f.ident.as_ref().is_some_and(|i| i == field));
        if !exists {
            return syn::Error::new(
                field.span(),
                format!("correlation field `{field}` not found on struct"),
            )
            .to_compile_error()
            .into();
        }
    }

    let required: Vec<syn::Path> = vec![
        syn::parse_quote!(Debug),
        syn::parse_quote!(Clone),
        syn::parse_quote!(PartialEq),
        syn::parse_quote!(serde::Serialize),
        syn::parse_quote!(serde::Deserialize),
    ];
    apply_derives(&mut st.attrs, required);

    let ident = &st.ident;
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();

    let name = cfg.name.unwrap_or_else(|| {
        let raw = ident.to_string();
        let trimmed = raw
            .strip_suffix(EVENT_SUFFIX)
            .filter(|s| !s.is_empty())
            .unwrap_or(&raw);
        syn::LitStr::new(trimmed, ident.span())
    });

    let correlation: Option<proc_macro2::TokenStream> = cfg.correlation.map(|field| {
        quote! {
            fn correlation_id(&self) -> ::core::option::Option<::std::string::String> {
                ::core::option::Option::Some(::std::string::ToString::to_string(&self.#field))
            }
        }
    });

    let expanded = quote! {
        #st

        impl #impl_generics ::biohub_eventing::IntegrationEvent for #ident #ty_generics #where_clause {
            const TYPE: &'static str = #name;

            #correlation
        }
    };

    expanded.into()
}

struct IntegrationEventAttrConfig {
    name: Option<syn::LitStr>,
    correlation: Option<Ident>,
}

impl Parse for IntegrationEventAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut name: Option<syn::LitStr> = None;
        let mut correlation: Option<Ident> = None;

        if input.is_empty() {
            return Ok(Self { name, correlation });
        }

        let pairs: Punctuated<syn::ExprAssign, Token![,]> =
            Punctuated::<syn::ExprAssign, Token![,]>::parse_terminated(input)?;

        for assign in pairs.into_iter() {
            let key_ident = match *assign.left {
                syn::Expr::Path(p) if p.path.segments.len() == 1 => {
                    p.path.segments[0].ident.clone()
                }
                other => return Err(syn::Error::new(other.span(), "invalid attribute key")),
            };
            match key_ident.to_string().as_str() {
                "name" => {
                    if name.is_some() {
                        return Err(syn::Error::new(
                            key_ident.span(),
                            "duplicate key 'name' in attribute",
                        ));
                    }
                    let lit: syn::LitStr = syn::parse2(assign.right.to_token_stream())?;
                    if lit.value().is_empty() {
                        return Err(syn::Error::new(lit.span(), "'name' must not be empty"));
                    }
                    name = Some(lit);
                }
                "correlation" => {
                    if correlation.is_some() {
                        return Err(syn::Error::new(
                            key_ident.span(),
                            "duplicate key 'correlation' in attribute",
                        ));
                    }
                    let field: Ident = syn::parse2(assign.right.to_token_stream())?;
                    correlation = Some(field);
                }
                _ => {
                    return Err(syn::Error::new(
                        key_ident.span(),
                        "unknown key; expected 'name' | 'correlation'",
                    ));
                }
            }
        }

        Ok(Self { name, correlation })
    }
}
