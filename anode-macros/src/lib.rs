use proc_macro::TokenStream;
use quote::quote;

use syn::spanned::Spanned as _;
use syn::{Attribute, Data, DeriveInput, Error, Expr, GenericArgument, Ident, Path, PathArguments, Type};

fn extract_generic_type(ty: &Type, wrapper: &str) -> Option<Type> {
    if let Type::Path(type_path) = ty
        && let Some(segment) = type_path.path.segments.last()
        && segment.ident == wrapper
        && let PathArguments::AngleBracketed(args) = &segment.arguments
        && let Some(GenericArgument::Type(inner)) = args.args.first()
    {
        return Some(inner.clone());
    }
    None
}

fn extract_arc_type(ty: &Type) -> Option<Type> {
    extract_generic_type(ty, "Arc")
}

const INJECT_ATTR: &str = "inject";
const INJECTABLE_ATTR: &str = "injectable";

#[derive(Default)]
struct FieldOptions {
    token: Option<Expr>,
    optional: bool,
    lazy: bool,
    default: bool,
}

fn parse_field_options(attrs: &[Attribute]) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();
    for attr in attrs {
        if !attr.path().is_ident(INJECT_ATTR) {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("token") {
                options.token = Some(meta.value()?.parse()?);
            } else if meta.path.is_ident("optional") {
                options.optional = true;
            } else if meta.path.is_ident("lazy") {
                options.lazy = true;
            } else if meta.path.is_ident("default") {
                options.default = true;
            } else {
                return Err(meta.error("expected one of `token`, `optional`, `lazy`, `default`"));
            }
            Ok(())
        })?;
    }
    if options.default && (options.token.is_some() || options.optional || options.lazy) {
        return Err(Error::new(
            attrs[0].span(),
            "`default` cannot be combined with other inject options",
        ));
    }
    if options.optional && options.lazy {
        return Err(Error::new(
            attrs[0].span(),
            "`optional` and `lazy` cannot be combined",
        ));
    }
    Ok(options)
}

#[derive(Default)]
struct TypeOptions {
    scope: Option<Ident>,
    on_init: Option<Path>,
    on_destroy: Option<Path>,
    dispose: Option<Path>,
}

fn parse_type_options(attrs: &[Attribute]) -> syn::Result<TypeOptions> {
    let mut options = TypeOptions::default();
    for attr in attrs {
        if !attr.path().is_ident(INJECTABLE_ATTR) {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("scope") {
                options.scope = Some(meta.value()?.parse()?);
            } else if meta.path.is_ident("on_init") {
                options.on_init = Some(meta.value()?.parse()?);
            } else if meta.path.is_ident("on_destroy") {
                options.on_destroy = Some(meta.value()?.parse()?);
            } else if meta.path.is_ident("dispose") {
                options.dispose = Some(meta.value()?.parse()?);
            } else {
                return Err(meta.error(
                    "expected one of `scope`, `on_init`, `on_destroy`, `dispose`",
                ));
            }
            Ok(())
        })?;
    }
    Ok(options)
}

/// Derive macro for the Injectable trait.
///
/// Every field is resolved from the container in declaration order:
///
/// - `Arc<T>` depends on the token of `T`
/// - `#[inject(optional)] Option<Arc<T>>` receives `None` when unresolvable
/// - `#[inject(lazy)] Lazy<T>` receives a deferred handle
/// - `#[inject(token = expr)]` overrides the requested token
/// - `#[inject(default)]` is filled with `Default::default()`
///
/// The struct level `#[injectable(...)]` attribute sets the default scope and
/// lifecycle hooks (`scope = Singleton`, `on_init = path::to::fn`).
#[proc_macro_derive(Injectable, attributes(inject, injectable))]
pub fn derive_injectable(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    match handle_derive_injectable(input) {
        Ok(v) => v.into(),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}

fn handle_derive_injectable(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let fields = match &input.data {
        Data::Struct(s) => &s.fields,
        _ => return Err(Error::new(name.span(), "Only structs are supported")),
    };

    let mut dependencies = Vec::new();
    let mut field_lets = Vec::new();
    let mut field_idents = Vec::new();

    match fields {
        syn::Fields::Named(fields) => {
            for field in &fields.named {
                let Some(field_ident) = field.ident.as_ref() else {
                    continue;
                };
                let field_ty = &field.ty;
                let options = parse_field_options(&field.attrs)?;
                field_idents.push(field_ident);

                if options.default {
                    field_lets.push(quote! {
                        let #field_ident: #field_ty = ::std::default::Default::default();
                    });
                    continue;
                }

                let index = dependencies.len();
                let (inner_ty, init) = if options.lazy {
                    let inner_ty = extract_generic_type(field_ty, "Lazy").ok_or_else(|| {
                        Error::new(field_ty.span(), "Lazy dependencies must be of type Lazy<T>")
                    })?;
                    let init = quote! { injector.lazy_arg::<#inner_ty>(#index)? };
                    (inner_ty, init)
                } else if options.optional {
                    let inner_ty = extract_generic_type(field_ty, "Option")
                        .as_ref()
                        .and_then(extract_arc_type)
                        .ok_or_else(|| {
                            Error::new(
                                field_ty.span(),
                                "Optional dependencies must be of type Option<Arc<T>>",
                            )
                        })?;
                    let init = quote! { injector.optional_arg::<#inner_ty>(#index)? };
                    (inner_ty, init)
                } else {
                    let inner_ty = extract_arc_type(field_ty).ok_or_else(|| {
                        Error::new(
                            field_ty.span(),
                            format!(
                                "Dependencies must be of type Arc<T> or use #[{INJECT_ATTR}(default)]"
                            ),
                        )
                    })?;
                    let init = quote! { injector.arg::<#inner_ty>(#index)? };
                    (inner_ty, init)
                };

                let mut dependency = match &options.token {
                    Some(token) => quote! { ::anode::Dependency::new(#token) },
                    None => quote! { ::anode::Dependency::of::<#inner_ty>() },
                };
                if options.optional {
                    dependency = quote! { #dependency.optional() };
                }
                if options.lazy {
                    dependency = quote! { #dependency.lazy() };
                }
                dependencies.push(dependency);
                field_lets.push(quote! { let #field_ident = #init; });
            }
        }
        syn::Fields::Unnamed(_) => {
            return Err(Error::new(name.span(), "Tuple structs are not supported"));
        }
        syn::Fields::Unit => {}
    }

    let construct_body = match fields {
        syn::Fields::Unit => quote! { Ok(Self) },
        _ => quote! {
            #(#field_lets)*
            Ok(Self {
                #(#field_idents,)*
            })
        },
    };

    let options = parse_type_options(&input.attrs)?;
    let scope_fn = options.scope.map(|scope| {
        quote! {
            fn scope() -> Option<::anode::Scope> {
                Some(::anode::Scope::#scope)
            }
        }
    });
    let hook = |path: &Option<Path>| match path {
        Some(path) => quote! { Some(::anode::Hook::typed::<Self, _>(#path)) },
        None => quote! { None },
    };
    let lifecycle_fn = if options.on_init.is_some()
        || options.on_destroy.is_some()
        || options.dispose.is_some()
    {
        let on_init = hook(&options.on_init);
        let on_destroy = hook(&options.on_destroy);
        let dispose = hook(&options.dispose);
        Some(quote! {
            fn lifecycle() -> ::anode::Lifecycle {
                ::anode::Lifecycle {
                    on_init: #on_init,
                    on_destroy: #on_destroy,
                    dispose: #dispose,
                }
            }
        })
    } else {
        None
    };

    Ok(quote! {
        impl ::anode::Injectable for #name {
            fn dependencies() -> Vec<::anode::Dependency> {
                vec![#(#dependencies),*]
            }

            #[allow(unused_variables)]
            fn construct(
                injector: &::anode::Injector
            ) -> Result<Self, ::anode::StdError> {
                #construct_body
            }

            #scope_fn

            #lifecycle_fn
        }
    })
}
