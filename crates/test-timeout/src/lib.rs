//! Test attributes that fail a test instead of letting it hang.
//!
//! Matchmaking tests wait on store notifications; a missed notification
//! would otherwise stall the whole suite. Both attributes run the body on a
//! dedicated thread and panic with `test timed out` once the budget is spent.
//!
//! ```ignore
//! #[test_timeout::timeout(secs = 5)]
//! fn decodes_records() { /* ... */ }
//!
//! #[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread")]
//! async fn two_participants_pair() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
}

impl Default for TimeoutArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
        }
    }
}

/// Async test on a fresh Tokio runtime, bounded by `secs` (default 30).
/// `flavor = "multi_thread"` runs on two worker threads so concurrent
/// participants actually interleave.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = TimeoutArgs::default();
    let parser = syn::meta::parser(|meta| parse_arg(&mut args, meta, true));
    parse_macro_input!(attr with parser);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test expects an async test function",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, is_tokio_test_attribute);
    let runtime = match args.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => quote! {
            {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder.worker_threads(2);
                builder
            }
        },
    };
    let secs = args.secs;
    let body = quote! {
        || {
            let budget = std::time::Duration::from_secs(#secs);
            let runtime = #runtime
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime for test");
            runtime.block_on(async {
                tokio::time::timeout(budget, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };

    expand(attrs, vis, sig, secs, body).into()
}

/// Synchronous test bounded by `secs` (default 30).
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = TimeoutArgs::default();
    let parser = syn::meta::parser(|meta| parse_arg(&mut args, meta, false));
    parse_macro_input!(attr with parser);

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, is_test_attribute);
    let body = quote! { || #block };
    expand(attrs, vis, sig, args.secs, body).into()
}

fn parse_arg(
    args: &mut TimeoutArgs,
    meta: syn::meta::ParseNestedMeta<'_>,
    allow_flavor: bool,
) -> syn::Result<()> {
    if meta.path.is_ident("secs") {
        let lit: LitInt = meta.value()?.parse()?;
        let secs: u64 = lit.base10_parse()?;
        if secs == 0 {
            return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
        }
        args.secs = secs;
        Ok(())
    } else if allow_flavor && meta.path.is_ident("flavor") {
        let lit: LitStr = meta.value()?.parse()?;
        args.flavor = match lit.value().as_str() {
            "current_thread" => Flavor::CurrentThread,
            "multi_thread" => Flavor::MultiThread,
            _ => {
                return Err(syn::Error::new_spanned(
                    lit,
                    "flavor must be \"current_thread\" or \"multi_thread\"",
                ));
            }
        };
        Ok(())
    } else {
        Err(meta.error("unsupported timeout argument"))
    }
}

/// Wraps `body` (a closure expression) in a `#[test]` that runs it on its
/// own thread and waits at most `secs` for a verdict.
fn expand(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#secs);
            let (verdict_tx, verdict_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(#body));
                let _ = verdict_tx.send(outcome);
            });
            match verdict_rx.recv_timeout(budget) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    }
}

fn strip_attrs(attrs: Vec<Attribute>, drop: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !drop(attr)).collect()
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
