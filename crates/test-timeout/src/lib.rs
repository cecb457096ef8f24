//! Test attributes that fail a test instead of hanging the suite.
//!
//! `#[tokio_timeout_test]` runs an async test on a fresh current-thread
//! runtime; `#[timeout]` guards a synchronous one. Both accept an optional
//! limit in seconds (default 60). The async form also accepts `paused`, which
//! starts the runtime with the clock frozen so timers advance only when every
//! task is idle.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct Options {
    secs: u64,
    paused: bool,
}

fn parse_options(attr: TokenStream, allow_paused: bool) -> syn::Result<Options> {
    let mut options = Options {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.secs = secs;
            }
            Expr::Path(ExprPath { path, .. }) if allow_paused && path.is_ident("paused") => {
                options.paused = true;
            }
            other => {
                let expected = if allow_paused {
                    "expected a timeout in seconds or `paused`"
                } else {
                    "expected a timeout in seconds"
                };
                return Err(syn::Error::new_spanned(other, expected));
            }
        }
    }
    Ok(options)
}

/// Runs `body` on a watchdog thread and fails the test if it does not report
/// back within `secs`.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = ::std::time::Duration::from_secs(#secs);
        let (sender, receiver) = ::std::sync::mpsc::channel();
        ::std::thread::spawn(move || {
            let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {}s", #secs)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }
}

fn has_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments == expected
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };
    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = attrs
        .into_iter()
        .filter(|attr| !has_path(attr, &["tokio", "test"]));
    // `start_paused` only exists with tokio's `test-util` feature.
    let pause = options.paused.then(|| quote! { .start_paused(true) });
    let secs = options.secs;
    let body = watchdog(
        secs,
        quote! {
            let runtime = ::tokio::runtime::Builder::new_current_thread()
                .enable_all()
                #pause
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                ::tokio::time::timeout(::std::time::Duration::from_secs(#secs), async move #block)
                    .await
                    .expect("test timed out");
            });
        },
    );

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };
    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = attrs.into_iter().filter(|attr| !has_path(attr, &["test"]));
    let body = watchdog(options.secs, quote! { #block });

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}
