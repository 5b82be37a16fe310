//! Attribute macros that run a test on its own thread and fail it when it
//! outlives a deadline, so a hung socket or a lost wakeup shows up as a
//! failure instead of a stuck `cargo test`.
//!
//! The deadline is the attribute argument (seconds, default 30). Setting
//! `HARBOR_TEST_TIMEOUT_SECS` at test run time overrides it for every test.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Async test on a current-thread Tokio runtime with a deadline.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(__deadline, async move #block)
                .await
                .expect("test timed out");
        });
    };
    let attrs = strip_test_attributes(attrs);
    wrap(quote! { #(#attrs)* #vis #sig }, timeout, body).into()
}

/// Synchronous test with a deadline.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
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

    let attrs = strip_test_attributes(attrs);
    wrap(quote! { #(#attrs)* #vis #sig }, timeout, quote! { #block; }).into()
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Emit `#[test] <signature> { ... }` whose body runs `body` on a worker
/// thread and waits at most the deadline for it.
fn wrap(signature: TokenStream2, timeout_secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        #[test]
        #signature {
            let __deadline = std::env::var("HARBOR_TEST_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(std::time::Duration::from_secs)
                .unwrap_or(std::time::Duration::from_secs(#timeout_secs));
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(__deadline) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", __deadline)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

/// Drop `#[test]` and `#[tokio::test]` so the generated `#[test]` is the
/// only one.
fn strip_test_attributes(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(
                segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
                ["test"] | ["tokio", "test"]
            )
        })
        .collect()
}
