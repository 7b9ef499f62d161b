use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, Ident, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one, and inject a fresh
/// simulated ledger network so that no state leaks between tests.
///
/// Injectable dependencies are [`crate::simulation::Network`],
/// [`crate::clock::ManualClock`], [`crate::simulation::SimulatedFhe`], and any
/// number of [`crate::simulation::Account`]s. Each account is connected to the
/// network under the name of its parameter, so `alice: Account` and
/// `bob: Account` are two distinct signers.
#[proc_macro_attribute]
pub fn ballot_test(_args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);

    // Extract the injections and reject invalid function signatures.
    let (idents, exprs): (Vec<Ident>, Vec<TokenStream2>) = match check_sig(&item_fn.sig) {
        Ok(injections) => injections.into_iter().unzip(),
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            /// The test itself.
            #item_fn

            log4rs_test_utils::test_logging::init_logging_once_for(
                ["secret_ballot"],
                None,
                None,
            );

            // Tests are single-threaded, like the pipelines they exercise.
            let runtime = tokio::runtime::Builder::new_current_thread()
                .thread_name("ballot-test")
                .enable_all()
                .build()
                .unwrap();

            // Every test gets its own chain, coprocessor, and clock.
            let network = crate::simulation::Network::new();
            #(
                let #idents = #exprs;
            )*

            runtime.block_on(#new_name(#(#idents),*));
        }
    }
    .into()
}

/// Ensure the wrapped test is async, and map each parameter to the expression
/// that produces it. Unknown parameters are rejected.
fn check_sig(sig: &Signature) -> Result<Vec<(Ident, TokenStream2)>, syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut has_network = false;
    let mut injections = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let Pat::Ident(pat_ident) = &*pat_type.pat {
                if let Type::Path(type_path) = &*pat_type.ty {
                    if let Some(type_ident) = type_path.path.get_ident() {
                        let ident = pat_ident.ident.clone();
                        if type_ident == "Network" {
                            if has_network {
                                return Err(syn::Error::new(
                                    input.span(),
                                    "Test cannot accept more than one `Network`",
                                ));
                            }
                            has_network = true;
                            injections.push((ident, quote! { network.clone() }));
                            continue;
                        } else if type_ident == "ManualClock" {
                            injections.push((ident, quote! { network.clock() }));
                            continue;
                        } else if type_ident == "SimulatedFhe" {
                            injections.push((ident, quote! { network.fhe() }));
                            continue;
                        } else if type_ident == "Account" {
                            let account_name = ident.to_string();
                            injections.push((ident, quote! { network.account(#account_name) }));
                            continue;
                        }
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `network: Network`, `clock: ManualClock`, `fhe: SimulatedFhe` or `name: Account`",
        ));
    }

    Ok(injections)
}
