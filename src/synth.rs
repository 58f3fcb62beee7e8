//! Replacement functions backed by closures.
//!
//! Every closure has its own type, so a generic thunk instantiated with that type is a distinct
//! function with its own address. The thunk finds its closure by `TypeId` in a process-wide
//! table and forwards the arguments as a tuple.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use lazy_static::lazy_static;

use crate::reflect::FnPtr;

lazy_static! {
    static ref HANDLERS: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>> =
        Mutex::new(HashMap::new());
}

/// Fn pointer types for which a callable can be synthesized from a handler.
///
/// The handler receives the arguments as a tuple and returns the result. Synthesizing twice
/// with the same handler type replaces the first handler, since both share one thunk.
///
/// A panic in a handler behind an `extern "C"` signature aborts the process.
pub trait Synthesize: FnPtr {
    /// Returns a fn pointer of type `Self` that calls `handler`.
    fn synthesize<H>(handler: H) -> Self
    where
        H: Fn(Self::Args) -> Self::Output + Send + Sync + 'static;
}

fn install<H: Any + Send + Sync>(handler: H) {
    HANDLERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(TypeId::of::<H>(), Arc::new(handler));
}

fn invoke<H, Args, Ret>(args: Args) -> Ret
where
    H: Fn(Args) -> Ret + Send + Sync + 'static,
{
    // Only `synthesize` names a thunk instantiated for `H`, and it installs the handler before
    // returning the thunk, so the entry is always there. Cloned out so the handler runs without
    // the table locked.
    let handler = HANDLERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&TypeId::of::<H>())
        .cloned()
        .and_then(|h| h.downcast::<H>().ok())
        .expect("a thunk is only handed out after its handler is installed");
    handler(args)
}

macro_rules! impl_synthesize {
    ($($arg:ident),*) => {
        impl_synthesize!(@impl [fn($($arg),*) -> Ret] [fn] $($arg),*);
        impl_synthesize!(@impl [unsafe fn($($arg),*) -> Ret] [fn] $($arg),*);
        impl_synthesize!(@impl [extern "C" fn($($arg),*) -> Ret] [extern "C" fn] $($arg),*);
        impl_synthesize!(@impl [unsafe extern "C" fn($($arg),*) -> Ret] [extern "C" fn] $($arg),*);
    };
    (@impl [$($ty:tt)*] [$($thunk_abi:tt)*] $($arg:ident),*) => {
        impl<Ret: 'static, $($arg: 'static),*> Synthesize for $($ty)* {
            fn synthesize<Hd>(handler: Hd) -> Self
            where
                Hd: Fn(Self::Args) -> Self::Output + Send + Sync + 'static,
            {
                #[allow(non_snake_case, improper_ctypes_definitions)]
                $($thunk_abi)* thunk<Hd, Ret, $($arg),*>($($arg: $arg),*) -> Ret
                where
                    Hd: Fn(($($arg,)*)) -> Ret + Send + Sync + 'static,
                {
                    invoke::<Hd, _, _>(($($arg,)*))
                }

                install(handler);
                thunk::<Hd, Ret, $($arg),*>
            }
        }
    };
}

impl_synthesize!();
impl_synthesize!(A);
impl_synthesize!(A, B);
impl_synthesize!(A, B, C);
impl_synthesize!(A, B, C, D);
impl_synthesize!(A, B, C, D, E);
impl_synthesize!(A, B, C, D, E, F);
impl_synthesize!(A, B, C, D, E, F, G);
impl_synthesize!(A, B, C, D, E, F, G, H);
