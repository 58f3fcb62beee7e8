/*!
This crate redirects calls of a function to a replacement function by patching the entry of the
target in memory, and restores the original code on demand. It is meant for tests that need to
swap out a dependency which can't be injected.

Supported instruction sets are `x86`, `x86_64` and `aarch64`, on unix and windows.

# Installation

```toml
[dependencies]
ilpatch = "0.1"
```

# Patching a function

Assume we have two functions with the same signature:

```rust
#[inline(never)]
fn foo(x: u64) -> u64 {
    println!("original foo, x:{}", x);
    x * x
}

#[inline(never)]
fn new_foo(x: u64) -> u64 {
    x * x + 3
}

assert_eq!(foo(5), 25);
```

Every call of `foo` can be sent to `new_foo`:

```rust,no_run
# #[inline(never)]
# fn foo(x: u64) -> u64 {
#     println!("original foo, x:{}", x);
#     x * x
# }
# #[inline(never)]
# fn new_foo(x: u64) -> u64 {
#     x * x + 3
# }
use ilpatch::patch_function;

let patch = patch_function(foo as fn(u64) -> u64, new_foo as fn(u64) -> u64).unwrap();
assert_eq!(foo(5), 28);
patch.deactivate().unwrap();
assert_eq!(foo(5), 25);
```

Both sides are resolved to a [`Function`]: a code address and a [`Signature`]. The signatures
must be equal, so the replacement must take the same parameters and return the same type with
the same ABI. Otherwise [`PatchError::SignatureMismatch`] is returned and nothing is written.

Fn pointers with reference parameters are higher-ranked. Resolve them with [`function!`].

# Patching a method

A [`TypeInfo`] lists the methods of a type. Methods taking `self` are on the value type, methods
taking `&self` are on the reference type. A method not found on a value type is looked up on its
reference type.

```rust,no_run
use ilpatch::{Reflect, TypeInfo, function, patch_instance_method};

struct Account {
    balance: i64,
}

impl Account {
    #[inline(never)]
    fn balance(&self) -> i64 {
        println!("balance: {}", self.balance);
        self.balance
    }
}

impl Reflect for Account {
    fn type_info() -> TypeInfo {
        TypeInfo::value::<Account>().with_reference(
            TypeInfo::reference::<Account>()
                .method("balance", function!(Account::balance, fn(&Account) -> i64)),
        )
    }
}

fn rich(_: &Account) -> i64 {
    1_000_000
}

let patch = patch_instance_method(
    &TypeInfo::of::<Account>(),
    "balance",
    function!(rich, fn(&Account) -> i64),
)
.unwrap();
assert_eq!(Account { balance: 1 }.balance(), 1_000_000);
patch.deactivate().unwrap();
```

# Replacements from closures

[`patch_function_with`] synthesizes the replacement from a closure taking the arguments as a
tuple:

```rust,no_run
# #[inline(never)]
# fn foo(x: u64) -> u64 {
#     println!("original foo, x:{}", x);
#     x * x
# }
let patch = ilpatch::patch_function_with(foo as fn(u64) -> u64, |(x,)| x + 1).unwrap();
assert_eq!(foo(5), 6);
# patch.deactivate().unwrap();
```

# Notes

The jump overwrites the first bytes of the target (13 on `x86_64`, 7 on `x86`, 16 on
`aarch64`). The target, together with the fill after it up to the next 16-byte boundary, must
be at least that long, which is checked unless [`PatchFlags::SKIP_PROLOGUE_CHECK`] is given.
Functions that get inlined at their call sites can't be patched, so mark targets
`#[inline(never)]`.

All patches share one process-wide registry, and every write happens under its lock. Another
thread executing the target while its entry is being rewritten may still fetch a half-written
jump. Patch before starting such threads.

Code pages are made writable for the duration of a write. If their protection can't be restored
afterwards, [`PatchError::ProtectionChangeFailed`] is returned with [`ProtectStage::Relock`]. A
failed activation writes the original bytes back and leaves the patch unarmed. A failed
deactivation has already restored the original bytes and unregisters the patch.

*/

#![warn(missing_docs)]

/// Jump payloads per instruction set
pub mod arch;

mod err;
mod memory;
mod patch;
mod patcher;
mod reflect;
mod registry;
mod synth;

#[cfg(all(
    test,
    any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"),
    not(all(target_os = "macos", target_arch = "aarch64"))
))]

pub use arch::{Arch, generate_jump};
pub use err::{PatchError, ProtectStage};
pub use patch::{Patch, PatchFlags, SuspendGuard};
pub use patcher::{
    Patcher, active_patch, patch_function, patch_function_with, patch_instance_method,
    patch_method, patch_method_with, restore_all,
};
pub use reflect::{FnPtr, Function, Method, Reflect, Signature, TypeInfo, TypeKind};
pub use synth::Synthesize;
