//! Resolving functions and methods to code addresses.
//!
//! A patch only needs two facts about each side: where its code starts and what its signature
//! is. [`Function`] carries both. It is built from a fn pointer ([`FnPtr`]), from an explicitly
//! typed expression ([`function!`](crate::function)), or by hand for code found some other way.
//! [`TypeInfo`] maps method names of a type to [`Function`]s.

use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A signature token. Two functions may replace each other only if their tokens are equal.
///
/// The token of a fn pointer type is its [`TypeId`], so the ABI, the parameter types and the
/// return type all take part in the comparison.
#[derive(Clone, Copy)]
pub struct Signature {
    id: TypeId,
    name: &'static str,
}

impl Signature {
    /// The signature token of the fn pointer type `F`.
    pub fn of<F: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<F>(),
            name: type_name::<F>(),
        }
    }

    /// Human readable form of the signature.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Signature {}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A resolved function: code address plus signature.
#[derive(Debug, Clone, Copy)]
pub struct Function {
    address: usize,
    signature: Signature,
    name: &'static str,
}

impl Function {
    /// Creates a function from a raw code address.
    ///
    /// Nothing is checked here. Patching fails with `NotCallable` if `address` can't be the
    /// entry of a function.
    pub fn new(address: usize, signature: Signature, name: &'static str) -> Self {
        Self {
            address,
            signature,
            name,
        }
    }

    /// Resolves a fn pointer.
    pub fn of<F: FnPtr>(f: F) -> Self {
        Self::new(f.address(), Signature::of::<F>(), type_name::<F>())
    }

    /// The entry address.
    pub fn address(&self) -> usize {
        self.address
    }

    /// The signature token.
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// The name used in errors and logs.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.signature == other.signature
    }
}

impl Eq for Function {}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.name, self.address)
    }
}

impl<F: FnPtr> From<F> for Function {
    fn from(f: F) -> Self {
        Function::of(f)
    }
}

/// Fn pointer types that can be resolved without help.
///
/// Implemented for `fn`, `unsafe fn`, `extern "C" fn` and `unsafe extern "C" fn` pointers with up
/// to 8 parameters that take no references. Pointers with reference parameters are higher-ranked
/// and go through [`function!`](crate::function) instead.
pub trait FnPtr: Copy + Send + Sync + 'static {
    /// The parameters as a tuple.
    type Args;
    /// The return type.
    type Output;

    /// The entry address.
    fn address(self) -> usize;
}

macro_rules! impl_fn_ptr {
    ($($arg:ident),*) => {
        impl_fn_ptr!(@impl [fn($($arg),*) -> Ret] $($arg),*);
        impl_fn_ptr!(@impl [unsafe fn($($arg),*) -> Ret] $($arg),*);
        impl_fn_ptr!(@impl [extern "C" fn($($arg),*) -> Ret] $($arg),*);
        impl_fn_ptr!(@impl [unsafe extern "C" fn($($arg),*) -> Ret] $($arg),*);
    };
    (@impl [$($ty:tt)*] $($arg:ident),*) => {
        impl<Ret: 'static, $($arg: 'static),*> FnPtr for $($ty)* {
            type Args = ($($arg,)*);
            type Output = Ret;

            fn address(self) -> usize {
                self as *const () as usize
            }
        }
    };
}

impl_fn_ptr!();
impl_fn_ptr!(A);
impl_fn_ptr!(A, B);
impl_fn_ptr!(A, B, C);
impl_fn_ptr!(A, B, C, D);
impl_fn_ptr!(A, B, C, D, E);
impl_fn_ptr!(A, B, C, D, E, F);
impl_fn_ptr!(A, B, C, D, E, F, G);
impl_fn_ptr!(A, B, C, D, E, F, G, H);

/// Resolves a function or method path with an explicit fn pointer type.
///
/// Works for every fn pointer type, including ones with reference parameters such as the
/// receiver of a `&self` method.
///
/// ```rust
/// use ilpatch::{Signature, function};
///
/// struct Counter(i32);
///
/// impl Counter {
///     fn get(&self) -> i32 {
///         self.0
///     }
/// }
///
/// let get = function!(Counter::get, fn(&Counter) -> i32);
/// assert_eq!(get.signature(), Signature::of::<fn(&Counter) -> i32>());
/// assert_eq!(get.name(), "Counter::get");
/// ```
#[macro_export]
macro_rules! function {
    ($f:expr, $ty:ty) => {{
        let f: $ty = $f;
        $crate::Function::new(
            f as *const () as usize,
            $crate::Signature::of::<$ty>(),
            stringify!($f),
        )
    }};
}

/// Whether a type is used by value or through a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// `T`
    Value,
    /// `&T`
    Reference,
}

/// A named method resolved to a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Method {
    name: &'static str,
    function: Function,
}

impl Method {
    /// Creates a method.
    pub fn new(name: &'static str, function: impl Into<Function>) -> Self {
        Self {
            name,
            function: function.into(),
        }
    }

    /// The method name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The function implementing the method.
    pub fn function(&self) -> Function {
        self.function
    }
}

/// The method set of a type.
///
/// Methods taking `self` belong to the value type, methods taking `&self` belong to the
/// reference type, which a value type can carry along with [`TypeInfo::with_reference`].
#[derive(Debug, Clone)]
pub struct TypeInfo {
    name: &'static str,
    kind: TypeKind,
    methods: Vec<Method>,
    reference: Option<Box<TypeInfo>>,
}

impl TypeInfo {
    /// An empty method set for the value type `T`.
    pub fn value<T: ?Sized + 'static>() -> Self {
        Self {
            name: type_name::<T>(),
            kind: TypeKind::Value,
            methods: Vec::new(),
            reference: None,
        }
    }

    /// An empty method set for `&T`.
    pub fn reference<T: ?Sized + 'static>() -> Self {
        Self {
            name: type_name::<&T>(),
            kind: TypeKind::Reference,
            methods: Vec::new(),
            reference: None,
        }
    }

    /// The method set of `T` as provided by its [`Reflect`] impl.
    pub fn of<T: Reflect + ?Sized>() -> Self {
        T::type_info()
    }

    /// Adds a method. A later method with the same name shadows an earlier one.
    pub fn method(mut self, name: &'static str, function: impl Into<Function>) -> Self {
        self.methods.retain(|m| m.name != name);
        self.methods.push(Method::new(name, function));
        self
    }

    /// Attaches the method set of the reference type.
    pub fn with_reference(mut self, reference: TypeInfo) -> Self {
        self.reference = Some(Box::new(reference));
        self
    }

    /// The type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Value or reference.
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// The methods of this type only, without the reference type's.
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// The attached reference type.
    pub fn reference_type(&self) -> Option<&TypeInfo> {
        self.reference.as_deref()
    }

    /// Looks up a method of this type only.
    pub fn method_by_name(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Types that can describe their own method set.
pub trait Reflect: 'static {
    /// Returns the method set.
    fn type_info() -> TypeInfo;
}
