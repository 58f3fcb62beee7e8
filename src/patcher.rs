use crate::err::PatchError;
use crate::patch::{Patch, PatchFlags};
use crate::reflect::{Function, Method, TypeInfo, TypeKind};
use crate::registry;
use crate::synth::Synthesize;

/// The configurable entry point. The `patch_*` functions use it with empty flags.
pub struct Patcher {
    target: Function,
    replacement: Function,
    flags: PatchFlags,
}

impl Patcher {
    /// Create a new Patcher.
    ///
    /// # Arguments
    ///
    /// * `target` - The function whose calls are redirected.
    /// * `replacement` - The function that runs instead. Must have the same signature.
    pub fn new(target: impl Into<Function>, replacement: impl Into<Function>) -> Self {
        Self {
            target: target.into(),
            replacement: replacement.into(),
            flags: PatchFlags::empty(),
        }
    }

    /// Sets the patch flags.
    pub fn flags(mut self, flags: PatchFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Consumes self, installs the jump and returns the armed patch.
    ///
    /// # Errors
    ///
    /// * `NotCallable` - the target or the replacement can't be the entry of a function.
    /// * `SignatureMismatch` - the signatures differ. Nothing is written.
    /// * `AlreadyPatched` - another patch holds the target.
    /// * `TargetTooSmall` - the target function is shorter than the jump.
    /// * `UnsupportedArchitecture`, `ProtectionChangeFailed`
    pub fn patch(self) -> Result<Patch, PatchError> {
        let patch = Patch::new(self.target, self.replacement, self.flags);
        patch.activate()?;
        Ok(patch)
    }
}

/// Redirects calls of `target` to `replacement`.
///
/// Both must resolve to functions with the same signature.
pub fn patch_function(
    target: impl Into<Function>,
    replacement: impl Into<Function>,
) -> Result<Patch, PatchError> {
    Patcher::new(target, replacement).patch()
}

/// Redirects calls of an already resolved method.
pub fn patch_method(method: &Method, replacement: impl Into<Function>) -> Result<Patch, PatchError> {
    patch_function(method.function(), replacement)
}

/// Redirects calls of the method `method_name` of a type.
///
/// A method that isn't in the method set of a value type is looked up in the method set of its
/// reference type, where `&self` methods live.
pub fn patch_instance_method(
    ty: &TypeInfo,
    method_name: &str,
    replacement: impl Into<Function>,
) -> Result<Patch, PatchError> {
    let method = resolve_method(ty, method_name)?;
    patch_method(&method, replacement)
}

/// Redirects calls of `target` to a function synthesized from `handler`.
///
/// The handler gets the arguments as a tuple.
pub fn patch_function_with<F, H>(target: F, handler: H) -> Result<Patch, PatchError>
where
    F: Synthesize,
    H: Fn(F::Args) -> F::Output + Send + Sync + 'static,
{
    patch_function(target, F::synthesize(handler))
}

/// Redirects calls of a resolved method to a function of type `F` synthesized from `handler`.
///
/// `F` must be the signature of the method, otherwise `SignatureMismatch` is returned.
pub fn patch_method_with<F, H>(method: &Method, handler: H) -> Result<Patch, PatchError>
where
    F: Synthesize,
    H: Fn(F::Args) -> F::Output + Send + Sync + 'static,
{
    patch_method(method, F::synthesize(handler))
}

/// Returns the armed patch of `target`, if any.
pub fn active_patch(target: impl Into<Function>) -> Option<Patch> {
    registry::lock().lookup(target.into().address()).cloned()
}

/// Disarms every armed patch. Returns how many were disarmed.
///
/// Stops at the first failure.
pub fn restore_all() -> Result<usize, PatchError> {
    let mut registry = registry::lock();
    let patches = registry.patches();
    for patch in &patches {
        patch.deactivate_locked(&mut registry)?;
    }
    Ok(patches.len())
}

fn resolve_method(ty: &TypeInfo, name: &str) -> Result<Method, PatchError> {
    ty.method_by_name(name)
        .or_else(|| match (ty.kind(), ty.reference_type()) {
            (TypeKind::Value, Some(reference)) => reference.method_by_name(name),
            _ => None,
        })
        .copied()
        .ok_or_else(|| PatchError::MethodNotFound {
            ty: ty.name(),
            method: name.to_string(),
        })
}
