use std::fmt;
use thiserror::Error;

/// The step of a protected write at which changing the page protection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectStage {
    /// Making the pages writable. Nothing has been written.
    Unlock,
    /// Restoring the pages to read+execute. The bytes have already been written.
    Relock,
}

impl fmt::Display for ProtectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectStage::Unlock => f.write_str("unlock"),
            ProtectStage::Relock => f.write_str("relock"),
        }
    }
}

/// Patch errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// The target or the replacement doesn't resolve to an invocable function
    #[error("`{0}` is not a callable function")]
    NotCallable(&'static str),

    /// The target and the replacement have different signatures
    #[error("the target and replacement don't have the same type: {target} != {replacement}")]
    SignatureMismatch {
        /// Signature of the target
        target: &'static str,
        /// Signature of the replacement
        replacement: &'static str,
    },

    /// The address already has an armed patch
    #[error("the target at {0:#x} is already patched")]
    AlreadyPatched(usize),

    /// The address has no armed patch
    #[error("the target at {0:#x} is not patched")]
    NotPatched(usize),

    /// The method can't be found on the type, nor on its reference type
    #[error("method `{method}` not found on `{ty}`")]
    MethodNotFound {
        /// Name of the type the method was looked up on
        ty: &'static str,
        /// Name of the method
        method: String,
    },

    /// No jump payload can be generated for the current instruction set
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(&'static str),

    /// Error occurs when modifying the memory protect
    #[error("memory protect error while trying to {stage} {address:#x}, code:{code}")]
    ProtectionChangeFailed {
        /// Start of the page whose protection couldn't be changed
        address: usize,
        /// The OS error code
        code: u32,
        /// Whether the bytes were already written
        stage: ProtectStage,
    },

    /// The function ends before the jump payload does
    #[error("target at {address:#x} has {available} patchable bytes, {required} required")]
    TargetTooSmall {
        /// Address of the target
        address: usize,
        /// Bytes before control flow leaves the function
        available: usize,
        /// Length of the jump payload
        required: usize,
    },
}

impl PatchError {
    /// Returns true if the bytes were written but the page protection could not be restored,
    /// which leaves the target pages writable.
    pub fn is_partial_write(&self) -> bool {
        matches!(
            self,
            PatchError::ProtectionChangeFailed {
                stage: ProtectStage::Relock,
                ..
            }
        )
    }
}
