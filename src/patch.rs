use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;
use log::{debug, warn};

use crate::arch::{self, Arch, MAX_INST_LEN};
use crate::err::PatchError;
use crate::memory::{self, KeepProtect, Protect, SystemProtect};
use crate::reflect::Function;
use crate::registry::{self, Registry};

bitflags! {
    /// Patch flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PatchFlags: u32 {
        /// If set, will not modify the memory protection of the target address. The caller must
        /// have made it writable.
        const NOT_MODIFY_MEMORY_PROTECT = 0x1;
        /// If set, will not check that the target function is long enough to hold the jump.
        const SKIP_PROLOGUE_CHECK = 0x2;
    }
}

/// A redirection of one function to another.
///
/// Cloning gives another handle to the same patch. Dropping a handle does nothing: an armed
/// patch stays armed, and can be found again with [`active_patch`](crate::active_patch).
#[derive(Clone)]
pub struct Patch {
    inner: Arc<PatchInner>,
}

struct PatchInner {
    target: Function,
    flags: PatchFlags,
    protect: &'static (dyn Protect + Sync),
    state: Mutex<PatchState>,
}

struct PatchState {
    replacement: Function,
    // captured on first arm and reused afterwards
    original: Vec<u8>,
    armed: bool,
}

impl Patch {
    /// An unarmed patch. Nothing is validated or written until it is activated.
    pub(crate) fn new(target: Function, replacement: Function, flags: PatchFlags) -> Self {
        let protect: &'static (dyn Protect + Sync) =
            if flags.contains(PatchFlags::NOT_MODIFY_MEMORY_PROTECT) {
                &KeepProtect
            } else {
                &SystemProtect
            };
        Self::with_protect(target, replacement, flags, protect)
    }

    pub(crate) fn with_protect(
        target: Function,
        replacement: Function,
        flags: PatchFlags,
        protect: &'static (dyn Protect + Sync),
    ) -> Self {
        Self {
            inner: Arc::new(PatchInner {
                target,
                flags,
                protect,
                state: Mutex::new(PatchState {
                    replacement,
                    original: Vec::new(),
                    armed: false,
                }),
            }),
        }
    }

    // Always taken after the registry lock.
    fn state(&self) -> MutexGuard<'_, PatchState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The patched function.
    pub fn target(&self) -> Function {
        self.inner.target
    }

    /// The function calls are redirected to.
    pub fn replacement(&self) -> Function {
        self.state().replacement
    }

    /// The flags the patch was created with.
    pub fn flags(&self) -> PatchFlags {
        self.inner.flags
    }

    /// Whether the jump is currently installed.
    pub fn is_armed(&self) -> bool {
        self.state().armed
    }

    /// The bytes the jump overwrote. Empty until the patch has been armed once.
    pub fn original_bytes(&self) -> Vec<u8> {
        self.state().original.clone()
    }

    /// Whether both handles refer to the same patch.
    pub fn same(&self, other: &Patch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Installs the jump again after [`Patch::deactivate`].
    ///
    /// Fails with `AlreadyPatched` if this patch is armed or another patch holds the target.
    pub fn activate(&self) -> Result<(), PatchError> {
        self.activate_locked(&mut registry::lock())
    }

    pub(crate) fn activate_locked(&self, registry: &mut Registry) -> Result<(), PatchError> {
        let mut state = self.state();
        self.arm(registry, &mut state)
    }

    /// Swaps the replacement, then installs the jump.
    ///
    /// The replacement is only kept if the patch could be armed with it.
    pub fn activate_with(&self, replacement: impl Into<Function>) -> Result<(), PatchError> {
        let mut registry = registry::lock();
        let mut state = self.state();
        let previous = std::mem::replace(&mut state.replacement, replacement.into());
        let ret = self.arm(&mut registry, &mut state);
        if ret.is_err() {
            state.replacement = previous;
        }
        ret
    }

    /// Restores the original bytes and unregisters the patch.
    ///
    /// Fails with `NotPatched` if the patch isn't armed.
    pub fn deactivate(&self) -> Result<(), PatchError> {
        self.deactivate_locked(&mut registry::lock())
    }

    pub(crate) fn deactivate_locked(&self, registry: &mut Registry) -> Result<(), PatchError> {
        let mut state = self.state();
        self.disarm(registry, &mut state)
    }

    /// Disarms the patch until the returned guard is dropped, so the original function can be
    /// called, typically from inside the replacement.
    pub fn suspend(&self) -> Result<SuspendGuard, PatchError> {
        self.deactivate()?;
        Ok(SuspendGuard {
            patch: Some(self.clone()),
        })
    }

    fn arm(&self, registry: &mut Registry, state: &mut PatchState) -> Result<(), PatchError> {
        let target = self.inner.target;
        let address = target.address();
        if state.armed {
            return Err(PatchError::AlreadyPatched(address));
        }
        let arch = arch::host_arch()?;
        check_patchable(registry, arch, &target, &state.replacement)?;

        let protect = self.inner.protect;
        let payload = arch.generate_jump(state.replacement.address());
        if state.original.is_empty() {
            if !self.inner.flags.contains(PatchFlags::SKIP_PROLOGUE_CHECK) {
                check_prologue(arch, address, payload.len(), protect.page_size())?;
            }
            state.original = unsafe { memory::read(address, payload.len()) };
        }

        if let Err(err) = unsafe { memory::write(protect, address, &payload) } {
            if err.is_partial_write() {
                // the jump is in place but can't be kept unrecorded
                if let Err(rollback) = unsafe { memory::write(protect, address, &state.original) } {
                    warn!("failed to roll back {}: {}", target, rollback);
                }
            }
            return Err(err);
        }

        registry.register(address, self.clone())?;
        state.armed = true;
        debug!(
            "patched {} -> {} ({} bytes)",
            target,
            state.replacement,
            payload.len()
        );
        Ok(())
    }

    fn disarm(&self, registry: &mut Registry, state: &mut PatchState) -> Result<(), PatchError> {
        let target = self.inner.target;
        let address = target.address();
        if !state.armed {
            return Err(PatchError::NotPatched(address));
        }
        match registry.lookup(address) {
            Some(p) if p.same(self) => {}
            _ => return Err(PatchError::NotPatched(address)),
        }
        if state.original.is_empty() {
            return Err(PatchError::NotPatched(address));
        }

        let ret = unsafe { memory::write(self.inner.protect, address, &state.original) };
        if let Err(err) = &ret {
            if !err.is_partial_write() {
                return ret;
            }
            warn!("restored {} but its pages may still be writable", target);
        }

        registry.unregister(address)?;
        state.armed = false;
        debug!("unpatched {}", target);
        ret
    }
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Patch")
            .field("target", &self.inner.target)
            .field("replacement", &state.replacement)
            .field("armed", &state.armed)
            .field("flags", &self.inner.flags)
            .finish()
    }
}

fn check_callable(arch: Arch, function: &Function) -> Result<(), PatchError> {
    let address = function.address();
    if address == 0 || address % arch.code_alignment() != 0 {
        Err(PatchError::NotCallable(function.name()))
    } else {
        Ok(())
    }
}

// Runs under the registry lock so the result still holds when the patch is registered.
fn check_patchable(
    registry: &Registry,
    arch: Arch,
    target: &Function,
    replacement: &Function,
) -> Result<(), PatchError> {
    check_callable(arch, target)?;
    check_callable(arch, replacement)?;
    if target.signature() != replacement.signature() {
        return Err(PatchError::SignatureMismatch {
            target: target.signature().name(),
            replacement: replacement.signature().name(),
        });
    }
    if registry.contains(target.address()) {
        return Err(PatchError::AlreadyPatched(target.address()));
    }
    Ok(())
}

fn check_prologue(
    arch: Arch,
    address: usize,
    required: usize,
    page_size: usize,
) -> Result<(), PatchError> {
    let code = unsafe { memory::read(address, prologue_window(address, required, page_size)) };
    let available = arch.patchable_len(&code, address as u64, required);
    if available < required {
        Err(PatchError::TargetTooSmall {
            address,
            available,
            required,
        })
    } else {
        Ok(())
    }
}

// Enough for an instruction crossing the end of the payload, without reading past the last page
// the payload itself touches.
fn prologue_window(address: usize, required: usize, page_size: usize) -> usize {
    let last_page_end = ((address + required - 1) & !(page_size - 1)) + page_size;
    (required + MAX_INST_LEN - 1).min(last_page_end - address)
}

/// Re-arms a suspended patch when dropped.
///
/// A failure to re-arm on drop is logged. Use [`SuspendGuard::resume`] to observe it.
#[must_use = "the patch is re-armed as soon as the guard is dropped"]
pub struct SuspendGuard {
    patch: Option<Patch>,
}

impl SuspendGuard {
    /// Re-arms the patch now.
    pub fn resume(mut self) -> Result<(), PatchError> {
        match self.patch.take() {
            Some(patch) => patch.activate(),
            None => Ok(()),
        }
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if let Some(patch) = self.patch.take() {
            if let Err(err) = patch.activate() {
                warn!("failed to re-arm {}: {}", patch.target(), err);
            }
        }
    }
}
