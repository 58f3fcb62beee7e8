//! Raw access to live code.
//!
//! Everything that dereferences a code address lives here. The rest of the crate only passes
//! addresses and byte buffers around.

use std::{ptr, slice};

use log::{trace, warn};

use crate::err::{PatchError, ProtectStage};

#[cfg(unix)]
mod protect_unix;
#[cfg(unix)]
use protect_unix as sys;

#[cfg(windows)]
mod protect_win;
#[cfg(windows)]
use protect_win as sys;

/// Changes the protection of whole pages.
///
/// Error values are OS error codes.
pub(crate) trait Protect {
    fn page_size(&self) -> usize;

    /// Makes the pages readable, writable and executable. Returns the protection
    /// [`Protect::restore`] should put back.
    fn unlock(&self, page: usize, len: usize) -> Result<u32, u32>;

    fn restore(&self, page: usize, len: usize, prot: u32) -> Result<(), u32>;
}

/// Page protection of the current process.
pub(crate) struct SystemProtect;

impl Protect for SystemProtect {
    fn page_size(&self) -> usize {
        sys::page_size()
    }

    fn unlock(&self, page: usize, len: usize) -> Result<u32, u32> {
        sys::protect_rwx(page, len)
    }

    fn restore(&self, page: usize, len: usize, prot: u32) -> Result<(), u32> {
        sys::protect(page, len, prot)
    }
}

/// Leaves protection untouched. Used when the caller already made the target writable.
pub(crate) struct KeepProtect;

impl Protect for KeepProtect {
    fn page_size(&self) -> usize {
        0x1000
    }

    fn unlock(&self, _: usize, _: usize) -> Result<u32, u32> {
        Ok(0)
    }

    fn restore(&self, _: usize, _: usize, _: u32) -> Result<(), u32> {
        Ok(())
    }
}

/// Start addresses of the pages spanning `[addr, addr + len)`.
pub(crate) fn page_range(addr: usize, len: usize, page_size: usize) -> impl Iterator<Item = usize> {
    let start = addr & !(page_size - 1);
    let end = addr + len;
    (start..end).step_by(page_size)
}

/// Copies `len` bytes from `addr`.
///
/// # Safety
///
/// `[addr, addr + len)` must be readable.
pub(crate) unsafe fn read(addr: usize, len: usize) -> Vec<u8> {
    unsafe { slice::from_raw_parts(addr as *const u8, len) }.to_vec()
}

/// Overwrites the bytes at `addr` with `bytes`, changing the protection of every page the
/// range spans for the duration of the copy.
///
/// The copy is not atomic with respect to other threads fetching instructions from the range.
///
/// # Safety
///
/// `[addr, addr + bytes.len())` must be mapped memory that can be made writable, and no live
/// Rust reference may point into it.
pub(crate) unsafe fn write<P: Protect + ?Sized>(
    protect: &P,
    addr: usize,
    bytes: &[u8],
) -> Result<(), PatchError> {
    if bytes.is_empty() {
        return Ok(());
    }
    let page_size = protect.page_size();

    let mut unlocked = Vec::with_capacity(2);
    for page in page_range(addr, bytes.len(), page_size) {
        match protect.unlock(page, page_size) {
            Ok(prot) => {
                trace!("unlocked page {:#x}", page);
                unlocked.push((page, prot));
            }
            Err(code) => {
                relock(protect, page_size, &unlocked);
                return Err(PatchError::ProtectionChangeFailed {
                    address: page,
                    code,
                    stage: ProtectStage::Unlock,
                });
            }
        }
    }

    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
    flush_icache(addr, bytes.len());

    match relock(protect, page_size, &unlocked) {
        None => Ok(()),
        Some((address, code)) => Err(PatchError::ProtectionChangeFailed {
            address,
            code,
            stage: ProtectStage::Relock,
        }),
    }
}

// Restores every page, even after a failure. Returns the first failure.
fn relock<P: Protect + ?Sized>(
    protect: &P,
    page_size: usize,
    pages: &[(usize, u32)],
) -> Option<(usize, u32)> {
    let mut first_err = None;
    for &(page, prot) in pages {
        if let Err(code) = protect.restore(page, page_size, prot) {
            warn!("failed to restore protection of page {:#x}, code:{}", page, code);
            first_err.get_or_insert((page, code));
        }
    }
    first_err
}

// No-op on x86, required after writing code on aarch64. Returns false if the cache could not
// be flushed.
fn flush_icache(addr: usize, len: usize) -> bool {
    let start = addr as *const u8;
    let flushed = unsafe { clear_cache::clear_cache(start, start.wrapping_add(len)) };
    if !flushed {
        warn!("failed to flush the instruction cache at {:#x}", addr);
    }
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeProtect {
        fail_unlock_at: Option<usize>,
        fail_restore: bool,
        unlocked: RefCell<Vec<usize>>,
        restored: RefCell<Vec<usize>>,
    }

    impl Protect for FakeProtect {
        fn page_size(&self) -> usize {
            16
        }

        fn unlock(&self, page: usize, _: usize) -> Result<u32, u32> {
            if self.fail_unlock_at == Some(page) {
                return Err(13);
            }
            self.unlocked.borrow_mut().push(page);
            Ok(5)
        }

        fn restore(&self, page: usize, _: usize, prot: u32) -> Result<(), u32> {
            assert_eq!(prot, 5);
            self.restored.borrow_mut().push(page);
            if self.fail_restore { Err(1) } else { Ok(()) }
        }
    }

    // 64 bytes aligned to the fake page size
    #[repr(align(16))]
    struct Code([u8; 64]);

    #[test]
    fn test_page_range() {
        assert_eq!(page_range(0x1000, 13, 0x1000).collect::<Vec<_>>(), [0x1000]);
        assert_eq!(page_range(0x1ffa, 13, 0x1000).collect::<Vec<_>>(), [0x1000, 0x2000]);
        assert_eq!(page_range(0x1ff3, 13, 0x1000).collect::<Vec<_>>(), [0x1000]);
        assert_eq!(page_range(0x1ff4, 13, 0x1000).collect::<Vec<_>>(), [0x1000, 0x2000]);
    }

    #[test]
    fn test_write_straddling_pages() {
        let mut code = Code([0x90; 64]);
        let base = code.0.as_mut_ptr() as usize;
        let protect = FakeProtect::default();

        unsafe { write(&protect, base + 10, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap() };

        assert_eq!(code.0[9], 0x90);
        assert_eq!(code.0[10..19], [1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(code.0[19], 0x90);
        assert_eq!(*protect.unlocked.borrow(), [base, base + 16]);
        assert_eq!(*protect.restored.borrow(), [base, base + 16]);
    }

    #[test]
    fn test_write_unlock_failed() {
        let mut code = Code([0x90; 64]);
        let base = code.0.as_mut_ptr() as usize;
        let protect = FakeProtect {
            fail_unlock_at: Some(base + 16),
            ..Default::default()
        };

        let err = unsafe { write(&protect, base + 10, &[0xcc; 9]).unwrap_err() };

        assert_eq!(
            err,
            PatchError::ProtectionChangeFailed {
                address: base + 16,
                code: 13,
                stage: ProtectStage::Unlock
            }
        );
        assert!(!err.is_partial_write());
        assert!(code.0.iter().all(|&b| b == 0x90));
        // the first page is given back
        assert_eq!(*protect.restored.borrow(), [base]);
    }

    #[test]
    fn test_write_relock_failed() {
        let mut code = Code([0x90; 64]);
        let base = code.0.as_mut_ptr() as usize;
        let protect = FakeProtect {
            fail_restore: true,
            ..Default::default()
        };

        let err = unsafe { write(&protect, base + 10, &[0xcc; 9]).unwrap_err() };

        assert!(err.is_partial_write());
        assert_eq!(code.0[10..19], [0xcc; 9]);
        // every page is still attempted
        assert_eq!(*protect.restored.borrow(), [base, base + 16]);
    }

    #[test]
    #[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
    fn test_flush_icache() {
        let code = Code([0; 64]);
        assert!(flush_icache(code.0.as_ptr() as usize, code.0.len()));
    }

    #[test]
    fn test_write_keep_protect() {
        let mut code = Code([0; 64]);
        let base = code.0.as_mut_ptr() as usize;
        unsafe { write(&KeepProtect, base + 1, &[0xaa, 0xbb]).unwrap() };
        assert_eq!(code.0[..4], [0, 0xaa, 0xbb, 0]);
        assert_eq!(unsafe { read(base, 4) }, [0, 0xaa, 0xbb, 0]);
    }
}
