use core::ffi::c_void;
use std::mem::MaybeUninit;

use windows_sys::Win32::Foundation::GetLastError;
use windows_sys::Win32::System::Memory::{PAGE_EXECUTE_READWRITE, VirtualProtect};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

pub(super) fn page_size() -> usize {
    let mut info = MaybeUninit::<SYSTEM_INFO>::zeroed();
    unsafe {
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init().dwPageSize as usize
    }
}

// Returns the protection the page had before, which is what gets restored.
pub(super) fn protect_rwx(page: usize, len: usize) -> Result<u32, u32> {
    let mut old_prot: u32 = 0;
    let ret = unsafe { VirtualProtect(page as *const c_void, len, PAGE_EXECUTE_READWRITE, &mut old_prot) };
    if ret == 0 {
        Err(unsafe { GetLastError() })
    } else {
        Ok(old_prot)
    }
}

pub(super) fn protect(page: usize, len: usize, prot: u32) -> Result<(), u32> {
    // VirtualProtect insists on somewhere to store the old protection
    let mut old_prot: u32 = 0;
    let ret = unsafe { VirtualProtect(page as *const c_void, len, prot, &mut old_prot) };
    if ret == 0 {
        Err(unsafe { GetLastError() })
    } else {
        Ok(())
    }
}
