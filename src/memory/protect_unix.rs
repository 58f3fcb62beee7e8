use std::io;

use libc::{PROT_EXEC, PROT_READ, PROT_WRITE, c_void, mprotect, sysconf, _SC_PAGESIZE};

pub(super) fn page_size() -> usize {
    unsafe { sysconf(_SC_PAGESIZE) as usize }
}

fn last_error() -> u32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32
}

// mprotect can't report the previous protection; code pages are read+execute.
pub(super) fn protect_rwx(page: usize, len: usize) -> Result<u32, u32> {
    protect(page, len, (PROT_READ | PROT_WRITE | PROT_EXEC) as u32)?;
    Ok((PROT_READ | PROT_EXEC) as u32)
}

pub(super) fn protect(page: usize, len: usize, prot: u32) -> Result<(), u32> {
    let ret = unsafe { mprotect(page as *mut c_void, len, prot as i32) };
    if ret != 0 { Err(last_error()) } else { Ok(()) }
}
