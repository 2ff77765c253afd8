//! The OS mapping primitive: anonymous read-write pages that can be
//! flipped to read-execute, plus instruction-cache maintenance where the
//! architecture requires it.

use log::trace;

use crate::JitError;

/// An owned region of page-aligned anonymous memory.
///
/// The region is mapped read-write; [`ExecutableMemory::protect_execute`]
/// seals it read-execute (W^X). Platforms that refuse the flip fall back
/// to a read-write-execute protection so the region is still runnable;
/// the strictest available policy wins.
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
    executable: bool,
}

// The region is exclusively owned, and once executable it is never
// written again.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    /// Map at least `size` bytes of read-write memory.
    pub fn allocate(size: usize) -> Result<ExecutableMemory, JitError> {
        let len = size.next_multiple_of(page_size()).max(page_size());
        let ptr = sys::map_rw(len)?;
        trace!("mapped {len} byte(s) rw at {ptr:p}");
        Ok(ExecutableMemory {
            ptr,
            len,
            executable: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Page-rounded length of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The writable view. Only available before the region is sealed.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(!self.executable, "region is already executable");
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Seal the region read-execute. On failure, fall back to
    /// read-write-execute where the host allows it.
    pub fn protect_execute(&mut self) -> Result<(), JitError> {
        match sys::protect_rx(self.ptr, self.len) {
            Ok(()) => {
                trace!("sealed {} byte(s) rx at {:p}", self.len, self.ptr);
            }
            Err(first) => {
                sys::protect_rwx(self.ptr, self.len).map_err(|_| first)?;
                trace!("sealed {} byte(s) rwx at {:p} (no w^x)", self.len, self.ptr);
            }
        }
        self.executable = true;
        Ok(())
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        trace!("unmapping {} byte(s) at {:p}", self.len, self.ptr);
        sys::unmap(self.ptr, self.len);
    }
}

fn page_size() -> usize {
    sys::page_size()
}

/// Make new instructions in `[ptr, ptr + len)` visible to the fetch
/// pipeline. Required on AArch64 after every code copy; a no-op on x86-64,
/// whose caches are coherent with stores.
pub fn flush_icache(ptr: *const u8, len: usize) {
    imp_flush_icache(ptr, len);
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
fn imp_flush_icache(ptr: *const u8, len: usize) {
    extern "C" {
        fn sys_icache_invalidate(start: *mut core::ffi::c_void, len: usize);
    }
    unsafe { sys_icache_invalidate(ptr as *mut core::ffi::c_void, len) };
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
fn imp_flush_icache(ptr: *const u8, len: usize) {
    // Clean the data cache to the point of unification, invalidate the
    // instruction cache over the same range, then synchronize the fetch
    // pipeline. Line sizes come from CTR_EL0.
    unsafe {
        let ctr: u64;
        core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack));
        let dline = 4usize << ((ctr >> 16) & 0xf);
        let iline = 4usize << (ctr & 0xf);
        let start = ptr as usize;
        let end = start + len;

        let mut addr = start & !(dline - 1);
        while addr < end {
            core::arch::asm!("dc cvau, {}", in(reg) addr, options(nostack));
            addr += dline;
        }
        core::arch::asm!("dsb ish", options(nostack));

        let mut addr = start & !(iline - 1);
        while addr < end {
            core::arch::asm!("ic ivau, {}", in(reg) addr, options(nostack));
            addr += iline;
        }
        core::arch::asm!("dsb ish", "isb", options(nostack));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn imp_flush_icache(_ptr: *const u8, _len: usize) {}

#[cfg(unix)]
mod sys {
    use crate::JitError;

    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn last_error() -> String {
        std::io::Error::last_os_error().to_string()
    }

    pub fn map_rw(len: usize) -> Result<*mut u8, JitError> {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::FailedToMapExecutableMemory(last_error()));
        }
        Ok(ptr.cast())
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> Result<(), JitError> {
        let rc = unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(JitError::FailedToProtectMemory(last_error()));
        }
        Ok(())
    }

    pub fn protect_rwx(ptr: *mut u8, len: usize) -> Result<(), JitError> {
        let rc = unsafe {
            libc::mprotect(
                ptr.cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(JitError::FailedToProtectMemory(last_error()));
        }
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        unsafe {
            libc::munmap(ptr.cast(), len);
        }
    }
}

#[cfg(windows)]
mod sys {
    use crate::JitError;

    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
    };

    pub fn page_size() -> usize {
        0x1000
    }

    fn last_error() -> String {
        std::io::Error::last_os_error().to_string()
    }

    pub fn map_rw(len: usize) -> Result<*mut u8, JitError> {
        let ptr = unsafe {
            VirtualAlloc(
                core::ptr::null(),
                len,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(JitError::FailedToMapExecutableMemory(last_error()));
        }
        Ok(ptr.cast())
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> Result<(), JitError> {
        let mut old = 0u32;
        let rc = unsafe { VirtualProtect(ptr.cast(), len, PAGE_EXECUTE_READ, &mut old) };
        if rc == 0 {
            return Err(JitError::FailedToProtectMemory(last_error()));
        }
        Ok(())
    }

    pub fn protect_rwx(ptr: *mut u8, len: usize) -> Result<(), JitError> {
        let mut old = 0u32;
        let rc = unsafe { VirtualProtect(ptr.cast(), len, PAGE_EXECUTE_READWRITE, &mut old) };
        if rc == 0 {
            return Err(JitError::FailedToProtectMemory(last_error()));
        }
        Ok(())
    }

    pub fn unmap(ptr: *mut u8, _len: usize) {
        unsafe {
            VirtualFree(ptr.cast(), 0, MEM_RELEASE);
        }
    }
}
