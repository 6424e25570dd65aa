//! Page-granular memory for linked code and data
//!
//! Blocks are mapped read-write, filled by the linker, then flipped to
//! read-execute. A [`MappedBlock`] unmaps itself on drop, which is what makes
//! resource-tracker removal actually release the underlying pages.

use thiserror::Error;

/// Memory mapping or protection change failed
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory map of {size} bytes failed: {reason}")]
    Map { size: usize, reason: String },
    #[error("memory protection change failed: {reason}")]
    Protect { reason: String },
}

/// Desired final protection of a mapped block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExecute,
}

/// An owned, page-aligned memory mapping
pub struct MappedBlock {
    ptr: *mut u8,
    size: usize,
}

// The mapping is exclusively owned and the pointer never aliases another
// block's pages.
unsafe impl Send for MappedBlock {}
unsafe impl Sync for MappedBlock {}

impl MappedBlock {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Write bytes at an offset. Only valid while the block is read-write.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }
}

impl Drop for MappedBlock {
    fn drop(&mut self) {
        unsafe { platform::unmap(self.ptr, self.size) }
    }
}

/// Allocates and protects page memory for the linking layer
pub trait MemoryManager: Send + Sync {
    /// Map a fresh read-write block of at least `size` bytes
    fn allocate(&self, size: usize) -> Result<MappedBlock, MemoryError>;

    /// Change the protection of a previously allocated block
    fn protect(&self, block: &mut MappedBlock, prot: Protection) -> Result<(), MemoryError>;
}

/// Default memory manager backed by the platform's virtual memory calls
pub struct PageAllocator;

impl MemoryManager for PageAllocator {
    fn allocate(&self, size: usize) -> Result<MappedBlock, MemoryError> {
        let size = size.max(1).next_multiple_of(platform::page_size());
        let ptr = platform::map_rw(size)?;
        Ok(MappedBlock { ptr, size })
    }

    fn protect(&self, block: &mut MappedBlock, prot: Protection) -> Result<(), MemoryError> {
        platform::protect(block.ptr, block.size, prot)
    }
}

#[cfg(unix)]
mod platform {
    use super::{MemoryError, Protection};

    pub fn page_size() -> usize {
        // Safety: sysconf with a valid name has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    pub fn map_rw(size: usize) -> Result<*mut u8, MemoryError> {
        // Safety: anonymous private mapping with no address hint
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::Map {
                size,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(ptr as *mut u8)
    }

    pub fn protect(ptr: *mut u8, size: usize, prot: Protection) -> Result<(), MemoryError> {
        let flags = match prot {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        };
        // Safety: ptr/size describe a live mapping owned by the caller
        let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, size, flags) };
        if rc != 0 {
            return Err(MemoryError::Protect {
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        libc::munmap(ptr as *mut libc::c_void, size);
    }
}

#[cfg(windows)]
mod platform {
    use super::{MemoryError, Protection};

    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_RELEASE: u32 = 0x8000;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE_READ: u32 = 0x20;

    extern "system" {
        fn VirtualAlloc(addr: *mut u8, size: usize, alloc_type: u32, protect: u32) -> *mut u8;
        fn VirtualProtect(addr: *mut u8, size: usize, protect: u32, old: *mut u32) -> i32;
        fn VirtualFree(addr: *mut u8, size: usize, free_type: u32) -> i32;
    }

    pub fn page_size() -> usize {
        4096
    }

    pub fn map_rw(size: usize) -> Result<*mut u8, MemoryError> {
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null_mut(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        if ptr.is_null() {
            return Err(MemoryError::Map {
                size,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(ptr)
    }

    pub fn protect(ptr: *mut u8, size: usize, prot: Protection) -> Result<(), MemoryError> {
        let flags = match prot {
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadExecute => PAGE_EXECUTE_READ,
        };
        let mut old = 0u32;
        let ok = unsafe { VirtualProtect(ptr, size, flags, &mut old) };
        if ok == 0 {
            return Err(MemoryError::Protect {
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    pub unsafe fn unmap(ptr: *mut u8, _size: usize) {
        VirtualFree(ptr, 0, MEM_RELEASE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_page() {
        let alloc = PageAllocator;
        let block = alloc.allocate(100).unwrap();
        assert!(block.size() >= 100);
        assert_eq!(block.size() % 4096, 0);
    }

    #[test]
    fn test_write_and_read_back() {
        let alloc = PageAllocator;
        let mut block = alloc.allocate(64).unwrap();
        block.write_at(8, &[1, 2, 3, 4]);
        let slice = unsafe { std::slice::from_raw_parts(block.as_ptr().add(8), 4) };
        assert_eq!(slice, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_protect_read_execute() {
        let alloc = PageAllocator;
        let mut block = alloc.allocate(4096).unwrap();
        block.write_at(0, &[0xC3]);
        alloc.protect(&mut block, Protection::ReadExecute).unwrap();
        // Still readable after the flip.
        let byte = unsafe { *block.as_ptr() };
        assert_eq!(byte, 0xC3);
    }
}
