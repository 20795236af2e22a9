//! Fiber stack memory.
//!
//! Stacks are anonymous private mappings with a single inaccessible guard
//! page below the usable range, so a deep overflow faults instead of
//! silently corrupting a neighboring allocation. Sizes are rounded up to
//! whole pages; the requested size excludes the guard page.

use crate::error::RuntimeError;
use std::ffi::c_void;
use std::io;
use std::ptr;

/// Default usable stack size when a spawn request passes zero.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Owned stack mapping of one fiber.
#[derive(Debug)]
pub struct FiberStack {
    base: *mut c_void,
    mapping_size: usize,
    page_size: usize,
}

impl FiberStack {
    /// Map a stack with at least `size` usable bytes (plus a guard page).
    pub fn allocate(size: usize) -> Result<Self, RuntimeError> {
        let page_size = page_size();
        let usable = round_up(size.max(page_size), page_size);
        let mapping_size = usable + page_size;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapping_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::StackAlloc {
                size: mapping_size,
                source: io::Error::last_os_error(),
            });
        }

        if unsafe { libc::mprotect(base, page_size, libc::PROT_NONE) } < 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::munmap(base, mapping_size) };
            return Err(RuntimeError::StackAlloc {
                size: mapping_size,
                source,
            });
        }

        Ok(Self {
            base,
            mapping_size,
            page_size,
        })
    }

    /// One past the highest usable byte, 16-aligned (page sizes are).
    pub fn top(&self) -> *mut c_void {
        unsafe { (self.base as *mut u8).add(self.mapping_size) as *mut c_void }
    }

    /// Usable bytes between the guard page and the top.
    pub fn usable_size(&self) -> usize {
        self.mapping_size - self.page_size
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base, self.mapping_size) };
        if rc < 0 {
            // Leaking the mapping is the only alternative; surface it loudly.
            panic!("munmap of fiber stack failed: {}", io::Error::last_os_error());
        }
    }
}

pub(crate) fn page_size() -> usize {
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        4096
    } else {
        value as usize
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_to_whole_pages() {
        let stack = FiberStack::allocate(1).expect("allocate");
        let page = page_size();
        assert_eq!(stack.usable_size() % page, 0);
        assert!(stack.usable_size() >= page);
        assert_eq!(stack.top() as usize % 16, 0);
    }

    #[test]
    fn test_usable_region_is_writable() {
        let stack = FiberStack::allocate(DEFAULT_STACK_SIZE).expect("allocate");
        unsafe {
            let top = stack.top() as *mut u8;
            top.sub(1).write(0xAB);
            top.sub(stack.usable_size()).write(0xCD);
            assert_eq!(top.sub(1).read(), 0xAB);
        }
    }
}
