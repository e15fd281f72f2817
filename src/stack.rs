//! Guard-paged fiber stacks.
//!
//! Each fiber owns a fixed-size stack mapped with one extra page below the
//! usable region. That page is `PROT_NONE` for the lifetime of the mapping,
//! so an overflow faults instead of silently corrupting the neighbouring
//! allocation. Stacks grow downward from [`FiberStack::top`].

use std::io;
use std::ptr::NonNull;

use once_cell::sync::OnceCell;

use crate::error::{Error, Result};

/// Default usable stack size of a spawned fiber.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack size accepted by [`fiber::Builder::stack_size`](crate::fiber::Builder::stack_size).
pub const MIN_STACK_SIZE: usize = 16 * 1024;

#[inline]
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceCell<usize> = OnceCell::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// A `mmap`-ed stack region: one guard page, then `size` usable bytes.
#[derive(Debug)]
pub(crate) struct FiberStack {
    base: NonNull<u8>,
    len: usize,
    size: usize,
}

impl FiberStack {
    /// Map a new stack of `size` usable bytes. `size` is rounded up to the
    /// page size; the lowest page of the mapping becomes the guard.
    pub(crate) fn new(size: usize) -> Result<Self> {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);
        let len = size + page;

        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(Error::StackAlloc(io::Error::last_os_error()));
            }
            if libc::mprotect(ptr, page, libc::PROT_NONE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(ptr, len);
                return Err(Error::StackAlloc(err));
            }
            Ok(Self {
                base: NonNull::new_unchecked(ptr.cast()),
                len,
                size,
            })
        }
    }

    /// One past the highest usable byte; the initial stack pointer.
    #[inline]
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Usable size in bytes (guard page excluded).
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let stack = FiberStack::new(DEFAULT_STACK_SIZE).unwrap();
        assert_eq!(stack.size(), DEFAULT_STACK_SIZE);
        assert_eq!(stack.top() as usize % page_size(), 0);
        // The whole usable region is writable.
        unsafe {
            let bottom = stack.top().sub(stack.size());
            bottom.write(0xAA);
            stack.top().sub(1).write(0xBB);
            assert_eq!(bottom.read(), 0xAA);
        }
    }

    #[test]
    fn rounds_up_to_page() {
        let stack = FiberStack::new(MIN_STACK_SIZE + 1).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() > MIN_STACK_SIZE);
    }
}
