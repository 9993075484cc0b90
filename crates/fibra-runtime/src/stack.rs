//! Coroutine stacks: one anonymous mmap per coroutine with a guard page
//!
//! The lowest page of every mapping stays PROT_NONE so runaway stack
//! growth faults immediately instead of corrupting a neighbour.

use fibra_core::error::{SchedError, SchedResult};

const PAGE_SIZE: usize = 4096;

/// An owned, guard-paged coroutine stack
pub struct CoStack {
    base: *mut u8,
    /// Full mapping size including the guard page
    map_size: usize,
}

impl CoStack {
    /// Map a stack with `size` usable bytes plus one guard page below
    pub fn new(size: usize) -> SchedResult<Self> {
        let usable = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let map_size = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SchedError::Os(errno()));
        }

        // Guard page at the low end of the mapping
        let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let err = errno();
            unsafe { libc::munmap(base, map_size) };
            return Err(SchedError::Os(err));
        }

        Ok(Self {
            base: base as *mut u8,
            map_size,
        })
    }

    /// Highest address of the usable region; stacks grow down from here
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.map_size) }
    }

    /// Usable bytes (mapping minus the guard page)
    pub fn usable_size(&self) -> usize {
        self.map_size - PAGE_SIZE
    }
}

impl Drop for CoStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_size);
        }
    }
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}
