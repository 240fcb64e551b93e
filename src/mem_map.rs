//! Ownership of a single OS-level virtual memory reservation.
//!
//! Every space owns exactly one `MemMap` for its whole lifetime. The only
//! ownership transfer is [`MemMap::split_at`], used when a heap is
//! partitioned at zygote-fork time.

use crate::utils::*;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

pub use libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};

pub struct MemMap {
    name: String,
    begin: Address,
    size: usize,
    prot: i32,
}

impl MemMap {
    /// Reserve `byte_count` bytes (rounded up to whole pages) of anonymous
    /// private memory. `requested_begin` is a placement hint, not a demand;
    /// the caller must re-query `begin()` to learn the granted address.
    pub fn map_anonymous(
        name: &str,
        requested_begin: Address,
        byte_count: usize,
        prot: i32,
    ) -> io::Result<MemMap> {
        let length = round_up(byte_count, os::page_size());
        let actual = unsafe {
            libc::mmap(
                requested_begin.to_mut_ptr(),
                length,
                prot,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if actual == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MemMap {
            name: name.to_owned(),
            begin: Address::from_ptr(actual),
            size: length,
            prot,
        })
    }

    /// Map the first `byte_count` bytes of `file`. Used for read-only image
    /// spaces; the mapping is private, so even a writable protection would
    /// never reach the file.
    pub fn map_file(name: &str, file: &File, byte_count: usize, prot: i32) -> io::Result<MemMap> {
        let length = round_up(byte_count, os::page_size());
        let actual = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length,
                prot,
                MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if actual == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MemMap {
            name: name.to_owned(),
            begin: Address::from_ptr(actual),
            size: length,
            prot,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> Address {
        self.begin.offset(self.size)
    }

    pub fn protection(&self) -> i32 {
        self.prot
    }

    pub fn has_address(&self, addr: Address) -> bool {
        self.begin() <= addr && addr < self.end()
    }

    /// Change protection on a page-aligned sub-range of the mapping. Failure
    /// on our own mapping means the cursor bookkeeping is broken, so it is
    /// fatal.
    pub fn protect(&self, from: Address, length: usize, prot: i32) {
        debug_assert!(from.is_page_aligned());
        debug_assert!(from >= self.begin() && from.offset(length) <= self.end());
        let rc = unsafe { libc::mprotect(from.to_mut_ptr(), length, prot) };
        assert!(
            rc == 0,
            "mprotect({}, {}) failed: {}",
            from,
            length,
            io::Error::last_os_error()
        );
    }

    /// Advisory release of physical pages; the range stays mapped. Errors are
    /// ignored, dropping the advice is always legal.
    pub fn madvise_dontneed(&self, from: Address, length: usize) {
        debug_assert!(from >= self.begin() && from.offset(length) <= self.end());
        unsafe {
            libc::madvise(from.to_mut_ptr(), length, libc::MADV_DONTNEED);
        }
    }

    /// Partition the reservation at a page-aligned `offset`: `self` keeps
    /// `[begin, begin+offset)` and the returned map owns the tail. Both
    /// halves unmap their own range on drop; munmap over a partial mapping
    /// is well-defined on the targets we support.
    pub fn split_at(&mut self, offset: usize, tail_name: &str) -> MemMap {
        assert!(mem::is_page_aligned(offset));
        assert!(offset <= self.size);
        let tail = MemMap {
            name: tail_name.to_owned(),
            begin: self.begin.offset(offset),
            size: self.size - offset,
            prot: self.prot,
        };
        self.size = offset;
        tail
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        if self.size != 0 {
            let rc = unsafe { libc::munmap(self.begin.to_mut_ptr(), self.size) };
            debug_assert!(rc == 0, "munmap failed for map '{}'", self.name);
        }
    }
}

// The raw range is owned and only mutated through &self syscalls.
unsafe impl Send for MemMap {}
unsafe impl Sync for MemMap {}
