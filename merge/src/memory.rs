use std::{
    io,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
    slice,
};

// Fixed buffers are registered as iovecs of up to 1G each; a single large
// allocation is chunked instead of registering many small ones.
pub const FIXED_BUFFER_LEN: usize = 1024 * 1024 * 1024;

fn page_size() -> usize {
    // Safety: just a libc wrapper
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Single anonymous mapping backing a reader's buffers.
///
/// mmap keeps the base page-aligned, which fixed-buffer registration wants,
/// and teardown releases the whole region in one call. `len` is rounded up
/// to whole pages.
#[derive(Debug)]
pub struct PageAlignedMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl PageAlignedMemory {
    pub fn new(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-sized buffer region",
            ));
        }
        let len = size.next_multiple_of(page_size());

        // Safety:
        // doing an ANONYMOUS alloc. addr=NULL is ok, fd is not used.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if std::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8)
                .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?,
            len,
        })
    }
}

impl Drop for PageAlignedMemory {
    fn drop(&mut self) {
        // Safety:
        // ptr is a valid pointer returned by mmap
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl Deref for PageAlignedMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PageAlignedMemory {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Single allocation backing one reader: the per-source read buffers first,
/// then an aligned tail the caller can claim for its own bookkeeping (the
/// merge driver installs its heap storage there).
///
/// Only the bucket region is ever registered with the kernel; the tail stays
/// plain memory.
#[derive(Debug)]
pub struct ReaderArena {
    memory: PageAlignedMemory,
    buckets_len: usize,
    extra_offset: usize,
    extra_len: usize,
}

impl ReaderArena {
    pub fn new(buckets_len: usize, extra_len: usize, extra_align: usize) -> io::Result<Self> {
        assert!(extra_align.is_power_of_two());
        let extra_offset = buckets_len.next_multiple_of(extra_align);
        let memory = PageAlignedMemory::new(extra_offset + extra_len.max(1))?;
        Ok(Self {
            memory,
            buckets_len,
            extra_offset,
            extra_len,
        })
    }

    /// Base of the read-buffer region.
    pub fn buckets_ptr(&self) -> *mut u8 {
        self.memory.ptr.as_ptr()
    }

    pub fn buckets_len(&self) -> usize {
        self.buckets_len
    }

    /// The caller-owned tail. Valid for `extra_len` bytes until the arena is
    /// dropped; never touched by the reader.
    pub fn extra_area(&self) -> NonNull<u8> {
        // Safety: extra_offset stays within the allocation (see `new`).
        unsafe { NonNull::new_unchecked(self.memory.ptr.as_ptr().add(self.extra_offset)) }
    }

    pub fn extra_len(&self) -> usize {
        self.extra_len
    }

    /// iovecs covering the bucket region in chunks the kernel accepts for
    /// fixed-buffer registration.
    pub fn registration_iovecs(&self) -> Vec<libc::iovec> {
        let mut iovecs = Vec::new();
        let mut offset = 0;
        while offset < self.buckets_len {
            let len = (self.buckets_len - offset).min(FIXED_BUFFER_LEN);
            iovecs.push(libc::iovec {
                // Safety: `offset` stays within the allocation.
                iov_base: unsafe { self.buckets_ptr().add(offset) } as *mut libc::c_void,
                iov_len: len,
            });
            offset += len;
        }
        iovecs
    }

    /// Registered-buffer index covering the byte at `offset` into the bucket
    /// region (one index per `FIXED_BUFFER_LEN` chunk, see
    /// `registration_iovecs`).
    pub fn buf_index(offset: usize) -> u16 {
        (offset / FIXED_BUFFER_LEN) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_page_aligned_and_page_sized() {
        let mem = PageAlignedMemory::new(100).unwrap();
        let page = page_size();
        assert_eq!(mem.ptr.as_ptr() as usize % page, 0);
        assert_eq!(mem.len() % page, 0);
        assert!(mem.len() >= 100);
    }

    #[test]
    fn zero_sized_region_is_rejected() {
        let err = PageAlignedMemory::new(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn arena_extra_area_is_aligned_and_disjoint() {
        let arena = ReaderArena::new(3 * 1000, 256, 8).unwrap();
        let extra = arena.extra_area().as_ptr() as usize;
        assert_eq!(extra % 8, 0);
        assert!(extra >= arena.buckets_ptr() as usize + arena.buckets_len());
        assert_eq!(arena.extra_len(), 256);
    }

    #[test]
    fn registration_covers_bucket_region() {
        let arena = ReaderArena::new(8192, 0, 8).unwrap();
        let iovecs = arena.registration_iovecs();
        assert_eq!(iovecs.len(), 1);
        assert_eq!(iovecs[0].iov_len, 8192);
        assert_eq!(ReaderArena::buf_index(4096), 0);
    }
}
