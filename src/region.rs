use crate::mmap::{self, Access};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A mapped store region.
///
/// `Region` owns the mapping and unmaps it exactly once, when dropped. All
/// access goes through offset-based accessors that check bounds before
/// touching memory, so a bad offset panics instead of reading outside the
/// mapping.
///
/// Plain reads are volatile byte copies decoded as little-endian; the
/// fields that take part in synchronization (record sequences, the queue
/// head, queue entries) are read through 8-byte aligned atomics.
///
/// # Concurrency
///
/// The memory is shared with a writer in another thread or process. Plain
/// reads may observe a write in progress; callers are expected to validate
/// them with the record sequence protocol.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    access: Access,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Takes ownership of a mapping produced by [`mmap::map_shared`].
    ///
    /// # Safety
    ///
    /// `ptr` must be the start of a live shared mapping of exactly `len`
    /// bytes that nothing else unmaps.
    pub(crate) unsafe fn from_mapping(ptr: NonNull<u8>, len: usize, access: Access) -> Self {
        Self { ptr, len, access }
    }

    /// Length of the mapping in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the region was mapped writable.
    #[inline(always)]
    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    #[inline(always)]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "region access out of bounds: offset {offset} + {len} > {}",
            self.len
        );
    }

    #[inline(always)]
    fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        self.check(offset, 8);
        assert!(offset % 8 == 0, "unaligned atomic access at offset {offset}");
        unsafe { AtomicI64::from_ptr(self.ptr.as_ptr().add(offset).cast()) }
    }

    #[inline(always)]
    fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        self.check(offset, 8);
        assert!(offset % 8 == 0, "unaligned atomic access at offset {offset}");
        unsafe { AtomicU64::from_ptr(self.ptr.as_ptr().add(offset).cast()) }
    }

    /// Atomically loads the little-endian `i64` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds or not 8-byte aligned.
    #[inline(always)]
    pub fn load_i64(&self, offset: usize, order: Ordering) -> i64 {
        i64::from_le(self.atomic_i64(offset).load(order))
    }

    /// Atomically loads the little-endian `u64` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds or not 8-byte aligned.
    #[inline(always)]
    pub fn load_u64(&self, offset: usize, order: Ordering) -> u64 {
        u64::from_le(self.atomic_u64(offset).load(order))
    }

    /// Copies `N` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    #[inline(always)]
    pub fn read_array<const N: usize>(&self, offset: usize) -> [u8; N] {
        self.check(offset, N);
        // `[u8; N]` has alignment 1, so any offset is valid here.
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset)
                .cast::<[u8; N]>()
                .read_volatile()
        }
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        let src = unsafe { self.ptr.as_ptr().add(offset) };
        for (i, b) in dst.iter_mut().enumerate() {
            *b = unsafe { src.add(i).read_volatile() };
        }
    }

    #[inline(always)]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.read_array::<1>(offset)[0]
    }

    #[inline(always)]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.read_array(offset))
    }

    #[inline(always)]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.read_array(offset))
    }

    #[inline(always)]
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.read_array(offset))
    }

    #[inline(always)]
    pub fn read_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.read_array(offset))
    }

    /// Atomically stores `value` as a little-endian `i64` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the region is read-only, or `offset` is out of bounds or
    /// not 8-byte aligned.
    #[inline(always)]
    pub(crate) fn store_i64(&self, offset: usize, value: i64, order: Ordering) {
        assert!(self.is_writable(), "store through read-only region");
        self.atomic_i64(offset).store(value.to_le(), order);
    }

    /// Atomically stores `value` as a little-endian `u64` at `offset`.
    #[inline(always)]
    pub(crate) fn store_u64(&self, offset: usize, value: u64, order: Ordering) {
        assert!(self.is_writable(), "store through read-only region");
        self.atomic_u64(offset).store(value.to_le(), order);
    }

    /// Copies `src` into the region at `offset`.
    pub(crate) fn write_bytes(&self, offset: usize, src: &[u8]) {
        assert!(self.is_writable(), "store through read-only region");
        self.check(offset, src.len());
        let dst = unsafe { self.ptr.as_ptr().add(offset) };
        for (i, b) in src.iter().enumerate() {
            unsafe { dst.add(i).write_volatile(*b) };
        }
    }
}

impl Drop for Region {
    /// Unmaps the underlying region.
    ///
    /// A failed `munmap` is logged rather than raised; the mapping is
    /// released by the kernel when the process exits in any case.
    fn drop(&mut self) {
        if let Err(err) = unsafe { mmap::unmap_shared(self.ptr, self.len) } {
            tracing::error!(%err, len = self.len, "failed to unmap store region");
        }
    }
}
