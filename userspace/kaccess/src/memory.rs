// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address access layer used to stage bytes around privileged transfers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! PUBLIC API:
//!   - AddressSpace: raw zeroed allocation and release
//!   - Scratch: scoped region with typed 1/2/4/8-byte access, released on drop
//!   - HeapSpace: process-heap backend
//!   - CountingSpace: wrapper that counts allocations and releases
//!
//! INVARIANTS:
//!   - Every region handed out by an AddressSpace is released at most once (Region is not Clone)
//!   - A Scratch releases its region on every exit path, including unwinding
//!   - Typed accessors are little-endian

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Result alias for memory operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the address access layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Zero-sized regions are never handed out.
    #[error("zero-sized allocation requested")]
    ZeroSize,
    /// Backend could not satisfy the request.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
    },
}

/// Raw memory region owned by whoever holds it.
pub struct Region {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: a region is an exclusively owned allocation; moving it between threads moves ownership.
unsafe impl Send for Region {}

impl Region {
    /// Wraps a raw allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `size` bytes until the region is returned to
    /// the [`AddressSpace`] that produced it, and no other live `Region` may alias it.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    /// Raw address of the first byte.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Raw pointer to the first byte.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always `false`; zero-sized regions are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("size", &self.size)
            .finish()
    }
}

/// Allocator of raw, zero-initialised process memory.
///
/// # Safety
///
/// Implementors must return regions satisfying the contract of [`Region::from_raw_parts`] and
/// must accept back, through [`AddressSpace::free`], exactly the regions they produced.
pub unsafe trait AddressSpace: Send + Sync {
    /// Allocates `size` zeroed bytes.
    fn alloc_zeroed(&self, size: usize) -> Result<Region>;

    /// Releases a region previously returned by [`AddressSpace::alloc_zeroed`].
    fn free(&self, region: Region);
}

/// Backend over the process heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapSpace;

impl HeapSpace {
    const ALIGN: usize = 16;

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, Self::ALIGN).map_err(|_| Error::OutOfMemory { size })
    }
}

// SAFETY: regions come straight from the global allocator with the recorded layout.
unsafe impl AddressSpace for HeapSpace {
    fn alloc_zeroed(&self, size: usize) -> Result<Region> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let layout = Self::layout(size)?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::OutOfMemory { size })?;
        // SAFETY: fresh allocation of `size` bytes, exclusively owned by the new region.
        Ok(unsafe { Region::from_raw_parts(ptr, size) })
    }

    fn free(&self, region: Region) {
        if let Ok(layout) = Self::layout(region.size) {
            // SAFETY: the region was produced by `alloc_zeroed` with this exact layout.
            unsafe { alloc::dealloc(region.as_ptr(), layout) };
        }
    }
}

/// Wraps another space and counts allocations and releases.
#[derive(Debug, Default)]
pub struct CountingSpace<S> {
    inner: S,
    allocations: AtomicUsize,
    releases: AtomicUsize,
}

impl<S> CountingSpace<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self { inner, allocations: AtomicUsize::new(0), releases: AtomicUsize::new(0) }
    }

    /// Number of successful allocations so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Number of releases so far.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Regions allocated but not yet released.
    pub fn outstanding(&self) -> usize {
        self.allocations().saturating_sub(self.releases())
    }
}

// SAFETY: forwards to `inner` unchanged.
unsafe impl<S: AddressSpace> AddressSpace for CountingSpace<S> {
    fn alloc_zeroed(&self, size: usize) -> Result<Region> {
        let region = self.inner.alloc_zeroed(size)?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(region)
    }

    fn free(&self, region: Region) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.free(region);
    }
}

/// Scoped region: released exactly once when dropped.
pub struct Scratch {
    space: Arc<dyn AddressSpace>,
    region: Option<Region>,
}

impl Scratch {
    /// Allocates `size` zeroed bytes from `space`.
    pub fn alloc(space: &Arc<dyn AddressSpace>, size: usize) -> Result<Self> {
        let region = space.alloc_zeroed(size)?;
        Ok(Self { space: Arc::clone(space), region: Some(region) })
    }

    fn region(&self) -> &Region {
        match &self.region {
            Some(region) => region,
            // `region` is only taken in `drop`.
            None => unreachable!("scratch region used after release"),
        }
    }

    /// Raw address of the first byte.
    pub fn addr(&self) -> usize {
        self.region().addr()
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.region().len()
    }

    /// Always `false`; see [`Region::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.region().is_empty()
    }

    /// Region contents.
    pub fn as_slice(&self) -> &[u8] {
        let region = self.region();
        // SAFETY: the region is valid for `len` bytes and exclusively owned by `self`.
        unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) }
    }

    /// Mutable region contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let region = self.region();
        // SAFETY: as above; `&mut self` guarantees no other borrow of the contents.
        unsafe { std::slice::from_raw_parts_mut(region.as_ptr(), region.len()) }
    }

    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.as_slice()[offset..offset + N]);
        out
    }

    fn put(&mut self, offset: usize, bytes: &[u8]) {
        self.as_mut_slice()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads one byte at `offset`.
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.as_slice()[offset]
    }

    /// Reads two bytes at `offset`.
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.array(offset))
    }

    /// Reads four bytes at `offset`.
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.array(offset))
    }

    /// Reads eight bytes at `offset`.
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.array(offset))
    }

    /// Writes one byte at `offset`.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.as_mut_slice()[offset] = value;
    }

    /// Writes two bytes at `offset`.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.put(offset, &value.to_le_bytes());
    }

    /// Writes four bytes at `offset`.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.put(offset, &value.to_le_bytes());
    }

    /// Writes eight bytes at `offset`.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.put(offset, &value.to_le_bytes());
    }
}

impl fmt::Debug for Scratch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scratch").field("region", &self.region).finish()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.space.free(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting() -> (Arc<CountingSpace<HeapSpace>>, Arc<dyn AddressSpace>) {
        let counting = Arc::new(CountingSpace::new(HeapSpace));
        let space: Arc<dyn AddressSpace> = counting.clone();
        (counting, space)
    }

    #[test]
    fn scratch_is_zeroed_and_typed() {
        let (_, space) = counting();
        let mut scratch = Scratch::alloc(&space, 16).unwrap();
        assert!(scratch.as_slice().iter().all(|b| *b == 0));
        scratch.write_u16(0, 0xbeef);
        scratch.write_u32(2, 0xdead_c0de);
        scratch.write_u64(8, 0x0102_0304_0506_0708);
        assert_eq!(scratch.read_u8(0), 0xef);
        assert_eq!(scratch.read_u16(0), 0xbeef);
        assert_eq!(scratch.read_u32(2), 0xdead_c0de);
        assert_eq!(scratch.read_u64(8), 0x0102_0304_0506_0708);
    }

    #[test]
    fn drop_releases_once() {
        let (counter, space) = counting();
        {
            let _a = Scratch::alloc(&space, 4).unwrap();
            let _b = Scratch::alloc(&space, 8).unwrap();
            assert_eq!(counter.outstanding(), 2);
        }
        assert_eq!(counter.allocations(), 2);
        assert_eq!(counter.releases(), 2);
    }

    #[test]
    fn zero_size_rejected() {
        let (counter, space) = counting();
        assert_eq!(Scratch::alloc(&space, 0).unwrap_err(), Error::ZeroSize);
        assert_eq!(counter.allocations(), 0);
    }

    #[test]
    fn released_on_unwind() {
        let (counter, space) = counting();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let scratch = Scratch::alloc(&space, 2).unwrap();
            let _ = scratch.read_u32(0);
        }));
        assert!(result.is_err());
        assert_eq!(counter.outstanding(), 0);
    }
}
