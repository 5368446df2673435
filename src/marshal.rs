/// Buffer marshaling across the foreign module boundary
///
/// One [`MarshalScope`] covers exactly one primitive call:
///
/// ```text
/// allocate every buffer ─▶ copy inputs in ─▶ invoke ─▶ copy outputs out ─▶ free all
/// ```
///
/// Every allocation is recorded in the scope and released in `Drop`, so no
/// buffer outlives the call that created it, whether the call succeeds, the
/// primitive reports failure, or a copy fails halfway. Buffers are zeroed in
/// foreign memory before they are freed.
///
/// The scope borrows the module mutably; callers hold the module mutex for
/// the scope's whole life and never await inside it.

use crate::error::{FileCryptError, Result};
use crate::module::{ForeignModule, ForeignPtr};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use zeroize::Zeroize;

// ─── Instrumentation ─────────────────────────────────────────────────────────

/// Allocation counters for one module handle.
#[derive(Debug, Default)]
pub struct AllocationStats {
    live_bytes: AtomicUsize,
    live_buffers: AtomicUsize,
    total_allocations: AtomicU64,
    total_frees: AtomicU64,
}

impl AllocationStats {
    fn record_alloc(&self, len: usize) {
        self.live_bytes.fetch_add(len, Ordering::SeqCst);
        self.live_buffers.fetch_add(1, Ordering::SeqCst);
        self.total_allocations.fetch_add(1, Ordering::SeqCst);
    }

    fn record_free(&self, len: usize) {
        self.live_bytes.fetch_sub(len, Ordering::SeqCst);
        self.live_buffers.fetch_sub(1, Ordering::SeqCst);
        self.total_frees.fetch_add(1, Ordering::SeqCst);
    }

    /// Bytes allocated and not yet freed
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::SeqCst)
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocations.load(Ordering::SeqCst)
    }

    pub fn total_frees(&self) -> u64 {
        self.total_frees.load(Ordering::SeqCst)
    }
}

// ─── Primitive status mapping ────────────────────────────────────────────────

/// KEM entry point being marshaled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    KeyGen,
    Encapsulate,
    Decapsulate,
}

impl Primitive {
    /// Map a foreign status code to `Ok` or the primitive's error kind
    pub fn check(self, status: i32) -> Result<()> {
        if status == 0 {
            return Ok(());
        }
        log::warn!("{:?} returned status {}", self, status);
        Err(match self {
            Primitive::KeyGen => FileCryptError::KeyGenFailed(status),
            Primitive::Encapsulate => FileCryptError::EncapsulationFailed(status),
            Primitive::Decapsulate => FileCryptError::DecapsulationFailed(status),
        })
    }
}

/// Fail with `InvalidInputLength` unless `bytes` has exactly `expected` bytes
pub fn expect_len(what: &'static str, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(FileCryptError::InvalidInputLength {
            what,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

// ─── Scope ───────────────────────────────────────────────────────────────────

/// A buffer living in foreign memory for the duration of one scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignBuffer {
    ptr: ForeignPtr,
    len: usize,
}

impl ForeignBuffer {
    const NULL: ForeignBuffer = ForeignBuffer { ptr: 0, len: 0 };

    pub fn ptr(&self) -> ForeignPtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn range(&self) -> Option<Range<usize>> {
        let start = self.ptr as usize;
        start.checked_add(self.len).map(|end| start..end)
    }
}

/// Owns every foreign allocation made for one primitive call
pub struct MarshalScope<'m> {
    module: &'m mut dyn ForeignModule,
    stats: &'m AllocationStats,
    live: Vec<ForeignBuffer>,
}

impl<'m> MarshalScope<'m> {
    pub fn new(module: &'m mut dyn ForeignModule, stats: &'m AllocationStats) -> Self {
        Self {
            module,
            stats,
            live: Vec::with_capacity(3),
        }
    }

    /// Allocate one buffer of exactly `len` bytes
    pub fn allocate(&mut self, len: usize) -> Result<ForeignBuffer> {
        let ptr = self.module.malloc(len);
        if ptr == 0 {
            log::warn!(
                "Foreign allocation of {} bytes failed ({} buffers held by this call)",
                len,
                self.live.len()
            );
            return Err(FileCryptError::AllocationError { requested: len });
        }

        let buffer = ForeignBuffer { ptr, len };
        self.stats.record_alloc(len);
        self.live.push(buffer);

        #[cfg(feature = "debug-logs")]
        log::debug!("Allocated {} bytes at {:#x}", len, ptr);

        Ok(buffer)
    }

    /// Allocate the whole buffer set up front; on failure the ones already
    /// obtained are released when the scope drops
    pub fn allocate_all<const N: usize>(&mut self, sizes: [usize; N]) -> Result<[ForeignBuffer; N]> {
        let mut buffers = [ForeignBuffer::NULL; N];
        for (slot, size) in buffers.iter_mut().zip(sizes) {
            *slot = self.allocate(size)?;
        }
        Ok(buffers)
    }

    /// Copy `data` into `buffer` at offset 0; the length must match exactly
    pub fn write(&mut self, buffer: ForeignBuffer, what: &'static str, data: &[u8]) -> Result<()> {
        expect_len(what, data, buffer.len)?;
        let region = buffer
            .range()
            .and_then(|r| self.module.memory_mut().get_mut(r))
            .ok_or(FileCryptError::MemoryAccessError {
                ptr: buffer.ptr,
                len: buffer.len,
            })?;
        region.copy_from_slice(data);
        Ok(())
    }

    /// Copy `buffer` out into freshly owned memory
    pub fn read(&self, buffer: ForeignBuffer) -> Result<Vec<u8>> {
        buffer
            .range()
            .and_then(|r| self.module.memory().get(r))
            .map(|bytes| bytes.to_vec())
            .ok_or(FileCryptError::MemoryAccessError {
                ptr: buffer.ptr,
                len: buffer.len,
            })
    }

    /// The module, for invoking the primitive between copies
    pub fn module(&mut self) -> &mut dyn ForeignModule {
        &mut *self.module
    }
}

impl Drop for MarshalScope<'_> {
    fn drop(&mut self) {
        for buffer in self.live.drain(..) {
            if let Some(region) = buffer
                .range()
                .and_then(|r| self.module.memory_mut().get_mut(r))
            {
                region.zeroize();
            }
            self.module.free(buffer.ptr);
            self.stats.record_free(buffer.len);

            #[cfg(feature = "debug-logs")]
            log::debug!("Freed {} bytes at {:#x}", buffer.len, buffer.ptr);
        }
    }
}
