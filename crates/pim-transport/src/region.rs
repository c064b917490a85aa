//! Mapped rank windows.
//!
//! A [`RankRegion`] is the host's view of one rank's physical window: the
//! region the bank scatter from [`pim_rank::address`] indexes into. On
//! hardware it is an mmap of the rank's device node; the software runtime
//! backs it with page-aligned host memory laid out in the same format.
//!
//! Access is volatile and bounds-asserted. The window is DRAM behind the
//! CPU cache, so the receive path must flush lines before reading
//! ([`RankRegion::flush_line`]) and both paths fence once per transfer
//! ([`memory_fence`]). Callers read and write disjoint offsets from
//! worker threads; the accessors take `&self` and the Sync impl below
//! spells out why that holds.

use crate::error::{PimError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::alloc::Layout;
use std::fs::OpenOptions;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, trace};

// Windows are up to 8 GiB; all offset math is u64 and narrowed only at the
// pointer boundary. 64-bit targets only.
#[allow(clippy::cast_possible_truncation)]
const fn as_usize(v: u64) -> usize {
    v as usize
}

/// How the memory behind a region is owned.
#[derive(Debug)]
enum Backing {
    /// mmap of a rank device window; fd held open for the mapping's life.
    Device { _file: std::fs::File, path: PathBuf },
    /// Page-aligned host allocation (software ranks, tests).
    Host { layout: Layout },
}

/// One rank's physical window.
#[derive(Debug)]
pub struct RankRegion {
    ptr: NonNull<u8>,
    len: u64,
    backing: Backing,
}

impl RankRegion {
    /// Map a rank window from a device path.
    ///
    /// `len` of zero means "use the file's reported size"; device nodes
    /// that report zero must pass the real window length.
    ///
    /// # Errors
    ///
    /// [`PimError::RegionMap`] if the path cannot be opened, sized, or
    /// mapped.
    pub fn map_device(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|source| {
            PimError::RegionMap { path: path.to_path_buf(), source }
        })?;

        let len = if len == 0 {
            file.metadata()
                .map_err(|source| PimError::RegionMap { path: path.to_path_buf(), source })?
                .len()
        } else {
            len
        };
        if len == 0 {
            return Err(PimError::RegionMap {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "window length is 0 (rank not enabled?)",
                ),
            });
        }

        debug!("mapping rank window {} ({} MiB)", path.display(), len >> 20);

        // SAFETY: mmap preconditions hold:
        // (1) fd is valid, just opened read-write;
        // (2) len is non-zero, checked above;
        // (3) SHARED + READ|WRITE is the required mapping for a device
        //     window;
        // (4) the fd is stored in the struct so the mapping outlives no
        //     open file;
        // (5) the mapping is released by munmap in Drop with the same
        //     length;
        // (6) rustix surfaces MAP_FAILED as Err, so a success address is
        //     never null and new_unchecked holds.
        let ptr = unsafe {
            let addr = mmap(
                std::ptr::null_mut(),
                as_usize(len),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
            .map_err(|e| PimError::RegionMap {
                path: path.to_path_buf(),
                source: std::io::Error::from(e),
            })?;
            NonNull::new_unchecked(addr.cast::<u8>())
        };

        Ok(Self { ptr, len, backing: Backing::Device { _file: file, path: path.to_path_buf() } })
    }

    /// Allocate a zeroed host-memory window (software ranks, tests).
    ///
    /// # Errors
    ///
    /// [`PimError::RuntimeFailed`] when the allocation cannot be made.
    pub fn host_backed(len: u64) -> Result<Self> {
        if len == 0 {
            return Err(PimError::runtime_failed("host window length must be non-zero"));
        }
        let layout = Layout::from_size_align(as_usize(len), 4096)
            .map_err(|e| PimError::runtime_failed(format!("bad window layout: {e}")))?;

        // SAFETY: raw alloc_zeroed for a page-aligned window. Invariants:
        // (1) layout has non-zero size and power-of-two alignment;
        // (2) null return is handled below;
        // (3) Drop deallocates with the identical layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            return Err(PimError::runtime_failed(format!(
                "cannot allocate {len} byte host window"
            )));
        };

        trace!("host window: {} KiB at {ptr:p}", len >> 10);
        Ok(Self { ptr, len, backing: Backing::Host { layout } })
    }

    /// Window length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the window is zero length (never true for a live region).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn check(&self, offset: u64, bytes: u64, align: u64) {
        assert!(
            offset % align == 0 && offset + bytes <= self.len,
            "window access out of bounds or misaligned: offset {offset:#x}, len {bytes}, window {:#x}",
            self.len
        );
    }

    /// Volatile 64-bit read at an 8-aligned offset.
    #[inline]
    #[must_use]
    pub fn read_u64(&self, offset: u64) -> u64 {
        self.check(offset, 8, 8);
        // SAFETY: bounds and alignment asserted in check(); ptr comes from
        // a live mapping of self.len bytes; volatile because the window is
        // device memory other agents write.
        unsafe { self.ptr.as_ptr().add(as_usize(offset)).cast::<u64>().read_volatile() }
    }

    /// Volatile 64-bit write at an 8-aligned offset.
    #[inline]
    pub fn write_u64(&self, offset: u64, value: u64) {
        self.check(offset, 8, 8);
        // SAFETY: as in read_u64; writes to disjoint offsets per worker
        // (transfer engine walks rank-local, quad-local lines).
        unsafe {
            self.ptr.as_ptr().add(as_usize(offset)).cast::<u64>().write_volatile(value);
        }
    }

    /// Volatile byte read.
    #[inline]
    #[must_use]
    pub fn read_u8(&self, offset: u64) -> u8 {
        self.check(offset, 1, 1);
        // SAFETY: bounds asserted; byte access has no alignment demand.
        unsafe { self.ptr.as_ptr().add(as_usize(offset)).read_volatile() }
    }

    /// Volatile byte write.
    #[inline]
    pub fn write_u8(&self, offset: u64, value: u8) {
        self.check(offset, 1, 1);
        // SAFETY: as in read_u8.
        unsafe {
            self.ptr.as_ptr().add(as_usize(offset)).write_volatile(value);
        }
    }

    /// Volatile load of one 64-byte line into lane words.
    #[inline]
    #[must_use]
    pub fn read_line(&self, offset: u64) -> [u64; 8] {
        self.check(offset, 64, 64);
        let mut line = [0u64; 8];
        for (i, word) in line.iter_mut().enumerate() {
            // SAFETY: offset + 64 <= len and 64-alignment asserted, so
            // each of the 8 word slots is in bounds and 8-aligned.
            *word = unsafe {
                self.ptr.as_ptr().add(as_usize(offset) + i * 8).cast::<u64>().read_volatile()
            };
        }
        line
    }

    /// Volatile store of lane words as one 64-byte line.
    #[inline]
    pub fn write_line(&self, offset: u64, line: &[u64; 8]) {
        self.check(offset, 64, 64);
        for (i, word) in line.iter().enumerate() {
            // SAFETY: as in read_line.
            unsafe {
                self.ptr
                    .as_ptr()
                    .add(as_usize(offset) + i * 8)
                    .cast::<u64>()
                    .write_volatile(*word);
            }
        }
    }

    /// Raw pointer to a 64-aligned line, for the streaming encode path.
    #[inline]
    pub(crate) fn line_ptr(&self, offset: u64) -> *mut u8 {
        self.check(offset, 64, 64);
        // SAFETY: in-bounds offset into a live mapping.
        unsafe { self.ptr.as_ptr().add(as_usize(offset)) }
    }

    /// Flush the cache line at a 64-aligned offset.
    ///
    /// Stale lines would otherwise satisfy the receive path's loads from
    /// cache while the units have long since rewritten the DRAM behind it.
    #[inline]
    pub fn flush_line(&self, offset: u64) {
        self.check(offset, 64, 64);
        #[cfg(target_arch = "x86_64")]
        {
            let p = unsafe { self.ptr.as_ptr().add(as_usize(offset)) };
            if clflushopt_available() {
                // SAFETY: feature presence checked at runtime; p is valid.
                unsafe { flush_line_opt(p) };
            } else {
                // SAFETY: clflush is baseline on x86_64; p is valid.
                unsafe { core::arch::x86_64::_mm_clflush(p) };
            }
        }
        // Non-x86 hosts are cache-coherent with the window; nothing to
        // flush there.
    }

    /// Prefetch the line at `offset` into cache (L1, read intent).
    #[inline]
    pub fn prefetch(&self, offset: u64) {
        if offset + 64 > self.len {
            return;
        }
        #[cfg(target_arch = "x86_64")]
        // SAFETY: prefetch is a hint and cannot fault; pointer is in
        // bounds by the check above.
        unsafe {
            core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_T0 }>(
                self.ptr.as_ptr().add(as_usize(offset)).cast::<i8>(),
            );
        }
    }
}

impl Drop for RankRegion {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Device { path, .. } => {
                debug!("unmapping rank window {} ({} MiB)", path.display(), self.len >> 20);
                // SAFETY: ptr/len are exactly what mmap returned in
                // map_device; the mapping is still live here.
                if let Err(e) = unsafe {
                    munmap(self.ptr.as_ptr().cast::<core::ffi::c_void>(), as_usize(self.len))
                } {
                    debug!("munmap failed on drop: {e}");
                }
            }
            Backing::Host { layout } => {
                // SAFETY: ptr came from alloc_zeroed with this exact
                // layout in host_backed.
                unsafe { std::alloc::dealloc(self.ptr.as_ptr(), *layout) };
            }
        }
    }
}

// SAFETY: the mapping (or allocation) is valid for the region's whole
// life and is not tied to the creating thread; moving the owner moves
// nothing the kernel cares about.
unsafe impl Send for RankRegion {}

// SAFETY: all access goes through volatile loads and stores on &self.
// Concurrent users are the per-rank transfer workers and the status
// poller; they touch disjoint offsets (data lines per rank and quad vs.
// the status block), and volatile word access cannot tear. Nothing else
// is interior-mutable.
unsafe impl Sync for RankRegion {}

#[cfg(target_arch = "x86_64")]
fn clflushopt_available() -> bool {
    static AVAILABLE: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        // CPUID.(EAX=7, ECX=0):EBX bit 23; std_detect has no name for
        // this feature, so ask the CPU directly.
        // SAFETY: cpuid is unprivileged and baseline on x86_64; leaf 7
        // is read only after leaf 0 reports it exists.
        unsafe {
            core::arch::x86_64::__cpuid(0).eax >= 7
                && (core::arch::x86_64::__cpuid_count(7, 0).ebx & (1 << 23)) != 0
        }
    })
}

/// # Safety
///
/// Caller must have verified the `clflushopt` feature and pass a pointer
/// into a live mapping.
#[cfg(target_arch = "x86_64")]
unsafe fn flush_line_opt(p: *mut u8) {
    // No stable intrinsic or target_feature name covers this
    // instruction, so emit it directly. It orders weaker than clflush;
    // the callers fence once per pass either way.
    core::arch::asm!("clflushopt [{0}]", in(reg) p, options(nostack, preserves_flags));
}

/// Order every store (including streaming stores) and flush before
/// whatever follows. The receive path fences once after its flush pass,
/// the send path once after its store loop.
#[inline]
pub fn memory_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: mfence has no preconditions.
    unsafe {
        core::arch::x86_64::_mm_mfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Prefetch a host buffer address the gather loop will need shortly.
#[inline]
pub(crate) fn prefetch_host(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch is a hint; any address is acceptable.
    unsafe {
        core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_T0 }>(ptr.cast::<i8>());
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}
