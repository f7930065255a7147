//! Memory regions and region-relative addressing.
//!
//! Every shared structure stores positions as signed offsets from the base
//! of the region it lives in, never as absolute pointers: two processes map
//! the same region at different virtual addresses, and only the offsets
//! survive the crossing. [`RegionView`] is the process-local window that
//! converts between the two representations.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Region-relative offset. Signed so that `offset_of` is total over the
/// process address space; only values in `[0, len)` resolve back.
pub type Off = i64;

/// Cache-line alignment used for every carved sub-structure.
pub const REGION_ALIGN: usize = 64;

/// Rounds `n` up to the next multiple of [`REGION_ALIGN`].
pub const fn align_up(n: usize) -> usize {
    (n + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}

/// A process-local window over a mapped region.
///
/// Copyable by design: many structures over the same mapping each hold
/// their own view. The view does not own the mapping.
#[derive(Clone, Copy)]
pub struct RegionView {
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for RegionView {}
unsafe impl Sync for RegionView {}

impl RegionView {
    /// # Safety
    /// `base` must point to a live mapping of at least `len` bytes that
    /// outlives every use of the view.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Offset of `ptr` relative to the region base. Total: pointers outside
    /// the region produce out-of-range offsets, caught on resolution.
    #[inline]
    pub fn offset_of<T>(&self, ptr: *const T) -> Off {
        (ptr as i64) - (self.base.as_ptr() as i64)
    }

    /// Resolves an offset to a pointer without a range check.
    ///
    /// # Safety
    /// `off` must have been produced by `offset_of` against the same region
    /// contents and lie within `[0, len)`.
    #[inline]
    pub unsafe fn at(&self, off: Off) -> *mut u8 {
        self.base.as_ptr().offset(off as isize)
    }

    /// Resolves an offset, failing with `AddressOutOfRange` when it lands
    /// outside the region.
    #[inline]
    pub fn checked_at(&self, off: Off) -> Result<*mut u8> {
        if off < 0 || off as u64 >= self.len as u64 {
            return Err(Error::AddressOutOfRange {
                off,
                len: self.len,
            });
        }
        Ok(unsafe { self.base.as_ptr().offset(off as isize) })
    }

    /// Sub-window starting `off` bytes in.
    pub fn slice_from(&self, off: usize) -> Result<RegionView> {
        if off > self.len {
            return Err(Error::AddressOutOfRange {
                off: off as i64,
                len: self.len,
            });
        }
        Ok(unsafe {
            RegionView::new(
                NonNull::new_unchecked(self.base.as_ptr().add(off)),
                self.len - off,
            )
        })
    }
}

/// A region of shared memory backed by `/dev/shm`.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    fd: RawFd,
    is_owner: bool,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates a new shared memory region.
    ///
    /// The caller becomes the owner and the object is unlinked when the
    /// region is dropped.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let name = name_to_cstring(name)?;

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let raw_fd = fd.as_raw_fd();

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = close(raw_fd);
            let _ = shm_unlink(name.as_c_str());
            return Err(io::Error::from_raw_os_error(e as i32));
        }

        let ptr = match unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero")
                })?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                let _ = shm_unlink(name.as_c_str());
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        };

        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name,
            fd: fd.into_raw_fd(),
            is_owner: true,
        })
    }

    /// Opens an existing shared memory region.
    ///
    /// The opener must know the size; the layout inside is whatever the
    /// creator initialized.
    pub fn open(name: &str, size: usize) -> io::Result<Self> {
        let name = name_to_cstring(name)?;

        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let raw_fd = fd.as_raw_fd();

        let ptr = match unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero")
                })?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                return Err(io::Error::from_raw_os_error(e as i32));
            }
        };

        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name,
            fd: fd.into_raw_fd(),
            is_owner: false,
        })
    }

    pub fn view(&self) -> RegionView {
        unsafe { RegionView::new(self.ptr, self.size) }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                NonNull::new_unchecked(self.ptr.as_ptr() as *mut _),
                self.size,
            );
            let _ = close(self.fd);

            if self.is_owner {
                let _ = shm_unlink(self.name.as_c_str());
            }
        }
    }
}

fn name_to_cstring(name: &str) -> io::Result<CString> {
    // shm_open requires a leading slash
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };

    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains null byte"))
}

/// A heap-backed region for queues that never leave the process.
///
/// Shares the offset-addressing discipline with [`SharedRegion`] so private
/// and shared queues run the same code paths.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, REGION_ALIGN)
            .map_err(|e| Error::Config(format!("heap region layout: {}", e)))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| Error::Config(format!("heap region allocation of {} bytes", size)))?;
        Ok(Self { ptr, layout })
    }

    pub fn view(&self) -> RegionView {
        unsafe { RegionView::new(self.ptr, self.layout.size()) }
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static SHM_COUNTER: AtomicU32 = AtomicU32::new(0);

    /// Unique shm name for tests sharing /dev/shm across the suite.
    pub(crate) fn test_shm_name(tag: &str) -> String {
        format!(
            "/shmq_{}_{}_{}",
            tag,
            std::process::id(),
            SHM_COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_create_and_open() {
        let name = test_shm_name("region");
        let size = 4096;

        let shm1 = SharedRegion::create(&name, size).unwrap();
        assert_eq!(shm1.size(), size);

        unsafe { std::ptr::write_volatile(shm1.as_ptr(), 42u8) };

        let shm2 = SharedRegion::open(&name, size).unwrap();
        let value = unsafe { std::ptr::read_volatile(shm2.as_ptr()) };
        assert_eq!(value, 42u8);

        // shm1 is owner, will unlink on drop
        drop(shm2);
        drop(shm1);
    }

    #[test]
    fn test_offset_round_trip() {
        let region = HeapRegion::new(4096).unwrap();
        let view = region.view();

        let p = unsafe { view.base().add(100) };
        let off = view.offset_of(p);
        assert_eq!(off, 100);
        assert_eq!(view.checked_at(off).unwrap(), p);
    }

    #[test]
    fn test_offsets_agree_across_mappings() {
        let name = test_shm_name("xbase");
        let size = 8192;

        let a = SharedRegion::create(&name, size).unwrap();
        let b = SharedRegion::open(&name, size).unwrap();

        let va = a.view();
        let vb = b.view();

        // Store through one mapping, resolve the same offset through the
        // other mapping.
        let off: Off = 256;
        unsafe {
            std::ptr::write_volatile(va.at(off) as *mut u64, 0xdead_beef);
            let got = std::ptr::read_volatile(vb.at(off) as *const u64);
            assert_eq!(got, 0xdead_beef);
        }
    }

    #[test]
    fn test_checked_at_rejects_out_of_range() {
        let region = HeapRegion::new(1024).unwrap();
        let view = region.view();

        assert!(matches!(
            view.checked_at(-8),
            Err(Error::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            view.checked_at(1024),
            Err(Error::AddressOutOfRange { .. })
        ));
        assert!(view.checked_at(1023).is_ok());
    }

    #[test]
    fn test_heap_region_is_aligned_and_zeroed() {
        let region = HeapRegion::new(512).unwrap();
        let view = region.view();
        assert_eq!(view.base() as usize % REGION_ALIGN, 0);
        for i in 0..512 {
            assert_eq!(unsafe { *view.base().add(i) }, 0);
        }
    }
}
