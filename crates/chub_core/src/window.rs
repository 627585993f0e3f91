//! Volatile view over the shared memory window.
//!
//! The window is either device memory mapped by the platform or an
//! in-process allocation used by the simulator and tests. Both are accessed
//! through volatile loads and stores only, since the peer may change the
//! contents at any time.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const NO_GLITCH: usize = usize::MAX;

/// Owned, word-aligned storage backing an allocated window.
struct Backing {
    ptr: NonNull<u32>,
    words: usize,
    /// Byte offset whose next write lands corrupted, or `NO_GLITCH`.
    glitch_at: AtomicUsize,
    glitch_flip: AtomicU8,
}

unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Drop for Backing {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: ptr and words come from Box::into_raw in SharedWindow::allocate.
            let slice = core::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.words);
            drop(Box::from_raw(slice));
        }
    }
}

/// A bounded region of shared memory.
///
/// Cloning is cheap and yields another view of the same bytes. Sub-windows
/// created with [`SharedWindow::slice`] keep the backing allocation alive.
#[derive(Clone)]
pub struct SharedWindow {
    base: NonNull<u8>,
    len: usize,
    _backing: Option<Arc<Backing>>,
}

unsafe impl Send for SharedWindow {}
unsafe impl Sync for SharedWindow {}

impl SharedWindow {
    /// Wraps memory mapped by the platform.
    ///
    /// # Safety
    ///
    /// `base` must be valid for volatile reads and writes of `len` bytes for
    /// the lifetime of every clone of the returned window, and must be
    /// 4-byte aligned.
    pub unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Option<Self> {
        let base = NonNull::new(base)?;
        if base.as_ptr() as usize % 4 != 0 {
            return None;
        }
        Some(Self {
            base,
            len,
            _backing: None,
        })
    }

    /// Allocates a zeroed, word-aligned window of `len` bytes.
    pub fn allocate(len: usize) -> Self {
        let words = len.div_ceil(4).max(1);
        let storage = vec![0u32; words].into_boxed_slice();
        let raw = Box::into_raw(storage);
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw as *mut u32) };
        Self {
            base: ptr.cast(),
            len,
            _backing: Some(Arc::new(Backing {
                ptr,
                words,
                glitch_at: AtomicUsize::new(NO_GLITCH),
                glitch_flip: AtomicU8::new(0),
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a view of `len` bytes starting at `offset`, or `None` when the
    /// range leaves this window or breaks word alignment.
    pub fn slice(&self, offset: usize, len: usize) -> Option<SharedWindow> {
        let end = offset.checked_add(len)?;
        if end > self.len || offset % 4 != 0 {
            return None;
        }
        Some(Self {
            // SAFETY: offset is within the window.
            base: unsafe { self.base.add(offset) },
            len,
            _backing: self._backing.clone(),
        })
    }

    /// Makes the next write covering byte `offset` land with its bits
    /// XORed by `flip`, the way a marginal memory cell would. The cell is
    /// sound again afterwards.
    ///
    /// Returns `false` for platform mapped windows, which cannot be
    /// glitched, and for offsets outside the window.
    pub fn glitch_next_write(&self, offset: usize, flip: u8) -> bool {
        let Some(backing) = &self._backing else {
            return false;
        };
        if offset >= self.len || flip == 0 {
            return false;
        }
        backing.glitch_flip.store(flip, Ordering::Relaxed);
        backing
            .glitch_at
            .store(self.backing_offset(backing) + offset, Ordering::Release);
        true
    }

    fn backing_offset(&self, backing: &Backing) -> usize {
        self.base.as_ptr() as usize - backing.ptr.as_ptr() as usize
    }

    fn after_write(&self, offset: usize, len: usize) {
        let Some(backing) = &self._backing else {
            return;
        };
        let at = backing.glitch_at.load(Ordering::Acquire);
        if at == NO_GLITCH {
            return;
        }
        let start = self.backing_offset(backing) + offset;
        if !(start..start + len).contains(&at) {
            return;
        }
        if backing
            .glitch_at
            .compare_exchange(at, NO_GLITCH, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let flip = backing.glitch_flip.load(Ordering::Relaxed);
        unsafe {
            // SAFETY: at lies inside the range just written, which is inside the backing.
            let cell = backing.ptr.cast::<u8>().as_ptr().add(at);
            cell.write_volatile(cell.read_volatile() ^ flip);
        }
    }

    #[inline]
    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset.checked_add(width).is_some_and(|end| end <= self.len),
            "access of {width} bytes at {offset:#x} outside window of {:#x}",
            self.len
        );
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        debug_assert!(offset % 4 == 0);
        unsafe { self.base.add(offset).cast::<u32>().as_ptr().read_volatile() }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        debug_assert!(offset % 4 == 0);
        unsafe { self.base.add(offset).cast::<u32>().as_ptr().write_volatile(value) }
        self.after_write(offset, 4);
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        debug_assert!(offset % 2 == 0);
        unsafe { self.base.add(offset).cast::<u16>().as_ptr().read_volatile() }
    }

    pub fn write_u16(&self, offset: usize, value: u16) {
        self.check(offset, 2);
        debug_assert!(offset % 2 == 0);
        unsafe { self.base.add(offset).cast::<u16>().as_ptr().write_volatile(value) }
        self.after_write(offset, 2);
    }

    /// Copies bytes out of the window into `dst`.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        let src = unsafe { self.base.add(offset).as_ptr() };
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = unsafe { src.add(i).read_volatile() };
        }
    }

    /// Copies `src` into the window.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        let dst = unsafe { self.base.add(offset).as_ptr() };
        for (i, byte) in src.iter().enumerate() {
            unsafe { dst.add(i).write_volatile(*byte) };
        }
        self.after_write(offset, src.len());
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) {
        self.check(offset, len);
        let dst = unsafe { self.base.add(offset).as_ptr() };
        for i in 0..len {
            unsafe { dst.add(i).write_volatile(value) };
        }
        self.after_write(offset, len);
    }

    /// Snapshot of the whole window.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read_bytes(0, &mut out);
        out
    }
}

impl core::fmt::Debug for SharedWindow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedWindow")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_share_the_same_bytes() {
        let window = SharedWindow::allocate(64);
        let sub = window.slice(16, 16).unwrap();
        sub.write_u32(4, 0xdead_beef);
        assert_eq!(window.read_u32(20), 0xdead_beef);

        window.write_bytes(16, b"abcd");
        let mut out = [0u8; 4];
        sub.read_bytes(0, &mut out);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn slice_rejects_ranges_outside_the_window() {
        let window = SharedWindow::allocate(64);
        assert!(window.slice(60, 8).is_none());
        assert!(window.slice(2, 4).is_none());
        assert!(window.slice(usize::MAX - 2, 8).is_none());
    }

    #[test]
    fn sub_window_outlives_parent() {
        let sub = {
            let window = SharedWindow::allocate(32);
            window.write_u32(8, 7);
            window.slice(8, 8).unwrap()
        };
        assert_eq!(sub.read_u32(0), 7);
    }

    #[test]
    fn glitch_corrupts_one_write_only() {
        let window = SharedWindow::allocate(64);
        let sub = window.slice(32, 32).unwrap();
        assert!(sub.glitch_next_write(5, 0x01));

        window.write_bytes(0, &[0xaa; 8]);
        assert_eq!(window.to_vec()[..8], [0xaa; 8]);

        sub.write_bytes(0, &[0x10; 8]);
        let mut out = [0u8; 8];
        sub.read_bytes(0, &mut out);
        assert_eq!(out, [0x10, 0x10, 0x10, 0x10, 0x10, 0x11, 0x10, 0x10]);

        sub.write_bytes(0, &[0x10; 8]);
        sub.read_bytes(0, &mut out);
        assert_eq!(out, [0x10; 8]);
    }

    #[test]
    fn glitch_is_refused_outside_the_window() {
        let window = SharedWindow::allocate(16);
        assert!(!window.glitch_next_write(16, 0x01));
        assert!(!window.glitch_next_write(0, 0));
    }

    #[test]
    #[should_panic]
    fn out_of_range_access_panics() {
        let window = SharedWindow::allocate(8);
        window.read_u32(8);
    }
}
