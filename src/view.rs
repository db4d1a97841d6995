// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Non-owning views delivered to readback handlers.
//!
//! A view borrows memory that belongs to somebody else: a provider's staging image, a
//! driver mapping, or a buffer owned by a native bridge.  The memory is valid only while
//! the handler runs.  Handlers are higher-ranked over the view lifetime
//! (`for<'a> FnOnce(BufferView<'a, T>)`), so safe code cannot smuggle a view, or a slice
//! derived from it, out of the handler.  [`RawView::as_ptr`] is the one escape hatch and
//! dereferencing that pointer after the handler returns is undefined behavior.
//!
//! Copying the pixels out is fine:
//!
//! ```
//! use pixel_readback::engine::software::{SoftwareEngine, SoftwareTexture};
//! use pixel_readback::{Backend, BufferView, Provider, ProviderConfig, Readback, Rgba8};
//! use std::sync::{Arc, Mutex};
//!
//! let engine = SoftwareEngine::new().unwrap();
//! let provider = Provider::new(Backend::Blocking, &engine, ProviderConfig::new(1, 1)).unwrap();
//! let texture = SoftwareTexture::solid(1, 1, Rgba8::RED);
//! let copied: Arc<Mutex<Vec<Rgba8>>> = Arc::new(Mutex::new(Vec::new()));
//! let inner = copied.clone();
//! provider
//!     .request::<Rgba8, _>(&texture, move |view: BufferView<'_, Rgba8>| {
//!         *inner.lock().unwrap() = view.to_vec();
//!     })
//!     .unwrap();
//! assert_eq!(*copied.lock().unwrap(), [Rgba8::RED]);
//! ```
//!
//! Keeping the borrowed slice is not:
//!
//! ```compile_fail
//! use pixel_readback::engine::software::{SoftwareEngine, SoftwareTexture};
//! use pixel_readback::{Backend, BufferView, Provider, ProviderConfig, Readback, Rgba8};
//! use std::sync::{Arc, Mutex};
//!
//! let engine = SoftwareEngine::new().unwrap();
//! let provider = Provider::new(Backend::Blocking, &engine, ProviderConfig::new(1, 1)).unwrap();
//! let texture = SoftwareTexture::solid(1, 1, Rgba8::RED);
//! let kept: Arc<Mutex<Option<&[Rgba8]>>> = Arc::new(Mutex::new(None));
//! let inner = kept.clone();
//! provider
//!     .request::<Rgba8, _>(&texture, move |view: BufferView<'_, Rgba8>| {
//!         *inner.lock().unwrap() = Some(view.as_slice());
//!     })
//!     .unwrap();
//! ```

use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::Deref;

/**
Types that can be viewed directly over readback bytes.

# Safety
Implementors must be plain data: no padding, no invalid bit patterns, no pointers.
Any sequence of `size_of::<Self>()` bytes must be a valid value.
*/
pub unsafe trait Element: Copy + Send + Sync + 'static {}

unsafe impl Element for u8 {}
unsafe impl Element for i8 {}
unsafe impl Element for u16 {}
unsafe impl Element for i16 {}
unsafe impl Element for u32 {}
unsafe impl Element for i32 {}
unsafe impl Element for u64 {}
unsafe impl Element for i64 {}
unsafe impl Element for f32 {}
unsafe impl Element for f64 {}
unsafe impl<const N: usize> Element for [u8; N] {}

/// One pixel of the RGBA8 layout every staging image uses.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

unsafe impl Element for Rgba8 {}

impl Rgba8 {
    pub const BYTES_PER_PIXEL: usize = 4;

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Rgba8 { r, g, b, a }
    }

    pub const RED: Rgba8 = Rgba8::new(255, 0, 0, 255);
    pub const TRANSPARENT: Rgba8 = Rgba8::new(0, 0, 0, 0);
}

/// Untyped view: a base address plus a byte length.
#[derive(Clone, Copy)]
pub struct RawView<'a> {
    ptr: *const u8,
    byte_len: usize,
    lifetime: PhantomData<&'a [u8]>,
}

impl<'a> RawView<'a> {
    /**
    # Safety
    `ptr` must be valid for reads of `byte_len` bytes for all of `'a`, and nothing may
    write to that memory during `'a`.
    */
    pub unsafe fn new(ptr: *const u8, byte_len: usize) -> Self {
        RawView {
            ptr,
            byte_len,
            lifetime: PhantomData,
        }
    }

    /// The view delivered when a readback fails.
    pub fn empty() -> Self {
        RawView {
            ptr: std::ptr::null(),
            byte_len: 0,
            lifetime: PhantomData,
        }
    }

    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        //safe because the slice guarantees validity for 'a
        unsafe { RawView::new(bytes.as_ptr(), bytes.len()) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || self.byte_len == 0
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        if self.is_empty() {
            &[]
        } else {
            //safe per the constructor contract
            unsafe { std::slice::from_raw_parts(self.ptr, self.byte_len) }
        }
    }

    /**
    Reinterprets the view as elements of `T`.

    A view whose address is misaligned for `T`, or whose length is not a multiple of
    `size_of::<T>()`, becomes an empty view.
    */
    pub fn typed<T: Element>(self) -> BufferView<'a, T> {
        let size = std::mem::size_of::<T>();
        if self.is_empty() || size == 0 {
            return BufferView::empty();
        }
        if self.ptr.align_offset(std::mem::align_of::<T>()) != 0 || self.byte_len % size != 0 {
            logwise::warn_sync!(
                "Readback buffer is not viewable as {element}; delivering an empty view",
                element = logwise::privacy::LogIt(std::any::type_name::<T>())
            );
            return BufferView::empty();
        }
        //safe because T: Element accepts any bit pattern and we checked alignment + length
        let elements =
            unsafe { std::slice::from_raw_parts(self.ptr as *const T, self.byte_len / size) };
        BufferView { elements }
    }
}

impl Debug for RawView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawView")
            .field("ptr", &self.ptr)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

/// Typed view over a readback buffer.
#[derive(Clone, Copy)]
pub struct BufferView<'a, T> {
    elements: &'a [T],
}

impl<'a, T: Element> BufferView<'a, T> {
    pub fn empty() -> Self {
        BufferView { elements: &[] }
    }

    pub fn as_ptr(&self) -> *const T {
        self.elements.as_ptr()
    }

    pub fn as_slice(&self) -> &'a [T] {
        self.elements
    }

    pub fn element_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    pub fn byte_len(&self) -> usize {
        std::mem::size_of_val(self.elements)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        //safe because T: Element has no padding
        unsafe { std::slice::from_raw_parts(self.elements.as_ptr() as *const u8, self.byte_len()) }
    }
}

impl<T> Deref for BufferView<'_, T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        self.elements
    }
}

impl<T: Debug> Debug for BufferView<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("ptr", &self.elements.as_ptr())
            .field("len", &self.elements.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_view_counts_elements() {
        let words = [0x01020304u32; 4];
        let bytes = unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, 16) };
        let raw = RawView::from_bytes(bytes);
        let pixels = raw.typed::<Rgba8>();
        assert_eq!(pixels.len(), 4);
        assert_eq!(pixels.byte_len(), 16);
        assert_eq!(pixels.element_size(), 4);
        let words_view = raw.typed::<u32>();
        assert_eq!(words_view.as_slice(), &words);
    }

    #[test]
    fn misaligned_view_is_empty() {
        let words = [0u32; 4];
        let bytes = unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, 16) };
        let raw = RawView::from_bytes(&bytes[1..13]);
        assert!(raw.typed::<u32>().is_empty());
        assert_eq!(raw.typed::<u8>().len(), 12);
    }

    #[test]
    fn uneven_length_is_empty() {
        let bytes = [0u8; 6];
        assert!(RawView::from_bytes(&bytes).typed::<Rgba8>().is_empty());
    }

    #[test]
    fn empty_view() {
        let raw = RawView::empty();
        assert!(raw.is_empty());
        assert!(raw.as_bytes().is_empty());
        assert!(raw.typed::<Rgba8>().is_empty());
    }
}
