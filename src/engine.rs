// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The engine-facing boundary.

Readback providers do not render, own textures, or talk to a driver.  Everything they
need from the host engine goes through [`Engine`]:

* a graphics command stream, wrapped in a [`Dispatcher`]
* a capability query
* staging image allocation, texture blits, and a synchronous pixel read
* an asynchronous texture copy with a completion continuation
* native handles for the staging image and the graphics context, for bridge providers

Two engines ship with the crate.  [`software::SoftwareEngine`] keeps textures in CPU
memory and runs its command stream on a plain thread; it is always available and is
what the tests use.  `wgpu::WgpuEngine` (feature `backend_wgpu`) drives a real GPU.
*/

pub mod software;
#[cfg(feature = "backend_wgpu")]
pub mod wgpu;

use crate::Error;
use crate::dispatch::Dispatcher;
use crate::readback::Backend;
use std::ffi::c_void;

/// Completion continuation for [`Engine::request_async_copy`].
///
/// The bytes belong to the engine and are only valid during the call.
pub type CopyCompletion = Box<dyn for<'a> FnOnce(Result<&'a [u8], Error>) + Send>;

/// Which readback strategies the current platform offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub async_copy: bool,
    pub jni_bridge: bool,
    pub native_bridge: bool,
}

impl Capabilities {
    pub const fn all() -> Self {
        Capabilities {
            async_copy: true,
            jni_bridge: true,
            native_bridge: true,
        }
    }

    /// Only the blocking fallback, which every engine supports.
    pub const fn blocking_only() -> Self {
        Capabilities {
            async_copy: false,
            jni_bridge: false,
            native_bridge: false,
        }
    }

    pub const fn supports(&self, backend: Backend) -> bool {
        match backend {
            Backend::AsyncCopy => self.async_copy,
            Backend::Blocking => true,
            Backend::JniBridge => self.jni_bridge,
            Backend::NativeApi => self.native_bridge,
        }
    }
}

/// Opaque native handle: a texture name, a native object, or a raw resource pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeHandle(*mut c_void);

// The handle is only an identifier on our side; whoever dereferences it owns the threading rules
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    pub const fn from_ptr(ptr: *mut c_void) -> Self {
        NativeHandle(ptr)
    }

    pub const fn null() -> Self {
        NativeHandle(std::ptr::null_mut())
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// The engine's native graphics context, as handed to bridge libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeContext(NativeHandle);

impl NativeContext {
    pub const fn from_ptr(ptr: *mut c_void) -> Self {
        NativeContext(NativeHandle::from_ptr(ptr))
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// What a readback provider needs from its host engine.
pub trait Engine: Send + Sync + 'static {
    /// A source texture owned by the engine.
    type Texture: Send + Sync + 'static;
    /// An offscreen RGBA8 image a provider can blit into.
    type Staging: Send + Sync + 'static;

    fn dispatcher(&self) -> &Dispatcher;

    fn capabilities(&self) -> Capabilities;

    /// Allocates a `width`x`height` RGBA8 staging image.
    fn create_staging(&self, width: u32, height: u32) -> Result<Self::Staging, Error>;

    fn release_staging(&self, staging: Self::Staging);

    /// Copies `source` into `destination`, clipped to the smaller of the two.
    fn blit(&self, source: &Self::Texture, destination: &Self::Staging) -> Result<(), Error>;

    /**
    Reads `source` back synchronously into tightly packed RGBA8 bytes.

    `destination` must be exactly `width * height * 4` bytes.  Blocks until the GPU has
    finished every prior command that touches `source`.
    */
    fn read_staging(&self, source: &Self::Staging, destination: &mut [u8]) -> Result<(), Error>;

    /**
    Starts an asynchronous copy of the top-left `width`x`height` region of `source`.

    `completion` runs exactly once on a thread of the engine's choosing, with
    `width * height * 4` tightly packed RGBA8 bytes or an error.
    */
    fn request_async_copy(
        &self,
        source: &Self::Texture,
        width: u32,
        height: u32,
        completion: CopyCompletion,
    );

    /// The handle bridge libraries use to address `staging`.
    fn native_texture_handle(&self, staging: &Self::Staging) -> Result<NativeHandle, Error>;

    /// The current native graphics context.  Only valid on the graphics thread.
    fn native_context(&self) -> Result<NativeContext, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_is_always_supported() {
        assert!(Capabilities::blocking_only().supports(Backend::Blocking));
        assert!(!Capabilities::blocking_only().supports(Backend::AsyncCopy));
        assert!(Capabilities::all().supports(Backend::NativeApi));
    }
}
