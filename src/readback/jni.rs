// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Bridge to a readback library reached through a JNI-style object.

The host registers the library's entry points once with [`register`].  The library is
handed the engine's native graphics context at construction, which is why construction
hops to the graphics thread.  Completed copies arrive as an opaque pixel-buffer object;
its base address is fetched with [`JniVTable::base_address`] before the handler runs.

The request context crosses the boundary as a 64-bit integer, the way a Java `long`
field would carry it.
*/

use crate::engine::{Engine, NativeHandle};
use crate::readback::bridge::{self, Bridge, BridgeReadback, sealed};
use crate::readback::{Backend, ProviderConfig};
use crate::registry::Token;
use crate::Error;
use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

/// Completion callback handed to the library: `(context, pixel_buffer)`.
pub type JniCallback = extern "C" fn(context: i64, pixel_buffer: *mut c_void);

/// Entry points of a JNI-style readback library.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct JniVTable {
    /// Creates a readback object bound to the given native graphics context.
    pub create: unsafe extern "C" fn(
        width: i32,
        height: i32,
        graphics_context: *mut c_void,
        multithreading: bool,
    ) -> *mut c_void,
    /// Copies `texture` out, then calls `callback(context, pixel_buffer)` from any thread.
    pub readback: unsafe extern "C" fn(
        object: *mut c_void,
        texture: *mut c_void,
        callback: JniCallback,
        context: i64,
    ),
    pub release: unsafe extern "C" fn(object: *mut c_void),
    /// Base address of a pixel buffer delivered to the callback.
    pub base_address: unsafe extern "C" fn(pixel_buffer: *mut c_void) -> *const u8,
}

static VTABLE: OnceLock<JniVTable> = OnceLock::new();

/**
Registers the library for this process.

Returns false if a library was already registered; the first registration stays.
*/
pub fn register(vtable: JniVTable) -> bool {
    let registered = VTABLE.set(vtable).is_ok();
    if registered {
        logwise::info_sync!("Registered JNI readback library");
    }
    registered
}

pub fn is_registered() -> bool {
    VTABLE.get().is_some()
}

extern "C" fn on_readback(context: i64, pixel_buffer: *mut c_void) {
    let base = match VTABLE.get() {
        Some(vtable) if !pixel_buffer.is_null() => unsafe { (vtable.base_address)(pixel_buffer) },
        _ => std::ptr::null(),
    };
    bridge::complete(Token::from_jlong(context), base);
}

/// The registered JNI-style library.
#[derive(Debug, Clone, Copy)]
pub struct JniBridge {
    vtable: JniVTable,
}

impl JniBridge {
    pub fn registered() -> Option<Self> {
        VTABLE.get().map(|vtable| JniBridge { vtable: *vtable })
    }
}

impl sealed::Sealed for JniBridge {}

impl Bridge for JniBridge {
    const BACKEND: Backend = Backend::JniBridge;

    fn create<E: Engine>(&self, engine: &Arc<E>, config: &ProviderConfig) -> Result<NativeHandle, Error> {
        let move_engine = engine.clone();
        let context = engine
            .dispatcher()
            .run_blocking(move || move_engine.native_context())?;
        let object = unsafe {
            (self.vtable.create)(
                config.width() as i32,
                config.height() as i32,
                context.as_ptr(),
                config.multithreading(),
            )
        };
        Ok(NativeHandle::from_ptr(object))
    }

    unsafe fn request(&self, object: NativeHandle, texture: NativeHandle, token: Token) {
        unsafe {
            (self.vtable.readback)(
                object.as_ptr(),
                texture.as_ptr(),
                on_readback,
                token.into_jlong(),
            )
        }
    }

    unsafe fn release(&self, object: NativeHandle) {
        unsafe { (self.vtable.release)(object.as_ptr()) }
    }
}

/// Readback through the registered JNI-style library.
pub type JniReadback<E> = BridgeReadback<E, JniBridge>;

impl<E: Engine> BridgeReadback<E, JniBridge> {
    /// Fails with [`Error::UnsupportedBackend`] when no library is registered.
    pub fn new(engine: &Arc<E>, config: ProviderConfig) -> Result<Self, Error> {
        Self::open(engine, config, JniBridge::registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Capabilities;
    use crate::engine::software::SoftwareEngine;

    #[test]
    fn unregistered_library_is_unsupported() {
        //unit tests never register a library
        let engine = SoftwareEngine::new().unwrap();
        let result = JniReadback::new(&engine, ProviderConfig::new(2, 2));
        assert!(matches!(
            result,
            Err(Error::UnsupportedBackend(Backend::JniBridge))
        ));
    }

    #[test]
    fn capability_is_checked_first() {
        let engine = SoftwareEngine::with_capabilities(Capabilities::blocking_only()).unwrap();
        let result = JniReadback::new(&engine, ProviderConfig::new(2, 2));
        assert!(matches!(
            result,
            Err(Error::UnsupportedBackend(Backend::JniBridge))
        ));
    }
}
