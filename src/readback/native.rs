// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Bridge to a readback library reached through a native graphics API.

The library exports three C symbols:

```text
void *NRCreateReadback(int32_t width, int32_t height, bool multithreading);
void  NRRequestReadback(void *readback, void *texture,
                        void (*handler)(void *context, void *pixels), void *context);
void  NRDisposeReadback(void *readback);
```

They are found, in order of preference, from:

1. a table passed to [`register`],
2. with the `native_linked` feature on Apple targets, symbols linked into the binary.

[`load`] resolves the table from a shared library at runtime.

The library's readback object must be created on the graphics thread, so construction
hops there.  The request context crosses the boundary as a pointer-sized integer.
*/

use crate::engine::{Engine, NativeHandle};
use crate::readback::bridge::{self, Bridge, BridgeReadback, sealed};
use crate::readback::{Backend, ProviderConfig};
use crate::registry::Token;
use crate::Error;
use std::ffi::{OsStr, c_void};
use std::sync::{Arc, OnceLock};

/// Completion callback handed to the library: `(context, pixel_buffer)`.
pub type NativeCallback = unsafe extern "C" fn(context: *mut c_void, pixel_buffer: *mut c_void);

/// Entry points of a native readback library.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeVTable {
    pub create: unsafe extern "C" fn(width: i32, height: i32, multithreading: bool) -> *mut c_void,
    /// Copies `texture` out, then calls `handler(context, pixel_buffer)` from any thread.
    pub request: unsafe extern "C" fn(
        readback: *mut c_void,
        texture: *mut c_void,
        handler: NativeCallback,
        context: *mut c_void,
    ),
    pub dispose: unsafe extern "C" fn(readback: *mut c_void),
}

type CreateFn = unsafe extern "C" fn(i32, i32, bool) -> *mut c_void;
type RequestFn = unsafe extern "C" fn(*mut c_void, *mut c_void, NativeCallback, *mut c_void);
type DisposeFn = unsafe extern "C" fn(*mut c_void);

static REGISTERED: OnceLock<NativeVTable> = OnceLock::new();

/**
Registers the library for this process.

Returns false if a library was already registered; the first registration stays.
*/
pub fn register(vtable: NativeVTable) -> bool {
    let registered = REGISTERED.set(vtable).is_ok();
    if registered {
        logwise::info_sync!("Registered native readback library");
    }
    registered
}

/**
Resolves the library's symbols from the shared library at `path`.

The library stays loaded for the life of the process.

# Safety
Loading a library runs its initializers, and the exported symbols must have the
signatures documented on this module.
*/
pub unsafe fn load<P: AsRef<OsStr>>(path: P) -> Result<NativeVTable, Error> {
    let library = unsafe { libloading::Library::new(path.as_ref()) }?;
    let vtable = unsafe {
        NativeVTable {
            create: *library.get::<CreateFn>(b"NRCreateReadback\0")?,
            request: *library.get::<RequestFn>(b"NRRequestReadback\0")?,
            dispose: *library.get::<DisposeFn>(b"NRDisposeReadback\0")?,
        }
    };
    //the table points into the library
    std::mem::forget(library);
    logwise::info_sync!(
        "Loaded native readback library {path}",
        path = logwise::privacy::LogIt(path.as_ref())
    );
    Ok(vtable)
}

#[cfg(all(feature = "native_linked", target_vendor = "apple"))]
mod linked {
    use super::{NativeCallback, NativeVTable};
    use std::ffi::c_void;

    unsafe extern "C" {
        fn NRCreateReadback(width: i32, height: i32, multithreading: bool) -> *mut c_void;
        fn NRRequestReadback(
            readback: *mut c_void,
            texture: *mut c_void,
            handler: NativeCallback,
            context: *mut c_void,
        );
        fn NRDisposeReadback(readback: *mut c_void);
    }

    pub(super) fn vtable() -> NativeVTable {
        NativeVTable {
            create: NRCreateReadback,
            request: NRRequestReadback,
            dispose: NRDisposeReadback,
        }
    }
}

fn current_vtable() -> Option<NativeVTable> {
    if let Some(vtable) = REGISTERED.get() {
        return Some(*vtable);
    }
    #[cfg(all(feature = "native_linked", target_vendor = "apple"))]
    {
        Some(linked::vtable())
    }
    #[cfg(not(all(feature = "native_linked", target_vendor = "apple")))]
    {
        None
    }
}

extern "C" fn on_readback(context: *mut c_void, pixel_buffer: *mut c_void) {
    bridge::complete(Token::from_context(context), pixel_buffer as *const u8);
}

/// A native readback library.
#[derive(Debug, Clone, Copy)]
pub struct NativeApiBridge {
    vtable: NativeVTable,
}

impl NativeApiBridge {
    /// The registered or linked library, if any.
    pub fn current() -> Option<Self> {
        current_vtable().map(Self::from_vtable)
    }

    /// A bridge over an explicit table, e.g. one returned by [`load`].
    pub fn from_vtable(vtable: NativeVTable) -> Self {
        NativeApiBridge { vtable }
    }
}

impl sealed::Sealed for NativeApiBridge {}

impl Bridge for NativeApiBridge {
    const BACKEND: Backend = Backend::NativeApi;

    fn create<E: Engine>(&self, engine: &Arc<E>, config: &ProviderConfig) -> Result<NativeHandle, Error> {
        let create = self.vtable.create;
        let width = config.width() as i32;
        let height = config.height() as i32;
        let multithreading = config.multithreading();
        let object = engine.dispatcher().run_blocking(move || {
            NativeHandle::from_ptr(unsafe { create(width, height, multithreading) })
        });
        Ok(object)
    }

    unsafe fn request(&self, object: NativeHandle, texture: NativeHandle, token: Token) {
        unsafe {
            (self.vtable.request)(
                object.as_ptr(),
                texture.as_ptr(),
                on_readback,
                token.into_context(),
            )
        }
    }

    unsafe fn release(&self, object: NativeHandle) {
        unsafe { (self.vtable.dispose)(object.as_ptr()) }
    }
}

/// Readback through the registered or linked native library.
pub type NativeReadback<E> = BridgeReadback<E, NativeApiBridge>;

impl<E: Engine> BridgeReadback<E, NativeApiBridge> {
    /// Fails with [`Error::UnsupportedBackend`] when no library is registered or linked.
    pub fn new(engine: &Arc<E>, config: ProviderConfig) -> Result<Self, Error> {
        Self::open(engine, config, NativeApiBridge::current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::software::SoftwareEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DISPOSED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn declining_create(_: i32, _: i32, _: bool) -> *mut c_void {
        std::ptr::null_mut()
    }

    unsafe extern "C" fn unused_request(
        _: *mut c_void,
        _: *mut c_void,
        _: NativeCallback,
        _: *mut c_void,
    ) {
        unreachable!("no object was created")
    }

    unsafe extern "C" fn counting_dispose(_: *mut c_void) {
        DISPOSED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn declined_create_is_unsupported() {
        let engine = SoftwareEngine::new().unwrap();
        let bridge = NativeApiBridge::from_vtable(NativeVTable {
            create: declining_create,
            request: unused_request,
            dispose: counting_dispose,
        });
        let result = BridgeReadback::with_bridge(&engine, bridge, ProviderConfig::new(2, 2));
        assert!(matches!(
            result,
            Err(Error::UnsupportedBackend(Backend::NativeApi))
        ));
        assert_eq!(DISPOSED.load(Ordering::SeqCst), 0);
        assert_eq!(engine.live_staging(), 0);
    }

    #[test]
    fn missing_library_fails_to_load() {
        let result = unsafe { load("/nonexistent/libnative_readback.so") };
        assert!(matches!(result, Err(Error::Library(_))));
    }
}
