// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Readback through an external native library.

Both bridge backends share one shape.  At construction the provider creates a native
readback object and a staging image the library can address.  Each request blits the
source texture into staging and asks the library to copy it out; the library calls back
on a thread of its choosing with the address of a buffer it owns.

The request's handler can't cross the C boundary, so it is parked in the process-wide
[`PENDING`] registry and only its [`Token`] travels through the library.  The callback
trampoline resolves the token, invokes the handler, and discards the entry.

# Disposal

Disposal runs in three steps:

1. Release the native object.  The library stops accepting work but may still be
   finishing a copy.
2. Wait [`ProviderConfig::dispose_grace`] so that copy can land.
3. If the outstanding request is still waiting, deliver an empty view to its handler and
   leave an orphan in its [`PENDING`] slot.  Then free the staging image.

The library still owes a callback for the request after step 3.  When it arrives it
resolves the orphan and is ignored.  Whichever of the callback and step 3 gets to the
entry first delivers; the other finds nothing to do.
*/

use crate::engine::{Engine, NativeHandle};
use crate::error::Misuse;
use crate::readback::{
    Backend, OnceHandler, Phase, ProviderConfig, ProviderState, RawHandler, Readback,
    RequestGuard,
};
use crate::registry::{HandleRegistry, Token, fatal};
use crate::view::RawView;
use crate::Error;
use std::fmt::{Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) mod sealed {
    pub trait Sealed {}
}

/**
An external readback library.

Implemented by [`super::jni::JniBridge`] and [`super::native::NativeApiBridge`].
*/
pub trait Bridge: sealed::Sealed + Send + Sync + 'static {
    const BACKEND: Backend;

    /// Creates the native readback object.  A null handle means the library declined.
    fn create<E: Engine>(&self, engine: &Arc<E>, config: &ProviderConfig) -> Result<NativeHandle, Error>;

    /**
    Asks the library to copy `texture` out and call back with `token`.

    # Safety
    `object` must come from [`Bridge::create`] and not be released.  `texture` must stay
    valid until the callback for `token` runs.
    */
    unsafe fn request(&self, object: NativeHandle, texture: NativeHandle, token: Token);

    /**
    # Safety
    `object` must come from [`Bridge::create`] and must not be used afterwards.
    */
    unsafe fn release(&self, object: NativeHandle);
}

/// A request waiting for its native callback.
pub(crate) enum Pending {
    Waiting {
        handler: OnceHandler,
        byte_len: usize,
        //after `handler`, so a dropped entry delivers before the provider goes idle
        guard: RequestGuard,
    },
    /// Completed with an empty view at dispose; the library's callback is still due.
    Orphaned,
}

pub(crate) static PENDING: HandleRegistry<Pending> = HandleRegistry::new();

/**
Completes the request behind `token` with `buffer`.

Called from bridge trampolines on library threads.  A callback for an orphaned request
is dropped.  A null token, or one that doesn't resolve, means the library broke the
protocol; that aborts the process.
*/
pub(crate) fn complete(token: Option<Token>, buffer: *const u8) {
    let Some(token) = token else {
        fatal(&Error::NullContext);
    };
    let pending = match PENDING.resolve_and_release(token) {
        Ok(pending) => pending,
        Err(e) => fatal(&e),
    };
    let Pending::Waiting {
        handler,
        byte_len,
        guard,
    } = pending
    else {
        logwise::info_sync!(
            "Late bridge completion {token} after dispose; ignored",
            token = logwise::privacy::LogIt(&token)
        );
        return;
    };
    guard.state().clear_outstanding(token);
    logwise::trace_sync!(
        "Bridge completion {token}",
        token = logwise::privacy::LogIt(&token)
    );
    let view = if buffer.is_null() {
        logwise::warn_sync!("Bridge delivered a null buffer; delivering an empty view");
        RawView::empty()
    } else {
        //the library keeps the buffer alive until the callback returns
        unsafe { RawView::new(buffer, byte_len) }
    };
    if std::panic::catch_unwind(AssertUnwindSafe(move || handler.deliver(view))).is_err() {
        logwise::error_sync!("Readback handler panicked on a bridge thread");
    }
    drop(guard);
}

/// Number of bridge requests whose handler has not run yet, across all providers.
///
/// Orphans left by dispose don't count.
pub fn pending_requests() -> usize {
    PENDING.count_live(|pending| matches!(pending, Pending::Waiting { .. }))
}

/// Readback through an external library `B`.
pub struct BridgeReadback<E: Engine, B: Bridge> {
    engine: Arc<E>,
    bridge: B,
    config: ProviderConfig,
    state: Arc<ProviderState>,
    object: Mutex<Option<NativeHandle>>,
    staging: Mutex<Option<E::Staging>>,
    texture: NativeHandle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: Engine, B: Bridge> BridgeReadback<E, B> {
    /// Builds a provider over an explicitly supplied bridge.
    pub fn with_bridge(engine: &Arc<E>, bridge: B, config: ProviderConfig) -> Result<Self, Error> {
        Self::open(engine, config, || Some(bridge))
    }

    pub(crate) fn open<F>(engine: &Arc<E>, config: ProviderConfig, find_bridge: F) -> Result<Self, Error>
    where
        F: FnOnce() -> Option<B>,
    {
        config.validate()?;
        if !engine.capabilities().supports(B::BACKEND) {
            return Err(Error::UnsupportedBackend(B::BACKEND));
        }
        let Some(bridge) = find_bridge() else {
            logwise::warn_sync!(
                "No {backend} library is available",
                backend = logwise::privacy::LogIt(&B::BACKEND)
            );
            return Err(Error::UnsupportedBackend(B::BACKEND));
        };
        let object = bridge.create(engine, &config)?;
        if object.is_null() {
            logwise::warn_sync!(
                "{backend} library declined to create a readback object",
                backend = logwise::privacy::LogIt(&B::BACKEND)
            );
            return Err(Error::UnsupportedBackend(B::BACKEND));
        }
        let staging = match engine.create_staging(config.width(), config.height()) {
            Ok(staging) => staging,
            Err(e) => {
                unsafe { bridge.release(object) };
                return Err(e);
            }
        };
        let texture = match engine.native_texture_handle(&staging) {
            Ok(texture) => texture,
            Err(e) => {
                engine.release_staging(staging);
                unsafe { bridge.release(object) };
                return Err(e);
            }
        };
        logwise::info_sync!(
            "Created {backend} readback {w}x{h}",
            backend = logwise::privacy::LogIt(&B::BACKEND),
            w = config.width(),
            h = config.height()
        );
        Ok(BridgeReadback {
            engine: engine.clone(),
            bridge,
            config,
            state: ProviderState::new(),
            object: Mutex::new(Some(object)),
            staging: Mutex::new(Some(staging)),
            texture,
        })
    }

    async fn shutdown(&self) {
        let object = lock(&self.object).take();
        if let Some(object) = object {
            unsafe { self.bridge.release(object) };
        }
        portable_async_sleep::async_sleep(self.config.dispose_grace()).await;
        if let Some(token) = self.state.take_outstanding() {
            //the callback may have won the race
            if let Ok(Pending::Waiting { handler, guard, .. }) =
                PENDING.replace(token, Pending::Orphaned)
            {
                logwise::warn_sync!("Readback was in flight at dispose; delivering an empty view");
                handler.deliver(RawView::empty());
                drop(guard);
            }
        }
        let staging = lock(&self.staging).take();
        if let Some(staging) = staging {
            self.engine.release_staging(staging);
        }
        self.state.finish_dispose();
    }
}

impl<E: Engine, B: Bridge> Readback for BridgeReadback<E, B> {
    type Texture = E::Texture;

    fn backend(&self) -> Backend {
        B::BACKEND
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn phase(&self) -> Phase {
        self.state.phase()
    }

    fn request_boxed(&self, texture: &E::Texture, handler: RawHandler) -> Result<(), Error> {
        let guard = self.state.begin_request()?;
        let Some(object) = *lock(&self.object) else {
            return Err(Misuse::RequestAfterDispose.into());
        };
        let blitted = match lock(&self.staging).as_ref() {
            Some(staging) => self.engine.blit(texture, staging),
            None => return Err(Misuse::RequestAfterDispose.into()),
        };
        let handler = OnceHandler::new(handler);
        if let Err(e) = blitted {
            logwise::warn_sync!(
                "Can't blit into bridge staging: {e}",
                e = logwise::privacy::LogIt(&e)
            );
            handler.deliver(RawView::empty());
            return Ok(());
        }
        let token = PENDING.allocate(Pending::Waiting {
            handler,
            byte_len: self.config.byte_len(),
            guard,
        });
        //recorded before the library can call back
        self.state.set_outstanding(token);
        logwise::trace_sync!(
            "Bridge request {token}",
            token = logwise::privacy::LogIt(&token)
        );
        unsafe { self.bridge.request(object, self.texture, token) };
        Ok(())
    }

    async fn dispose(&self) {
        if self.state.begin_dispose() {
            self.shutdown().await;
            logwise::info_sync!(
                "Disposed {backend} readback",
                backend = logwise::privacy::LogIt(&B::BACKEND)
            );
        }
    }
}

impl<E: Engine, B: Bridge> Drop for BridgeReadback<E, B> {
    fn drop(&mut self) {
        if self.state.phase() != Phase::Disposed {
            self.state.begin_dispose();
            test_executors::sleep_on(self.shutdown());
        }
    }
}

impl<E: Engine, B: Bridge> Debug for BridgeReadback<E, B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeReadback")
            .field("backend", &B::BACKEND)
            .field("config", &self.config)
            .field("phase", &self.state.phase())
            .field("texture", &self.texture)
            .finish()
    }
}
