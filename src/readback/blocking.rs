// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Synchronous readback.  Works on every engine, at the price of a pipeline stall.

use crate::engine::Engine;
use crate::error::Misuse;
use crate::readback::{Backend, OnceHandler, Phase, ProviderConfig, ProviderState, RawHandler, Readback};
use crate::view::RawView;
use crate::Error;
use std::fmt::{Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

/**
Reads the texture back on the calling thread and invokes the handler before returning.

The provider owns a CPU pixel buffer sized for the output.  Each request allocates a
temporary staging image, blits into it, reads it back into the buffer, and releases it.
The handler sees the buffer directly; it is only valid during the call.

A handler may dispose its own provider.  Disposal then finishes when the request
returns.
*/
pub struct BlockingReadback<E: Engine> {
    engine: Arc<E>,
    config: ProviderConfig,
    state: Arc<ProviderState>,
    //words, so byte views of it are 4-aligned
    pixels: Mutex<Option<Box<[u32]>>>,
    //thread currently running a handler
    delivering_on: Mutex<Option<ThreadId>>,
    //dispose was called from inside a handler
    deferred_dispose: AtomicBool,
}

impl<E: Engine> BlockingReadback<E> {
    pub fn new(engine: &Arc<E>, config: ProviderConfig) -> Result<Self, Error> {
        config.validate()?;
        let words = config.width() as usize * config.height() as usize;
        logwise::info_sync!(
            "Created blocking readback {w}x{h}",
            w = config.width(),
            h = config.height()
        );
        Ok(BlockingReadback {
            engine: engine.clone(),
            config,
            state: ProviderState::new(),
            pixels: Mutex::new(Some(vec![0u32; words].into_boxed_slice())),
            delivering_on: Mutex::new(None),
            deferred_dispose: AtomicBool::new(false),
        })
    }

    fn copy_into(&self, source: &E::Texture, destination: &mut [u8]) -> Result<(), Error> {
        let staging = self
            .engine
            .create_staging(self.config.width(), self.config.height())?;
        let result = self
            .engine
            .blit(source, &staging)
            .and_then(|()| self.engine.read_staging(&staging, destination));
        self.engine.release_staging(staging);
        result
    }

    fn set_delivering(&self, thread: Option<ThreadId>) {
        *self
            .delivering_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = thread;
    }

    fn delivering_here(&self) -> bool {
        *self
            .delivering_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(thread::current().id())
    }

    fn shutdown(&self) {
        let pixels = self
            .pixels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(pixels);
        self.state.finish_dispose();
    }
}

fn words_as_bytes_mut(words: &mut [u32]) -> &mut [u8] {
    let len = std::mem::size_of_val(words);
    //u32 has no padding and u8 has no alignment requirement
    unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, len) }
}

impl<E: Engine> Readback for BlockingReadback<E> {
    type Texture = E::Texture;

    fn backend(&self) -> Backend {
        Backend::Blocking
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn phase(&self) -> Phase {
        self.state.phase()
    }

    fn request_boxed(&self, texture: &E::Texture, handler: RawHandler) -> Result<(), Error> {
        let guard = self.state.begin_request()?;
        //held across the handler so dispose can't free the buffer under it
        let mut pixels = self.pixels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(words) = pixels.as_mut() else {
            return Err(Misuse::RequestAfterDispose.into());
        };
        let handler = OnceHandler::new(handler);
        let bytes = words_as_bytes_mut(words);
        let stall = logwise::perfwarn_begin!("Blocking readback stalls the graphics pipeline");
        let copied = self.copy_into(texture, bytes);
        drop(stall);
        self.set_delivering(Some(thread::current().id()));
        //handler panics surface to our caller, but only after the bookkeeping below
        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| match copied {
            Ok(()) => handler.deliver(RawView::from_bytes(bytes)),
            Err(e) => {
                logwise::warn_sync!(
                    "Blocking readback failed: {e}",
                    e = logwise::privacy::LogIt(&e)
                );
                handler.deliver(RawView::empty());
            }
        }));
        self.set_delivering(None);
        drop(pixels);
        drop(guard);
        if self.deferred_dispose.swap(false, Ordering::AcqRel) {
            self.shutdown();
            logwise::info_sync!("Disposed blocking readback after its handler returned");
        }
        if let Err(panic) = delivered {
            std::panic::resume_unwind(panic);
        }
        Ok(())
    }

    async fn dispose(&self) {
        if self.state.begin_dispose() {
            if self.delivering_here() {
                //the buffer is locked by the request below us on this stack
                self.deferred_dispose.store(true, Ordering::Release);
                return;
            }
            self.shutdown();
            logwise::info_sync!("Disposed blocking readback");
        }
    }
}

impl<E: Engine> Drop for BlockingReadback<E> {
    fn drop(&mut self) {
        if self.state.phase() != Phase::Disposed {
            self.state.begin_dispose();
            self.shutdown();
        }
    }
}

impl<E: Engine> Debug for BlockingReadback<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingReadback")
            .field("config", &self.config)
            .field("phase", &self.state.phase())
            .finish()
    }
}
