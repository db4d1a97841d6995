// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Readback through the engine's own asynchronous copy.

use crate::engine::Engine;
use crate::readback::{Backend, OnceHandler, Phase, ProviderConfig, ProviderState, RawHandler, Readback};
use crate::view::RawView;
use crate::Error;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/**
Wraps [`Engine::request_async_copy`].

The provider owns no staging resources: the engine owns the bytes it delivers.  The
handler runs on whichever thread the engine completes on.  A request in flight when the
provider is disposed still completes normally.
*/
pub struct AsyncReadback<E: Engine> {
    engine: Arc<E>,
    config: ProviderConfig,
    state: Arc<ProviderState>,
}

impl<E: Engine> AsyncReadback<E> {
    pub fn new(engine: &Arc<E>, config: ProviderConfig) -> Result<Self, Error> {
        config.validate()?;
        if !engine.capabilities().supports(Backend::AsyncCopy) {
            return Err(Error::UnsupportedBackend(Backend::AsyncCopy));
        }
        logwise::info_sync!(
            "Created async readback {w}x{h}",
            w = config.width(),
            h = config.height()
        );
        Ok(AsyncReadback {
            engine: engine.clone(),
            config,
            state: ProviderState::new(),
        })
    }
}

impl<E: Engine> Readback for AsyncReadback<E> {
    type Texture = E::Texture;

    fn backend(&self) -> Backend {
        Backend::AsyncCopy
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn phase(&self) -> Phase {
        self.state.phase()
    }

    fn request_boxed(&self, texture: &E::Texture, handler: RawHandler) -> Result<(), Error> {
        let guard = self.state.begin_request()?;
        let handler = OnceHandler::new(handler);
        let byte_len = self.config.byte_len();
        self.engine.request_async_copy(
            texture,
            self.config.width(),
            self.config.height(),
            Box::new(move |result: Result<&[u8], Error>| {
                match result {
                    Ok(bytes) if bytes.len() == byte_len => {
                        handler.deliver(RawView::from_bytes(bytes))
                    }
                    Ok(bytes) => {
                        logwise::warn_sync!(
                            "Async copy returned {got} bytes, expected {want}",
                            got = bytes.len(),
                            want = byte_len
                        );
                        handler.deliver(RawView::empty());
                    }
                    Err(e) => {
                        logwise::warn_sync!(
                            "Async copy failed: {e}",
                            e = logwise::privacy::LogIt(&e)
                        );
                        handler.deliver(RawView::empty());
                    }
                }
                drop(guard);
            }),
        );
        Ok(())
    }

    async fn dispose(&self) {
        if self.state.begin_dispose() {
            self.state.finish_dispose();
            logwise::info_sync!("Disposed async readback");
        }
    }
}

impl<E: Engine> Drop for AsyncReadback<E> {
    fn drop(&mut self) {
        self.state.begin_dispose();
        self.state.finish_dispose();
    }
}

impl<E: Engine> Debug for AsyncReadback<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncReadback")
            .field("config", &self.config)
            .field("phase", &self.state.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Capabilities;
    use crate::engine::software::{SoftwareEngine, SoftwareTexture};
    use crate::view::Rgba8;

    #[test]
    fn unsupported_without_capability() {
        let engine = SoftwareEngine::with_capabilities(Capabilities::blocking_only()).unwrap();
        let result = AsyncReadback::new(&engine, ProviderConfig::new(2, 2));
        assert!(matches!(
            result,
            Err(Error::UnsupportedBackend(Backend::AsyncCopy))
        ));
    }

    #[test_executors::async_test]
    async fn in_flight_request_survives_dispose() {
        let engine = SoftwareEngine::new().unwrap();
        let provider = AsyncReadback::new(&engine, ProviderConfig::new(1, 1)).unwrap();
        let texture = SoftwareTexture::solid(1, 1, Rgba8::RED);
        let (s, r) = r#continue::continuation();
        provider
            .request_raw(&texture, move |view: RawView<'_>| {
                s.send(view.as_bytes().to_vec());
            })
            .unwrap();
        provider.dispose().await;
        assert_eq!(r.await, [255u8, 0, 0, 255]);
        assert_eq!(provider.phase(), Phase::Disposed);
    }
}
