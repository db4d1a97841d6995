// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Readback providers: copy a GPU texture into CPU-addressable memory.

Four providers implement [`Readback`]:

| Provider                     | Backend                 | Blocks caller | Copy runs on            |
|------------------------------|-------------------------|---------------|-------------------------|
| [`AsyncReadback`]            | [`Backend::AsyncCopy`]  | no            | engine completion thread|
| [`BlockingReadback`]         | [`Backend::Blocking`]   | yes           | calling thread          |
| [`JniReadback`]              | [`Backend::JniBridge`]  | no            | bridge worker thread(s) |
| [`NativeReadback`]           | [`Backend::NativeApi`]  | no            | bridge worker thread(s) |

[`Provider`] wraps whichever one you picked.

# Contract

* Every request that returns `Ok` invokes its handler exactly once.  A failed copy is
  delivered as an empty view rather than lost.
* A request that returns `Err` never invokes its handler.
* Requests on one provider must be serialized.  Issuing a request while another is in
  flight fails with [`Misuse::OverlappingRequest`]; so does issuing one from inside a
  handler, since the staging image is still in use until the handler returns.
* After [`Readback::dispose`] every request fails with [`Misuse::RequestAfterDispose`].
  A request still in flight when disposal finishes its grace step is completed with an
  empty view.

```
# fn main() -> Result<(), pixel_readback::Error> {
use pixel_readback::engine::software::{SoftwareEngine, SoftwareTexture};
use pixel_readback::readback::{Backend, Provider, ProviderConfig, Readback};
use pixel_readback::view::Rgba8;

let engine = SoftwareEngine::new()?;
let provider = Provider::new(Backend::Blocking, &engine, ProviderConfig::new(4, 4))?;
let texture = SoftwareTexture::solid(4, 4, Rgba8::RED);
provider.request::<Rgba8, _>(&texture, |pixels| {
    assert!(pixels.iter().all(|p| *p == Rgba8::RED));
})?;
# test_executors::sleep_on(provider.dispose());
# Ok(())
# }
```
*/

pub mod async_copy;
pub mod blocking;
pub mod bridge;
pub mod jni;
pub mod native;

pub use async_copy::AsyncReadback;
pub use blocking::BlockingReadback;
pub use bridge::BridgeReadback;
pub use jni::JniReadback;
pub use native::NativeReadback;

use crate::engine::Engine;
use crate::error::Misuse;
use crate::registry::Token;
use crate::view::{BufferView, Element, RawView};
use crate::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Environment variable overriding the default disposal grace, in milliseconds.
pub const DISPOSE_GRACE_ENV: &str = "PIXEL_READBACK_DISPOSE_GRACE_MS";

/// One 60 Hz frame.
const DEFAULT_DISPOSE_GRACE: Duration = Duration::from_millis(16);

/// Readback strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Backend {
    /// The engine's own asynchronous GPU-to-CPU copy.
    AsyncCopy,
    /// Synchronous readback; works everywhere, stalls the caller.
    Blocking,
    /// External native library reached through a JNI-style object.
    JniBridge,
    /// External native library reached through a native graphics API.
    NativeApi,
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::AsyncCopy => write!(f, "Async copy"),
            Backend::Blocking => write!(f, "Blocking"),
            Backend::JniBridge => write!(f, "JNI bridge"),
            Backend::NativeApi => write!(f, "Native API bridge"),
        }
    }
}

/// Construction parameters shared by every provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    width: u32,
    height: u32,
    multithreading: bool,
    dispose_grace: Duration,
}

impl ProviderConfig {
    /// Output buffer of `width`x`height` RGBA8 pixels, single-threaded bridges.
    pub fn new(width: u32, height: u32) -> Self {
        ProviderConfig {
            width,
            height,
            multithreading: false,
            dispose_grace: default_dispose_grace(),
        }
    }

    /// Lets bridge libraries copy on several worker threads.  Usually faster, at the
    /// cost of latency.
    pub fn with_multithreading(mut self, multithreading: bool) -> Self {
        self.multithreading = multithreading;
        self
    }

    /// How long disposal waits between releasing the native resource and freeing the
    /// staging image.
    pub fn with_dispose_grace(mut self, grace: Duration) -> Self {
        self.dispose_grace = grace;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn multithreading(&self) -> bool {
        self.multithreading
    }

    pub fn dispose_grace(&self) -> Duration {
        self.dispose_grace
    }

    /// Length of every delivered buffer: `width * height * 4`.
    ///
    /// Saturates for dimensions that [`Provider::new`] would reject.
    pub fn byte_len(&self) -> usize {
        self.checked_byte_len().unwrap_or(usize::MAX)
    }

    fn checked_byte_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(crate::view::Rgba8::BYTES_PER_PIXEL)
            //no allocation may exceed isize::MAX bytes
            .filter(|len| *len <= isize::MAX as usize)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        //bridges take i32 dimensions
        let limit = i32::MAX as u32;
        if self.width == 0
            || self.height == 0
            || self.width > limit
            || self.height > limit
            || self.checked_byte_len().is_none()
        {
            return Err(Error::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

fn default_dispose_grace() -> Duration {
    std::env::var(DISPOSE_GRACE_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_DISPOSE_GRACE)
}

/// Where a provider is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Requesting,
    Disposing,
    Disposed,
}

impl Phase {
    const fn to_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Requesting => 1,
            Phase::Disposing => 2,
            Phase::Disposed => 3,
        }
    }

    const fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Idle,
            1 => Phase::Requesting,
            2 => Phase::Disposing,
            _ => Phase::Disposed,
        }
    }
}

/// Lifecycle state plus the token of the request in flight, if any.
#[derive(Debug)]
pub(crate) struct ProviderState {
    phase: AtomicU8,
    outstanding: Mutex<Option<Token>>,
}

impl ProviderState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ProviderState {
            phase: AtomicU8::new(Phase::Idle.to_u8()),
            outstanding: Mutex::new(None),
        })
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.phase
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Phase::from_u8)
    }

    /// Claims the provider for one request.
    pub(crate) fn begin_request(self: &Arc<Self>) -> Result<RequestGuard, Error> {
        match self.transition(Phase::Idle, Phase::Requesting) {
            Ok(()) => Ok(RequestGuard {
                state: self.clone(),
            }),
            Err(Phase::Requesting) => Err(Misuse::OverlappingRequest.into()),
            Err(_) => Err(Misuse::RequestAfterDispose.into()),
        }
    }

    /// Moves to `Disposing`.  False if disposal already started.
    pub(crate) fn begin_dispose(&self) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            match Phase::from_u8(current) {
                Phase::Disposing | Phase::Disposed => return false,
                _ => {}
            }
            match self.phase.compare_exchange(
                current,
                Phase::Disposing.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn finish_dispose(&self) {
        self.phase.store(Phase::Disposed.to_u8(), Ordering::Release);
    }

    fn outstanding(&self) -> MutexGuard<'_, Option<Token>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_outstanding(&self, token: Token) {
        *self.outstanding() = Some(token);
    }

    /// Forgets `token` if it is still the request in flight.
    pub(crate) fn clear_outstanding(&self, token: Token) {
        let mut outstanding = self.outstanding();
        if *outstanding == Some(token) {
            *outstanding = None;
        }
    }

    pub(crate) fn take_outstanding(&self) -> Option<Token> {
        self.outstanding().take()
    }
}

/// Returns the provider to `Idle` when the request is over, however it ends.
#[derive(Debug)]
pub(crate) struct RequestGuard {
    state: Arc<ProviderState>,
}

impl RequestGuard {
    pub(crate) fn state(&self) -> &ProviderState {
        &self.state
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        //a provider disposed mid-request stays disposing
        let _ = self.state.transition(Phase::Requesting, Phase::Idle);
    }
}

/// Boxed raw handler as stored by providers.
pub type RawHandler = Box<dyn for<'a> FnOnce(RawView<'a>) + Send>;

/**
A handler that is invoked exactly once.

Dropping it undelivered delivers an empty view, so an engine or bridge that loses a
completion cannot leak the caller's handler.
*/
pub(crate) struct OnceHandler(Option<RawHandler>);

impl OnceHandler {
    pub(crate) fn new(handler: RawHandler) -> Self {
        OnceHandler(Some(handler))
    }

    pub(crate) fn deliver(mut self, view: RawView<'_>) {
        if let Some(handler) = self.0.take() {
            handler(view);
        }
    }
}

impl Drop for OnceHandler {
    fn drop(&mut self) {
        if let Some(handler) = self.0.take() {
            logwise::warn_sync!("Readback dropped before completion; delivering an empty view");
            handler(RawView::empty());
        }
    }
}

/// The common readback contract.
pub trait Readback {
    /// The engine texture type this provider reads.
    type Texture;

    fn backend(&self) -> Backend;

    fn config(&self) -> &ProviderConfig;

    fn phase(&self) -> Phase;

    /// Requests a readback, delivering bytes to a boxed handler.
    fn request_boxed(&self, texture: &Self::Texture, handler: RawHandler) -> Result<(), Error>;

    /**
    Requests a readback and delivers the base address plus [`ProviderConfig::byte_len`].

    This is the zero-copy path: the view points straight at staging, driver, or bridge
    memory.
    */
    fn request_raw<F>(&self, texture: &Self::Texture, handler: F) -> Result<(), Error>
    where
        F: for<'a> FnOnce(RawView<'a>) + Send + 'static,
    {
        self.request_boxed(texture, Box::new(handler))
    }

    /**
    Requests a readback and delivers it as elements of `T`.

    Fails with [`Error::ElementSize`] unless `size_of::<T>()` divides the buffer length.
    */
    fn request<T, F>(&self, texture: &Self::Texture, handler: F) -> Result<(), Error>
    where
        T: Element,
        F: for<'a> FnOnce(BufferView<'a, T>) + Send + 'static,
    {
        let byte_len = self.config().byte_len();
        let element_size = std::mem::size_of::<T>();
        if element_size == 0 || byte_len % element_size != 0 {
            return Err(Error::ElementSize {
                element_size,
                byte_len,
            });
        }
        self.request_raw(texture, move |raw: RawView<'_>| handler(raw.typed::<T>()))
    }

    /// Releases every resource the provider owns.  Later requests are rejected.
    fn dispose(&self) -> impl Future<Output = ()>;
}

/// Any of the four providers.
#[derive(Debug)]
pub enum Provider<E: Engine> {
    AsyncCopy(AsyncReadback<E>),
    Blocking(BlockingReadback<E>),
    Jni(JniReadback<E>),
    NativeApi(NativeReadback<E>),
}

impl<E: Engine> Provider<E> {
    /**
    Builds the provider for `backend`.

    Fails with [`Error::UnsupportedBackend`] when the engine or platform can't provide it;
    this never falls back to another backend.
    */
    pub fn new(backend: Backend, engine: &Arc<E>, config: ProviderConfig) -> Result<Self, Error> {
        match backend {
            Backend::AsyncCopy => AsyncReadback::new(engine, config).map(Provider::AsyncCopy),
            Backend::Blocking => BlockingReadback::new(engine, config).map(Provider::Blocking),
            Backend::JniBridge => JniReadback::new(engine, config).map(Provider::Jni),
            Backend::NativeApi => NativeReadback::new(engine, config).map(Provider::NativeApi),
        }
    }
}

impl<E: Engine> Readback for Provider<E> {
    type Texture = E::Texture;

    fn backend(&self) -> Backend {
        match self {
            Provider::AsyncCopy(p) => p.backend(),
            Provider::Blocking(p) => p.backend(),
            Provider::Jni(p) => p.backend(),
            Provider::NativeApi(p) => p.backend(),
        }
    }

    fn config(&self) -> &ProviderConfig {
        match self {
            Provider::AsyncCopy(p) => p.config(),
            Provider::Blocking(p) => p.config(),
            Provider::Jni(p) => p.config(),
            Provider::NativeApi(p) => p.config(),
        }
    }

    fn phase(&self) -> Phase {
        match self {
            Provider::AsyncCopy(p) => p.phase(),
            Provider::Blocking(p) => p.phase(),
            Provider::Jni(p) => p.phase(),
            Provider::NativeApi(p) => p.phase(),
        }
    }

    fn request_boxed(&self, texture: &E::Texture, handler: RawHandler) -> Result<(), Error> {
        match self {
            Provider::AsyncCopy(p) => p.request_boxed(texture, handler),
            Provider::Blocking(p) => p.request_boxed(texture, handler),
            Provider::Jni(p) => p.request_boxed(texture, handler),
            Provider::NativeApi(p) => p.request_boxed(texture, handler),
        }
    }

    async fn dispose(&self) {
        match self {
            Provider::AsyncCopy(p) => p.dispose().await,
            Provider::Blocking(p) => p.dispose().await,
            Provider::Jni(p) => p.dispose().await,
            Provider::NativeApi(p) => p.dispose().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn state_machine_transitions() {
        let state = ProviderState::new();
        assert_eq!(state.phase(), Phase::Idle);
        let guard = state.begin_request().unwrap();
        assert_eq!(state.phase(), Phase::Requesting);
        assert!(matches!(
            state.begin_request(),
            Err(Error::ResourceMisuse(Misuse::OverlappingRequest))
        ));
        drop(guard);
        assert_eq!(state.phase(), Phase::Idle);

        assert!(state.begin_dispose());
        assert!(!state.begin_dispose());
        assert!(matches!(
            state.begin_request(),
            Err(Error::ResourceMisuse(Misuse::RequestAfterDispose))
        ));
        state.finish_dispose();
        assert_eq!(state.phase(), Phase::Disposed);
    }

    #[test]
    fn dispose_during_request_stays_disposing() {
        let state = ProviderState::new();
        let guard = state.begin_request().unwrap();
        assert!(state.begin_dispose());
        drop(guard);
        assert_eq!(state.phase(), Phase::Disposing);
    }

    #[test]
    fn outstanding_is_cleared_only_for_matching_token() {
        let registry = crate::registry::HandleRegistry::new();
        let first = registry.allocate(());
        let second = registry.allocate(());
        let state = ProviderState::new();
        state.set_outstanding(second);
        state.clear_outstanding(first);
        assert_eq!(state.take_outstanding(), Some(second));
        assert_eq!(state.take_outstanding(), None);
    }

    #[test]
    fn dropped_handler_delivers_empty_view() {
        let calls = Arc::new(AtomicUsize::new(0));
        let move_calls = calls.clone();
        let handler = OnceHandler::new(Box::new(move |view: RawView<'_>| {
            assert!(view.is_empty());
            move_calls.fetch_add(1, Ordering::SeqCst);
        }));
        drop(handler);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivered_handler_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let move_calls = calls.clone();
        let handler = OnceHandler::new(Box::new(move |view: RawView<'_>| {
            assert_eq!(view.byte_len(), 3);
            move_calls.fetch_add(1, Ordering::SeqCst);
        }));
        handler.deliver(RawView::from_bytes(&[1, 2, 3]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn config_validation() {
        assert!(ProviderConfig::new(0, 4).validate().is_err());
        assert!(ProviderConfig::new(4, u32::MAX).validate().is_err());
        let config = ProviderConfig::new(4, 4).with_multithreading(true);
        assert!(config.validate().is_ok());
        assert_eq!(config.byte_len(), 64);
        assert!(config.multithreading());
    }

    #[test]
    fn oversized_buffer_is_rejected() {
        let max = i32::MAX as u32;
        let config = ProviderConfig::new(max, max);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidDimensions { width, height }) if width == max && height == max
        ));
        assert_eq!(config.byte_len(), usize::MAX);
    }
}
