// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! CPU implementation of [`Engine`].
//!
//! Textures are shared RGBA8 pixel arrays.  Commands run on a dedicated
//! [`GraphicsThread`], and asynchronous copies complete there as well.  Staging images
//! export the address of their pixel memory as their native handle, so bridge libraries
//! can read them directly.

use crate::Error;
use crate::dispatch::{Dispatcher, GraphicsThread};
use crate::engine::{Capabilities, CopyCompletion, Engine, NativeContext, NativeHandle};
use crate::view::Rgba8;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

thread_local! {
    static CONTEXT: u8 = const { 0 };
}

#[derive(Debug)]
pub struct SoftwareEngine {
    dispatcher: Dispatcher,
    capabilities: Capabilities,
    live_staging: AtomicUsize,
}

impl SoftwareEngine {
    pub fn new() -> Result<Arc<Self>, Error> {
        Self::with_capabilities(Capabilities::all())
    }

    /// An engine that reports `capabilities`, for simulating platforms without a bridge.
    pub fn with_capabilities(capabilities: Capabilities) -> Result<Arc<Self>, Error> {
        let stream = GraphicsThread::spawn("software graphics")?;
        Ok(Arc::new(SoftwareEngine {
            dispatcher: Dispatcher::new(Arc::new(stream)),
            capabilities,
            live_staging: AtomicUsize::new(0),
        }))
    }

    /// Number of staging images created and not yet released.
    pub fn live_staging(&self) -> usize {
        self.live_staging.load(Ordering::SeqCst)
    }
}

/// A texture held in CPU memory.  Clones share pixels.
#[derive(Debug, Clone)]
pub struct SoftwareTexture {
    width: u32,
    height: u32,
    pixels: Arc<RwLock<Vec<Rgba8>>>,
}

impl SoftwareTexture {
    pub fn solid(width: u32, height: u32, pixel: Rgba8) -> Self {
        Self::from_fn(width, height, |_, _| pixel)
    }

    pub fn from_fn<F: Fn(u32, u32) -> Rgba8>(width: u32, height: u32, f: F) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        SoftwareTexture {
            width,
            height,
            pixels: Arc::new(RwLock::new(pixels)),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn write(&self, x: u32, y: u32, pixel: Rgba8) {
        assert!(x < self.width && y < self.height, "texel ({x},{y}) out of bounds");
        let mut pixels = self.pixels.write().unwrap_or_else(PoisonError::into_inner);
        pixels[(y * self.width + x) as usize] = pixel;
    }

    pub fn read(&self, x: u32, y: u32) -> Rgba8 {
        assert!(x < self.width && y < self.height, "texel ({x},{y}) out of bounds");
        let pixels = self.pixels.read().unwrap_or_else(PoisonError::into_inner);
        pixels[(y * self.width + x) as usize]
    }

    /// Packs the top-left region as words so byte views of it stay 4-aligned.
    fn region_words(&self, width: u32, height: u32) -> Option<Vec<u32>> {
        if width > self.width || height > self.height {
            return None;
        }
        let pixels = self.pixels.read().unwrap_or_else(PoisonError::into_inner);
        let mut words = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            let row = (y * self.width) as usize;
            words.extend(
                pixels[row..row + width as usize]
                    .iter()
                    .map(|p| u32::from_ne_bytes([p.r, p.g, p.b, p.a])),
            );
        }
        Some(words)
    }
}

/// A staging image in CPU memory with a stable address.
#[derive(Debug)]
pub struct SoftwareStaging {
    width: u32,
    height: u32,
    words: Mutex<Box<[u32]>>,
    base: NativeHandle,
}

impl SoftwareStaging {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

fn words_as_bytes(words: &[u32]) -> &[u8] {
    //safe because u32 has no padding and u8 has no alignment requirement
    unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, std::mem::size_of_val(words)) }
}

impl Engine for SoftwareEngine {
    type Texture = SoftwareTexture;
    type Staging = SoftwareStaging;

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_staging(&self, width: u32, height: u32) -> Result<SoftwareStaging, Error> {
        let mut words = vec![0u32; width as usize * height as usize].into_boxed_slice();
        //the boxed slice never moves, so this stays valid for the staging image's life
        let base = NativeHandle::from_ptr(words.as_mut_ptr() as *mut c_void);
        self.live_staging.fetch_add(1, Ordering::SeqCst);
        Ok(SoftwareStaging {
            width,
            height,
            words: Mutex::new(words),
            base,
        })
    }

    fn release_staging(&self, staging: SoftwareStaging) {
        drop(staging);
        self.live_staging.fetch_sub(1, Ordering::SeqCst);
    }

    fn blit(&self, source: &SoftwareTexture, destination: &SoftwareStaging) -> Result<(), Error> {
        let pixels = source.pixels.read().unwrap_or_else(PoisonError::into_inner);
        let mut words = destination
            .words
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for y in 0..destination.height {
            for x in 0..destination.width {
                let word = if x < source.width && y < source.height {
                    let p = pixels[(y * source.width + x) as usize];
                    u32::from_ne_bytes([p.r, p.g, p.b, p.a])
                } else {
                    0
                };
                words[(y * destination.width + x) as usize] = word;
            }
        }
        Ok(())
    }

    fn read_staging(&self, source: &SoftwareStaging, destination: &mut [u8]) -> Result<(), Error> {
        let words = source.words.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = words_as_bytes(&words);
        if bytes.len() != destination.len() {
            return Err(Error::CopyFailed(format!(
                "destination holds {} bytes, staging image holds {}",
                destination.len(),
                bytes.len()
            )));
        }
        destination.copy_from_slice(bytes);
        Ok(())
    }

    fn request_async_copy(
        &self,
        source: &SoftwareTexture,
        width: u32,
        height: u32,
        completion: CopyCompletion,
    ) {
        let source = source.clone();
        self.dispatcher.run(move || match source.region_words(width, height) {
            Some(words) => completion(Ok(words_as_bytes(&words))),
            None => completion(Err(Error::CopyFailed(format!(
                "{}x{} texture is smaller than the {width}x{height} region",
                source.width, source.height
            )))),
        });
    }

    fn native_texture_handle(&self, staging: &SoftwareStaging) -> Result<NativeHandle, Error> {
        Ok(staging.base)
    }

    fn native_context(&self) -> Result<NativeContext, Error> {
        if !self.dispatcher.is_graphics_thread() {
            return Err(Error::NotOnGraphicsThread);
        }
        Ok(CONTEXT.with(|c| NativeContext::from_ptr(c as *const u8 as *mut c_void)))
    }
}
