// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Drives the JNI-style bridge against a fake library written in Rust.

use pixel_readback::engine::software::{SoftwareEngine, SoftwareTexture};
use pixel_readback::readback::bridge::pending_requests;
use pixel_readback::readback::jni::{self, JniCallback, JniVTable};
use pixel_readback::{Backend, Phase, Provider, ProviderConfig, RawView, Readback, Rgba8};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, Once, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

struct FakeObject {
    width: i32,
    height: i32,
}

struct FakePixelBuffer {
    pixels: Vec<u32>,
}

static CONTEXT: Mutex<usize> = Mutex::new(0);
static RELEASES: AtomicUsize = AtomicUsize::new(0);
static NULL_BUFFER: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn fake_create(
    width: i32,
    height: i32,
    graphics_context: *mut c_void,
    _multithreading: bool,
) -> *mut c_void {
    *CONTEXT.lock().unwrap() = graphics_context as usize;
    Box::into_raw(Box::new(FakeObject { width, height })) as *mut c_void
}

unsafe extern "C" fn fake_readback(
    object: *mut c_void,
    texture: *mut c_void,
    callback: JniCallback,
    context: i64,
) {
    let object = unsafe { &*(object as *const FakeObject) };
    let words = object.width as usize * object.height as usize;
    let pixels = unsafe { std::slice::from_raw_parts(texture as *const u32, words) }.to_vec();
    let null_buffer = NULL_BUFFER.load(Ordering::SeqCst);
    thread::spawn(move || {
        if null_buffer {
            callback(context, std::ptr::null_mut());
            return;
        }
        let buffer = Box::into_raw(Box::new(FakePixelBuffer { pixels }));
        callback(context, buffer as *mut c_void);
        drop(unsafe { Box::from_raw(buffer) });
    });
}

unsafe extern "C" fn fake_release(object: *mut c_void) {
    drop(unsafe { Box::from_raw(object as *mut FakeObject) });
    RELEASES.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn fake_base_address(pixel_buffer: *mut c_void) -> *const u8 {
    let buffer = unsafe { &*(pixel_buffer as *const FakePixelBuffer) };
    buffer.pixels.as_ptr() as *const u8
}

static INSTALL: Once = Once::new();
static SERIAL: Mutex<()> = Mutex::new(());

fn setup() -> MutexGuard<'static, ()> {
    INSTALL.call_once(|| {
        assert!(!jni::is_registered());
        assert!(jni::register(JniVTable {
            create: fake_create,
            readback: fake_readback,
            release: fake_release,
            base_address: fake_base_address,
        }));
    });
    let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    NULL_BUFFER.store(false, Ordering::SeqCst);
    guard
}

fn config(width: u32, height: u32) -> ProviderConfig {
    ProviderConfig::new(width, height).with_dispose_grace(Duration::from_millis(5))
}

fn wait_idle<R: Readback>(provider: &R) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while provider.phase() != Phase::Idle {
        assert!(Instant::now() < deadline, "provider never went idle");
        thread::yield_now();
    }
}

#[test]
fn construction_attaches_graphics_context() {
    let _serial = setup();
    *CONTEXT.lock().unwrap() = 0;
    let engine = SoftwareEngine::new().unwrap();
    let provider = Provider::new(Backend::JniBridge, &engine, config(2, 2)).unwrap();
    assert_ne!(*CONTEXT.lock().unwrap(), 0);
    test_executors::sleep_on(provider.dispose());
}

#[test]
fn delivers_pixels_through_base_address() {
    let _serial = setup();
    let engine = SoftwareEngine::new().unwrap();
    let provider = Provider::new(Backend::JniBridge, &engine, config(2, 1)).unwrap();
    let texture = SoftwareTexture::from_fn(2, 1, |x, _| Rgba8::new(0, 0, 100 + x as u8, 255));
    let (s, r) = r#continue::continuation();
    provider
        .request_raw(&texture, move |view: RawView<'_>| s.send(view.as_bytes().to_vec()))
        .unwrap();
    assert_eq!(
        test_executors::sleep_on(r),
        [0u8, 0, 100, 255, 0, 0, 101, 255]
    );
    wait_idle(&provider);
    test_executors::sleep_on(provider.dispose());
    assert_eq!(pending_requests(), 0);
}

#[test]
fn null_pixel_buffer_delivers_empty_view() {
    let _serial = setup();
    NULL_BUFFER.store(true, Ordering::SeqCst);
    let engine = SoftwareEngine::new().unwrap();
    let provider = Provider::new(Backend::JniBridge, &engine, config(1, 1)).unwrap();
    let texture = SoftwareTexture::solid(1, 1, Rgba8::RED);
    let (s, r) = r#continue::continuation();
    provider
        .request_raw(&texture, move |view: RawView<'_>| s.send(view.is_empty()))
        .unwrap();
    assert!(test_executors::sleep_on(r));
    wait_idle(&provider);
    test_executors::sleep_on(provider.dispose());
}

#[test]
fn drop_releases_native_object() {
    let _serial = setup();
    let engine = SoftwareEngine::new().unwrap();
    let releases = RELEASES.load(Ordering::SeqCst);
    let provider = Provider::new(Backend::JniBridge, &engine, config(1, 1)).unwrap();
    drop(provider);
    assert_eq!(RELEASES.load(Ordering::SeqCst), releases + 1);
    assert_eq!(engine.live_staging(), 0);
}
