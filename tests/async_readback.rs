// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use pixel_readback::engine::{Capabilities, Engine};
use pixel_readback::engine::software::{SoftwareEngine, SoftwareTexture};
use pixel_readback::{
    Backend, BufferView, Error, Misuse, Phase, Provider, ProviderConfig, RawView, Readback, Rgba8,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use test_executors::async_test;

#[async_test]
async fn delivers_pixels_once() {
    let engine = SoftwareEngine::new().unwrap();
    let provider = Provider::new(Backend::AsyncCopy, &engine, ProviderConfig::new(2, 2)).unwrap();
    assert_eq!(provider.backend(), Backend::AsyncCopy);
    let texture = SoftwareTexture::from_fn(2, 2, |x, y| Rgba8::new(10 * x as u8, 10 * y as u8, 1, 255));

    let calls = Arc::new(AtomicUsize::new(0));
    let move_calls = calls.clone();
    let (s, r) = r#continue::continuation();
    provider
        .request::<Rgba8, _>(&texture, move |view: BufferView<'_, Rgba8>| {
            move_calls.fetch_add(1, Ordering::SeqCst);
            s.send(view.to_vec());
        })
        .unwrap();
    let pixels = r.await;
    assert_eq!(
        pixels,
        [
            Rgba8::new(0, 0, 1, 255),
            Rgba8::new(10, 0, 1, 255),
            Rgba8::new(0, 10, 1, 255),
            Rgba8::new(10, 10, 1, 255),
        ]
    );
    //the engine's stream drains in order, so a later no-op proves nothing else arrived
    engine.dispatcher().run_blocking(|| ());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    provider.dispose().await;
}

#[async_test]
async fn sequential_requests_each_complete() {
    let engine = SoftwareEngine::new().unwrap();
    let provider = Provider::new(Backend::AsyncCopy, &engine, ProviderConfig::new(1, 1)).unwrap();
    let texture = SoftwareTexture::solid(1, 1, Rgba8::RED);
    for value in 0..5u8 {
        texture.write(0, 0, Rgba8::new(value, 0, 0, 255));
        let (s, r) = r#continue::continuation();
        provider
            .request_raw(&texture, move |view: RawView<'_>| s.send(view.as_bytes().to_vec()))
            .unwrap();
        assert_eq!(r.await, [value, 0, 0, 255]);
        //completion finishes the request after the handler returns
        engine.dispatcher().run_blocking(|| ());
        assert_eq!(provider.phase(), Phase::Idle);
    }
    provider.dispose().await;
}

#[async_test]
async fn overlapping_request_is_rejected() {
    let engine = SoftwareEngine::new().unwrap();
    let provider = Provider::new(Backend::AsyncCopy, &engine, ProviderConfig::new(1, 1)).unwrap();
    let texture = SoftwareTexture::solid(1, 1, Rgba8::RED);

    //park the graphics thread so the first copy can't finish yet
    let (release, parked) = r#continue::continuation::<()>();
    engine.dispatcher().run(move || test_executors::sleep_on(parked));

    let (s, r) = r#continue::continuation();
    provider
        .request_raw(&texture, move |view: RawView<'_>| s.send(view.byte_len()))
        .unwrap();
    let second = provider.request_raw(&texture, |_view: RawView<'_>| {
        panic!("rejected handler must not run");
    });
    assert!(matches!(
        second,
        Err(Error::ResourceMisuse(Misuse::OverlappingRequest))
    ));
    release.send(());
    assert_eq!(r.await, 4);
    provider.dispose().await;
}

#[async_test]
async fn failed_copy_delivers_empty_view() {
    let engine = SoftwareEngine::new().unwrap();
    let provider = Provider::new(Backend::AsyncCopy, &engine, ProviderConfig::new(4, 4)).unwrap();
    //smaller than the configured output, so the engine's copy fails
    let texture = SoftwareTexture::solid(2, 2, Rgba8::RED);
    let (s, r) = r#continue::continuation();
    provider
        .request_raw(&texture, move |view: RawView<'_>| s.send(view.is_empty()))
        .unwrap();
    assert!(r.await);
    provider.dispose().await;
}

#[test]
fn missing_capability_is_unsupported() {
    let engine = SoftwareEngine::with_capabilities(Capabilities::blocking_only()).unwrap();
    let result = Provider::new(Backend::AsyncCopy, &engine, ProviderConfig::new(2, 2));
    assert!(matches!(
        result,
        Err(Error::UnsupportedBackend(Backend::AsyncCopy))
    ));
    //no fallback: blocking still has to be asked for explicitly
    assert!(Provider::new(Backend::Blocking, &engine, ProviderConfig::new(2, 2)).is_ok());
}
