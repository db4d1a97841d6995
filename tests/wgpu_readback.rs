// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
#![cfg(feature = "backend_wgpu")]
//! Readback against a real GPU.  Skips quietly on machines without an adapter.

use pixel_readback::engine::wgpu::WgpuEngine;
use pixel_readback::{
    Backend, BufferView, Error, Provider, ProviderConfig, RawView, Readback, Rgba8,
};
use std::sync::Arc;

use test_executors::async_test;

async fn engine() -> Option<Arc<WgpuEngine>> {
    match WgpuEngine::new().await {
        Ok(engine) => Some(engine),
        Err(e) => {
            eprintln!("skipping: {e}");
            None
        }
    }
}

fn gradient(width: u32, height: u32) -> Vec<Rgba8> {
    (0..height)
        .flat_map(|y| (0..width).map(move |x| Rgba8::new(x as u8, y as u8, 200, 255)))
        .collect()
}

#[async_test]
async fn async_copy_strips_row_padding() {
    let Some(engine) = engine().await else { return };
    //5 pixels is 20 bytes a row, far from the 256-byte copy alignment
    let texture = engine.create_texture(5, 3, &gradient(5, 3));
    let provider = Provider::new(Backend::AsyncCopy, &engine, ProviderConfig::new(5, 3)).unwrap();
    let (s, r) = r#continue::continuation();
    provider
        .request::<Rgba8, _>(&texture, move |view: BufferView<'_, Rgba8>| s.send(view.to_vec()))
        .unwrap();
    assert_eq!(r.await, gradient(5, 3));
    provider.dispose().await;
}

#[async_test]
async fn blocking_reads_back_synchronously() {
    let Some(engine) = engine().await else { return };
    let texture = engine.create_texture(4, 2, &gradient(4, 2));
    let provider = Provider::new(Backend::Blocking, &engine, ProviderConfig::new(4, 2)).unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let move_seen = seen.clone();
    provider
        .request_raw(&texture, move |view: RawView<'_>| {
            move_seen.lock().unwrap().extend_from_slice(view.as_bytes());
        })
        .unwrap();
    let expected: Vec<u8> = gradient(4, 2)
        .iter()
        .flat_map(|p| [p.r, p.g, p.b, p.a])
        .collect();
    assert_eq!(*seen.lock().unwrap(), expected);
    provider.dispose().await;
}

#[async_test]
async fn bridges_are_unsupported() {
    let Some(engine) = engine().await else { return };
    let result = Provider::new(Backend::NativeApi, &engine, ProviderConfig::new(1, 1));
    assert!(matches!(
        result,
        Err(Error::UnsupportedBackend(Backend::NativeApi))
    ));
    let result = Provider::new(Backend::JniBridge, &engine, ProviderConfig::new(1, 1));
    assert!(matches!(
        result,
        Err(Error::UnsupportedBackend(Backend::JniBridge))
    ));
}
