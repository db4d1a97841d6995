// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
GPU implementation of [`Engine`] on wgpu.

Staging images are `Rgba8Unorm` textures.  Readback copies them into a `MAP_READ`
buffer whose rows are padded to [`wgpu::COPY_BYTES_PER_ROW_ALIGNMENT`]; the padding is
stripped before bytes reach a handler.

Buffer mapping only completes when the device is polled.  A dedicated poll thread does
that whenever work is submitted.  Map callbacks run on the poll thread, so they only hop
to the graphics thread, where the mapped range is read.

wgpu exposes no native texture names or graphics contexts, so this engine offers the
async copy and blocking backends only.
*/

use crate::Error;
use crate::dispatch::{Dispatcher, GraphicsThread};
use crate::engine::{Capabilities, CopyCompletion, Engine, NativeContext, NativeHandle};
use crate::readback::Backend;
use crate::view::Rgba8;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use wgpu::{
    BufferAsyncError, Extent3d, MapMode, Origin3d, PollType, TexelCopyBufferInfo,
    TexelCopyBufferLayout, TexelCopyTextureInfo, TextureAspect, TextureFormat, TextureUsages,
};

const STAGING_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

pub struct WgpuEngine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    dispatcher: Dispatcher,
    poll_trigger: Option<Sender<()>>,
    poll_thread: Option<JoinHandle<()>>,
}

impl WgpuEngine {
    /// Opens the default adapter.
    pub async fn new() -> Result<Arc<Self>, Error> {
        let descriptor = wgpu::InstanceDescriptor::from_env_or_default();
        let instance = wgpu::Instance::new(&descriptor);
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .map_err(|_| Error::NoSuchAdapter)?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("pixel_readback"),
                ..Default::default()
            })
            .await?;
        Self::from_device(device, queue)
    }

    /// Wraps a device the host engine already owns.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Result<Arc<Self>, Error> {
        let poll_device = device.clone();
        let (poll_trigger, poll_receiver): (Sender<()>, Receiver<()>) = mpsc::channel();
        let poll_thread = thread::Builder::new()
            .name("wgpu_poll".to_string())
            .spawn(move || {
                //channel closes when the engine drops
                while poll_receiver.recv().is_ok() {
                    if let Err(e) = poll_device.poll(PollType::Wait) {
                        logwise::warn_sync!("wgpu poll failed: {e}", e = logwise::privacy::LogIt(&e));
                    }
                }
            })?;
        let stream = GraphicsThread::spawn("wgpu graphics")?;
        Ok(Arc::new(WgpuEngine {
            device,
            queue,
            dispatcher: Dispatcher::new(Arc::new(stream)),
            poll_trigger: Some(poll_trigger),
            poll_thread: Some(poll_thread),
        }))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Uploads `pixels` (row-major, `width * height` of them) into a new readable texture.
    pub fn create_texture(&self, width: u32, height: u32, pixels: &[Rgba8]) -> wgpu::Texture {
        assert_eq!(pixels.len(), width as usize * height as usize, "pixel count");
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("pixel_readback source"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: STAGING_FORMAT,
            usage: TextureUsages::COPY_SRC | TextureUsages::COPY_DST | TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let bytes: Vec<u8> = pixels.iter().flat_map(|p| [p.r, p.g, p.b, p.a]).collect();
        self.write_region(&texture, width, height, &bytes);
        texture
    }

    fn write_region(&self, texture: &wgpu::Texture, width: u32, height: u32, bytes: &[u8]) {
        self.queue.write_texture(
            texel_copy(texture),
            bytes,
            TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * Rgba8::BYTES_PER_PIXEL as u32),
                rows_per_image: Some(height),
            },
            extent(width, height),
        );
    }

    fn set_needs_poll(&self) {
        if let Some(trigger) = &self.poll_trigger {
            let _ = trigger.send(());
        }
    }

    /// Copies the top-left region of `texture` into a fresh mappable buffer and submits.
    fn submit_copy(&self, texture: &wgpu::Texture, width: u32, height: u32) -> Result<Readout, Error> {
        if texture.width() < width || texture.height() < height {
            return Err(Error::CopyFailed(format!(
                "{}x{} texture is smaller than the {width}x{height} region",
                texture.width(),
                texture.height()
            )));
        }
        check_readable(texture)?;
        let padded_row = aligned_bytes_per_row(width);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pixel_readback readout"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("pixel_readback readout"),
            });
        encoder.copy_texture_to_buffer(
            texel_copy(texture),
            TexelCopyBufferInfo {
                buffer: &buffer,
                layout: TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            extent(width, height),
        );
        self.queue.submit(Some(encoder.finish()));
        Ok(Readout {
            buffer,
            width,
            height,
            padded_row,
        })
    }
}

/// A submitted copy waiting to be mapped.
struct Readout {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row: u32,
}

impl Readout {
    /// Packs the mapped rows into `destination`.  The buffer must be mapped.
    fn unpack_into(&self, destination: &mut [u8]) {
        let row = self.width as usize * Rgba8::BYTES_PER_PIXEL;
        let mapped = self.buffer.slice(..).get_mapped_range();
        for (y, chunk) in destination.chunks_exact_mut(row).enumerate() {
            let start = y * self.padded_row as usize;
            chunk.copy_from_slice(&mapped[start..start + row]);
        }
        drop(mapped);
        self.buffer.unmap();
    }

    fn packed_len(&self) -> usize {
        self.width as usize * self.height as usize * Rgba8::BYTES_PER_PIXEL
    }
}

fn map_failed(e: BufferAsyncError) -> Error {
    Error::CopyFailed(format!("can't map readout buffer: {e}"))
}

fn aligned_bytes_per_row(width: u32) -> u32 {
    let unaligned = width * Rgba8::BYTES_PER_PIXEL as u32;
    unaligned.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
}

fn extent(width: u32, height: u32) -> Extent3d {
    Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

fn texel_copy(texture: &wgpu::Texture) -> TexelCopyTextureInfo<'_> {
    TexelCopyTextureInfo {
        texture,
        mip_level: 0,
        origin: Origin3d::ZERO,
        aspect: TextureAspect::All,
    }
}

fn check_readable(texture: &wgpu::Texture) -> Result<(), Error> {
    if texture.format().remove_srgb_suffix() != STAGING_FORMAT {
        return Err(Error::CopyFailed(format!(
            "texture format {:?} is not RGBA8",
            texture.format()
        )));
    }
    if !texture.usage().contains(TextureUsages::COPY_SRC) {
        return Err(Error::CopyFailed("texture lacks COPY_SRC usage".to_string()));
    }
    Ok(())
}

/// A staging image on the GPU.
#[derive(Debug)]
pub struct WgpuStaging {
    texture: wgpu::Texture,
}

impl WgpuStaging {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }
}

impl Engine for WgpuEngine {
    type Texture = wgpu::Texture;
    type Staging = WgpuStaging;

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            async_copy: true,
            jni_bridge: false,
            native_bridge: false,
        }
    }

    fn create_staging(&self, width: u32, height: u32) -> Result<WgpuStaging, Error> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("pixel_readback staging"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: STAGING_FORMAT,
            usage: TextureUsages::COPY_SRC | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        Ok(WgpuStaging { texture })
    }

    fn release_staging(&self, staging: WgpuStaging) {
        staging.texture.destroy();
    }

    fn blit(&self, source: &wgpu::Texture, destination: &WgpuStaging) -> Result<(), Error> {
        check_readable(source)?;
        let staging = &destination.texture;
        let width = source.width().min(staging.width());
        let height = source.height().min(staging.height());
        if width < staging.width() || height < staging.height() {
            let zeros = vec![0u8; staging.width() as usize * staging.height() as usize * Rgba8::BYTES_PER_PIXEL];
            self.write_region(staging, staging.width(), staging.height(), &zeros);
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("pixel_readback blit"),
            });
        encoder.copy_texture_to_texture(texel_copy(source), texel_copy(staging), extent(width, height));
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_staging(&self, source: &WgpuStaging, destination: &mut [u8]) -> Result<(), Error> {
        let readout = self.submit_copy(&source.texture, source.texture.width(), source.texture.height())?;
        if destination.len() != readout.packed_len() {
            return Err(Error::CopyFailed(format!(
                "destination holds {} bytes, staging image holds {}",
                destination.len(),
                readout.packed_len()
            )));
        }
        let (s, r) = r#continue::continuation();
        readout
            .buffer
            .slice(..)
            .map_async(MapMode::Read, move |result| s.send(result));
        self.set_needs_poll();
        test_executors::sleep_on(r).map_err(map_failed)?;
        readout.unpack_into(destination);
        Ok(())
    }

    fn request_async_copy(
        &self,
        source: &wgpu::Texture,
        width: u32,
        height: u32,
        completion: CopyCompletion,
    ) {
        let readout = match self.submit_copy(source, width, height) {
            Ok(readout) => readout,
            Err(e) => {
                self.dispatcher.run(move || completion(Err(e)));
                return;
            }
        };
        let dispatcher = self.dispatcher.clone();
        let map_buffer = readout.buffer.clone();
        map_buffer.slice(..).map_async(MapMode::Read, move |result| {
            //on the poll thread; read the mapping elsewhere
            dispatcher.run(move || match result {
                Ok(()) => {
                    let mut bytes = vec![0u8; readout.packed_len()];
                    readout.unpack_into(&mut bytes);
                    completion(Ok(bytes.as_slice()));
                }
                Err(e) => completion(Err(map_failed(e))),
            });
        });
        self.set_needs_poll();
    }

    fn native_texture_handle(&self, _staging: &WgpuStaging) -> Result<NativeHandle, Error> {
        Err(Error::UnsupportedBackend(Backend::NativeApi))
    }

    fn native_context(&self) -> Result<NativeContext, Error> {
        Err(Error::UnsupportedBackend(Backend::JniBridge))
    }
}

impl Debug for WgpuEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuEngine")
            .field("device", &self.device)
            .finish()
    }
}

impl Drop for WgpuEngine {
    fn drop(&mut self) {
        drop(self.poll_trigger.take());
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }
}
