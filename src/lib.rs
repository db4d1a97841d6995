// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! pixel_readback copies GPU textures into CPU memory and hands the bytes to your code,
without you having to care which platform mechanism did the copy.

Here is a quick chart of the strategies:

| Backend                          | Blocks caller | Extra copy | Needs                                          |
|----------------------------------|---------------|------------|------------------------------------------------|
| [`Backend::AsyncCopy`]           | no            | engine's   | an engine with an asynchronous copy primitive  |
| [`Backend::Blocking`]            | yes           | yes        | nothing; always available                      |
| [`Backend::JniBridge`]           | no            | no         | a JNI-style native library, registered at runtime |
| [`Backend::NativeApi`]           | no            | no         | a native graphics-API library, registered, loaded, or linked |

You pick one, build a [`Provider`] from it, and issue requests.  Each request's handler
runs exactly once with a view of the pixels.  The view borrows memory somebody else owns,
so it only lives as long as the handler call:

```
# fn main() -> Result<(), pixel_readback::Error> {
use pixel_readback::{Backend, Provider, ProviderConfig, Readback};
use pixel_readback::engine::software::{SoftwareEngine, SoftwareTexture};
use pixel_readback::view::Rgba8;

let engine = SoftwareEngine::new()?;
let provider = Provider::new(Backend::AsyncCopy, &engine, ProviderConfig::new(2, 2))?;
let texture = SoftwareTexture::solid(2, 2, Rgba8::RED);

let (sender, pixels) = r#continue::continuation();
provider.request::<Rgba8, _>(&texture, move |view| {
    sender.send(view.to_vec());
})?;
assert_eq!(test_executors::sleep_on(pixels), vec![Rgba8::RED; 4]);
test_executors::sleep_on(provider.dispose());
# Ok(())
# }
```

# Engines

Providers never render or own textures.  Whatever they need from the host engine (a
graphics command stream, staging images, blits, native handles) goes through the
[`engine::Engine`] trait.  [`engine::software::SoftwareEngine`] keeps pixels in CPU memory
and is always available; `engine::wgpu::WgpuEngine` (feature `backend_wgpu`, on by
default) drives a real GPU.

# Native bridges

Bridge providers hand work to an external library over a C ABI and get called back on
the library's threads.  The handler never crosses that boundary.  It stays in a
process-wide [`registry::HandleRegistry`], and only an opaque [`registry::Token`] travels.
A token that is null or doesn't resolve when the library calls back aborts the process,
since continuing would mean invoking a handler that belongs to someone else.

# Logging

Everything logs through [logwise](https://sealedabstract.com/code/logwise).  Blocking
readbacks are reported as performance warnings.
*/

mod bittricks;
pub mod dispatch;
pub mod engine;
mod error;
pub mod readback;
pub mod registry;
pub mod view;

pub use error::{Error, Misuse};
pub use readback::{Backend, Phase, Provider, ProviderConfig, RawHandler, Readback};
pub use view::{BufferView, Element, RawView, Rgba8};
