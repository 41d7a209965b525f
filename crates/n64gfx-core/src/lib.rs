//! Render-thread half of the N64 graphics HLE: pixel format conversion,
//! texture and combiner caches, color buffer read-back, the render command
//! protocol and the renderer that executes it.

pub mod backend;
pub mod cmd;
pub mod color_reader;
pub mod combiner;
pub mod format;
pub mod hash;
pub mod renderer;
pub mod stats;
pub mod texture_cache;

pub use backend::{
    create_backend, BackendCaps, BackendDesc, BackendError, BackendKind, Frame, FrameSink,
    GfxBackend, HeadlessBackend, RenderTargetFormat,
};
pub use cmd::{DecodeError, RenderCommand};
pub use color_reader::{ColorBufferReader, ReadColorBufferParams};
pub use combiner::{CombinerAccuracy, CombinerKey, CombinerProgramCache};
pub use format::{ConvertError, ConvertQuality, Palette, PaletteFormat, PixelFormat};
pub use hash::{ContentHasher, HashImpl};
pub use renderer::{Renderer, RendererConfig};
pub use stats::{GfxStats, GfxStatsSnapshot};
pub use texture_cache::{TextureCache, TextureCacheConfig, TextureError};
