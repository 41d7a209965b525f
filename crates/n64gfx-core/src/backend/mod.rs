//! The GPU-facing seam of the renderer.
//!
//! Everything the render thread needs from a graphics API goes through
//! [`GfxBackend`]. The concrete implementation is picked once at session
//! start from [`BackendKind`].

mod headless;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use headless::{DrawRecord, HeadlessBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u32);

bitflags::bitflags! {
    /// Optional features a backend may expose. Generated programs depend on
    /// these, so losing one invalidates the combiner program cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BackendCaps: u32 {
        /// `dpdx`/`dpdy` are usable in fragment shaders.
        const SHADER_DERIVATIVES = 1 << 0;
        const FLOAT_RENDER_TARGET = 1 << 1;
        /// Render target contents can be copied back to the CPU.
        const READBACK = 1 << 2;
    }
}

/// Pixel storage of the active render target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderTargetFormat {
    #[default]
    Rgba8,
    Rgba16f,
    Rgba32f,
}

impl RenderTargetFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            RenderTargetFormat::Rgba8 => 4,
            RenderTargetFormat::Rgba16f => 8,
            RenderTargetFormat::Rgba32f => 16,
        }
    }

    pub fn is_float(self) -> bool {
        !matches!(self, RenderTargetFormat::Rgba8)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// CPU-side backend: validates shaders, tracks resources and keeps a
    /// software render target for fills and read-back.
    #[default]
    Headless,
}

#[derive(Debug, Clone, Copy)]
pub struct BackendDesc {
    pub width: u32,
    pub height: u32,
    pub format: RenderTargetFormat,
    pub caps: BackendCaps,
    pub max_texture_dim: u32,
}

impl Default for BackendDesc {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            format: RenderTargetFormat::Rgba8,
            caps: BackendCaps::all(),
            max_texture_dim: 4096,
        }
    }
}

pub fn create_backend(kind: BackendKind, desc: &BackendDesc) -> Box<dyn GfxBackend> {
    match kind {
        BackendKind::Headless => Box::new(HeadlessBackend::new(desc)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("texture {width}x{height} rejected: {reason}")]
    TextureRejected {
        width: u32,
        height: u32,
        reason: &'static str,
    },

    #[error("program `{label}` failed to compile: {message}")]
    Compile { label: String, message: String },

    #[error("unknown program {0:?}")]
    UnknownProgram(ProgramHandle),

    #[error("unknown texture {0:?}")]
    UnknownTexture(TextureHandle),
}

/// Vertex layout shared by every combiner program.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Clip-space position.
    pub position: [f32; 4],
    /// Shade color, 0..=1.
    pub color: [f32; 4],
    /// Normalized texture coordinates.
    pub uv: [f32; 2],
}

impl Vertex {
    pub const SIZE: usize = std::mem::size_of::<Vertex>();
}

/// An axis-aligned fill in render-target pixels; `x1`/`y1` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillRect {
    pub x0: u16,
    pub y0: u16,
    pub x1: u16,
    pub y1: u16,
    pub color: [u8; 4],
}

pub struct DrawCall<'a> {
    pub program: ProgramHandle,
    pub textures: [Option<TextureHandle>; 2],
    pub uniforms: &'a [u8],
    pub vertices: &'a [Vertex],
    pub depth_compare: bool,
}

/// Raw render target bytes as the backend stores them.
#[derive(Debug, Clone, PartialEq)]
pub struct Readback {
    pub format: RenderTargetFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes between the starts of consecutive rows; may exceed
    /// `width * format.bytes_per_pixel()`.
    pub stride: usize,
    pub data: Vec<u8>,
}

/// A completed frame in RGBA8888.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub pixels: Vec<u8>,
}

/// Host-side receiver of completed frames. Runs on the render thread.
pub trait FrameSink: Send {
    fn frame_ready(&mut self, frame: Frame);
}

impl<F: FnMut(Frame) + Send> FrameSink for F {
    fn frame_ready(&mut self, frame: Frame) {
        self(frame)
    }
}

pub trait GfxBackend: Send {
    fn capabilities(&self) -> BackendCaps;

    fn render_target_format(&self) -> RenderTargetFormat;

    /// Upload an RGBA8888 image.
    fn upload_texture(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureHandle, BackendError>;

    fn release_texture(&mut self, handle: TextureHandle);

    fn compile_program(&mut self, label: &str, wgsl: &str) -> Result<ProgramHandle, BackendError>;

    fn release_program(&mut self, handle: ProgramHandle);

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError>;

    fn fill_rect(&mut self, rect: &FillRect);

    /// Copy a region of the render target. `None` when the backend cannot
    /// read back or the region is outside the target.
    fn read_pixels(&mut self, x: u32, y: u32, width: u32, height: u32) -> Option<Readback>;

    fn present(&mut self) -> Option<Frame>;
}

impl<B: GfxBackend + ?Sized> GfxBackend for Box<B> {
    fn capabilities(&self) -> BackendCaps {
        (**self).capabilities()
    }

    fn render_target_format(&self) -> RenderTargetFormat {
        (**self).render_target_format()
    }

    fn upload_texture(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureHandle, BackendError> {
        (**self).upload_texture(width, height, rgba)
    }

    fn release_texture(&mut self, handle: TextureHandle) {
        (**self).release_texture(handle)
    }

    fn compile_program(&mut self, label: &str, wgsl: &str) -> Result<ProgramHandle, BackendError> {
        (**self).compile_program(label, wgsl)
    }

    fn release_program(&mut self, handle: ProgramHandle) {
        (**self).release_program(handle)
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError> {
        (**self).draw(call)
    }

    fn fill_rect(&mut self, rect: &FillRect) {
        (**self).fill_rect(rect)
    }

    fn read_pixels(&mut self, x: u32, y: u32, width: u32, height: u32) -> Option<Readback> {
        (**self).read_pixels(x, y, width, height)
    }

    fn present(&mut self) -> Option<Frame> {
        (**self).present()
    }
}
