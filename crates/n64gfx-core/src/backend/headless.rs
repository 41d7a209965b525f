use hashbrown::HashMap;
use tracing::{debug, trace};

use super::{
    BackendCaps, BackendDesc, BackendError, DrawCall, FillRect, Frame, GfxBackend, ProgramHandle,
    Readback, RenderTargetFormat, TextureHandle, Vertex,
};
use crate::color_reader::readback_to_rgba8;

/// Row pitch alignment of read-back copies (matches what GPU copy engines
/// require, so callers always have to honor the stride).
const READBACK_ROW_ALIGNMENT: usize = 256;

struct HeadlessTexture {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

struct HeadlessProgram {
    label: String,
}

/// What a single draw referenced, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub program: ProgramHandle,
    pub textures: [Option<TextureHandle>; 2],
    pub vertex_count: usize,
    pub uniform_bytes: usize,
    pub depth_compare: bool,
}

/// A backend that never touches a GPU.
///
/// Programs are parsed and validated with naga, textures and draws are
/// tracked in tables, and the render target is a CPU buffer that fills
/// write into.
pub struct HeadlessBackend {
    caps: BackendCaps,
    max_texture_dim: u32,
    textures: HashMap<TextureHandle, HeadlessTexture>,
    programs: HashMap<ProgramHandle, HeadlessProgram>,
    next_texture: u32,
    next_program: u32,
    format: RenderTargetFormat,
    width: u32,
    height: u32,
    target: Vec<u8>,
    draws: Vec<DrawRecord>,
    frames: u64,
}

impl HeadlessBackend {
    pub fn new(desc: &BackendDesc) -> Self {
        let len = desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel();
        Self {
            caps: desc.caps,
            max_texture_dim: desc.max_texture_dim,
            textures: HashMap::new(),
            programs: HashMap::new(),
            next_texture: 1,
            next_program: 1,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            target: vec![0; len],
            draws: Vec::new(),
            frames: 0,
        }
    }

    /// Draws issued since the last [`HeadlessBackend::take_draws`].
    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn take_draws(&mut self) -> Vec<DrawRecord> {
        std::mem::take(&mut self.draws)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn program_label(&self, handle: ProgramHandle) -> Option<&str> {
        self.programs.get(&handle).map(|p| p.label.as_str())
    }

    /// RGBA8888 contents of a live texture.
    pub fn texture_rgba(&self, handle: TextureHandle) -> Option<(u32, u32, &[u8])> {
        self.textures
            .get(&handle)
            .map(|t| (t.width, t.height, t.rgba.as_slice()))
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    /// Drop `caps`, as a driver losing a feature would.
    pub fn set_capabilities(&mut self, caps: BackendCaps) {
        self.caps = caps;
    }

    fn write_pixel(&mut self, x: usize, y: usize, color: [u8; 4]) {
        let bpp = self.format.bytes_per_pixel();
        let at = (y * self.width as usize + x) * bpp;
        let dst = &mut self.target[at..at + bpp];
        match self.format {
            RenderTargetFormat::Rgba8 => dst.copy_from_slice(&color),
            RenderTargetFormat::Rgba16f => {
                for (c, v) in dst.chunks_exact_mut(2).zip(color) {
                    c.copy_from_slice(&half::f16::from_f32(v as f32 / 255.0).to_le_bytes());
                }
            }
            RenderTargetFormat::Rgba32f => {
                for (c, v) in dst.chunks_exact_mut(4).zip(color) {
                    c.copy_from_slice(&(v as f32 / 255.0).to_le_bytes());
                }
            }
        }
    }
}

impl GfxBackend for HeadlessBackend {
    fn capabilities(&self) -> BackendCaps {
        self.caps
    }

    fn render_target_format(&self) -> RenderTargetFormat {
        self.format
    }

    fn upload_texture(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureHandle, BackendError> {
        let reject = |reason| BackendError::TextureRejected {
            width,
            height,
            reason,
        };
        if width == 0 || height == 0 {
            return Err(reject("empty texture"));
        }
        if width > self.max_texture_dim || height > self.max_texture_dim {
            return Err(reject("exceeds maximum texture dimension"));
        }
        if rgba.len() != width as usize * height as usize * 4 {
            return Err(reject("data length does not match dimensions"));
        }

        let handle = TextureHandle(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(
            handle,
            HeadlessTexture {
                width,
                height,
                rgba: rgba.to_vec(),
            },
        );
        trace!(?handle, width, height, "uploaded texture");
        Ok(handle)
    }

    fn release_texture(&mut self, handle: TextureHandle) {
        if self.textures.remove(&handle).is_none() {
            debug!(?handle, "release of unknown texture");
        }
    }

    fn compile_program(&mut self, label: &str, wgsl: &str) -> Result<ProgramHandle, BackendError> {
        let compile_error = |message: String| BackendError::Compile {
            label: label.to_owned(),
            message,
        };
        let module = naga::front::wgsl::parse_str(wgsl)
            .map_err(|err| compile_error(err.emit_to_string(wgsl)))?;
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::empty(),
        );
        validator
            .validate(&module)
            .map_err(|err| compile_error(format!("{err:?}")))?;

        for (stage, name) in [
            (naga::ShaderStage::Vertex, "vs_main"),
            (naga::ShaderStage::Fragment, "fs_main"),
        ] {
            if !module
                .entry_points
                .iter()
                .any(|ep| ep.stage == stage && ep.name == name)
            {
                return Err(compile_error(format!("missing entry point `{name}`")));
            }
        }

        let handle = ProgramHandle(self.next_program);
        self.next_program += 1;
        self.programs.insert(
            handle,
            HeadlessProgram {
                label: label.to_owned(),
            },
        );
        Ok(handle)
    }

    fn release_program(&mut self, handle: ProgramHandle) {
        if self.programs.remove(&handle).is_none() {
            debug!(?handle, "release of unknown program");
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError> {
        if !self.programs.contains_key(&call.program) {
            return Err(BackendError::UnknownProgram(call.program));
        }
        for tex in call.textures.iter().flatten() {
            if !self.textures.contains_key(tex) {
                return Err(BackendError::UnknownTexture(*tex));
            }
        }
        let vertex_bytes: &[u8] = bytemuck::cast_slice(call.vertices);
        debug_assert_eq!(vertex_bytes.len(), call.vertices.len() * Vertex::SIZE);
        self.draws.push(DrawRecord {
            program: call.program,
            textures: call.textures,
            vertex_count: call.vertices.len(),
            uniform_bytes: call.uniforms.len(),
            depth_compare: call.depth_compare,
        });
        Ok(())
    }

    fn fill_rect(&mut self, rect: &FillRect) {
        let x1 = (rect.x1 as u32).min(self.width) as usize;
        let y1 = (rect.y1 as u32).min(self.height) as usize;
        for y in rect.y0 as usize..y1 {
            for x in rect.x0 as usize..x1 {
                self.write_pixel(x, y, rect.color);
            }
        }
    }

    fn read_pixels(&mut self, x: u32, y: u32, width: u32, height: u32) -> Option<Readback> {
        if !self.caps.contains(BackendCaps::READBACK) {
            return None;
        }
        if x.checked_add(width)? > self.width || y.checked_add(height)? > self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let row_len = width as usize * bpp;
        let stride = row_len.div_ceil(READBACK_ROW_ALIGNMENT).max(1) * READBACK_ROW_ALIGNMENT;
        let mut data = vec![0u8; stride * height as usize];
        let src_pitch = self.width as usize * bpp;
        for row in 0..height as usize {
            let src = (y as usize + row) * src_pitch + x as usize * bpp;
            data[row * stride..row * stride + row_len]
                .copy_from_slice(&self.target[src..src + row_len]);
        }
        Some(Readback {
            format: self.format,
            width,
            height,
            stride,
            data,
        })
    }

    fn present(&mut self) -> Option<Frame> {
        let readback = Readback {
            format: self.format,
            width: self.width,
            height: self.height,
            stride: self.width as usize * self.format.bytes_per_pixel(),
            data: self.target.clone(),
        };
        let pixels = readback_to_rgba8(&readback)?;
        self.frames += 1;
        Some(Frame {
            width: self.width,
            height: self.height,
            stride: self.width as usize * 4,
            pixels,
        })
    }
}
