//! The render thread: consumes [`RenderCommand`]s in submission order and
//! turns them into backend work.

use std::sync::Arc;

use n64gfx_ring::RingBufferPool;
use tracing::{debug, trace, warn};

use crate::backend::{DrawCall, FrameSink, GfxBackend, Vertex};
use crate::cmd::{ColorCapture, ColorState, RenderCommand, TextureLoad, TexturedRect};
use crate::color_reader::ColorBufferReader;
use crate::combiner::{
    rgba_to_f32, CombinerAccuracy, CombinerFlags, CombinerKey, CombinerProgramCache,
    CombinerUniforms,
};
use crate::format::{ConvertQuality, PixelFormat};
use crate::stats::GfxStats;
use crate::texture_cache::{
    TextureCache, TextureCacheConfig, TextureError, TextureKey, TextureSource,
};

/// `G_SETOTHERMODE_L` depth compare enable.
const OTHERMODE_Z_CMP: u32 = 0x10;

#[derive(Debug, Clone, Copy)]
pub struct RendererConfig {
    pub texture_cache: TextureCacheConfig,
    pub combiner_accuracy: CombinerAccuracy,
    /// Narrowing used for 16-bit color buffer reads.
    pub read_quality: ConvertQuality,
    /// Console screen size; rectangle commands are in these pixels.
    pub screen_width: u32,
    pub screen_height: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            texture_cache: TextureCacheConfig::default(),
            combiner_accuracy: CombinerAccuracy::default(),
            read_quality: ConvertQuality::default(),
            screen_width: 320,
            screen_height: 240,
        }
    }
}

pub struct Renderer<B: GfxBackend> {
    backend: B,
    textures: TextureCache,
    combiners: CombinerProgramCache,
    color_reader: ColorBufferReader,
    frame_sink: Box<dyn FrameSink>,
    stats: Arc<GfxStats>,

    key: CombinerKey,
    othermode_l: u32,
    uniforms: CombinerUniforms,
    /// Texture bound to each unit, looked up again at draw time so an
    /// evicted entry degrades to an untextured draw.
    bound: [Option<TextureKey>; 2],
    screen: (f32, f32),
    scratch: Vec<u8>,
}

impl<B: GfxBackend> Renderer<B> {
    pub fn new(
        backend: B,
        config: &RendererConfig,
        frame_sink: Box<dyn FrameSink>,
        stats: Arc<GfxStats>,
    ) -> Result<Self, TextureError> {
        let caps = backend.capabilities();
        Ok(Self {
            textures: TextureCache::new(config.texture_cache)?,
            combiners: CombinerProgramCache::new(config.combiner_accuracy, caps),
            color_reader: ColorBufferReader::new(config.read_quality),
            backend,
            frame_sink,
            stats,
            key: CombinerKey::new(0, CombinerFlags::empty()),
            othermode_l: 0,
            uniforms: CombinerUniforms::default(),
            bound: [None; 2],
            screen: (
                config.screen_width.max(1) as f32,
                config.screen_height.max(1) as f32,
            ),
            scratch: Vec::new(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn texture_cache(&self) -> &TextureCache {
        &self.textures
    }

    pub fn combiner_cache(&self) -> &CombinerProgramCache {
        &self.combiners
    }

    /// Consume commands from `pool` until it is closed and drained.
    ///
    /// Each claim is released only after its command has executed, so a
    /// producer waiting for an idle pool knows the work is done.
    pub fn run(&mut self, pool: &RingBufferPool) {
        while let Some(ptr) = pool.next() {
            match pool.read_into(&ptr, &mut self.scratch) {
                Ok(()) => match RenderCommand::decode(&self.scratch) {
                    Ok(cmd) => self.execute(&cmd),
                    Err(err) => {
                        self.stats.inc_decode_errors();
                        warn!(%err, "dropping malformed render command");
                    }
                },
                Err(err) => warn!(%err, "failed to read render command"),
            }
            if let Err(err) = pool.release(ptr) {
                warn!(%err, "failed to release render command");
            }
        }
        debug!("render command pool closed");
    }

    pub fn execute(&mut self, cmd: &RenderCommand) {
        trace!(opcode = %cmd.opcode(), "render command");
        match cmd {
            RenderCommand::SetCombine { mux, flags } => {
                self.key = CombinerKey::new(*mux, *flags);
            }
            RenderCommand::SetOtherModes { l, .. } => self.othermode_l = *l,
            RenderCommand::SetColors(colors) => self.uniforms = uniforms_for(colors),
            RenderCommand::LoadTexture(load) => self.load_texture(load),
            RenderCommand::InvalidateRange { address, len } => {
                let start = *address as u64;
                let dropped = self
                    .textures
                    .invalidate(start..start + *len as u64, &mut self.backend);
                if dropped > 0 {
                    debug!(address, len, dropped, "textures invalidated by RAM write");
                }
            }
            RenderCommand::CaptureColorBuffer(capture) => self.capture(capture),
            RenderCommand::DrawTriangles(vertices) => self.draw(vertices),
            RenderCommand::DrawRects(rects) => {
                let vertices: Vec<Vertex> = rects
                    .iter()
                    .flat_map(|r| rect_vertices(r, self.screen))
                    .collect();
                self.draw(&vertices);
            }
            RenderCommand::FillRects(rects) => {
                for rect in rects {
                    self.backend.fill_rect(rect);
                    self.stats.inc_draws();
                }
            }
            RenderCommand::EndFrame => self.end_frame(),
        }
    }

    fn load_texture(&mut self, load: &TextureLoad) {
        let source = TextureSource {
            address: load.address,
            source_len: load.source_len,
            format: load.format,
            width: load.width,
            height: load.height,
            bytes: &load.bytes,
            palette: load.palette.as_ref(),
        };
        self.bound[load.slot as usize & 1] = self.fetch(&source);
    }

    fn capture(&mut self, capture: &ColorCapture) {
        self.stats.inc_color_reads();
        let slot = capture.slot as usize & 1;
        let Some(bytes) = self
            .color_reader
            .read_pixels(&mut self.backend, &capture.params)
        else {
            debug!(address = capture.address, "no color buffer data; effect skipped");
            self.bound[slot] = None;
            return;
        };
        let format = match capture.params.bit_depth {
            16 => PixelFormat::Rgba5551,
            _ => PixelFormat::Rgba8888,
        };
        let source = TextureSource {
            address: capture.address,
            source_len: bytes.len() as u32,
            format,
            width: capture.params.width,
            height: capture.params.height,
            bytes: &bytes,
            palette: None,
        };
        self.bound[slot] = self.fetch(&source);
    }

    fn fetch(&mut self, source: &TextureSource<'_>) -> Option<TextureKey> {
        match self.textures.fetch(source, &mut self.backend) {
            Ok(fetch) => {
                if fetch.hit {
                    self.stats.inc_texture_hits();
                } else {
                    self.stats.inc_texture_misses();
                }
                Some(fetch.key)
            }
            Err(_) => {
                // Already logged by the cache; draw untextured.
                self.stats.inc_texture_failures();
                None
            }
        }
    }

    fn draw(&mut self, vertices: &[Vertex]) {
        if vertices.is_empty() {
            return;
        }
        let before = self.combiners.stats();
        let program = self.combiners.build_for_key(self.key, &mut self.backend);
        let after = self.combiners.stats();
        if after.misses > before.misses {
            self.stats.inc_combiner_builds();
        }
        if after.fallbacks > before.fallbacks {
            self.stats.inc_combiner_fallbacks();
        }

        let Some(handle) = program.handle else {
            self.stats.inc_skipped_draws();
            return;
        };
        let textures = if self.key.flags.contains(CombinerFlags::TEXTURE_PRESENT) {
            self.bound
                .map(|key| key.and_then(|k| self.textures.get(&k)).map(|t| t.handle))
        } else {
            [None; 2]
        };
        let call = DrawCall {
            program: handle,
            textures,
            uniforms: self.uniforms.as_bytes(),
            vertices,
            depth_compare: self.othermode_l & OTHERMODE_Z_CMP != 0,
        };
        match self.backend.draw(&call) {
            Ok(()) => self.stats.inc_draws(),
            Err(err) => {
                self.stats.inc_skipped_draws();
                warn!(%err, "draw rejected by backend");
            }
        }
    }

    fn end_frame(&mut self) {
        // A driver may lose features between frames; programs built against
        // the old set are rebuilt lazily.
        self.combiners
            .set_capabilities(self.backend.capabilities());
        if let Some(frame) = self.backend.present() {
            self.frame_sink.frame_ready(frame);
        }
        self.stats.inc_frames();
    }
}

fn uniforms_for(c: &ColorState) -> CombinerUniforms {
    CombinerUniforms {
        prim_color: rgba_to_f32(c.prim),
        env_color: rgba_to_f32(c.env),
        fog_color: rgba_to_f32(c.fog),
        blend_color: rgba_to_f32(c.blend),
        key_center: rgba_to_f32(c.key_center),
        key_scale: rgba_to_f32(c.key_scale),
        params: [
            c.prim_lod_frac as f32 / 255.0,
            c.k4 as f32 / 255.0,
            c.k5 as f32 / 255.0,
            // Alpha compare threshold is the blend color's alpha.
            (c.blend & 0xFF) as f32 / 255.0,
        ],
    }
}

/// Two triangles covering `r`, mapped from console pixels to clip space.
fn rect_vertices(r: &TexturedRect, (w, h): (f32, f32)) -> [Vertex; 6] {
    let corner = |x: f32, y: f32, s: f32, t: f32| Vertex {
        position: [x / w * 2.0 - 1.0, 1.0 - y / h * 2.0, 0.0, 1.0],
        color: [1.0; 4],
        uv: [s, t],
    };
    let tl = corner(r.x0, r.y0, r.s0, r.t0);
    let tr = corner(r.x1, r.y0, r.s1, r.t0);
    let bl = corner(r.x0, r.y1, r.s0, r.t1);
    let br = corner(r.x1, r.y1, r.s1, r.t1);
    [tl, tr, bl, bl, tr, br]
}
