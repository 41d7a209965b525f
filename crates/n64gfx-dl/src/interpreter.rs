//! The display list interpreter.
//!
//! Walks F3DEX2 display lists in console RAM, tracks RSP/RDP state, and
//! turns draws into [`RenderCommand`]s for a [`CommandSink`]. Consecutive
//! compatible geometry is batched; state commands close the batch. Before a
//! batch opens, whatever state the renderer has not seen yet is emitted.

use n64gfx_core::backend::{FillRect, Vertex};
use n64gfx_core::cmd::{
    ColorCapture, ColorState, RenderCommand, TextureLoad, TexturedRect, MAX_BATCH_FILLS,
    MAX_BATCH_RECTS, MAX_BATCH_VERTICES, TMEM_BYTES,
};
use n64gfx_core::color_reader::ReadColorBufferParams;
use n64gfx_core::combiner::{AlphaInput, ColorInput, CombinerFlags, CombinerKey};
use n64gfx_core::format::{Palette, PixelFormat, EXPAND_1, EXPAND_5};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::clip;
use crate::gbi::{self, field, GeometryMode};
use crate::memory::{RdramView, SegmentTable};
use crate::sink::{CommandSink, SinkError};
use crate::state::{
    self, set_bits, tlut_format, Image, Light, Lights, Matrices, SpVertex, TextureState, Tile,
    Tlut, TmemLoad, Viewport, VERTEX_BUFFER_LEN, VERTEX_STRIDE,
};

/// Call depth limit when the host does not configure one.
pub const DEFAULT_MAX_DEPTH: usize = 18;
/// Commands one `run` may execute before it is cut off.
pub const COMMAND_BUDGET: u64 = 1_000_000;

/// Color images remembered for frame-buffer effects.
const RECENT_COLOR_IMAGES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterConfig {
    pub max_depth: usize,
    pub command_budget: u64,
    /// Console screen size in pixels.
    pub screen_width: u32,
    pub screen_height: u32,
    /// Whether captured color buffers are read synchronously.
    pub synchronous_color_reads: bool,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            command_budget: COMMAND_BUDGET,
            screen_width: 320,
            screen_height: 240,
            synchronous_color_reads: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("display list call stack overflow at depth {depth} (call at {address:#010x})")]
    StackOverflow { depth: usize, address: u32 },

    #[error("render command sink failed: {0}")]
    Sink(#[source] SinkError),
}

/// How a [`Interpreter::run`] ended.
#[derive(Debug)]
pub enum ListOutcome {
    /// The top-level `G_ENDDL` was reached.
    Completed,
    /// The command budget ran out; the list is probably corrupt or looping.
    CommandBudgetExhausted,
    /// Interpretation of this list stopped early.
    Aborted(InterpreterError),
}

impl ListOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ListOutcome::Completed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterpreterStats {
    pub commands: u64,
    pub unknown_opcodes: u64,
    pub triangles: u64,
    /// Triangles rejected by the visibility or backface tests.
    pub dropped_triangles: u64,
    pub culled_lists: u64,
    pub stack_overflows: u64,
    pub batches: u64,
    pub sink_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchKind {
    Triangles,
    Rects,
    Fills,
}

/// What a batch was opened for; geometry with a different key starts a new
/// batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BatchKey {
    kind: BatchKind,
    textured: bool,
    tile: usize,
    copy: bool,
}

#[derive(Debug, Default)]
struct Batch {
    key: Option<BatchKey>,
    vertices: Vec<Vertex>,
    rects: Vec<TexturedRect>,
    fills: Vec<FillRect>,
}

/// Render state last handed to the sink.
#[derive(Debug, Default)]
struct Emitted {
    combine: Option<(u64, CombinerFlags)>,
    othermodes: Option<(u32, u32)>,
    colors: Option<ColorState>,
    tiles: [Option<usize>; 2],
}

enum Control {
    Continue,
    End,
}

pub struct Interpreter {
    config: InterpreterConfig,
    screen: (f32, f32),

    segments: SegmentTable,
    matrices: Matrices,
    viewport: Viewport,
    lights: Lights,
    vertices: [SpVertex; VERTEX_BUFFER_LEN],
    geometry: GeometryMode,
    texture: TextureState,

    othermode_h: u32,
    othermode_l: u32,
    combine_mux: u64,
    colors: ColorState,
    scissor: [u32; 4],
    texture_image: Image,
    color_image: Image,
    recent_color_images: Vec<Image>,
    depth_image: u32,
    tiles: [Tile; 8],
    tmem_loads: Vec<(u16, TmemLoad)>,
    tlut: Tlut,
    rdp_half_1: u32,

    batch: Batch,
    emitted: Emitted,
    texture_dirty: bool,
    pending_invalidations: Vec<(u32, u32)>,

    stats: InterpreterStats,
    warned: [u64; 4],
}

impl Interpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        let (w, h) = (config.screen_width.max(1), config.screen_height.max(1));
        Self {
            config,
            screen: (w as f32, h as f32),
            segments: SegmentTable::default(),
            matrices: Matrices::default(),
            viewport: Viewport::full(w, h),
            lights: Lights::default(),
            vertices: [SpVertex::default(); VERTEX_BUFFER_LEN],
            geometry: GeometryMode::empty(),
            texture: TextureState::default(),
            othermode_h: 0,
            othermode_l: 0,
            combine_mux: 0,
            colors: ColorState::default(),
            scissor: [0, 0, w << 2, h << 2],
            texture_image: Image::default(),
            color_image: Image::default(),
            recent_color_images: Vec::with_capacity(RECENT_COLOR_IMAGES),
            depth_image: 0,
            tiles: [Tile::default(); 8],
            tmem_loads: Vec::new(),
            tlut: Tlut::default(),
            rdp_half_1: 0,
            batch: Batch::default(),
            emitted: Emitted::default(),
            texture_dirty: true,
            pending_invalidations: Vec::new(),
            stats: InterpreterStats::default(),
            warned: [0; 4],
        }
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn stats(&self) -> InterpreterStats {
        self.stats
    }

    /// Return the counters accumulated since the last call and reset them.
    pub fn take_stats(&mut self) -> InterpreterStats {
        std::mem::take(&mut self.stats)
    }

    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    pub fn depth_image(&self) -> u32 {
        self.depth_image
    }

    /// The host rewrote `len` bytes of RAM at `address`. Textures sourced
    /// from there are invalidated before the next texture state change.
    pub fn notify_ram_write(&mut self, address: u32, len: u32) {
        if len > 0 {
            self.pending_invalidations.push((address, len));
        }
    }

    /// Run one display list starting at `address` (segmented or physical).
    ///
    /// The call stack lives only for this run, so an aborted list never
    /// affects the next one.
    pub fn run(
        &mut self,
        ram: &RdramView<'_>,
        address: u32,
        sink: &mut dyn CommandSink,
    ) -> ListOutcome {
        self.warned = [0; 4];
        let mut pc = ram.clamp(self.segments.resolve(address));
        let mut stack: Vec<u32> = Vec::with_capacity(self.config.max_depth);
        let mut executed = 0u64;

        let mut outcome = loop {
            if executed >= self.config.command_budget {
                warn!(
                    budget = self.config.command_budget,
                    address, "display list exceeded its command budget"
                );
                break ListOutcome::CommandBudgetExhausted;
            }
            executed += 1;

            let at = pc;
            let w0 = ram.read_u32(pc);
            let w1 = ram.read_u32(pc.wrapping_add(4));
            pc = ram.clamp(pc.wrapping_add(gbi::COMMAND_LEN));

            match self.execute(ram, at, w0, w1, &mut pc, &mut stack, sink) {
                Ok(Control::Continue) => {}
                Ok(Control::End) => break ListOutcome::Completed,
                Err(err) => break ListOutcome::Aborted(err),
            }
        };
        self.stats.commands += executed;

        if !matches!(outcome, ListOutcome::Aborted(InterpreterError::Sink(_))) {
            if let Err(err) = self.flush(sink) {
                outcome = ListOutcome::Aborted(err);
            }
        }
        outcome
    }

    /// Emit pending invalidations and the frame boundary.
    pub fn end_frame(&mut self, sink: &mut dyn CommandSink) -> Result<(), InterpreterError> {
        self.flush(sink)?;
        self.flush_invalidations(sink)?;
        self.recent_color_images.clear();
        self.emit(sink, &RenderCommand::EndFrame).map(drop)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &mut self,
        ram: &RdramView<'_>,
        at: u32,
        w0: u32,
        w1: u32,
        pc: &mut u32,
        stack: &mut Vec<u32>,
        sink: &mut dyn CommandSink,
    ) -> Result<Control, InterpreterError> {
        let op = (w0 >> 24) as u8;
        trace!(address = at, opcode = gbi::opcode_name(op), w0, w1, "gbi");

        match op {
            gbi::G_SPNOOP | gbi::G_NOOP => {}
            gbi::G_RDPLOADSYNC | gbi::G_RDPPIPESYNC | gbi::G_RDPTILESYNC | gbi::G_RDPFULLSYNC => {}

            // Control flow.
            gbi::G_DL => {
                let target = ram.clamp(self.segments.resolve(w1));
                if field(w0, 16, 8) == 0 {
                    if stack.len() >= self.config.max_depth {
                        self.stats.stack_overflows += 1;
                        error!(
                            depth = stack.len(),
                            address = at,
                            "display list call stack overflow; aborting list"
                        );
                        return Err(InterpreterError::StackOverflow {
                            depth: stack.len(),
                            address: at,
                        });
                    }
                    stack.push(*pc);
                }
                *pc = target;
            }
            gbi::G_ENDDL => match stack.pop() {
                Some(ret) => *pc = ret,
                None => return Ok(Control::End),
            },
            gbi::G_BRANCH_Z => {
                *pc = ram.clamp(self.segments.resolve(self.rdp_half_1));
            }
            gbi::G_CULLDL => {
                let first = (field(w0, 0, 16) / 2) as usize;
                let last = ((field(w1, 0, 16) / 2) as usize).min(VERTEX_BUFFER_LEN - 1);
                if first <= last {
                    let points: Vec<[f32; 4]> =
                        self.vertices[first..=last].iter().map(|v| v.clip).collect();
                    if clip::trivially_rejected(&points) {
                        self.stats.culled_lists += 1;
                        match stack.pop() {
                            Some(ret) => *pc = ret,
                            None => return Ok(Control::End),
                        }
                    }
                }
            }
            gbi::G_RDPHALF_1 => self.rdp_half_1 = w1,
            gbi::G_RDPHALF_2 => {}

            // Geometry.
            gbi::G_VTX => self.load_vertices(ram, w0, w1),
            gbi::G_MODIFYVTX => self.modify_vertex(w0, w1),
            gbi::G_TRI1 => self.triangle(ram, tri_indices(w0), sink)?,
            gbi::G_TRI2 | gbi::G_QUAD => {
                self.triangle(ram, tri_indices(w0), sink)?;
                self.triangle(ram, tri_indices(w1), sink)?;
            }
            gbi::G_MTX => {
                let params = field(w0, 0, 8) ^ gbi::G_MTX_PUSH;
                let m = state::load_matrix(ram, self.segments.resolve(w1));
                if !self.matrices.apply(&m, params) {
                    warn!(address = at, "modelview matrix stack full; push ignored");
                }
            }
            gbi::G_POPMTX => self.matrices.pop(w1 >> 6),
            gbi::G_MOVEWORD => match field(w0, 16, 8) {
                gbi::G_MW_SEGMENT => {
                    self.segments.set((field(w0, 0, 16) / 4) as usize, w1);
                }
                gbi::G_MW_NUMLIGHT => self.lights.set_count((w1 / 24) as usize),
                gbi::G_MW_LIGHTCOL => {
                    let offset = field(w0, 0, 16);
                    // Each light is 24 bytes; +4 is the color copy.
                    if offset % 24 == 0 || offset % 24 == 4 {
                        self.lights.set_color((offset / 24) as usize, w1);
                    }
                }
                gbi::G_MW_FOG | gbi::G_MW_PERSPNORM => {}
                index => trace!(index, "ignored G_MOVEWORD"),
            },
            gbi::G_MOVEMEM => match field(w0, 0, 8) {
                gbi::G_MV_VIEWPORT => {
                    self.viewport = Viewport::load(ram, self.segments.resolve(w1));
                }
                gbi::G_MV_LIGHT => {
                    let offset = field(w0, 8, 8) * 8;
                    // The first two 24-byte slots are the look-at vectors.
                    match (offset / 24).checked_sub(2) {
                        Some(slot) => self
                            .lights
                            .set(slot as usize, Light::load(ram, self.segments.resolve(w1))),
                        None => trace!(offset, "ignored look-at G_MOVEMEM"),
                    }
                }
                index => trace!(index, "ignored G_MOVEMEM"),
            },
            gbi::G_GEOMETRYMODE => {
                self.flush(sink)?;
                let kept = self.geometry.bits() & field(w0, 0, 24);
                self.geometry = GeometryMode::from_bits_retain(kept | w1);
            }
            gbi::G_TEXTURE => {
                self.texture_state_change(sink)?;
                self.texture = TextureState {
                    on: field(w0, 1, 7) != 0,
                    tile: field(w0, 8, 3) as usize,
                    scale: [
                        (w1 >> 16) as f32 / 65536.0,
                        (w1 & 0xFFFF) as f32 / 65536.0,
                    ],
                };
            }
            gbi::G_SPECIAL_1 | gbi::G_SPECIAL_2 | gbi::G_SPECIAL_3 => {}
            gbi::G_DMA_IO | gbi::G_LOAD_UCODE => {}

            // Othermodes and combiner.
            gbi::G_SETOTHERMODE_L | gbi::G_SETOTHERMODE_H => {
                self.flush(sink)?;
                let len = field(w0, 0, 8) + 1;
                let shift = 32u32.saturating_sub(field(w0, 8, 8) + len);
                if op == gbi::G_SETOTHERMODE_L {
                    self.othermode_l = set_bits(self.othermode_l, shift, len, w1);
                } else {
                    self.othermode_h = set_bits(self.othermode_h, shift, len, w1);
                }
            }
            gbi::G_RDPSETOTHERMODE => {
                self.flush(sink)?;
                self.othermode_h = w0 & 0x00FF_FFFF;
                self.othermode_l = w1;
            }
            gbi::G_SETCOMBINE => {
                self.flush(sink)?;
                self.combine_mux = CombinerKey::from_words(w0, w1, CombinerFlags::empty()).mux;
            }

            // Constant colors.
            gbi::G_SETPRIMCOLOR => {
                self.flush(sink)?;
                self.colors.prim_min_level = field(w0, 8, 5) as u8;
                self.colors.prim_lod_frac = field(w0, 0, 8) as u8;
                self.colors.prim = w1;
            }
            gbi::G_SETENVCOLOR => self.set_color(sink, |c| c.env = w1)?,
            gbi::G_SETFOGCOLOR => self.set_color(sink, |c| c.fog = w1)?,
            gbi::G_SETBLENDCOLOR => self.set_color(sink, |c| c.blend = w1)?,
            gbi::G_SETFILLCOLOR => self.set_color(sink, |c| c.fill = w1)?,
            gbi::G_SETKEYR => self.set_color(sink, |c| {
                c.key_center = replace_byte(c.key_center, 3, field(w1, 8, 8));
                c.key_scale = replace_byte(c.key_scale, 3, field(w1, 0, 8));
            })?,
            gbi::G_SETKEYGB => self.set_color(sink, |c| {
                c.key_center = replace_byte(c.key_center, 2, field(w1, 24, 8));
                c.key_center = replace_byte(c.key_center, 1, field(w1, 8, 8));
                c.key_scale = replace_byte(c.key_scale, 2, field(w1, 16, 8));
                c.key_scale = replace_byte(c.key_scale, 1, field(w1, 0, 8));
            })?,
            gbi::G_SETCONVERT => self.set_color(sink, |c| {
                c.k4 = sign_extend_9(field(w1, 9, 9));
                c.k5 = sign_extend_9(field(w1, 0, 9));
            })?,

            // Images and scissor.
            gbi::G_SETCIMG => {
                self.flush(sink)?;
                self.color_image = Image::from_words(w0, self.segments.resolve(w1));
                let image = self.color_image;
                self.recent_color_images.retain(|i| i.address != image.address);
                if self.recent_color_images.len() == RECENT_COLOR_IMAGES {
                    self.recent_color_images.remove(0);
                }
                self.recent_color_images.push(image);
            }
            gbi::G_SETZIMG => {
                self.flush(sink)?;
                self.depth_image = self.segments.resolve(w1);
            }
            gbi::G_SETSCISSOR => {
                self.flush(sink)?;
                self.scissor = [
                    field(w0, 12, 12),
                    field(w0, 0, 12),
                    field(w1, 12, 12),
                    field(w1, 0, 12),
                ];
            }
            gbi::G_SETPRIMDEPTH => self.flush(sink)?,

            // Texture state.
            gbi::G_SETTIMG => {
                self.texture_state_change(sink)?;
                self.texture_image = Image::from_words(w0, self.segments.resolve(w1));
            }
            gbi::G_SETTILE => {
                self.texture_state_change(sink)?;
                self.tiles[field(w1, 24, 3) as usize].set_from(w0, w1);
            }
            gbi::G_SETTILESIZE => {
                self.texture_state_change(sink)?;
                self.tiles[field(w1, 24, 3) as usize].set_size(w0, w1);
            }
            gbi::G_LOADBLOCK => {
                self.texture_state_change(sink)?;
                self.load_block(w0, w1);
            }
            gbi::G_LOADTILE => {
                self.texture_state_change(sink)?;
                self.load_tile(w0, w1);
            }
            gbi::G_LOADTLUT => {
                self.texture_state_change(sink)?;
                self.load_tlut(ram, w0, w1);
            }

            // Rectangles.
            gbi::G_FILLRECT => self.fill_rect(ram, w0, w1, sink)?,
            gbi::G_TEXRECT | gbi::G_TEXRECTFLIP => {
                // The texture coordinates follow as RDPHALF_1/RDPHALF_2, or
                // inline as a bare word pair.
                let w2 = ram.read_u32(*pc);
                let w3 = ram.read_u32(pc.wrapping_add(4));
                *pc = ram.clamp(pc.wrapping_add(gbi::COMMAND_LEN));
                let (coords, steps) = if (w2 >> 24) as u8 == gbi::G_RDPHALF_1 {
                    let w5 = ram.read_u32(pc.wrapping_add(4));
                    *pc = ram.clamp(pc.wrapping_add(gbi::COMMAND_LEN));
                    (w3, w5)
                } else {
                    (w2, w3)
                };
                self.texture_rect(ram, w0, w1, coords, steps, op == gbi::G_TEXRECTFLIP, sink)?;
            }

            _ => {
                self.stats.unknown_opcodes += 1;
                let (word, bit) = (op as usize / 64, op as u64 % 64);
                if self.warned[word] & (1 << bit) == 0 {
                    self.warned[word] |= 1 << bit;
                    warn!(
                        opcode = op,
                        opcode_name = gbi::opcode_name(op),
                        address = at,
                        "unknown display list opcode; skipping"
                    );
                } else {
                    trace!(opcode = op, address = at, "unknown display list opcode");
                }
            }
        }
        Ok(Control::Continue)
    }

    fn set_color(
        &mut self,
        sink: &mut dyn CommandSink,
        update: impl FnOnce(&mut ColorState),
    ) -> Result<(), InterpreterError> {
        self.flush(sink)?;
        update(&mut self.colors);
        Ok(())
    }

    /// Close the batch and report host RAM writes before texture state
    /// moves on.
    fn texture_state_change(&mut self, sink: &mut dyn CommandSink) -> Result<(), InterpreterError> {
        self.flush(sink)?;
        self.flush_invalidations(sink)?;
        self.texture_dirty = true;
        Ok(())
    }

    fn flush_invalidations(&mut self, sink: &mut dyn CommandSink) -> Result<(), InterpreterError> {
        if self.pending_invalidations.is_empty() {
            return Ok(());
        }
        for (address, len) in std::mem::take(&mut self.pending_invalidations) {
            self.emit(sink, &RenderCommand::InvalidateRange { address, len })?;
        }
        self.texture_dirty = true;
        Ok(())
    }

    fn load_vertices(&mut self, ram: &RdramView<'_>, w0: u32, w1: u32) {
        let count = field(w0, 12, 8) as usize;
        let first = (field(w0, 1, 7) as usize).saturating_sub(count);
        let base = self.segments.resolve(w1);
        let combined = *self.matrices.combined();
        let scale = self.texture.scale;
        // Lit vertices carry a normal where the color would be.
        let lighting = self
            .geometry
            .contains(GeometryMode::LIGHTING)
            .then(|| (self.lights, self.matrices.modelview));

        for i in 0..count {
            let Some(slot) = self.vertices.get_mut(first + i) else {
                debug!(first, count, "G_VTX runs past the vertex buffer");
                break;
            };
            let addr = base.wrapping_add(i as u32 * VERTEX_STRIDE);
            let coord = |off: u32| ram.read_i16(addr.wrapping_add(off)) as f32;
            let position = [coord(0), coord(2), coord(4), 1.0];
            let mut rgba = ram.read_u32(addr.wrapping_add(12)).to_be_bytes();
            if let Some((lights, modelview)) = &lighting {
                let normal = [rgba[0] as i8, rgba[1] as i8, rgba[2] as i8];
                let [r, g, b] = lights.shade(normal, modelview);
                rgba = [r, g, b, rgba[3]];
            }
            *slot = SpVertex {
                clip: state::transform(position, &combined),
                color: rgba,
                st: [
                    coord(8) / 32.0 * scale[0],
                    coord(10) / 32.0 * scale[1],
                ],
            };
        }
    }

    fn modify_vertex(&mut self, w0: u32, w1: u32) {
        let index = (field(w0, 0, 16) / 2) as usize;
        let Some(v) = self.vertices.get_mut(index) else {
            return;
        };
        match field(w0, 16, 8) {
            gbi::G_MWO_POINT_RGBA => v.color = w1.to_be_bytes(),
            gbi::G_MWO_POINT_ST => {
                v.st = [
                    (w1 >> 16) as i16 as f32 / 32.0,
                    (w1 & 0xFFFF) as i16 as f32 / 32.0,
                ];
            }
            other => trace!(kind = other, "ignored G_MODIFYVTX target"),
        }
    }

    fn triangle(
        &mut self,
        ram: &RdramView<'_>,
        indices: [usize; 3],
        sink: &mut dyn CommandSink,
    ) -> Result<(), InterpreterError> {
        if indices.iter().any(|&i| i >= VERTEX_BUFFER_LEN) {
            debug!(?indices, "triangle references a vertex outside the buffer");
            self.stats.dropped_triangles += 1;
            return Ok(());
        }
        let [a, b, c] = indices.map(|i| self.vertices[i]);
        let corners = [&a.clip, &b.clip, &c.clip];
        if !clip::triangle_visible(corners) || clip::culled(corners, self.geometry) {
            self.stats.dropped_triangles += 1;
            return Ok(());
        }

        let key = BatchKey {
            kind: BatchKind::Triangles,
            textured: self.texture.on,
            tile: self.texture.tile,
            copy: false,
        };
        self.open_batch(ram, key, sink)?;
        if self.batch.vertices.len() + 3 > MAX_BATCH_VERTICES {
            self.submit_batch(sink)?;
        }
        let tile = self.tiles[self.texture.tile];
        for v in [a, b, c] {
            let vertex = Vertex {
                position: self.viewport.to_screen_clip(v.clip, self.screen),
                color: v.color.map(|c| c as f32 / 255.0),
                uv: normalize_st(&tile, v.st),
            };
            self.batch.vertices.push(vertex);
        }
        self.stats.triangles += 1;
        Ok(())
    }

    fn fill_rect(
        &mut self,
        ram: &RdramView<'_>,
        w0: u32,
        w1: u32,
        sink: &mut dyn CommandSink,
    ) -> Result<(), InterpreterError> {
        let cycle = self.cycle_type();
        let inclusive = matches!(cycle, gbi::G_CYC_FILL | gbi::G_CYC_COPY) as u32;
        let x0 = (field(w1, 12, 12) >> 2).max(self.scissor[0] >> 2);
        let y0 = (field(w1, 0, 12) >> 2).max(self.scissor[1] >> 2);
        let x1 = ((field(w0, 12, 12) >> 2) + inclusive).min(self.scissor[2] >> 2);
        let y1 = ((field(w0, 0, 12) >> 2) + inclusive).min(self.scissor[3] >> 2);
        if x0 >= x1 || y0 >= y1 {
            return Ok(());
        }
        let color = if cycle == gbi::G_CYC_FILL {
            self.fill_rgba()
        } else {
            self.colors.prim.to_be_bytes()
        };

        let key = BatchKey {
            kind: BatchKind::Fills,
            textured: false,
            tile: 0,
            copy: false,
        };
        self.open_batch(ram, key, sink)?;
        self.batch.fills.push(FillRect {
            x0: clamp_u16(x0),
            y0: clamp_u16(y0),
            x1: clamp_u16(x1),
            y1: clamp_u16(y1),
            color,
        });
        if self.batch.fills.len() >= MAX_BATCH_FILLS {
            self.submit_batch(sink)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn texture_rect(
        &mut self,
        ram: &RdramView<'_>,
        w0: u32,
        w1: u32,
        coords: u32,
        steps: u32,
        flip: bool,
        sink: &mut dyn CommandSink,
    ) -> Result<(), InterpreterError> {
        let tile_index = field(w1, 24, 3) as usize;
        let copy = self.cycle_type() == gbi::G_CYC_COPY;
        let extra = if matches!(self.cycle_type(), gbi::G_CYC_COPY | gbi::G_CYC_FILL) {
            1.0
        } else {
            0.0
        };
        let x0 = field(w1, 12, 12) as f32 / 4.0;
        let y0 = field(w1, 0, 12) as f32 / 4.0;
        let x1 = field(w0, 12, 12) as f32 / 4.0 + extra;
        let y1 = field(w0, 0, 12) as f32 / 4.0 + extra;
        if x1 <= x0 || y1 <= y0 {
            return Ok(());
        }

        let s = (coords >> 16) as i16 as f32 / 32.0;
        let t = (coords & 0xFFFF) as i16 as f32 / 32.0;
        let mut dsdx = (steps >> 16) as i16 as f32 / 1024.0;
        let dtdy = (steps & 0xFFFF) as i16 as f32 / 1024.0;
        if copy {
            // Copy mode steps four texels per pixel.
            dsdx /= 4.0;
        }
        let (w, h) = (x1 - x0, y1 - y0);
        let tile = self.tiles[tile_index];

        if flip {
            // S runs down the rectangle and T across it; emit explicit
            // corners.
            let key = BatchKey {
                kind: BatchKind::Triangles,
                textured: true,
                tile: tile_index,
                copy,
            };
            self.open_batch(ram, key, sink)?;
            let corner = |x: f32, y: f32, st: [f32; 2]| Vertex {
                position: [
                    x / self.screen.0 * 2.0 - 1.0,
                    1.0 - y / self.screen.1 * 2.0,
                    0.0,
                    1.0,
                ],
                color: [1.0; 4],
                uv: normalize_st(&tile, st),
            };
            let (s1, t1) = (s + h * dsdx, t + w * dtdy);
            let tl = corner(x0, y0, [s, t]);
            let tr = corner(x1, y0, [s, t1]);
            let bl = corner(x0, y1, [s1, t]);
            let br = corner(x1, y1, [s1, t1]);
            if self.batch.vertices.len() + 6 > MAX_BATCH_VERTICES {
                self.submit_batch(sink)?;
            }
            self.batch.vertices.extend_from_slice(&[tl, tr, bl, bl, tr, br]);
            return Ok(());
        }

        let key = BatchKey {
            kind: BatchKind::Rects,
            textured: true,
            tile: tile_index,
            copy,
        };
        self.open_batch(ram, key, sink)?;
        let [s0, t0] = normalize_st(&tile, [s, t]);
        let [s1, t1] = normalize_st(&tile, [s + w * dsdx, t + h * dtdy]);
        self.batch.rects.push(TexturedRect {
            x0,
            y0,
            x1,
            y1,
            s0,
            t0,
            s1,
            t1,
        });
        if self.batch.rects.len() >= MAX_BATCH_RECTS {
            self.submit_batch(sink)?;
        }
        Ok(())
    }

    fn load_block(&mut self, w0: u32, w1: u32) {
        let image = self.texture_image;
        let uls = field(w0, 12, 12);
        let ult = field(w0, 0, 12);
        let address = image
            .address
            .wrapping_add(ult * image.row_bytes())
            .wrapping_add((uls << image.size) / 2);
        let tile = field(w1, 24, 3) as usize;
        self.record_load(
            self.tiles[tile].tmem,
            TmemLoad {
                address,
                ram_stride: None,
            },
        );
    }

    fn load_tile(&mut self, w0: u32, w1: u32) {
        let image = self.texture_image;
        let index = field(w1, 24, 3) as usize;
        self.tiles[index].set_size(w0, w1);
        let tile = self.tiles[index];
        let (uls, ult) = ((tile.uls >> 2) as u32, (tile.ult >> 2) as u32);
        let address = image
            .address
            .wrapping_add(ult * image.row_bytes())
            .wrapping_add((uls << image.size) / 2);
        self.record_load(
            tile.tmem,
            TmemLoad {
                address,
                ram_stride: Some(image.row_bytes()),
            },
        );
    }

    fn record_load(&mut self, tmem: u16, load: TmemLoad) {
        self.tmem_loads.retain(|(t, _)| *t != tmem);
        self.tmem_loads.push((tmem, load));
    }

    fn load_tlut(&mut self, ram: &RdramView<'_>, w0: u32, w1: u32) {
        let tile = self.tiles[field(w1, 24, 3) as usize];
        let count = field(w1, 14, 10) as usize + 1;
        let first = (tile.tmem as usize).saturating_sub(256);
        let source = self
            .texture_image
            .address
            .wrapping_add((field(w0, 12, 12) >> 2) * 2);
        for i in 0..count {
            let Some(entry) = self.tlut.entries.get_mut(first + i) else {
                break;
            };
            *entry = ram.read_u16(source.wrapping_add(i as u32 * 2));
        }
        self.tlut.address = source;
        self.tlut.loaded = true;
    }

    fn cycle_type(&self) -> u32 {
        field(self.othermode_h, gbi::G_MDSFT_CYCLETYPE, 2)
    }

    /// The fill word as RGBA. A 16-bit color image packs two 5551 pixels;
    /// the first is used.
    fn fill_rgba(&self) -> [u8; 4] {
        if self.color_image.size == gbi::G_IM_SIZ_16B {
            let c = (self.colors.fill >> 16) as u16;
            [
                EXPAND_5[((c >> 11) & 0x1F) as usize],
                EXPAND_5[((c >> 6) & 0x1F) as usize],
                EXPAND_5[((c >> 1) & 0x1F) as usize],
                EXPAND_1[(c & 1) as usize],
            ]
        } else {
            self.colors.fill.to_be_bytes()
        }
    }

    fn combiner_state(&self, key: BatchKey) -> (u64, CombinerFlags) {
        if key.copy {
            return (gbi::DECAL_RGBA_MUX, CombinerFlags::TEXTURE_PRESENT);
        }
        let l = self.othermode_l;
        let mut flags = CombinerFlags::empty();
        flags.set(CombinerFlags::TWO_CYCLE, self.cycle_type() == gbi::G_CYC_2CYCLE);
        flags.set(CombinerFlags::TEXTURE_PRESENT, key.textured);
        flags.set(CombinerFlags::DEPTH_COMPARE, l & gbi::Z_CMP != 0);
        flags.set(CombinerFlags::ALPHA_COMPARE, l & gbi::G_AC_MASK != 0);
        flags.set(CombinerFlags::ALPHA_CVG_SEL, l & gbi::ALPHA_CVG_SEL != 0);
        flags.set(CombinerFlags::CVG_X_ALPHA, l & gbi::CVG_X_ALPHA != 0);
        flags.set(CombinerFlags::FOG, self.geometry.contains(GeometryMode::FOG));
        (self.combine_mux, flags)
    }

    /// Start a batch for `key`, first emitting any state the renderer has
    /// not seen.
    fn open_batch(
        &mut self,
        ram: &RdramView<'_>,
        key: BatchKey,
        sink: &mut dyn CommandSink,
    ) -> Result<(), InterpreterError> {
        if self.batch.key == Some(key) {
            return Ok(());
        }
        self.flush(sink)?;
        self.flush_invalidations(sink)?;

        if key.kind != BatchKind::Fills {
            let (mux, flags) = self.combiner_state(key);
            if self.emitted.combine != Some((mux, flags))
                && self.emit(sink, &RenderCommand::SetCombine { mux, flags })?
            {
                self.emitted.combine = Some((mux, flags));
            }
            let modes = (self.othermode_h, self.othermode_l);
            if self.emitted.othermodes != Some(modes)
                && self.emit(sink, &RenderCommand::SetOtherModes { h: modes.0, l: modes.1 })?
            {
                self.emitted.othermodes = Some(modes);
            }
            let colors = self.colors;
            if self.emitted.colors != Some(colors)
                && self.emit(sink, &RenderCommand::SetColors(colors))?
            {
                self.emitted.colors = Some(colors);
            }
            if key.textured {
                self.emit_textures(ram, key.tile, mux, sink)?;
            }
        }
        self.batch.key = Some(key);
        Ok(())
    }

    fn emit_textures(
        &mut self,
        ram: &RdramView<'_>,
        tile: usize,
        mux: u64,
        sink: &mut dyn CommandSink,
    ) -> Result<(), InterpreterError> {
        let mut slots = vec![(0u8, tile)];
        if reads_texel1(mux) {
            slots.push((1, (tile + 1) & 7));
        }
        let mut delivered = true;
        for (slot, tile) in slots {
            if !self.texture_dirty && self.emitted.tiles[slot as usize] == Some(tile) {
                continue;
            }
            if let Some(cmd) = self.texture_command(ram, slot, tile) {
                if !self.emit(sink, &cmd)? {
                    delivered = false;
                    continue;
                }
            }
            self.emitted.tiles[slot as usize] = Some(tile);
        }
        if delivered {
            self.texture_dirty = false;
        }
        Ok(())
    }

    /// Gather the bytes a tile samples, or point the renderer at the color
    /// buffer when the tile reads back a frame the game just drew.
    fn texture_command(&self, ram: &RdramView<'_>, slot: u8, index: usize) -> Option<RenderCommand> {
        let tile = self.tiles[index];
        let Some(format) = tile.pixel_format() else {
            debug!(tile = index, format = tile.format, size = tile.size, "unsupported tile format");
            return None;
        };
        let load = self
            .tmem_loads
            .iter()
            .rev()
            .find(|(tmem, _)| *tmem == tile.tmem)
            .or_else(|| self.tmem_loads.last())
            .map(|(_, load)| *load)?;
        let (width, mut height) = tile.dimensions();

        if let Some(image) = self.color_image_containing(load.address) {
            let bpp = image.bytes_per_pixel();
            let pixel = (load.address - image.address) / bpp;
            return Some(RenderCommand::CaptureColorBuffer(ColorCapture {
                slot,
                address: load.address,
                params: ReadColorBufferParams {
                    x0: pixel % image.width,
                    y0: pixel / image.width,
                    width,
                    height,
                    bit_depth: if image.size == gbi::G_IM_SIZ_16B { 16 } else { 32 },
                    synchronous: self.config.synchronous_color_reads,
                },
            }));
        }

        let row = format.row_bytes(width);
        if row == 0 || row > TMEM_BYTES {
            debug!(tile = index, width, "tile row does not fit in TMEM");
            return None;
        }
        let max_rows = (TMEM_BYTES / row) as u32;
        if height > max_rows {
            debug!(tile = index, width, height, "tile larger than TMEM; truncating");
            height = max_rows;
        }
        let stride = load.ram_stride.unwrap_or_else(|| {
            let words = tile.line as u32 * if tile.size == 3 { 16 } else { 8 };
            if words == 0 {
                row as u32
            } else {
                words
            }
        });

        let mut bytes = vec![0u8; row * height as usize];
        for (r, chunk) in bytes.chunks_exact_mut(row).enumerate() {
            ram.read_into(load.address.wrapping_add(r as u32 * stride), chunk);
        }
        let source_len = match height {
            0 => 0,
            rows => (stride as u64 * (rows as u64 - 1) + row as u64).min(u32::MAX as u64) as u32,
        };

        let palette = match format {
            PixelFormat::Ci4 => {
                let base = tile.palette as usize * 16;
                Some(self.tlut.entries[base..base + 16].to_vec())
            }
            PixelFormat::Ci8 => Some(self.tlut.entries.to_vec()),
            _ => None,
        }
        .map(|entries| Palette::new(tlut_format(self.othermode_h), entries));

        Some(RenderCommand::LoadTexture(TextureLoad {
            slot,
            address: load.address,
            source_len,
            format,
            width,
            height,
            palette,
            bytes,
        }))
    }

    fn color_image_containing(&self, address: u32) -> Option<Image> {
        let height = self.config.screen_height;
        self.recent_color_images.iter().rev().copied().find(|image| {
            let len = image.width as u64 * height as u64 * image.bytes_per_pixel() as u64;
            let start = image.address as u64;
            (start..start + len).contains(&(address as u64))
        })
    }

    /// Hand the pending batch to the sink and forget its key.
    fn flush(&mut self, sink: &mut dyn CommandSink) -> Result<(), InterpreterError> {
        if self.batch.key.is_none() {
            return Ok(());
        }
        self.submit_batch(sink)?;
        self.batch.key = None;
        Ok(())
    }

    /// Submit what the batch holds but keep it open; used when it fills up.
    fn submit_batch(&mut self, sink: &mut dyn CommandSink) -> Result<(), InterpreterError> {
        let cmd = if !self.batch.vertices.is_empty() {
            RenderCommand::DrawTriangles(std::mem::take(&mut self.batch.vertices))
        } else if !self.batch.rects.is_empty() {
            RenderCommand::DrawRects(std::mem::take(&mut self.batch.rects))
        } else if !self.batch.fills.is_empty() {
            RenderCommand::FillRects(std::mem::take(&mut self.batch.fills))
        } else {
            return Ok(());
        };
        self.stats.batches += 1;
        self.emit(sink, &cmd)?;
        // Keep the allocation for the next batch.
        match cmd {
            RenderCommand::DrawTriangles(mut v) => {
                v.clear();
                self.batch.vertices = v;
            }
            RenderCommand::DrawRects(mut r) => {
                r.clear();
                self.batch.rects = r;
            }
            RenderCommand::FillRects(mut f) => {
                f.clear();
                self.batch.fills = f;
            }
            _ => {}
        }
        Ok(())
    }

    /// Submit one command; `Ok(false)` if it was dropped. Non-fatal sink
    /// failures forget what the renderer was told, so state is re-sent.
    fn emit(
        &mut self,
        sink: &mut dyn CommandSink,
        cmd: &RenderCommand,
    ) -> Result<bool, InterpreterError> {
        match sink.submit(cmd) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.stats.sink_errors += 1;
                self.emitted = Emitted::default();
                self.texture_dirty = true;
                if err.is_fatal() {
                    error!(%err, opcode = %cmd.opcode(), "render command sink closed");
                    return Err(InterpreterError::Sink(err));
                }
                warn!(%err, opcode = %cmd.opcode(), "render command dropped");
                Ok(false)
            }
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(InterpreterConfig::default())
    }
}

/// Vertex indices of a `G_TRI1`-style word; the microcode stores them
/// doubled.
fn tri_indices(word: u32) -> [usize; 3] {
    [
        (field(word, 16, 8) / 2) as usize,
        (field(word, 8, 8) / 2) as usize,
        (field(word, 0, 8) / 2) as usize,
    ]
}

/// Texel coordinates to 0..1 across the tile, after the tile's shift.
fn normalize_st(tile: &Tile, st: [f32; 2]) -> [f32; 2] {
    let (w, h) = tile.dimensions();
    let origin = tile.origin();
    let dims = [w as f32, h as f32];
    let mut out = [0.0f32; 2];
    for axis in 0..2 {
        let shifted = match tile.shift[axis] {
            0 => st[axis],
            s @ 1..=10 => st[axis] / (1u32 << s) as f32,
            s => st[axis] * (1u32 << (16 - s as u32)) as f32,
        };
        out[axis] = (shifted - origin[axis]) / dims[axis];
    }
    out
}

fn reads_texel1(mux: u64) -> bool {
    let (color, alpha) = CombinerKey::new(mux, CombinerFlags::TWO_CYCLE).stages();
    color.cycles.iter().any(|c| {
        c.reads(ColorInput::Texel1) || c.reads(ColorInput::Texel1Alpha)
    }) || alpha.cycles.iter().any(|c| c.reads(AlphaInput::Texel1))
}

fn replace_byte(word: u32, byte: u32, value: u32) -> u32 {
    let shift = byte * 8;
    (word & !(0xFF << shift)) | ((value & 0xFF) << shift)
}

fn sign_extend_9(v: u32) -> i16 {
    (((v << 23) as i32) >> 23) as i16
}

fn clamp_u16(v: u32) -> u16 {
    v.min(u16::MAX as u32) as u16
}
