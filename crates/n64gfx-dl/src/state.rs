//! RSP and RDP state the interpreter tracks between commands.

use n64gfx_core::format::{PaletteFormat, PixelFormat};

use crate::gbi::{self, field};
use crate::memory::RdramView;

pub type Mat4 = [[f32; 4]; 4];

pub const IDENTITY: Mat4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Row-vector product `a * b`, the order the microcode concatenates in.
pub fn mat_mul(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut out = [[0.0f32; 4]; 4];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..4).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// `v * m` for a row vector.
pub fn transform(v: [f32; 4], m: &Mat4) -> [f32; 4] {
    let mut out = [0.0f32; 4];
    for (j, cell) in out.iter_mut().enumerate() {
        *cell = (0..4).map(|i| v[i] * m[i][j]).sum();
    }
    out
}

/// Load a 4x4 s15.16 matrix: sixteen integer halves followed by sixteen
/// fraction halves, row-major.
pub fn load_matrix(ram: &RdramView<'_>, addr: u32) -> Mat4 {
    let mut m = [[0.0f32; 4]; 4];
    for (i, row) in m.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            let idx = (i * 4 + j) as u32 * 2;
            let int = ram.read_i16(addr.wrapping_add(idx)) as i32;
            let frac = ram.read_u16(addr.wrapping_add(32 + idx)) as i32;
            *cell = ((int << 16) | frac) as f32 / 65536.0;
        }
    }
    m
}

/// Modelview stack depth of the F3DEX2 microcode.
pub const MATRIX_STACK_DEPTH: usize = 10;

#[derive(Debug, Clone)]
pub struct Matrices {
    pub projection: Mat4,
    pub modelview: Mat4,
    stack: Vec<Mat4>,
    combined: Mat4,
}

impl Default for Matrices {
    fn default() -> Self {
        Self {
            projection: IDENTITY,
            modelview: IDENTITY,
            stack: Vec::with_capacity(MATRIX_STACK_DEPTH),
            combined: IDENTITY,
        }
    }
}

impl Matrices {
    /// Apply a `G_MTX`. Returns `false` if a push was dropped because the
    /// stack is full; the matrix itself is still applied.
    pub fn apply(&mut self, m: &Mat4, params: u32) -> bool {
        let mut pushed = true;
        if params & gbi::G_MTX_PROJECTION != 0 {
            self.projection = if params & gbi::G_MTX_LOAD != 0 {
                *m
            } else {
                mat_mul(m, &self.projection)
            };
        } else {
            if params & gbi::G_MTX_PUSH != 0 {
                if self.stack.len() < MATRIX_STACK_DEPTH {
                    self.stack.push(self.modelview);
                } else {
                    pushed = false;
                }
            }
            self.modelview = if params & gbi::G_MTX_LOAD != 0 {
                *m
            } else {
                mat_mul(m, &self.modelview)
            };
        }
        self.update();
        pushed
    }

    pub fn pop(&mut self, count: u32) {
        for _ in 0..count {
            match self.stack.pop() {
                Some(m) => self.modelview = m,
                None => break,
            }
        }
        self.update();
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Modelview times projection.
    pub fn combined(&self) -> &Mat4 {
        &self.combined
    }

    fn update(&mut self) {
        self.combined = mat_mul(&self.modelview, &self.projection);
    }
}

/// Viewport in screen pixels: `screen = ndc * scale + translate`, y down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scale: [f32; 2],
    pub translate: [f32; 2],
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        let (w, h) = (width as f32 / 2.0, height as f32 / 2.0);
        Self {
            scale: [w, h],
            translate: [w, h],
        }
    }

    /// `G_MOVEMEM` viewport block: three s13.2 scales, padding, three s13.2
    /// translations.
    pub fn load(ram: &RdramView<'_>, addr: u32) -> Self {
        let q = |off: u32| ram.read_i16(addr.wrapping_add(off)) as f32 / 4.0;
        Self {
            scale: [q(0), q(2)],
            translate: [q(8), q(10)],
        }
    }

    /// Re-express a clip-space position relative to the whole screen, so the
    /// renderer can treat the target as one viewport.
    pub fn to_screen_clip(&self, p: [f32; 4], screen: (f32, f32)) -> [f32; 4] {
        let (hw, hh) = (screen.0 / 2.0, screen.1 / 2.0);
        let w = p[3];
        [
            p[0] * self.scale[0] / hw + w * (self.translate[0] / hw - 1.0),
            p[1] * self.scale[1] / hh - w * (self.translate[1] / hh - 1.0),
            p[2],
            w,
        ]
    }
}

/// Directional light slots. The ambient color lives in the slot right after
/// the last active directional light.
pub const LIGHT_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Light {
    /// Linear color, 0..=1 per channel.
    pub color: [f32; 3],
    /// Unit direction in model space, zero for an ambient-only slot.
    pub dir: [f32; 3],
}

impl Light {
    /// `Light_t` block: color, color copy, then an s8 direction.
    pub fn load(ram: &RdramView<'_>, addr: u32) -> Self {
        let byte = |off: u32| ram.read_u8(addr.wrapping_add(off));
        let color = [0, 1, 2].map(|i| byte(i) as f32 / 255.0);
        let dir = normalize([8, 9, 10].map(|i| byte(i) as i8 as f32));
        Self { color, dir }
    }
}

/// RSP lighting state for `G_LIGHTING` geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lights {
    pub slots: [Light; LIGHT_SLOTS],
    /// Active directional lights; `slots[count]` is the ambient color.
    pub count: usize,
}

impl Default for Lights {
    fn default() -> Self {
        Self {
            slots: [Light::default(); LIGHT_SLOTS],
            count: 0,
        }
    }
}

impl Lights {
    /// `G_MW_NUMLIGHT`; out-of-range counts disable directional lights.
    pub fn set_count(&mut self, count: usize) {
        self.count = if count < LIGHT_SLOTS { count } else { 0 };
    }

    /// `G_MW_LIGHTCOL`: packed `0xRRGGBB00` for one slot.
    pub fn set_color(&mut self, slot: usize, packed: u32) {
        if let Some(light) = self.slots.get_mut(slot) {
            light.color = [24, 16, 8].map(|shift| ((packed >> shift) & 0xFF) as f32 / 255.0);
        }
    }

    pub fn set(&mut self, slot: usize, light: Light) {
        if let Some(l) = self.slots.get_mut(slot) {
            *l = light;
        }
    }

    /// Shade a model-space normal: ambient plus every directional light
    /// facing it, saturated. Lights are in the modelview's frame, so the
    /// normal is moved there first.
    pub fn shade(&self, normal: [i8; 3], modelview: &Mat4) -> [u8; 3] {
        let n = normal.map(f32::from);
        let n = normalize([0, 1, 2].map(|j| (0..3).map(|i| n[i] * modelview[i][j]).sum::<f32>()));
        let mut rgb = self.slots[self.count].color;
        for light in &self.slots[..self.count] {
            let intensity = dot(n, light.dir).max(0.0);
            for (c, l) in rgb.iter_mut().zip(light.color) {
                *c += l * intensity;
            }
        }
        rgb.map(|c| (c.min(1.0) * 255.0).round() as u8)
    }
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = dot(v, v).sqrt();
    if len == 0.0 {
        v
    } else {
        v.map(|c| c / len)
    }
}

/// A vertex after the RSP's transform.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpVertex {
    pub clip: [f32; 4],
    pub color: [u8; 4],
    /// Texture coordinates in texels, already scaled by `G_TEXTURE`.
    pub st: [f32; 2],
}

pub const VERTEX_BUFFER_LEN: usize = 32;
pub const VERTEX_STRIDE: u32 = 16;

/// `G_TEXTURE` state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureState {
    pub on: bool,
    pub tile: usize,
    pub scale: [f32; 2],
}

impl Default for TextureState {
    fn default() -> Self {
        Self {
            on: false,
            tile: 0,
            scale: [1.0, 1.0],
        }
    }
}

/// `G_SETTIMG` / `G_SETCIMG` image description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Image {
    pub address: u32,
    pub format: u8,
    pub size: u8,
    /// Width in texels.
    pub width: u32,
}

impl Image {
    pub fn from_words(w0: u32, address: u32) -> Self {
        Self {
            address,
            format: field(w0, 21, 3) as u8,
            size: field(w0, 19, 2) as u8,
            width: field(w0, 0, 12) + 1,
        }
    }

    /// Bytes per row, rounding 4-bit rows up.
    pub fn row_bytes(&self) -> u32 {
        (self.width << self.size).div_ceil(2)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self.size {
            0 | 1 => 1,
            2 => 2,
            _ => 4,
        }
    }
}

/// One of the eight RDP tile descriptors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tile {
    pub format: u8,
    pub size: u8,
    /// TMEM row stride in 64-bit words.
    pub line: u16,
    /// TMEM address in 64-bit words.
    pub tmem: u16,
    pub palette: u8,
    pub cm: [u8; 2],
    pub mask: [u8; 2],
    pub shift: [u8; 2],
    /// 10.2 fixed point bounds from `G_SETTILESIZE`/`G_LOADTILE`.
    pub uls: u16,
    pub ult: u16,
    pub lrs: u16,
    pub lrt: u16,
}

impl Tile {
    pub fn set_from(&mut self, w0: u32, w1: u32) {
        self.format = field(w0, 21, 3) as u8;
        self.size = field(w0, 19, 2) as u8;
        self.line = field(w0, 9, 9) as u16;
        self.tmem = field(w0, 0, 9) as u16;
        self.palette = field(w1, 20, 4) as u8;
        self.cm = [field(w1, 8, 2) as u8, field(w1, 18, 2) as u8];
        self.mask = [field(w1, 4, 4) as u8, field(w1, 14, 4) as u8];
        self.shift = [field(w1, 0, 4) as u8, field(w1, 10, 4) as u8];
    }

    pub fn set_size(&mut self, w0: u32, w1: u32) {
        self.uls = field(w0, 12, 12) as u16;
        self.ult = field(w0, 0, 12) as u16;
        self.lrs = field(w1, 12, 12) as u16;
        self.lrt = field(w1, 0, 12) as u16;
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_n64(self.format, self.size)
    }

    /// Sampled size in texels. A wrap mask narrower than the tile bounds
    /// wins.
    pub fn dimensions(&self) -> (u32, u32) {
        let dim = |lo: u16, hi: u16, mask: u8| {
            let size = (hi.saturating_sub(lo) as u32 >> 2) + 1;
            match mask {
                0 => size,
                m => size.min(1 << m.min(10)),
            }
        };
        (
            dim(self.uls, self.lrs, self.mask[0]),
            dim(self.ult, self.lrt, self.mask[1]),
        )
    }

    /// Top-left of the tile in texels.
    pub fn origin(&self) -> [f32; 2] {
        [self.uls as f32 / 4.0, self.ult as f32 / 4.0]
    }
}

/// Where a TMEM region's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmemLoad {
    /// RAM address of the first texel loaded.
    pub address: u32,
    /// Bytes between rows in RAM. Block loads have no row structure of their
    /// own; the sampling tile's line decides.
    pub ram_stride: Option<u32>,
}

/// Palette entries as loaded by `G_LOADTLUT`, in TMEM entry order.
#[derive(Debug, Clone)]
pub struct Tlut {
    pub entries: [u16; 256],
    /// RAM address each entry came from, for write invalidation.
    pub address: u32,
    pub loaded: bool,
}

impl Default for Tlut {
    fn default() -> Self {
        Self {
            entries: [0; 256],
            address: 0,
            loaded: false,
        }
    }
}

/// Palette format selected by othermode H.
pub fn tlut_format(othermode_h: u32) -> PaletteFormat {
    match field(othermode_h, gbi::G_MDSFT_TEXTLUT, 2) {
        gbi::G_TT_IA16 => PaletteFormat::Ia16,
        _ => PaletteFormat::Rgba5551,
    }
}

/// Replace `len` bits at `shift` of `word` with the same bits of `data`.
pub fn set_bits(word: u32, shift: u32, len: u32, data: u32) -> u32 {
    if shift >= 32 || len == 0 {
        return word;
    }
    let mask = ((((1u64 << len.min(32)) - 1) << shift) & 0xFFFF_FFFF) as u32;
    (word & !mask) | (data & mask)
}
