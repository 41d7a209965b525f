//! Color combiner decoding and program generation.
//!
//! The RDP combiner evaluates `(A - B) * C + D` for color and alpha in each
//! of up to two cycles. `G_SETCOMBINE` packs the sixteen selectors into 56
//! bits:
//!
//! ```text
//! w0: a0:4@20 c0:5@15 Aa0:3@12 Ac0:3@9 a1:4@5 c1:5@0
//! w1: b0:4@28 b1:4@24 Aa1:3@21 Ac1:3@18 d0:3@15 Ab0:3@12 Ad0:3@9 d1:3@6 Ab1:3@3 Ad1:3@0
//! ```

mod cache;
mod wgsl;

use serde::{Deserialize, Serialize};

pub use cache::{CombinerProgram, CombinerProgramCache, CombinerStats};
pub(crate) use wgsl::rgba_to_f32;
pub use wgsl::{generate_wgsl, passthrough_wgsl, CombinerUniforms, UniformField, UniformLayout};

/// Inputs selectable by the color half of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorInput {
    Combined,
    Texel0,
    Texel1,
    Primitive,
    Shade,
    Environment,
    One,
    Noise,
    Zero,
    KeyCenter,
    K4,
    KeyScale,
    CombinedAlpha,
    Texel0Alpha,
    Texel1Alpha,
    PrimitiveAlpha,
    ShadeAlpha,
    EnvAlpha,
    LodFraction,
    PrimLodFraction,
    K5,
}

/// Inputs selectable by the alpha half of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlphaInput {
    Combined,
    Texel0,
    Texel1,
    Primitive,
    Shade,
    Environment,
    One,
    Zero,
    LodFraction,
    PrimLodFraction,
}

const COMMON: [ColorInput; 6] = [
    ColorInput::Combined,
    ColorInput::Texel0,
    ColorInput::Texel1,
    ColorInput::Primitive,
    ColorInput::Shade,
    ColorInput::Environment,
];

fn color_a(v: u32) -> ColorInput {
    match v {
        0..=5 => COMMON[v as usize],
        6 => ColorInput::One,
        7 => ColorInput::Noise,
        _ => ColorInput::Zero,
    }
}

fn color_b(v: u32) -> ColorInput {
    match v {
        0..=5 => COMMON[v as usize],
        6 => ColorInput::KeyCenter,
        7 => ColorInput::K4,
        _ => ColorInput::Zero,
    }
}

fn color_c(v: u32) -> ColorInput {
    match v {
        0..=5 => COMMON[v as usize],
        6 => ColorInput::KeyScale,
        7 => ColorInput::CombinedAlpha,
        8 => ColorInput::Texel0Alpha,
        9 => ColorInput::Texel1Alpha,
        10 => ColorInput::PrimitiveAlpha,
        11 => ColorInput::ShadeAlpha,
        12 => ColorInput::EnvAlpha,
        13 => ColorInput::LodFraction,
        14 => ColorInput::PrimLodFraction,
        15 => ColorInput::K5,
        _ => ColorInput::Zero,
    }
}

fn color_d(v: u32) -> ColorInput {
    match v {
        0..=5 => COMMON[v as usize],
        6 => ColorInput::One,
        _ => ColorInput::Zero,
    }
}

fn alpha_abd(v: u32) -> AlphaInput {
    match v {
        0 => AlphaInput::Combined,
        1 => AlphaInput::Texel0,
        2 => AlphaInput::Texel1,
        3 => AlphaInput::Primitive,
        4 => AlphaInput::Shade,
        5 => AlphaInput::Environment,
        6 => AlphaInput::One,
        _ => AlphaInput::Zero,
    }
}

fn alpha_c(v: u32) -> AlphaInput {
    match v {
        0 => AlphaInput::LodFraction,
        1 => AlphaInput::Texel0,
        2 => AlphaInput::Texel1,
        3 => AlphaInput::Primitive,
        4 => AlphaInput::Shade,
        5 => AlphaInput::Environment,
        6 => AlphaInput::PrimLodFraction,
        _ => AlphaInput::Zero,
    }
}

/// `(a - b) * c + d` for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cycle<T> {
    pub a: T,
    pub b: T,
    pub c: T,
    pub d: T,
}

impl<T: Copy + PartialEq> Cycle<T> {
    pub fn inputs(&self) -> [T; 4] {
        [self.a, self.b, self.c, self.d]
    }

    pub fn reads(&self, input: T) -> bool {
        self.inputs().contains(&input)
    }
}

pub type ColorCycle = Cycle<ColorInput>;
pub type AlphaCycle = Cycle<AlphaInput>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorStage {
    pub cycles: [ColorCycle; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlphaStage {
    pub cycles: [AlphaCycle; 2],
}

fn field(v: u32, shift: u32, bits: u32) -> u32 {
    (v >> shift) & ((1 << bits) - 1)
}

/// Split a 56-bit combine mux into its color and alpha stages.
pub fn decode_mux(mux: u64) -> (ColorStage, AlphaStage) {
    let w0 = (mux >> 32) as u32;
    let w1 = mux as u32;

    let color = ColorStage {
        cycles: [
            Cycle {
                a: color_a(field(w0, 20, 4)),
                b: color_b(field(w1, 28, 4)),
                c: color_c(field(w0, 15, 5)),
                d: color_d(field(w1, 15, 3)),
            },
            Cycle {
                a: color_a(field(w0, 5, 4)),
                b: color_b(field(w1, 24, 4)),
                c: color_c(field(w0, 0, 5)),
                d: color_d(field(w1, 6, 3)),
            },
        ],
    };
    let alpha = AlphaStage {
        cycles: [
            Cycle {
                a: alpha_abd(field(w0, 12, 3)),
                b: alpha_abd(field(w1, 12, 3)),
                c: alpha_c(field(w0, 9, 3)),
                d: alpha_abd(field(w1, 9, 3)),
            },
            Cycle {
                a: alpha_abd(field(w1, 21, 3)),
                b: alpha_abd(field(w1, 3, 3)),
                c: alpha_c(field(w1, 18, 3)),
                d: alpha_abd(field(w1, 0, 3)),
            },
        ],
    };
    (color, alpha)
}

bitflags::bitflags! {
    /// Render state folded into the combiner key because it changes the
    /// generated program.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct CombinerFlags: u32 {
        const TWO_CYCLE = 1 << 0;
        const TEXTURE_PRESENT = 1 << 1;
        const DEPTH_COMPARE = 1 << 2;
        const ALPHA_COMPARE = 1 << 3;
        const ALPHA_CVG_SEL = 1 << 4;
        const CVG_X_ALPHA = 1 << 5;
        const FOG = 1 << 6;
    }
}

/// Identity of a combiner program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CombinerKey {
    /// The 56 meaningful bits of `G_SETCOMBINE`.
    pub mux: u64,
    pub flags: CombinerFlags,
}

impl CombinerKey {
    pub const MUX_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

    pub fn new(mux: u64, flags: CombinerFlags) -> Self {
        Self {
            mux: mux & Self::MUX_MASK,
            flags,
        }
    }

    /// Build the mux from the two command halves of `G_SETCOMBINE`.
    pub fn from_words(w0: u32, w1: u32, flags: CombinerFlags) -> Self {
        Self::new(((w0 & 0x00FF_FFFF) as u64) << 32 | w1 as u64, flags)
    }

    pub fn packed(&self) -> u128 {
        (self.flags.bits() as u128) << 64 | self.mux as u128
    }

    pub fn from_packed(packed: u128) -> Self {
        Self::new(
            packed as u64,
            CombinerFlags::from_bits_truncate((packed >> 64) as u32),
        )
    }

    pub fn stages(&self) -> (ColorStage, AlphaStage) {
        decode_mux(self.mux)
    }

    pub fn is_two_cycle(&self) -> bool {
        self.flags.contains(CombinerFlags::TWO_CYCLE)
    }
}

/// How faithfully inputs without a cheap GPU equivalent are emulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinerAccuracy {
    /// Noise is a constant 0.5; LOD fraction uses the primitive LOD fraction.
    #[default]
    Fast,
    /// Per-pixel noise; LOD fraction from screen-space derivatives when the
    /// backend supports them.
    Accurate,
}
