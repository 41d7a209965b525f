//! F3DEX2 Graphics Binary Interface: opcodes and the bit fields the
//! interpreter decodes.
//!
//! Every command is 64 bits, two big-endian words. The top byte of the first
//! word is the opcode.

// RSP geometry and control flow.
pub const G_SPNOOP: u8 = 0x00;
pub const G_VTX: u8 = 0x01;
pub const G_MODIFYVTX: u8 = 0x02;
pub const G_CULLDL: u8 = 0x03;
pub const G_BRANCH_Z: u8 = 0x04;
pub const G_TRI1: u8 = 0x05;
pub const G_TRI2: u8 = 0x06;
pub const G_QUAD: u8 = 0x07;
pub const G_SPECIAL_3: u8 = 0xD3;
pub const G_SPECIAL_2: u8 = 0xD4;
pub const G_SPECIAL_1: u8 = 0xD5;
pub const G_DMA_IO: u8 = 0xD6;
pub const G_TEXTURE: u8 = 0xD7;
pub const G_POPMTX: u8 = 0xD8;
pub const G_GEOMETRYMODE: u8 = 0xD9;
pub const G_MTX: u8 = 0xDA;
pub const G_MOVEWORD: u8 = 0xDB;
pub const G_MOVEMEM: u8 = 0xDC;
pub const G_LOAD_UCODE: u8 = 0xDD;
pub const G_DL: u8 = 0xDE;
pub const G_ENDDL: u8 = 0xDF;
pub const G_NOOP: u8 = 0xE0;
pub const G_RDPHALF_1: u8 = 0xE1;
pub const G_SETOTHERMODE_L: u8 = 0xE2;
pub const G_SETOTHERMODE_H: u8 = 0xE3;

// RDP commands passed through by the microcode.
pub const G_TEXRECT: u8 = 0xE4;
pub const G_TEXRECTFLIP: u8 = 0xE5;
pub const G_RDPLOADSYNC: u8 = 0xE6;
pub const G_RDPPIPESYNC: u8 = 0xE7;
pub const G_RDPTILESYNC: u8 = 0xE8;
pub const G_RDPFULLSYNC: u8 = 0xE9;
pub const G_SETKEYGB: u8 = 0xEA;
pub const G_SETKEYR: u8 = 0xEB;
pub const G_SETCONVERT: u8 = 0xEC;
pub const G_SETSCISSOR: u8 = 0xED;
pub const G_SETPRIMDEPTH: u8 = 0xEE;
pub const G_RDPSETOTHERMODE: u8 = 0xEF;
pub const G_LOADTLUT: u8 = 0xF0;
pub const G_RDPHALF_2: u8 = 0xF1;
pub const G_SETTILESIZE: u8 = 0xF2;
pub const G_LOADBLOCK: u8 = 0xF3;
pub const G_LOADTILE: u8 = 0xF4;
pub const G_SETTILE: u8 = 0xF5;
pub const G_FILLRECT: u8 = 0xF6;
pub const G_SETFILLCOLOR: u8 = 0xF7;
pub const G_SETFOGCOLOR: u8 = 0xF8;
pub const G_SETBLENDCOLOR: u8 = 0xF9;
pub const G_SETPRIMCOLOR: u8 = 0xFA;
pub const G_SETENVCOLOR: u8 = 0xFB;
pub const G_SETCOMBINE: u8 = 0xFC;
pub const G_SETTIMG: u8 = 0xFD;
pub const G_SETZIMG: u8 = 0xFE;
pub const G_SETCIMG: u8 = 0xFF;

// G_MTX parameter bits, after undoing the microcode's inverted push bit.
pub const G_MTX_PUSH: u32 = 0x01;
pub const G_MTX_LOAD: u32 = 0x02;
pub const G_MTX_PROJECTION: u32 = 0x04;

// G_MOVEWORD indices.
pub const G_MW_NUMLIGHT: u32 = 0x02;
pub const G_MW_SEGMENT: u32 = 0x06;
pub const G_MW_FOG: u32 = 0x08;
pub const G_MW_LIGHTCOL: u32 = 0x0A;
pub const G_MW_PERSPNORM: u32 = 0x0E;

// G_MOVEMEM indices.
pub const G_MV_VIEWPORT: u32 = 0x08;
pub const G_MV_LIGHT: u32 = 0x0A;

// G_MODIFYVTX targets.
pub const G_MWO_POINT_RGBA: u32 = 0x10;
pub const G_MWO_POINT_ST: u32 = 0x14;

// Othermode fields.
pub const G_MDSFT_CYCLETYPE: u32 = 20;
pub const G_MDSFT_TEXTLUT: u32 = 14;
pub const G_CYC_1CYCLE: u32 = 0;
pub const G_CYC_2CYCLE: u32 = 1;
pub const G_CYC_COPY: u32 = 2;
pub const G_CYC_FILL: u32 = 3;
pub const G_TT_RGBA16: u32 = 2;
pub const G_TT_IA16: u32 = 3;

pub const G_AC_MASK: u32 = 0x3;
pub const Z_CMP: u32 = 0x10;
pub const CVG_X_ALPHA: u32 = 0x1000;
pub const ALPHA_CVG_SEL: u32 = 0x2000;

/// Image size field: 0 = 4 bit, 1 = 8 bit, 2 = 16 bit, 3 = 32 bit.
pub const G_IM_SIZ_16B: u8 = 2;

/// Byte length of one command.
pub const COMMAND_LEN: u32 = 8;

/// `gsDPSetCombineMode(G_CC_DECALRGBA, G_CC_DECALRGBA)`, what copy mode
/// effectively does.
pub const DECAL_RGBA_MUX: u64 = 0x00FF_FFFF_FFFC_F279;

bitflags::bitflags! {
    /// F3DEX2 geometry mode bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct GeometryMode: u32 {
        const ZBUFFER = 0x0000_0001;
        const SHADE = 0x0000_0004;
        const CULL_FRONT = 0x0000_0200;
        const CULL_BACK = 0x0000_0400;
        const FOG = 0x0001_0000;
        const LIGHTING = 0x0002_0000;
        const TEXTURE_GEN = 0x0004_0000;
        const TEXTURE_GEN_LINEAR = 0x0008_0000;
        const SHADING_SMOOTH = 0x0020_0000;
        const CLIPPING = 0x0080_0000;
    }
}

/// Extract `bits` bits of `word` starting at `shift`.
#[inline]
pub fn field(word: u32, shift: u32, bits: u32) -> u32 {
    (word >> shift) & ((1 << bits) - 1)
}

/// Name of an opcode for diagnostics.
pub fn opcode_name(op: u8) -> &'static str {
    match op {
        G_SPNOOP => "G_SPNOOP",
        G_VTX => "G_VTX",
        G_MODIFYVTX => "G_MODIFYVTX",
        G_CULLDL => "G_CULLDL",
        G_BRANCH_Z => "G_BRANCH_Z",
        G_TRI1 => "G_TRI1",
        G_TRI2 => "G_TRI2",
        G_QUAD => "G_QUAD",
        G_SPECIAL_3 => "G_SPECIAL_3",
        G_SPECIAL_2 => "G_SPECIAL_2",
        G_SPECIAL_1 => "G_SPECIAL_1",
        G_DMA_IO => "G_DMA_IO",
        G_TEXTURE => "G_TEXTURE",
        G_POPMTX => "G_POPMTX",
        G_GEOMETRYMODE => "G_GEOMETRYMODE",
        G_MTX => "G_MTX",
        G_MOVEWORD => "G_MOVEWORD",
        G_MOVEMEM => "G_MOVEMEM",
        G_LOAD_UCODE => "G_LOAD_UCODE",
        G_DL => "G_DL",
        G_ENDDL => "G_ENDDL",
        G_NOOP => "G_NOOP",
        G_RDPHALF_1 => "G_RDPHALF_1",
        G_SETOTHERMODE_L => "G_SETOTHERMODE_L",
        G_SETOTHERMODE_H => "G_SETOTHERMODE_H",
        G_TEXRECT => "G_TEXRECT",
        G_TEXRECTFLIP => "G_TEXRECTFLIP",
        G_RDPLOADSYNC => "G_RDPLOADSYNC",
        G_RDPPIPESYNC => "G_RDPPIPESYNC",
        G_RDPTILESYNC => "G_RDPTILESYNC",
        G_RDPFULLSYNC => "G_RDPFULLSYNC",
        G_SETKEYGB => "G_SETKEYGB",
        G_SETKEYR => "G_SETKEYR",
        G_SETCONVERT => "G_SETCONVERT",
        G_SETSCISSOR => "G_SETSCISSOR",
        G_SETPRIMDEPTH => "G_SETPRIMDEPTH",
        G_RDPSETOTHERMODE => "G_RDPSETOTHERMODE",
        G_LOADTLUT => "G_LOADTLUT",
        G_RDPHALF_2 => "G_RDPHALF_2",
        G_SETTILESIZE => "G_SETTILESIZE",
        G_LOADBLOCK => "G_LOADBLOCK",
        G_LOADTILE => "G_LOADTILE",
        G_SETTILE => "G_SETTILE",
        G_FILLRECT => "G_FILLRECT",
        G_SETFILLCOLOR => "G_SETFILLCOLOR",
        G_SETFOGCOLOR => "G_SETFOGCOLOR",
        G_SETBLENDCOLOR => "G_SETBLENDCOLOR",
        G_SETPRIMCOLOR => "G_SETPRIMCOLOR",
        G_SETENVCOLOR => "G_SETENVCOLOR",
        G_SETCOMBINE => "G_SETCOMBINE",
        G_SETTIMG => "G_SETTIMG",
        G_SETZIMG => "G_SETZIMG",
        G_SETCIMG => "G_SETCIMG",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_extract_bit_ranges() {
        assert_eq!(field(0xFC12_1824, 20, 4), 0x1);
        assert_eq!(field(0xFFFF_FFFF, 0, 24), 0x00FF_FFFF);
        assert_eq!(field(0x0010_0000, G_MDSFT_CYCLETYPE, 2), G_CYC_2CYCLE);
    }

    #[test]
    fn names_cover_the_dispatch_table() {
        assert_eq!(opcode_name(G_DL), "G_DL");
        assert_eq!(opcode_name(G_SETCIMG), "G_SETCIMG");
        assert_eq!(opcode_name(0x42), "UNKNOWN");
    }
}
