//! Render commands passed from the interpreter to the render thread.
//!
//! Each command occupies one ring buffer claim: an 8-byte header
//! (`opcode: u16`, `flags: u16`, `payload_len: u32`, all little-endian)
//! followed by the payload. Console memory never crosses this boundary by
//! reference; texture bytes are copied into the payload.

use std::fmt;

use thiserror::Error;

use crate::backend::{FillRect, Vertex};
use crate::color_reader::ReadColorBufferParams;
use crate::combiner::CombinerFlags;
use crate::format::{Palette, PaletteFormat, PixelFormat};

pub const COMMAND_HEADER_LEN: usize = 8;

/// Bytes of texture memory on the RDP; no single texture load exceeds it.
pub const TMEM_BYTES: usize = 4096;
pub const MAX_PALETTE_ENTRIES: usize = 256;

/// Largest payload a well-formed command carries.
pub const MAX_PAYLOAD_BYTES: usize = 8192;
/// Header plus the largest payload; the ring buffer must hold at least this.
pub const MAX_COMMAND_BYTES: usize = COMMAND_HEADER_LEN + MAX_PAYLOAD_BYTES;

/// Vertices per `DrawTriangles` command; longer batches are split.
pub const MAX_BATCH_VERTICES: usize = 96;
pub const MAX_BATCH_RECTS: usize = 64;
pub const MAX_BATCH_FILLS: usize = 128;

const VERTEX_WIRE_LEN: usize = 40;
const RECT_WIRE_LEN: usize = 32;
const FILL_WIRE_LEN: usize = 12;
const TEXTURE_HEADER_LEN: usize = 28;
const NO_PALETTE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    SetCombine = 0x0001,
    SetOtherModes = 0x0002,
    SetColors = 0x0003,

    LoadTexture = 0x0010,
    InvalidateRange = 0x0011,
    CaptureColorBuffer = 0x0012,

    DrawTriangles = 0x0020,
    DrawRects = 0x0021,
    FillRects = 0x0022,

    EndFrame = 0x0030,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0001 => Self::SetCombine,
            0x0002 => Self::SetOtherModes,
            0x0003 => Self::SetColors,
            0x0010 => Self::LoadTexture,
            0x0011 => Self::InvalidateRange,
            0x0012 => Self::CaptureColorBuffer,
            0x0020 => Self::DrawTriangles,
            0x0021 => Self::DrawRects,
            0x0022 => Self::FillRects,
            0x0030 => Self::EndFrame,
            _ => return None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Constant colors as the RDP holds them: `0xRRGGBBAA`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColorState {
    pub prim: u32,
    pub env: u32,
    pub fog: u32,
    pub blend: u32,
    /// Raw fill word; its layout depends on the color image size.
    pub fill: u32,
    pub key_center: u32,
    pub key_scale: u32,
    /// 9-bit signed color conversion constants.
    pub k4: i16,
    pub k5: i16,
    pub prim_lod_frac: u8,
    pub prim_min_level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureLoad {
    /// Texture unit, 0 or 1.
    pub slot: u8,
    pub address: u32,
    /// Bytes of console memory spanned by the rows that were read, starting
    /// at `address`. Larger than `bytes` when rows were strided.
    pub source_len: u32,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub palette: Option<Palette>,
    pub bytes: Vec<u8>,
}

/// Bind a region of the current render target as a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorCapture {
    pub slot: u8,
    /// Console address the game sampled from, used as the cache identity.
    pub address: u32,
    pub params: ReadColorBufferParams,
}

/// A screen-space rectangle in console pixels with normalized texture
/// coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TexturedRect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub s0: f32,
    pub t0: f32,
    pub s1: f32,
    pub t1: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderCommand {
    SetCombine { mux: u64, flags: CombinerFlags },
    SetOtherModes { h: u32, l: u32 },
    SetColors(ColorState),
    LoadTexture(TextureLoad),
    InvalidateRange { address: u32, len: u32 },
    CaptureColorBuffer(ColorCapture),
    /// A triangle list; the length is a multiple of three.
    DrawTriangles(Vec<Vertex>),
    DrawRects(Vec<TexturedRect>),
    FillRects(Vec<FillRect>),
    EndFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("command header truncated ({0} bytes)")]
    HeaderTooShort(usize),

    #[error("unknown render opcode {0:#06x}")]
    UnknownOpcode(u16),

    #[error("payload length {declared} does not match {actual} available bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload of {0} bytes exceeds the command size limit")]
    PayloadTooLarge(usize),

    #[error("{opcode} payload truncated")]
    Truncated { opcode: Opcode },

    #[error("{opcode} has {extra} trailing bytes")]
    TrailingBytes { opcode: Opcode, extra: usize },

    #[error("{opcode} field `{field}` has invalid value {value}")]
    InvalidField {
        opcode: Opcode,
        field: &'static str,
        value: u32,
    },
}

impl RenderCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            RenderCommand::SetCombine { .. } => Opcode::SetCombine,
            RenderCommand::SetOtherModes { .. } => Opcode::SetOtherModes,
            RenderCommand::SetColors(_) => Opcode::SetColors,
            RenderCommand::LoadTexture(_) => Opcode::LoadTexture,
            RenderCommand::InvalidateRange { .. } => Opcode::InvalidateRange,
            RenderCommand::CaptureColorBuffer(_) => Opcode::CaptureColorBuffer,
            RenderCommand::DrawTriangles(_) => Opcode::DrawTriangles,
            RenderCommand::DrawRects(_) => Opcode::DrawRects,
            RenderCommand::FillRects(_) => Opcode::FillRects,
            RenderCommand::EndFrame => Opcode::EndFrame,
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            RenderCommand::SetCombine { .. } => 12,
            RenderCommand::SetOtherModes { .. } => 8,
            RenderCommand::SetColors(_) => 36,
            RenderCommand::LoadTexture(load) => {
                TEXTURE_HEADER_LEN
                    + load.palette.as_ref().map_or(0, |p| p.entries.len() * 2)
                    + load.bytes.len()
            }
            RenderCommand::InvalidateRange { .. } => 8,
            RenderCommand::CaptureColorBuffer(_) => 24,
            RenderCommand::DrawTriangles(v) => 4 + v.len() * VERTEX_WIRE_LEN,
            RenderCommand::DrawRects(r) => 4 + r.len() * RECT_WIRE_LEN,
            RenderCommand::FillRects(r) => 4 + r.len() * FILL_WIRE_LEN,
            RenderCommand::EndFrame => 0,
        }
    }

    pub fn encoded_len(&self) -> usize {
        COMMAND_HEADER_LEN + self.payload_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Append the header and payload to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.opcode() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // flags/reserved
        out.extend_from_slice(&(self.payload_len() as u32).to_le_bytes());

        match self {
            RenderCommand::SetCombine { mux, flags } => {
                out.extend_from_slice(&mux.to_le_bytes());
                out.extend_from_slice(&flags.bits().to_le_bytes());
            }
            RenderCommand::SetOtherModes { h, l } => {
                out.extend_from_slice(&h.to_le_bytes());
                out.extend_from_slice(&l.to_le_bytes());
            }
            RenderCommand::SetColors(c) => {
                for v in [c.prim, c.env, c.fog, c.blend, c.fill, c.key_center, c.key_scale] {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                out.extend_from_slice(&c.k4.to_le_bytes());
                out.extend_from_slice(&c.k5.to_le_bytes());
                out.push(c.prim_lod_frac);
                out.push(c.prim_min_level);
                out.extend_from_slice(&0u16.to_le_bytes());
            }
            RenderCommand::LoadTexture(load) => {
                let entries = load.palette.as_ref().map_or(&[][..], |p| &p.entries[..]);
                out.push(load.slot);
                out.push(load.format as u8);
                out.push(load.palette.as_ref().map_or(NO_PALETTE, |p| p.format as u8));
                out.push(0);
                out.extend_from_slice(&load.address.to_le_bytes());
                out.extend_from_slice(&load.width.to_le_bytes());
                out.extend_from_slice(&load.height.to_le_bytes());
                out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes());
                out.extend_from_slice(&(load.bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(&load.source_len.to_le_bytes());
                for e in entries {
                    out.extend_from_slice(&e.to_le_bytes());
                }
                out.extend_from_slice(&load.bytes);
            }
            RenderCommand::InvalidateRange { address, len } => {
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
            }
            RenderCommand::CaptureColorBuffer(cap) => {
                out.push(cap.slot);
                out.push(cap.params.bit_depth);
                out.push(cap.params.synchronous as u8);
                out.push(0);
                out.extend_from_slice(&cap.address.to_le_bytes());
                for v in [cap.params.x0, cap.params.y0, cap.params.width, cap.params.height] {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            RenderCommand::DrawTriangles(vertices) => {
                out.extend_from_slice(&(vertices.len() as u32).to_le_bytes());
                for v in vertices {
                    for f in v.position.iter().chain(&v.color).chain(&v.uv) {
                        out.extend_from_slice(&f.to_le_bytes());
                    }
                }
            }
            RenderCommand::DrawRects(rects) => {
                out.extend_from_slice(&(rects.len() as u32).to_le_bytes());
                for r in rects {
                    for f in [r.x0, r.y0, r.x1, r.y1, r.s0, r.t0, r.s1, r.t1] {
                        out.extend_from_slice(&f.to_le_bytes());
                    }
                }
            }
            RenderCommand::FillRects(rects) => {
                out.extend_from_slice(&(rects.len() as u32).to_le_bytes());
                for r in rects {
                    for v in [r.x0, r.y0, r.x1, r.y1] {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                    out.extend_from_slice(&r.color);
                }
            }
            RenderCommand::EndFrame => {}
        }
    }

    /// Parse exactly one command occupying all of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < COMMAND_HEADER_LEN {
            return Err(DecodeError::HeaderTooShort(bytes.len()));
        }
        let raw_opcode = u16::from_le_bytes([bytes[0], bytes[1]]);
        let declared = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let opcode = Opcode::from_u16(raw_opcode).ok_or(DecodeError::UnknownOpcode(raw_opcode))?;
        if declared > MAX_PAYLOAD_BYTES {
            return Err(DecodeError::PayloadTooLarge(declared));
        }
        let payload = &bytes[COMMAND_HEADER_LEN..];
        if payload.len() != declared {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        let mut r = Reader {
            opcode,
            bytes: payload,
            pos: 0,
        };
        let cmd = match opcode {
            Opcode::SetCombine => {
                let mux = r.u64()?;
                let flags = r.u32()?;
                RenderCommand::SetCombine {
                    mux,
                    flags: CombinerFlags::from_bits(flags).ok_or(DecodeError::InvalidField {
                        opcode,
                        field: "flags",
                        value: flags,
                    })?,
                }
            }
            Opcode::SetOtherModes => RenderCommand::SetOtherModes {
                h: r.u32()?,
                l: r.u32()?,
            },
            Opcode::SetColors => {
                let c = ColorState {
                    prim: r.u32()?,
                    env: r.u32()?,
                    fog: r.u32()?,
                    blend: r.u32()?,
                    fill: r.u32()?,
                    key_center: r.u32()?,
                    key_scale: r.u32()?,
                    k4: r.u16()? as i16,
                    k5: r.u16()? as i16,
                    prim_lod_frac: r.u8()?,
                    prim_min_level: r.u8()?,
                };
                r.u16()?;
                RenderCommand::SetColors(c)
            }
            Opcode::LoadTexture => RenderCommand::LoadTexture(decode_texture(&mut r)?),
            Opcode::InvalidateRange => RenderCommand::InvalidateRange {
                address: r.u32()?,
                len: r.u32()?,
            },
            Opcode::CaptureColorBuffer => {
                let slot = r.slot()?;
                let bit_depth = r.u8()?;
                if bit_depth != 16 && bit_depth != 32 {
                    return Err(r.invalid("bit_depth", bit_depth as u32));
                }
                let synchronous = r.u8()? != 0;
                r.u8()?;
                let address = r.u32()?;
                RenderCommand::CaptureColorBuffer(ColorCapture {
                    slot,
                    address,
                    params: ReadColorBufferParams {
                        x0: r.u32()?,
                        y0: r.u32()?,
                        width: r.u32()?,
                        height: r.u32()?,
                        bit_depth,
                        synchronous,
                    },
                })
            }
            Opcode::DrawTriangles => {
                let count = r.count(VERTEX_WIRE_LEN)?;
                if count % 3 != 0 {
                    return Err(r.invalid("vertex_count", count as u32));
                }
                let mut vertices = Vec::with_capacity(count);
                for _ in 0..count {
                    vertices.push(Vertex {
                        position: [r.f32()?, r.f32()?, r.f32()?, r.f32()?],
                        color: [r.f32()?, r.f32()?, r.f32()?, r.f32()?],
                        uv: [r.f32()?, r.f32()?],
                    });
                }
                RenderCommand::DrawTriangles(vertices)
            }
            Opcode::DrawRects => {
                let count = r.count(RECT_WIRE_LEN)?;
                let mut rects = Vec::with_capacity(count);
                for _ in 0..count {
                    rects.push(TexturedRect {
                        x0: r.f32()?,
                        y0: r.f32()?,
                        x1: r.f32()?,
                        y1: r.f32()?,
                        s0: r.f32()?,
                        t0: r.f32()?,
                        s1: r.f32()?,
                        t1: r.f32()?,
                    });
                }
                RenderCommand::DrawRects(rects)
            }
            Opcode::FillRects => {
                let count = r.count(FILL_WIRE_LEN)?;
                let mut rects = Vec::with_capacity(count);
                for _ in 0..count {
                    rects.push(FillRect {
                        x0: r.u16()?,
                        y0: r.u16()?,
                        x1: r.u16()?,
                        y1: r.u16()?,
                        color: [r.u8()?, r.u8()?, r.u8()?, r.u8()?],
                    });
                }
                RenderCommand::FillRects(rects)
            }
            Opcode::EndFrame => RenderCommand::EndFrame,
        };
        r.finish()?;
        Ok(cmd)
    }
}

fn decode_texture(r: &mut Reader<'_>) -> Result<TextureLoad, DecodeError> {
    let slot = r.slot()?;
    let raw_format = r.u8()?;
    let format =
        PixelFormat::from_u8(raw_format).ok_or_else(|| r.invalid("format", raw_format as u32))?;
    let raw_palette = r.u8()?;
    r.u8()?;
    let address = r.u32()?;
    let width = r.u32()?;
    let height = r.u32()?;
    let palette_len = r.u16()? as usize;
    r.u16()?;
    let bytes_len = r.u32()? as usize;
    let source_len = r.u32()?;

    if palette_len > MAX_PALETTE_ENTRIES {
        return Err(r.invalid("palette_len", palette_len as u32));
    }
    if bytes_len > TMEM_BYTES {
        return Err(r.invalid("bytes_len", bytes_len as u32));
    }
    let palette = match raw_palette {
        NO_PALETTE if palette_len == 0 => None,
        NO_PALETTE => return Err(r.invalid("palette_len", palette_len as u32)),
        raw => {
            let format = PaletteFormat::from_u8(raw)
                .ok_or_else(|| r.invalid("palette_format", raw as u32))?;
            let mut entries = Vec::with_capacity(palette_len);
            for _ in 0..palette_len {
                entries.push(r.u16()?);
            }
            Some(Palette::new(format, entries))
        }
    };
    let bytes = r.take(bytes_len)?.to_vec();
    Ok(TextureLoad {
        slot,
        address,
        source_len,
        format,
        width,
        height,
        palette,
        bytes,
    })
}

struct Reader<'a> {
    opcode: Opcode,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let slice = self
            .pos
            .checked_add(n)
            .and_then(|end| self.bytes.get(self.pos..end))
            .ok_or(DecodeError::Truncated {
                opcode: self.opcode,
            })?;
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.array().map(u64::from_le_bytes)
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        self.array().map(f32::from_le_bytes)
    }

    fn slot(&mut self) -> Result<u8, DecodeError> {
        let slot = self.u8()?;
        if slot > 1 {
            return Err(self.invalid("slot", slot as u32));
        }
        Ok(slot)
    }

    /// Element count prefix, checked against the bytes that follow.
    fn count(&mut self, element_len: usize) -> Result<usize, DecodeError> {
        let count = self.u32()? as usize;
        let remaining = self.bytes.len() - self.pos;
        if count.checked_mul(element_len) != Some(remaining) {
            return Err(self.invalid("count", count as u32));
        }
        Ok(count)
    }

    fn invalid(&self, field: &'static str, value: u32) -> DecodeError {
        DecodeError::InvalidField {
            opcode: self.opcode,
            field,
            value,
        }
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes {
                opcode: self.opcode,
                extra,
            }),
        }
    }
}
