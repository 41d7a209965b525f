//! Conversion between the console's texel encodings and canonical RGBA8888.
//!
//! Console data is big-endian and packed row by row without padding; 4-bit
//! formats store the left texel in the high nibble. The canonical side is
//! always 4 bytes per pixel in `R, G, B, A` order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of console pixel encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PixelFormat {
    /// 16-bit, 5 bits per color channel plus a 1-bit alpha.
    Rgba5551 = 0,
    Rgb565 = 1,
    Rgba8888 = 2,
    /// 3-bit intensity, 1-bit alpha.
    Ia4 = 3,
    Ia8 = 4,
    Ia16 = 5,
    I4 = 6,
    I8 = 7,
    Ci4 = 8,
    Ci8 = 9,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 10] = [
        PixelFormat::Rgba5551,
        PixelFormat::Rgb565,
        PixelFormat::Rgba8888,
        PixelFormat::Ia4,
        PixelFormat::Ia8,
        PixelFormat::Ia16,
        PixelFormat::I4,
        PixelFormat::I8,
        PixelFormat::Ci4,
        PixelFormat::Ci8,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Map an RDP tile `fmt`/`siz` pair onto a pixel format.
    ///
    /// YUV and the odd size combinations the hardware does not sample return
    /// `None`.
    pub fn from_n64(fmt: u8, siz: u8) -> Option<Self> {
        Some(match (fmt, siz) {
            (0, 2) => PixelFormat::Rgba5551,
            (0, 3) => PixelFormat::Rgba8888,
            (2, 0) => PixelFormat::Ci4,
            (2, 1) => PixelFormat::Ci8,
            (3, 0) => PixelFormat::Ia4,
            (3, 1) => PixelFormat::Ia8,
            (3, 2) => PixelFormat::Ia16,
            (4, 0) => PixelFormat::I4,
            (4, 1) => PixelFormat::I8,
            _ => return None,
        })
    }

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Ia4 | PixelFormat::I4 | PixelFormat::Ci4 => 4,
            PixelFormat::Ia8 | PixelFormat::I8 | PixelFormat::Ci8 => 8,
            PixelFormat::Rgba5551 | PixelFormat::Rgb565 | PixelFormat::Ia16 => 16,
            PixelFormat::Rgba8888 => 32,
        }
    }

    pub fn is_indexed(self) -> bool {
        matches!(self, PixelFormat::Ci4 | PixelFormat::Ci8)
    }

    /// Packed size of one row of `width` pixels.
    pub fn row_bytes(self, width: u32) -> usize {
        (width as usize * self.bits_per_pixel() as usize).div_ceil(8)
    }

    /// Packed size of a `width` x `height` image, `None` on overflow.
    pub fn image_bytes(self, width: u32, height: u32) -> Option<usize> {
        self.row_bytes(width).checked_mul(height as usize)
    }
}

/// Encoding of the 16-bit entries of a color index palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PaletteFormat {
    Rgba5551 = 0,
    Ia16 = 1,
}

impl PaletteFormat {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PaletteFormat::Rgba5551),
            1 => Some(PaletteFormat::Ia16),
            _ => None,
        }
    }
}

/// A snapshot of palette entries taken when the palette was loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Palette {
    pub format: PaletteFormat,
    pub entries: Vec<u16>,
}

impl Palette {
    pub fn new(format: PaletteFormat, entries: Vec<u16>) -> Self {
        Self { format, entries }
    }

    /// Entries as they are laid out in console memory.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        self.entries.iter().flat_map(|e| e.to_be_bytes()).collect()
    }

    fn lookup(&self, index: usize) -> [u8; 4] {
        let Some(last) = self.entries.len().checked_sub(1) else {
            return [0, 0, 0, 0];
        };
        let entry = self.entries[index.min(last)];
        match self.format {
            PaletteFormat::Rgba5551 => decode_5551(entry),
            PaletteFormat::Ia16 => {
                let [i, a] = entry.to_be_bytes();
                [i, i, i, a]
            }
        }
    }
}

/// Narrowing strategy used when encoding to a format with fewer bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertQuality {
    /// Per-channel rounding through a lookup table.
    #[default]
    Fast,
    /// Floyd-Steinberg error diffusion across scanlines.
    Quality,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("source buffer too short: need {needed} bytes, have {actual}")]
    SourceTooShort { needed: usize, actual: usize },

    #[error("{0:?} requires a palette")]
    MissingPalette(PixelFormat),

    #[error("conversion from {from:?} to {to:?} is not supported")]
    Unsupported { from: PixelFormat, to: PixelFormat },

    #[error("image dimensions {width}x{height} overflow")]
    Overflow { width: u32, height: u32 },
}

/// Expansion from an N-bit channel to 8 bits: `round(v * 255 / (2^N - 1))`.
pub static EXPAND_1: [u8; 2] = expand_table::<2>();
pub static EXPAND_3: [u8; 8] = expand_table::<8>();
pub static EXPAND_4: [u8; 16] = expand_table::<16>();
pub static EXPAND_5: [u8; 32] = expand_table::<32>();
pub static EXPAND_6: [u8; 64] = expand_table::<64>();

/// Narrowing from 8 bits to N bits: `round(v * (2^N - 1) / 255)`.
pub static NARROW_1: [u8; 256] = narrow_table(1);
pub static NARROW_3: [u8; 256] = narrow_table(3);
pub static NARROW_4: [u8; 256] = narrow_table(4);
pub static NARROW_5: [u8; 256] = narrow_table(5);
pub static NARROW_6: [u8; 256] = narrow_table(6);

const fn expand_table<const N: usize>() -> [u8; N] {
    let max = (N - 1) as u32;
    let mut out = [0u8; N];
    let mut v = 0;
    while v < N {
        // `max` is odd, so the quotient never lands exactly on .5.
        out[v] = ((v as u32 * 255 + max / 2) / max) as u8;
        v += 1;
    }
    out
}

const fn narrow_table(bits: u32) -> [u8; 256] {
    let max = (1u32 << bits) - 1;
    let mut out = [0u8; 256];
    let mut v = 0;
    while v < 256 {
        out[v] = ((v as u32 * max + 127) / 255) as u8;
        v += 1;
    }
    out
}

fn expand(bits: u8, v: u8) -> u8 {
    match bits {
        1 => EXPAND_1[v as usize & 0x1],
        3 => EXPAND_3[v as usize & 0x7],
        4 => EXPAND_4[v as usize & 0xF],
        5 => EXPAND_5[v as usize & 0x1F],
        6 => EXPAND_6[v as usize & 0x3F],
        _ => v,
    }
}

fn narrow(bits: u8, v: u8) -> u8 {
    match bits {
        1 => NARROW_1[v as usize],
        3 => NARROW_3[v as usize],
        4 => NARROW_4[v as usize],
        5 => NARROW_5[v as usize],
        6 => NARROW_6[v as usize],
        _ => v,
    }
}

fn decode_5551(c: u16) -> [u8; 4] {
    [
        EXPAND_5[((c >> 11) & 0x1F) as usize],
        EXPAND_5[((c >> 6) & 0x1F) as usize],
        EXPAND_5[((c >> 1) & 0x1F) as usize],
        EXPAND_1[(c & 1) as usize],
    ]
}

/// Convert between a console format and canonical RGBA8888.
///
/// Exactly one of `src` and `dst` is expected to be [`PixelFormat::Rgba8888`]
/// (the canonical side); `Rgba8888 -> Rgba8888` is a checked copy.
pub fn convert(
    src: PixelFormat,
    dst: PixelFormat,
    width: u32,
    height: u32,
    src_buf: &[u8],
    palette: Option<&Palette>,
    quality: ConvertQuality,
) -> Result<Vec<u8>, ConvertError> {
    match (src, dst) {
        (_, PixelFormat::Rgba8888) => decode(src, width, height, src_buf, palette),
        (PixelFormat::Rgba8888, _) => encode(dst, width, height, src_buf, quality),
        _ => Err(ConvertError::Unsupported { from: src, to: dst }),
    }
}

fn checked_len(
    format: PixelFormat,
    width: u32,
    height: u32,
    actual: usize,
) -> Result<usize, ConvertError> {
    let needed = format
        .image_bytes(width, height)
        .ok_or(ConvertError::Overflow { width, height })?;
    if actual < needed {
        return Err(ConvertError::SourceTooShort { needed, actual });
    }
    Ok(needed)
}

/// Decode a console image into RGBA8888.
pub fn decode(
    format: PixelFormat,
    width: u32,
    height: u32,
    src: &[u8],
    palette: Option<&Palette>,
) -> Result<Vec<u8>, ConvertError> {
    checked_len(format, width, height, src.len())?;
    let palette = match (format.is_indexed(), palette) {
        (true, None) => return Err(ConvertError::MissingPalette(format)),
        (_, p) => p,
    };

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or(ConvertError::Overflow { width, height })?;
    let mut out = Vec::with_capacity(pixels);
    let row_bytes = format.row_bytes(width);

    for row in src.chunks_exact(row_bytes.max(1)).take(height as usize) {
        for x in 0..width as usize {
            let px = match format {
                PixelFormat::Rgba5551 => {
                    decode_5551(u16::from_be_bytes([row[x * 2], row[x * 2 + 1]]))
                }
                PixelFormat::Rgb565 => {
                    let c = u16::from_be_bytes([row[x * 2], row[x * 2 + 1]]);
                    [
                        EXPAND_5[(c >> 11) as usize],
                        EXPAND_6[((c >> 5) & 0x3F) as usize],
                        EXPAND_5[(c & 0x1F) as usize],
                        0xFF,
                    ]
                }
                PixelFormat::Rgba8888 => {
                    [row[x * 4], row[x * 4 + 1], row[x * 4 + 2], row[x * 4 + 3]]
                }
                PixelFormat::Ia4 => {
                    let n = nibble(row, x);
                    let i = EXPAND_3[(n >> 1) as usize];
                    [i, i, i, EXPAND_1[(n & 1) as usize]]
                }
                PixelFormat::Ia8 => {
                    let b = row[x];
                    let i = EXPAND_4[(b >> 4) as usize];
                    [i, i, i, EXPAND_4[(b & 0xF) as usize]]
                }
                PixelFormat::Ia16 => {
                    let i = row[x * 2];
                    [i, i, i, row[x * 2 + 1]]
                }
                PixelFormat::I4 => {
                    let i = EXPAND_4[nibble(row, x) as usize];
                    [i, i, i, i]
                }
                PixelFormat::I8 => {
                    let i = row[x];
                    [i, i, i, i]
                }
                PixelFormat::Ci4 => lookup(palette, nibble(row, x) as usize),
                PixelFormat::Ci8 => lookup(palette, row[x] as usize),
            };
            out.extend_from_slice(&px);
        }
    }
    // Zero-width rows produce no chunks; keep the output size exact.
    out.resize(pixels, 0);
    Ok(out)
}

fn nibble(row: &[u8], x: usize) -> u8 {
    let b = row[x / 2];
    if x % 2 == 0 {
        b >> 4
    } else {
        b & 0xF
    }
}

fn lookup(palette: Option<&Palette>, index: usize) -> [u8; 4] {
    palette.map_or([0, 0, 0, 0], |p| p.lookup(index))
}

/// Channel widths of each encodable format, in packing order.
fn channel_bits(format: PixelFormat) -> Option<&'static [u8]> {
    Some(match format {
        PixelFormat::Rgba5551 => &[5, 5, 5, 1],
        PixelFormat::Rgb565 => &[5, 6, 5],
        PixelFormat::Rgba8888 => &[8, 8, 8, 8],
        PixelFormat::Ia4 => &[3, 1],
        PixelFormat::Ia8 => &[4, 4],
        PixelFormat::Ia16 => &[8, 8],
        PixelFormat::I4 => &[4],
        PixelFormat::I8 => &[8],
        PixelFormat::Ci4 | PixelFormat::Ci8 => return None,
    })
}

/// Project an RGBA pixel onto the channels `channel_bits` describes.
fn channel_values(format: PixelFormat, px: &[u8]) -> [u8; 4] {
    let intensity = ((px[0] as u32 + px[1] as u32 + px[2] as u32 + 1) / 3) as u8;
    match format {
        PixelFormat::Ia4 | PixelFormat::Ia8 | PixelFormat::Ia16 => [intensity, px[3], 0, 0],
        PixelFormat::I4 | PixelFormat::I8 => [intensity, 0, 0, 0],
        _ => [px[0], px[1], px[2], px[3]],
    }
}

/// Encode RGBA8888 into a console format.
pub fn encode(
    format: PixelFormat,
    width: u32,
    height: u32,
    rgba: &[u8],
    quality: ConvertQuality,
) -> Result<Vec<u8>, ConvertError> {
    let bits = channel_bits(format).ok_or(ConvertError::Unsupported {
        from: PixelFormat::Rgba8888,
        to: format,
    })?;
    checked_len(PixelFormat::Rgba8888, width, height, rgba.len())?;

    let (w, h) = (width as usize, height as usize);
    let mut quantized: Vec<[u8; 4]> = rgba
        .chunks_exact(4)
        .take(w * h)
        .map(|px| channel_values(format, px))
        .collect();

    match quality {
        ConvertQuality::Fast => {
            for q in &mut quantized {
                for (c, &b) in bits.iter().enumerate() {
                    q[c] = narrow(b, q[c]);
                }
            }
        }
        ConvertQuality::Quality => diffuse(&mut quantized, w, h, bits),
    }

    let mut out = vec![0u8; format.row_bytes(width) * h];
    let row_bytes = format.row_bytes(width);
    for y in 0..h {
        let dst = &mut out[y * row_bytes..(y + 1) * row_bytes];
        for x in 0..w {
            let q = quantized[y * w + x];
            match format {
                PixelFormat::Rgba5551 => {
                    let c = (q[0] as u16) << 11 | (q[1] as u16) << 6 | (q[2] as u16) << 1 | q[3] as u16;
                    dst[x * 2..x * 2 + 2].copy_from_slice(&c.to_be_bytes());
                }
                PixelFormat::Rgb565 => {
                    let c = (q[0] as u16) << 11 | (q[1] as u16) << 5 | q[2] as u16;
                    dst[x * 2..x * 2 + 2].copy_from_slice(&c.to_be_bytes());
                }
                PixelFormat::Rgba8888 => dst[x * 4..x * 4 + 4].copy_from_slice(&q),
                PixelFormat::Ia4 => put_nibble(dst, x, q[0] << 1 | q[1]),
                PixelFormat::Ia8 => dst[x] = q[0] << 4 | q[1],
                PixelFormat::Ia16 => dst[x * 2..x * 2 + 2].copy_from_slice(&q[..2]),
                PixelFormat::I4 => put_nibble(dst, x, q[0]),
                PixelFormat::I8 => dst[x] = q[0],
                PixelFormat::Ci4 | PixelFormat::Ci8 => unreachable!("rejected above"),
            }
        }
    }
    Ok(out)
}

fn put_nibble(row: &mut [u8], x: usize, v: u8) {
    let b = &mut row[x / 2];
    if x % 2 == 0 {
        *b = (*b & 0x0F) | (v << 4);
    } else {
        *b = (*b & 0xF0) | (v & 0xF);
    }
}

/// Floyd-Steinberg error diffusion, one channel at a time, left to right.
///
/// Error is carried in 1/16ths of an 8-bit unit. 1-bit channels (coverage
/// style alpha) are thresholded instead of dithered.
fn diffuse(pixels: &mut [[u8; 4]], w: usize, h: usize, bits: &[u8]) {
    if w == 0 || h == 0 {
        return;
    }
    for (c, &b) in bits.iter().enumerate() {
        if b >= 8 {
            continue;
        }
        if b == 1 {
            for px in pixels.iter_mut() {
                px[c] = narrow(1, px[c]);
            }
            continue;
        }

        let mut cur = vec![0i32; w + 2];
        let mut next = vec![0i32; w + 2];
        for y in 0..h {
            for x in 0..w {
                let px = &mut pixels[y * w + x];
                let want = (px[c] as i32 * 16 + cur[x + 1]).clamp(0, 255 * 16);
                let q = narrow(b, ((want + 8) / 16) as u8);
                let err = want - expand(b, q) as i32 * 16;
                px[c] = q;

                cur[x + 2] += err * 7 / 16;
                next[x] += err * 3 / 16;
                next[x + 1] += err * 5 / 16;
                next[x + 2] += err / 16;
            }
            std::mem::swap(&mut cur, &mut next);
            next.iter_mut().for_each(|e| *e = 0);
        }
    }
}
