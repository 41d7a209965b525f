//! Reads render-target pixels back into CPU memory for effects that sample
//! the previous frame.

use tracing::debug;

use crate::backend::{GfxBackend, Readback, RenderTargetFormat};
use crate::format::{self, ConvertQuality, PixelFormat};

/// Parameters of one framebuffer read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadColorBufferParams {
    pub x0: u32,
    pub y0: u32,
    pub width: u32,
    pub height: u32,
    /// 16 for big-endian RGBA5551 output, 32 for RGBA8888.
    pub bit_depth: u8,
    /// Asynchronous reads return the data requested by the previous call
    /// with the same region and schedule a fresh copy.
    pub synchronous: bool,
}

/// Round to nearest, ties to even, by pushing the fraction out of a
/// double's mantissa. Valid for `|v| < 2^51`.
#[inline]
pub fn round_half_even(v: f64) -> f64 {
    const MAGIC: f64 = 6_755_399_441_055_744.0; // 1.5 * 2^52
    (v + MAGIC) - MAGIC
}

#[inline]
pub fn unorm_to_u8(v: f32) -> u8 {
    let scaled = (v as f64 * 255.0).clamp(0.0, 255.0);
    round_half_even(scaled) as u8
}

/// Convert a raw readback into tightly packed RGBA8888, honoring the row
/// stride.
pub fn readback_to_rgba8(rb: &Readback) -> Option<Vec<u8>> {
    let bpp = rb.format.bytes_per_pixel();
    let row_len = (rb.width as usize).checked_mul(bpp)?;
    if rb.stride < row_len {
        return None;
    }
    let needed = match rb.height {
        0 => 0,
        h => rb.stride.checked_mul(h as usize - 1)?.checked_add(row_len)?,
    };
    if rb.data.len() < needed {
        return None;
    }

    let mut out = Vec::with_capacity(rb.width as usize * rb.height as usize * 4);
    for y in 0..rb.height as usize {
        let row = &rb.data[y * rb.stride..y * rb.stride + row_len];
        match rb.format {
            RenderTargetFormat::Rgba8 => out.extend_from_slice(row),
            RenderTargetFormat::Rgba16f => {
                for c in row.chunks_exact(2) {
                    let v = half::f16::from_le_bytes([c[0], c[1]]).to_f32();
                    out.push(unorm_to_u8(v));
                }
            }
            RenderTargetFormat::Rgba32f => {
                for c in row.chunks_exact(4) {
                    let v = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                    out.push(unorm_to_u8(v));
                }
            }
        }
    }
    Some(out)
}

#[derive(Debug)]
struct PendingRead {
    region: (u32, u32, u32, u32),
    readback: Readback,
}

#[derive(Debug, Default)]
pub struct ColorBufferReader {
    quality: ConvertQuality,
    pending: Option<PendingRead>,
}

impl ColorBufferReader {
    /// `quality` selects how 32-bit pixels are narrowed for 16-bit reads.
    pub fn new(quality: ConvertQuality) -> Self {
        Self {
            quality,
            pending: None,
        }
    }

    /// Read a region of the active render target.
    ///
    /// `None` means "no data this frame": the backend cannot read back, the
    /// region is out of range, or an asynchronous read has nothing queued
    /// yet. Callers skip the dependent effect.
    pub fn read_pixels(
        &mut self,
        backend: &mut dyn GfxBackend,
        params: &ReadColorBufferParams,
    ) -> Option<Vec<u8>> {
        let region = (params.x0, params.y0, params.width, params.height);
        let readback = if params.synchronous {
            backend.read_pixels(params.x0, params.y0, params.width, params.height)?
        } else {
            let previous = self.pending.take().filter(|p| p.region == region);
            if let Some(readback) =
                backend.read_pixels(params.x0, params.y0, params.width, params.height)
            {
                self.pending = Some(PendingRead { region, readback });
            }
            previous?.readback
        };

        let rgba = readback_to_rgba8(&readback)?;
        match params.bit_depth {
            32 => Some(rgba),
            16 => format::encode(
                PixelFormat::Rgba5551,
                readback.width,
                readback.height,
                &rgba,
                self.quality,
            )
            .ok(),
            other => {
                debug!(bit_depth = other, "unsupported color buffer read depth");
                None
            }
        }
    }
}
