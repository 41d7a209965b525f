use std::time::Duration;

use n64gfx_core::backend::{BackendDesc, BackendKind, RenderTargetFormat};
use n64gfx_core::cmd::MAX_COMMAND_BYTES;
use n64gfx_core::{
    CombinerAccuracy, ConvertQuality, HashImpl, RendererConfig, TextureCacheConfig,
};
use n64gfx_dl::InterpreterConfig;
use n64gfx_ring::{align_up, POOL_ALIGNMENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Call depth accepted for `maxDisplayListDepth`.
pub const DISPLAY_LIST_DEPTH_RANGE: std::ops::RangeInclusive<usize> = 1..=64;

/// Host-facing configuration, usually deserialized from JSON.
///
/// Unknown keys are rejected so a typo does not silently fall back to a
/// default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct GfxConfig {
    /// Narrowing used when color buffers are read back at 16 bits.
    pub texture_filter_quality: ConvertQuality,
    pub texture_cache_budget_bytes: usize,
    /// Maximum number of cached textures; 0 means only the byte budget
    /// applies.
    pub texture_cache_max_entries: usize,
    pub combiner_accuracy: CombinerAccuracy,
    pub hash_implementation: HashImpl,

    pub ring_buffer_bytes: usize,
    pub ring_alloc_timeout_ms: u64,
    pub max_display_list_depth: usize,

    pub backend: BackendKind,
    pub render_target_format: RenderTargetFormat,
    pub screen_width: u32,
    pub screen_height: u32,
}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            texture_filter_quality: ConvertQuality::Fast,
            texture_cache_budget_bytes: 32 * 1024 * 1024,
            texture_cache_max_entries: 0,
            combiner_accuracy: CombinerAccuracy::Fast,
            hash_implementation: HashImpl::Vectorized,
            ring_buffer_bytes: 4 * 1024 * 1024,
            ring_alloc_timeout_ms: 1000,
            max_display_list_depth: n64gfx_dl::interpreter::DEFAULT_MAX_DEPTH,
            backend: BackendKind::Headless,
            render_target_format: RenderTargetFormat::Rgba8,
            screen_width: 320,
            screen_height: 240,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("ring buffer of {bytes} bytes cannot hold a {required}-byte command")]
    RingTooSmall { bytes: usize, required: usize },

    #[error("texture cache budget must be non-zero")]
    ZeroTextureBudget,

    #[error("ring allocation timeout must be non-zero")]
    ZeroAllocTimeout,

    #[error("invalid screen size {width}x{height}")]
    ScreenSize { width: u32, height: u32 },
}

impl GfxConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Startup checks. A configuration that passes can always make
    /// progress: the largest command fits in the ring.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = align_up(MAX_COMMAND_BYTES, POOL_ALIGNMENT);
        let usable = self.ring_buffer_bytes / POOL_ALIGNMENT * POOL_ALIGNMENT;
        if usable < required {
            return Err(ConfigError::RingTooSmall {
                bytes: self.ring_buffer_bytes,
                required,
            });
        }
        if self.texture_cache_budget_bytes == 0 {
            return Err(ConfigError::ZeroTextureBudget);
        }
        if self.ring_alloc_timeout_ms == 0 {
            return Err(ConfigError::ZeroAllocTimeout);
        }
        if self.screen_width == 0
            || self.screen_height == 0
            || self.screen_width > 4096
            || self.screen_height > 4096
        {
            return Err(ConfigError::ScreenSize {
                width: self.screen_width,
                height: self.screen_height,
            });
        }
        Ok(())
    }

    pub fn alloc_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_alloc_timeout_ms)
    }

    pub fn interpreter(&self) -> InterpreterConfig {
        InterpreterConfig {
            max_depth: self.max_display_list_depth.clamp(
                *DISPLAY_LIST_DEPTH_RANGE.start(),
                *DISPLAY_LIST_DEPTH_RANGE.end(),
            ),
            screen_width: self.screen_width,
            screen_height: self.screen_height,
            ..InterpreterConfig::default()
        }
    }

    pub fn renderer(&self) -> RendererConfig {
        RendererConfig {
            texture_cache: TextureCacheConfig {
                budget_bytes: self.texture_cache_budget_bytes,
                max_entries: self.texture_cache_max_entries,
                hash: self.hash_implementation,
            },
            combiner_accuracy: self.combiner_accuracy,
            read_quality: self.texture_filter_quality,
            screen_width: self.screen_width,
            screen_height: self.screen_height,
        }
    }

    pub fn backend_desc(&self) -> BackendDesc {
        BackendDesc {
            width: self.screen_width,
            height: self.screen_height,
            format: self.render_target_format,
            ..BackendDesc::default()
        }
    }
}
