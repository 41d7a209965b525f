//! Decoded textures keyed by content hash, with a byte/slot budget and LRU
//! eviction.

use std::num::NonZeroUsize;
use std::ops::Range;

use lru::LruCache;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::backend::{BackendError, GfxBackend, TextureHandle};
use crate::format::{self, ConvertError, Palette, PixelFormat};
use crate::hash::{ContentHasher, HashImpl};

/// Raw console texture as the interpreter captured it.
#[derive(Debug, Clone, Copy)]
pub struct TextureSource<'a> {
    /// Console address the bytes were read from.
    pub address: u32,
    /// Console memory spanned by the read, which exceeds `bytes.len()` for
    /// rows gathered with a stride.
    pub source_len: u32,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: &'a [u8],
    pub palette: Option<&'a Palette>,
}

impl TextureSource<'_> {
    /// Console memory the texture was read from.
    pub fn source_range(&self) -> Range<u64> {
        let start = self.address as u64;
        start..start + self.source_len as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureKey {
    pub hash: u64,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
pub struct CachedTexture {
    pub key: TextureKey,
    pub handle: TextureHandle,
    /// Canonical RGBA8888 pixels.
    pub rgba: Vec<u8>,
    pub source: Range<u64>,
    /// Fetch counter value at the last hit or insert.
    pub last_used: u64,
}

impl CachedTexture {
    pub fn size_bytes(&self) -> usize {
        self.rgba.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFetch {
    pub handle: TextureHandle,
    pub key: TextureKey,
    pub hit: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub upload_failures: u64,
    /// Bytes of canonical RGBA held right now.
    pub bytes: usize,
}

#[derive(Debug, Error)]
pub enum TextureError {
    #[error("texture decode failed: {0}")]
    Decode(#[from] ConvertError),

    #[error("texture upload failed: {0}")]
    Upload(#[from] BackendError),

    #[error("invalid texture cache configuration: {0}")]
    InvalidConfig(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureCacheConfig {
    pub budget_bytes: usize,
    /// Maximum number of entries; 0 means no slot limit.
    pub max_entries: usize,
    pub hash: HashImpl,
}

impl Default for TextureCacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 32 * 1024 * 1024,
            max_entries: 0,
            hash: HashImpl::Vectorized,
        }
    }
}

pub struct TextureCache {
    entries: LruCache<TextureKey, CachedTexture>,
    budget_bytes: NonZeroUsize,
    max_entries: Option<NonZeroUsize>,
    hasher: ContentHasher,
    bytes: usize,
    clock: u64,
    stats: TextureCacheStats,
}

impl TextureCache {
    pub fn new(config: TextureCacheConfig) -> Result<Self, TextureError> {
        let budget_bytes = NonZeroUsize::new(config.budget_bytes)
            .ok_or(TextureError::InvalidConfig("budget_bytes must be > 0"))?;
        Ok(Self {
            entries: LruCache::unbounded(),
            budget_bytes,
            max_entries: NonZeroUsize::new(config.max_entries),
            hasher: ContentHasher::new(config.hash),
            bytes: 0,
            clock: 0,
            stats: TextureCacheStats::default(),
        })
    }

    pub fn stats(&self) -> TextureCacheStats {
        TextureCacheStats {
            bytes: self.bytes,
            ..self.stats
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &TextureKey) -> bool {
        self.entries.contains(key)
    }

    pub fn get(&self, key: &TextureKey) -> Option<&CachedTexture> {
        self.entries.peek(key)
    }

    /// Keys from least to most recently used.
    pub fn keys_lru_first(&self) -> Vec<TextureKey> {
        self.entries.iter().rev().map(|(k, _)| *k).collect()
    }

    /// Identity of `source`: content hash over bytes, palette and metadata.
    pub fn key_for(&self, source: &TextureSource<'_>) -> TextureKey {
        let palette_bytes = source.palette.map(Palette::to_be_bytes).unwrap_or_default();
        let mut meta = [0u8; 10];
        meta[0] = source.format as u8;
        meta[1] = source.palette.map_or(0xFF, |p| p.format as u8);
        meta[2..6].copy_from_slice(&source.width.to_le_bytes());
        meta[6..10].copy_from_slice(&source.height.to_le_bytes());
        TextureKey {
            hash: self
                .hasher
                .hash(&[source.bytes, palette_bytes.as_slice(), &meta[..]]),
            format: source.format,
            width: source.width,
            height: source.height,
        }
    }

    /// Return the texture for `source`, decoding and uploading it on a miss.
    ///
    /// On failure nothing is inserted and the caller draws without it.
    pub fn fetch(
        &mut self,
        source: &TextureSource<'_>,
        backend: &mut dyn GfxBackend,
    ) -> Result<TextureFetch, TextureError> {
        let key = self.key_for(source);
        self.clock += 1;

        if let Some(entry) = self.entries.get_mut(&key) {
            self.stats.hits += 1;
            entry.last_used = self.clock;
            entry.source = source.source_range();
            return Ok(TextureFetch {
                handle: entry.handle,
                key,
                hit: true,
            });
        }
        self.stats.misses += 1;

        let rgba = format::decode(
            source.format,
            source.width,
            source.height,
            source.bytes,
            source.palette,
        )
        .inspect_err(|err| {
            self.stats.upload_failures += 1;
            warn!(address = source.address, format = ?source.format, %err, "texture decode failed");
        })?;

        self.make_room(rgba.len(), backend);

        let handle = backend
            .upload_texture(source.width, source.height, &rgba)
            .inspect_err(|err| {
                self.stats.upload_failures += 1;
                warn!(address = source.address, %err, "texture upload failed; drawing untextured");
            })?;

        trace!(?key, ?handle, "texture cache insert");
        self.bytes += rgba.len();
        self.entries.put(
            key,
            CachedTexture {
                key,
                handle,
                rgba,
                source: source.source_range(),
                last_used: self.clock,
            },
        );
        Ok(TextureFetch {
            handle,
            key,
            hit: false,
        })
    }

    /// Evict least-recently-used entries until `incoming` more bytes and one
    /// more slot fit. An empty cache always accepts the next texture.
    fn make_room(&mut self, incoming: usize, backend: &mut dyn GfxBackend) {
        loop {
            let over_bytes = self.bytes + incoming > self.budget_bytes.get();
            let over_slots = self
                .max_entries
                .is_some_and(|max| self.entries.len() >= max.get());
            if !(over_bytes || over_slots) {
                break;
            }
            let Some((key, evicted)) = self.entries.pop_lru() else {
                break;
            };
            debug!(?key, bytes = evicted.size_bytes(), "texture cache evict");
            self.release(evicted, backend);
            self.stats.evictions += 1;
        }
    }

    fn release(&mut self, entry: CachedTexture, backend: &mut dyn GfxBackend) {
        self.bytes -= entry.size_bytes();
        backend.release_texture(entry.handle);
    }

    /// Drop every entry whose source bytes overlap `range`. Returns how many
    /// were dropped.
    pub fn invalidate(&mut self, range: Range<u64>, backend: &mut dyn GfxBackend) -> usize {
        if range.is_empty() {
            return 0;
        }
        let stale: Vec<TextureKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.source.start < range.end && range.start < e.source.end)
            .map(|(k, _)| *k)
            .collect();
        for key in &stale {
            if let Some(entry) = self.entries.pop(key) {
                self.release(entry, backend);
            }
        }
        self.stats.invalidations += stale.len() as u64;
        stale.len()
    }

    pub fn clear(&mut self, backend: &mut dyn GfxBackend) {
        while let Some((_, entry)) = self.entries.pop_lru() {
            self.release(entry, backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendDesc, HeadlessBackend};
    use crate::format::PaletteFormat;
    use pretty_assertions::assert_eq;

    fn cache(budget_bytes: usize, max_entries: usize) -> TextureCache {
        TextureCache::new(TextureCacheConfig {
            budget_bytes,
            max_entries,
            ..TextureCacheConfig::default()
        })
        .unwrap()
    }

    fn source(address: u32, bytes: &[u8]) -> TextureSource<'_> {
        TextureSource {
            address,
            source_len: bytes.len() as u32,
            format: PixelFormat::I8,
            width: bytes.len() as u32,
            height: 1,
            bytes,
            palette: None,
        }
    }

    #[test]
    fn zero_budget_is_rejected() {
        assert!(matches!(
            TextureCache::new(TextureCacheConfig {
                budget_bytes: 0,
                ..TextureCacheConfig::default()
            }),
            Err(TextureError::InvalidConfig(_))
        ));
    }

    #[test]
    fn hit_returns_same_handle_without_upload() {
        let mut be = HeadlessBackend::new(&BackendDesc::default());
        let mut cache = cache(1 << 20, 0);
        let a = cache.fetch(&source(0x100, &[1, 2, 3, 4]), &mut be).unwrap();
        let b = cache.fetch(&source(0x200, &[1, 2, 3, 4]), &mut be).unwrap();
        assert!(!a.hit);
        assert!(b.hit);
        assert_eq!(a.handle, b.handle);
        assert_eq!(be.texture_count(), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().bytes, 16);
    }

    #[test]
    fn same_bytes_different_shape_are_distinct() {
        let mut be = HeadlessBackend::new(&BackendDesc::default());
        let mut cache = cache(1 << 20, 0);
        let wide = source(0, &[9; 4]);
        let tall = TextureSource {
            width: 1,
            height: 4,
            ..wide
        };
        let a = cache.fetch(&wide, &mut be).unwrap();
        let b = cache.fetch(&tall, &mut be).unwrap();
        assert_ne!(a.key, b.key);
        assert!(!b.hit);
    }

    #[test]
    fn palette_contents_are_part_of_identity() {
        let mut be = HeadlessBackend::new(&BackendDesc::default());
        let mut cache = cache(1 << 20, 0);
        let p1 = Palette::new(PaletteFormat::Rgba5551, vec![0xF801, 0x07C1]);
        let p2 = Palette::new(PaletteFormat::Rgba5551, vec![0xF801, 0x003F]);
        fn ci4<'a>(bytes: &'a [u8], palette: &'a Palette) -> TextureSource<'a> {
            TextureSource {
                address: 0,
                source_len: bytes.len() as u32,
                format: PixelFormat::Ci4,
                width: 2,
                height: 1,
                bytes,
                palette: Some(palette),
            }
        }
        let a = cache.fetch(&ci4(&[0x01], &p1), &mut be).unwrap();
        let b = cache.fetch(&ci4(&[0x01], &p2), &mut be).unwrap();
        assert_ne!(a.handle, b.handle);
    }

    #[test]
    fn byte_budget_evicts_least_recently_fetched() {
        let mut be = HeadlessBackend::new(&BackendDesc::default());
        // Each 4-texel I8 texture costs 16 RGBA bytes; room for three.
        let mut cache = cache(48, 0);
        let a = cache.fetch(&source(0, &[1; 4]), &mut be).unwrap();
        let b = cache.fetch(&source(4, &[2; 4]), &mut be).unwrap();
        let c = cache.fetch(&source(8, &[3; 4]), &mut be).unwrap();

        // Refresh `a`; `b` becomes the eviction candidate.
        assert!(cache.fetch(&source(0, &[1; 4]), &mut be).unwrap().hit);
        let d = cache.fetch(&source(12, &[4; 4]), &mut be).unwrap();

        assert_eq!(cache.keys_lru_first(), vec![c.key, a.key, d.key]);
        assert!(!cache.contains(&b.key));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(be.texture_count(), 3);
        assert!(cache.stats().bytes <= 48);
    }

    #[test]
    fn slot_budget_evicts_too() {
        let mut be = HeadlessBackend::new(&BackendDesc::default());
        let mut cache = cache(1 << 20, 2);
        for i in 0..5u8 {
            cache.fetch(&source(0, &[i; 4]), &mut be).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn oversized_texture_still_inserts() {
        let mut be = HeadlessBackend::new(&BackendDesc::default());
        let mut cache = cache(8, 0);
        cache.fetch(&source(0, &[1; 1]), &mut be).unwrap();
        let big = cache.fetch(&source(0, &[7; 16]), &mut be).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&big.key));
    }

    #[test]
    fn invalidate_drops_overlapping_sources() {
        let mut be = HeadlessBackend::new(&BackendDesc::default());
        let mut cache = cache(1 << 20, 0);
        let a = cache.fetch(&source(0x1000, &[1; 16]), &mut be).unwrap();
        let b = cache.fetch(&source(0x2000, &[2; 16]), &mut be).unwrap();

        assert_eq!(cache.invalidate(0x1010..0x1020, &mut be), 0);
        assert_eq!(cache.invalidate(0x100F..0x1010, &mut be), 1);
        assert!(!cache.contains(&a.key));
        assert!(cache.contains(&b.key));
        assert_eq!(be.texture_count(), 1);

        // The rewritten data is decoded again on next use.
        assert!(!cache.fetch(&source(0x1000, &[1; 16]), &mut be).unwrap().hit);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn invalidate_covers_every_strided_row() {
        let mut be = HeadlessBackend::new(&BackendDesc::default());
        let mut cache = cache(1 << 20, 0);
        // Four 16-byte rows sampled from an image 128 bytes wide.
        let texels = [9u8; 64];
        let strided = TextureSource {
            source_len: 3 * 128 + 16,
            width: 16,
            height: 4,
            ..source(0x1000, &texels)
        };
        let fetched = cache.fetch(&strided, &mut be).unwrap();
        assert_eq!(strided.source_range(), 0x1000..0x1190);

        // Just past the last row.
        assert_eq!(cache.invalidate(0x1190..0x1200, &mut be), 0);
        assert_eq!(cache.invalidate(0x1000 + 3 * 128..0x1000 + 3 * 128 + 16, &mut be), 1);
        assert!(!cache.contains(&fetched.key));
        assert!(!cache.fetch(&strided, &mut be).unwrap().hit);
    }

    #[test]
    fn failed_upload_leaves_cache_unchanged() {
        let mut be = HeadlessBackend::new(&BackendDesc {
            max_texture_dim: 2,
            ..BackendDesc::default()
        });
        let mut cache = cache(1 << 20, 0);
        let err = cache.fetch(&source(0, &[1; 4]), &mut be).unwrap_err();
        assert!(matches!(err, TextureError::Upload(_)));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().upload_failures, 1);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn hash_implementations_produce_same_keys() {
        let scalar = TextureCache::new(TextureCacheConfig {
            hash: HashImpl::Scalar,
            ..TextureCacheConfig::default()
        })
        .unwrap();
        let vector = TextureCache::new(TextureCacheConfig::default()).unwrap();
        let bytes: Vec<u8> = (0..=255).collect();
        let src = source(0, &bytes);
        assert_eq!(scalar.key_for(&src), vector.key_for(&src));
    }
}
