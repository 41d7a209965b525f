//! Content hashing for texture identity.
//!
//! Both implementations compute XXH3-64 over `bytes ++ palette ++ metadata`
//! with seed 0, so they agree bit for bit on every platform.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashImpl {
    /// Streaming XXH3 using the SIMD code paths available on the host.
    #[default]
    Vectorized,
    /// Portable `const fn` XXH3; needs one contiguous input buffer.
    Scalar,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher {
    imp: HashImpl,
}

impl ContentHasher {
    pub fn new(imp: HashImpl) -> Self {
        Self { imp }
    }

    pub fn implementation(&self) -> HashImpl {
        self.imp
    }

    /// Hash the concatenation of `parts`, in order.
    pub fn hash(&self, parts: &[&[u8]]) -> u64 {
        match self.imp {
            HashImpl::Vectorized => {
                let mut hasher = Xxh3::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.digest()
            }
            HashImpl::Scalar => {
                let len = parts.iter().map(|p| p.len()).sum();
                let mut buf = Vec::with_capacity(len);
                for part in parts {
                    buf.extend_from_slice(part);
                }
                xxhash_rust::const_xxh3::xxh3_64(&buf)
            }
        }
    }
}
