use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, error};

use super::wgsl::{generate_wgsl, passthrough_wgsl, UniformLayout};
use super::{AlphaStage, ColorStage, CombinerAccuracy, CombinerFlags, CombinerKey};
use crate::backend::{BackendCaps, GfxBackend, ProgramHandle};

/// A compiled combiner and what a backend needs to drive it.
#[derive(Debug)]
pub struct CombinerProgram {
    pub key: CombinerKey,
    /// `None` only if even the pass-through program failed to compile; draws
    /// using it are skipped.
    pub handle: Option<ProgramHandle>,
    pub layout: UniformLayout,
    pub wgsl: String,
    /// `true` when compilation failed and this is the pass-through program.
    pub fallback: bool,
    /// Cache generation this program was built in.
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CombinerStats {
    pub hits: u64,
    pub misses: u64,
    pub fallbacks: u64,
    pub rebuilds: u64,
    pub programs: u64,
}

/// Combiner programs keyed by [`CombinerKey`].
///
/// Built programs are shared through `Arc`, so asking twice for the same key
/// yields the same instance until the cache is marked obsolete.
pub struct CombinerProgramCache {
    programs: HashMap<CombinerKey, Arc<CombinerProgram>>,
    accuracy: CombinerAccuracy,
    caps: BackendCaps,
    obsolete: bool,
    generation: u64,
    stats: CombinerStats,
}

impl CombinerProgramCache {
    pub fn new(accuracy: CombinerAccuracy, caps: BackendCaps) -> Self {
        Self {
            programs: HashMap::new(),
            accuracy,
            caps,
            obsolete: false,
            generation: 0,
            stats: CombinerStats::default(),
        }
    }

    pub fn stats(&self) -> CombinerStats {
        CombinerStats {
            programs: self.programs.len() as u64,
            ..self.stats
        }
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn capabilities(&self) -> BackendCaps {
        self.caps
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    /// Force every program to be rebuilt on its next lookup.
    pub fn mark_obsolete(&mut self) {
        self.obsolete = true;
    }

    /// Record the backend's current capabilities. Losing any capability marks
    /// the cache obsolete; gaining one does not.
    pub fn set_capabilities(&mut self, caps: BackendCaps) {
        if !caps.contains(self.caps) {
            debug!(old = ?self.caps, new = ?caps, "backend capabilities dropped; combiner programs obsolete");
            self.obsolete = true;
        }
        self.caps = caps;
    }

    /// Look up the program for `key`, generating and compiling it on a miss.
    ///
    /// `color` and `alpha` must be the stages `key.mux` decodes to.
    pub fn build(
        &mut self,
        color: &ColorStage,
        alpha: &AlphaStage,
        key: CombinerKey,
        backend: &mut dyn GfxBackend,
    ) -> Arc<CombinerProgram> {
        debug_assert_eq!((*color, *alpha), key.stages());

        if self.obsolete {
            self.stats.rebuilds += 1;
            self.generation += 1;
            self.clear(backend);
            self.obsolete = false;
        }

        if let Some(existing) = self.programs.get(&key) {
            self.stats.hits += 1;
            return Arc::clone(existing);
        }
        self.stats.misses += 1;

        let program = Arc::new(self.compile(color, alpha, key, backend));
        self.programs.insert(key, Arc::clone(&program));
        program
    }

    /// Drop every program and release its backend handle. Outstanding `Arc`s
    /// keep their data but the handle is no longer drawable.
    pub fn clear(&mut self, backend: &mut dyn GfxBackend) {
        for (_, program) in self.programs.drain() {
            if let Some(handle) = program.handle {
                backend.release_program(handle);
            }
        }
    }

    /// [`CombinerProgramCache::build`] with the stages decoded from `key`.
    pub fn build_for_key(
        &mut self,
        key: CombinerKey,
        backend: &mut dyn GfxBackend,
    ) -> Arc<CombinerProgram> {
        let (color, alpha) = key.stages();
        self.build(&color, &alpha, key, backend)
    }

    fn compile(
        &mut self,
        color: &ColorStage,
        alpha: &AlphaStage,
        key: CombinerKey,
        backend: &mut dyn GfxBackend,
    ) -> CombinerProgram {
        let textured = key.flags.contains(CombinerFlags::TEXTURE_PRESENT);
        let label = format!("combiner:{:032x}", key.packed());
        let wgsl = generate_wgsl(color, alpha, &key, self.accuracy, self.caps);

        match backend.compile_program(&label, &wgsl) {
            Ok(handle) => CombinerProgram {
                key,
                handle: Some(handle),
                layout: UniformLayout::for_program(textured),
                wgsl,
                fallback: false,
                generation: self.generation,
            },
            Err(err) => {
                let key_hex = format!("{:032x}", key.packed());
                error!(key = %key_hex, %err, "combiner compile failed; using pass-through");
                self.stats.fallbacks += 1;

                let wgsl = passthrough_wgsl(color, &key);
                let handle = match backend.compile_program(&format!("{label}:passthrough"), &wgsl)
                {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        error!(key = %key_hex, %err, "pass-through compile failed");
                        None
                    }
                };
                CombinerProgram {
                    key,
                    handle,
                    layout: UniformLayout::for_program(textured),
                    wgsl,
                    fallback: true,
                    generation: self.generation,
                }
            }
        }
    }
}
