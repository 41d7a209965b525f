use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use n64gfx_core::backend::{create_backend, FrameSink};
use n64gfx_core::{GfxStats, GfxStatsSnapshot, Renderer, TextureError};
use n64gfx_dl::{
    Interpreter, InterpreterError, InterpreterStats, ListOutcome, MemoryError, PoolSink,
    RdramView,
};
use n64gfx_ring::RingBufferPool;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::{ConfigError, GfxConfig};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to create renderer: {0}")]
    Renderer(#[from] TextureError),

    #[error("failed to spawn render thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("console RAM rejected: {0}")]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Interpreter(#[from] InterpreterError),

    #[error("render thread did not drain the command pool within {0:?}")]
    FrameTimeout(Duration),
}

/// One graphics session: the interpreter runs on the caller's (emulation)
/// thread and feeds a render thread through the ring buffer pool.
pub struct Session {
    config: GfxConfig,
    pool: Arc<RingBufferPool>,
    interpreter: Interpreter,
    stats: Arc<GfxStats>,
    render_thread: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(config: GfxConfig, frame_sink: Box<dyn FrameSink>) -> Result<Self, SessionError> {
        config.validate()?;

        let stats = Arc::new(GfxStats::new());
        let backend = create_backend(config.backend, &config.backend_desc());
        let mut renderer = Renderer::new(backend, &config.renderer(), frame_sink, stats.clone())?;
        let pool = Arc::new(RingBufferPool::new(
            config.ring_buffer_bytes,
            config.alloc_timeout(),
        ));

        let render_pool = pool.clone();
        let render_thread = thread::Builder::new()
            .name("n64gfx-render".into())
            .spawn(move || renderer.run(&render_pool))
            .map_err(SessionError::Spawn)?;
        debug!(
            ring_bytes = pool.capacity(),
            backend = ?config.backend,
            "graphics session started"
        );

        Ok(Self {
            interpreter: Interpreter::new(config.interpreter()),
            config,
            pool,
            stats,
            render_thread: Some(render_thread),
        })
    }

    pub fn config(&self) -> &GfxConfig {
        &self.config
    }

    /// Interpret the display list at `address` (segmented or physical).
    ///
    /// `ram` is the whole of console RAM; its length must be a power of two.
    /// A list that aborts is reported in the outcome and does not affect the
    /// next call.
    pub fn run_display_list(
        &mut self,
        ram: &[u8],
        address: u32,
    ) -> Result<ListOutcome, SessionError> {
        let view = RdramView::new(ram)?;
        let mut sink = PoolSink::new(&self.pool);
        let outcome = self.interpreter.run(&view, address, &mut sink);
        self.merge_stats();
        match &outcome {
            ListOutcome::Completed => {}
            ListOutcome::CommandBudgetExhausted => {
                warn!(address, "display list cut off by the command budget")
            }
            ListOutcome::Aborted(err) => warn!(address, %err, "display list aborted"),
        }
        Ok(outcome)
    }

    /// Finish the frame and wait until the render thread has executed it.
    pub fn end_frame(&mut self) -> Result<(), SessionError> {
        let mut sink = PoolSink::new(&self.pool);
        self.interpreter.end_frame(&mut sink)?;
        self.merge_stats();
        let timeout = self.config.alloc_timeout();
        if !self.pool.wait_idle(timeout) {
            return Err(SessionError::FrameTimeout(timeout));
        }
        Ok(())
    }

    /// The host wrote `len` bytes of console RAM at `address`.
    pub fn notify_ram_write(&mut self, address: u32, len: u32) {
        self.interpreter.notify_ram_write(address, len);
    }

    pub fn stats(&self) -> GfxStatsSnapshot {
        self.stats.set_pool_waits(self.pool.stats().waits);
        self.stats.snapshot()
    }

    fn merge_stats(&mut self) {
        let InterpreterStats {
            commands,
            unknown_opcodes,
            dropped_triangles,
            stack_overflows,
            ..
        } = self.interpreter.take_stats();
        self.stats.add_commands(commands);
        self.stats.add_unknown_opcodes(unknown_opcodes);
        self.stats.add_dropped_triangles(dropped_triangles);
        for _ in 0..stack_overflows {
            self.stats.inc_stack_overflows();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pool.close();
        if let Some(handle) = self.render_thread.take() {
            if handle.join().is_err() {
                error!("render thread panicked");
            }
        }
    }
}
