//! Destinations for the render commands the interpreter emits.

use n64gfx_core::cmd::RenderCommand;
use n64gfx_ring::{PoolError, RingBufferPool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl SinkError {
    /// The sink can take no further commands this run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SinkError::Pool(PoolError::Closed | PoolError::TooLarge { .. })
        )
    }
}

pub trait CommandSink {
    fn submit(&mut self, cmd: &RenderCommand) -> Result<(), SinkError>;
}

/// Serializes commands into a [`RingBufferPool`], one claim per command.
pub struct PoolSink<'a> {
    pool: &'a RingBufferPool,
    scratch: Vec<u8>,
}

impl<'a> PoolSink<'a> {
    pub fn new(pool: &'a RingBufferPool) -> Self {
        Self {
            pool,
            scratch: Vec::new(),
        }
    }
}

impl CommandSink for PoolSink<'_> {
    fn submit(&mut self, cmd: &RenderCommand) -> Result<(), SinkError> {
        self.scratch.clear();
        cmd.encode_into(&mut self.scratch);
        let ptr = self.pool.allocate(self.scratch.len())?;
        self.pool.commit(ptr, &self.scratch)?;
        Ok(())
    }
}

/// Keeps every command in memory. Used by tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub commands: Vec<RenderCommand>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<RenderCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl CommandSink for RecordingSink {
    fn submit(&mut self, cmd: &RenderCommand) -> Result<(), SinkError> {
        self.commands.push(cmd.clone());
        Ok(())
    }
}

impl<S: CommandSink + ?Sized> CommandSink for &mut S {
    fn submit(&mut self, cmd: &RenderCommand) -> Result<(), SinkError> {
        (**self).submit(cmd)
    }
}
