//! High-level emulation of the Nintendo 64 graphics pipeline.
//!
//! A [`Session`] interprets F3DEX2 display lists on the emulation thread and
//! renders them on a dedicated render thread.

mod config;
mod session;

pub use config::{ConfigError, GfxConfig, DISPLAY_LIST_DEPTH_RANGE};
pub use session::{Session, SessionError};

pub use n64gfx_core::backend::{Frame, FrameSink};
pub use n64gfx_core::GfxStatsSnapshot;
pub use n64gfx_dl::{InterpreterError, ListOutcome};
