//! F3DEX2 display list interpretation.
//!
//! [`Interpreter`] walks display lists in a read-only view of console RAM
//! and emits render commands to a [`CommandSink`], normally a [`PoolSink`]
//! feeding the render thread.

pub mod clip;
pub mod gbi;
pub mod interpreter;
pub mod memory;
pub mod sink;
pub mod state;

pub use interpreter::{
    Interpreter, InterpreterConfig, InterpreterError, InterpreterStats, ListOutcome,
};
pub use memory::{MemoryError, RdramView, SegmentTable};
pub use sink::{CommandSink, PoolSink, RecordingSink, SinkError};
