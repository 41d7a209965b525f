//! Bounded circular byte arena used to hand serialized render commands from the
//! emulation thread to the render thread.
//!
//! The pool is a single-producer/single-consumer channel. The producer
//! [`RingBufferPool::allocate`]s a claim, fills it with
//! [`RingBufferPool::write`] and hands it over with [`RingBufferPool::submit`].
//! The consumer takes claims in allocation order with [`RingBufferPool::next`]
//! and gives the bytes back with [`RingBufferPool::release`]. When the arena is
//! full, `allocate` blocks (up to a deadline) until the consumer releases
//! enough space.

mod pool;

pub use pool::{align_up, PoolBufferPointer, PoolError, PoolStats, RingBufferPool, POOL_ALIGNMENT};
