//! Bounded, length-framed message queue in named POSIX shared memory.
//!
//! Any number of processes open the same queue by name; [`Queue::send`] and
//! [`Queue::receive`] block on named semaphores, so no broker is involved.

mod config;
mod errors;
pub mod queue;
pub mod ring;
pub mod segment;
pub mod semaphore;

#[cfg(test)]
mod tests;

pub use config::{QueueConfig, DEFAULT_CAPACITY, DEFAULT_NAME};
pub use errors::QueueError;
pub use queue::{cleanup, Queue, QueueStats, ResourceNames};
pub use ring::FRAME_PREFIX;
