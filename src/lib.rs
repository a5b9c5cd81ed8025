//! A thread-safe, typed FIFO pipe backed by a circular buffer.
//!
//! A [`Pipe`] starts small and grows by doubling as producers outpace
//! consumers, then shrinks back by halving once it is mostly drained. One or
//! more [`Producer`] handles push elements onto the tail; one or more
//! [`Consumer`] handles pop them off the head. All three handle types share
//! state behind a single mutex and condition variable — there is no lock-free
//! trickery here, just careful locking and `Condvar::wait_while`.
//!
//! ```
//! use fifo_pipe::Pipe;
//!
//! let pipe = Pipe::<u32>::new().unwrap();
//! let producer = pipe.producer();
//! let consumer = pipe.consumer();
//!
//! producer.push(&[1, 2, 3]);
//!
//! let mut received = [0u32; 3];
//! assert_eq!(consumer.pop(&mut received), 3);
//! assert_eq!(received, [1, 2, 3]);
//! ```
//!
//! Dropping every [`Producer`] (and the originating [`Pipe`], which counts as
//! one) marks the pipe closed: blocked consumers wake up and drain whatever
//! remains rather than waiting forever.

mod config;
mod error;
mod invariants;
mod metrics;
mod pipe;

pub use config::{PipeConfig, DEFAULT_MINCAP};
pub use error::PipeError;
pub use metrics::MetricsSnapshot;
pub use pipe::{Consumer, Pipe, Producer};
