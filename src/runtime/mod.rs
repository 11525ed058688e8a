//! Server runtime: buffers, readiness notification, worker pool, timers,
//! and the reactor that ties them together.

mod buffer;
mod connection;
mod notifier;
mod pool;
mod reactor;
mod timer;

pub use buffer::IoBuffer;
pub use connection::{ConnState, ConnectionSlot, ReadOutcome, WriteOutcome};
pub use notifier::{Event, Events, Interest, Notifier};
pub use pool::WorkerPool;
pub use reactor::{Reactor, ReactorHandle};
pub use timer::TimerHeap;
