//! riptide: a readiness-driven TCP server core.
//!
//! A single reactor thread multiplexes a listening socket and its accepted
//! connections with epoll, hands ready connections to a fixed worker pool,
//! and evicts idle connections with a heap-based timeout scheduler. Wire
//! protocols plug in behind the [`protocol::Processor`] trait; the core
//! never interprets payload bytes.
//!
//! Linux only: readiness notification is built directly on epoll.

pub mod config;
pub mod protocol;
pub mod runtime;
