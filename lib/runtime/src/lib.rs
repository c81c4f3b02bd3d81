//! Portable asynchronous I/O substrate: a reactor/proactor pair over epoll, kqueue and IOCP, an
//! event loop (`IoContext`) built on top of them, length-prefixed framing, async TCP/UDP sockets,
//! and a consistent-hash ring used by the broker crate for shard routing.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod error;
pub mod reactor;
pub mod proactor;
pub mod context;
pub mod framing;
pub mod hash_ring;
pub mod net;

pub use error::ErrorCode;
pub use context::IoContext;
pub use hash_ring::HashRing;
