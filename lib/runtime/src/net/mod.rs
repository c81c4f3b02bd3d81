//! Async TCP/UDP sockets built on top of the reactor and proactor.

pub mod socket;

pub use socket::{TcpAcceptor, TcpSocket, UdpSocket};
