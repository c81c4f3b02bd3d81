//! Async TCP and UDP sockets. Grounded on the teacher's `net::channel::Channel` for the
//! buffered-ingress/egress and logging idiom, generalized away from that type's encrypted game
//! session framing into the plain reactor/proactor-driven transport the broker's wire protocol
//! needs.
//!
//! Each socket keeps its `mio` handle behind an `Arc<Mutex<_>>` rather than handing it to the
//! reactor by value: callers still need `peer_addr`/`shutdown`/etc. on the socket itself while an
//! operation is in flight, and the mutex gives the in-flight attempt closure and the socket object
//! safe concurrent access to the same handle without unsafe aliasing.

use crate::context::{CancelToken, IoContext};
use crate::error::{ErrorCode, IoResult};
use crate::reactor::{Interest, ReadyEvent, Token};
use flux::logging::{self, Logger};
use mio::net::{TcpListener, TcpStream, UdpSocket as MioUdpSocket};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wraps a completion callback so that either the normal I/O path or an expiring timeout can
/// fire it, whichever happens first; the loser is a silent no-op. The proactor registration
/// itself is left in place after a timeout fires early — it is reclaimed when the owning socket
/// is next closed or cancelled, same as any other outstanding operation.
fn guard_with_timeout<T: Send + 'static>(
    ctx: &mut IoContext,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
    cb: Box<dyn FnOnce(IoResult<T>) + Send>,
) -> Box<dyn FnOnce(IoResult<T>) + Send> {
    let fired = Arc::new(AtomicBool::new(false));
    let slot: Arc<Mutex<Option<Box<dyn FnOnce(IoResult<T>) + Send>>>> = Arc::new(Mutex::new(Some(cb)));

    if let Some(duration) = timeout {
        let timeout_fired = fired.clone();
        let timeout_slot = slot.clone();
        ctx.handle().post_delayed(
            move || {
                if let Some(token) = &cancel {
                    token.cancel();
                }
                if timeout_fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(cb) = timeout_slot.lock().unwrap().take() {
                    cb(Err(ErrorCode::Timeout));
                }
            },
            duration,
            None,
        );
    }

    Box::new(move |result| {
        if fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cb) = slot.lock().unwrap().take() {
            cb(result);
        }
    })
}

/// Lets an in-progress attempt bail out promptly when cancelled between readiness events, rather
/// than waiting for the next one.
fn cancelled_error(cancel: &Option<CancelToken>) -> Option<io::Error> {
    match cancel {
        Some(token) if token.is_cancelled() => Some(io::Error::from(io::ErrorKind::TimedOut)),
        _ => None,
    }
}

/// A connected, non-blocking TCP socket.
pub struct TcpSocket {
    stream: Arc<Mutex<TcpStream>>,
    token: Token,
    log: Logger,
}

impl TcpSocket {
    /// Initiates a connection. Returns as soon as the non-blocking connect syscall has been
    /// issued; completion (and any connection-refused error) surfaces on the first writable
    /// readiness, observed via [`TcpSocket::async_send`].
    pub fn connect(ctx: &IoContext, addr: SocketAddr, log: Logger) -> IoResult<TcpSocket> {
        let stream = TcpStream::connect(addr).map_err(ErrorCode::from)?;
        let token = ctx.alloc_token();
        logging::debug!(log, "tcp connect issued"; "addr" => %addr, "token" => token.0);
        Ok(TcpSocket { stream: Arc::new(Mutex::new(stream)), token, log })
    }

    fn from_stream(stream: TcpStream, token: Token, log: Logger) -> TcpSocket {
        TcpSocket { stream: Arc::new(Mutex::new(stream)), token, log }
    }

    pub fn peer_addr(&self) -> IoResult<SocketAddr> {
        self.stream.lock().unwrap().peer_addr().map_err(ErrorCode::from)
    }

    /// Sends `data`, retrying on write-readiness until it is fully written or the operation
    /// fails/times out/is cancelled. `cb` fires exactly once with the number of bytes written.
    pub fn async_send(
        &mut self,
        ctx: &mut IoContext,
        data: Vec<u8>,
        timeout: Option<Duration>,
        cancel: Option<CancelToken>,
        cb: Box<dyn FnOnce(IoResult<usize>) + Send>,
    ) -> IoResult<()> {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                cb(Err(ErrorCode::ConnectionClosed));
                return Ok(());
            }
        }

        let mut remaining = data;
        let mut written_total = 0usize;
        let stream = self.stream.clone();
        let attempt_cancel = cancel.clone();

        let attempt = Box::new(move || loop {
            if let Some(err) = cancelled_error(&attempt_cancel) {
                return Err(err);
            }
            if remaining.is_empty() {
                return Ok(written_total);
            }
            let mut guard = stream.lock().unwrap();
            match guard.write(&remaining) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    written_total += n;
                    remaining.drain(..n);
                    if remaining.is_empty() {
                        return Ok(written_total);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
                Err(e) => return Err(e),
            }
        });

        let guarded_cb = guard_with_timeout(ctx, timeout, cancel, cb);

        logging::trace!(self.log, "submitting send"; "token" => self.token.0);
        let mut guard = self.stream.lock().unwrap();
        let result = ctx.proactor_mut().submit(&mut *guard, self.token, Interest::write(), attempt, guarded_cb);
        drop(guard);
        result
    }

    /// Receives up to `buf.len()` bytes. `cb` fires exactly once with the number of bytes read
    /// (`0` means the peer closed the connection in an orderly fashion) and the buffer handed in.
    pub fn async_receive(
        &mut self,
        ctx: &mut IoContext,
        buf: Vec<u8>,
        timeout: Option<Duration>,
        cancel: Option<CancelToken>,
        cb: Box<dyn FnOnce(IoResult<(usize, Vec<u8>)>) + Send>,
    ) -> IoResult<()> {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                cb(Err(ErrorCode::ConnectionClosed));
                return Ok(());
            }
        }

        let stream = self.stream.clone();
        let attempt_cancel = cancel.clone();
        // The attempt and completion closures run at different times (the former possibly many
        // times, the latter exactly once) but both need the read buffer, so it lives in a slot
        // shared between them rather than being moved into either one outright.
        let buf_slot = Arc::new(Mutex::new(buf));
        let attempt_slot = buf_slot.clone();

        let attempt = Box::new(move || {
            if let Some(err) = cancelled_error(&attempt_cancel) {
                return Err(err);
            }
            let mut guard = stream.lock().unwrap();
            let mut buf_guard = attempt_slot.lock().unwrap();
            guard.read(&mut buf_guard)
        });

        let relay: Box<dyn FnOnce(IoResult<usize>) + Send> = Box::new(move |result| {
            let buf = buf_slot.lock().unwrap().clone();
            cb(result.map(|n| (n, buf)))
        });

        let guarded_relay = guard_with_timeout(ctx, timeout, cancel, relay);

        logging::trace!(self.log, "submitting receive"; "token" => self.token.0);
        let mut guard = self.stream.lock().unwrap();
        let result = ctx.proactor_mut().submit(&mut *guard, self.token, Interest::read(), attempt, guarded_relay);
        drop(guard);
        result
    }

    pub fn close(self, ctx: &mut IoContext) -> IoResult<()> {
        let mut guard = self.stream.lock().unwrap();
        let _ = ctx.proactor_mut().cancel(&mut *guard, self.token);
        guard.shutdown(std::net::Shutdown::Both).map_err(ErrorCode::from)
    }
}

/// A listening TCP socket that hands out accepted connections via a repeating callback.
pub struct TcpAcceptor {
    listener: Arc<Mutex<TcpListener>>,
    token: Token,
    log: Logger,
}

impl TcpAcceptor {
    pub fn bind(ctx: &IoContext, addr: SocketAddr, log: Logger) -> IoResult<TcpAcceptor> {
        let listener = TcpListener::bind(addr).map_err(ErrorCode::from)?;
        let token = ctx.alloc_token();
        logging::info!(log, "tcp acceptor bound"; "addr" => %addr, "token" => token.0);
        Ok(TcpAcceptor { listener: Arc::new(Mutex::new(listener)), token, log })
    }

    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.listener.lock().unwrap().local_addr().map_err(ErrorCode::from)
    }

    /// Registers a level-triggered accept loop: `cb` is invoked once per accepted connection (and
    /// once more with an `Err` if `accept` fails for a reason other than would-block) and keeps
    /// being driven for as long as the acceptor stays registered.
    pub fn async_accept(
        &mut self,
        ctx: &mut IoContext,
        mut cb: Box<dyn FnMut(IoResult<(TcpSocket, SocketAddr)>) + Send>,
    ) -> IoResult<()> {
        let log = self.log.clone();
        let listener = self.listener.clone();
        let token = self.token;

        let callback = move |_ready: ReadyEvent| loop {
            let accepted = listener.lock().unwrap().accept();
            match accepted {
                Ok((stream, peer)) => {
                    cb(Ok((TcpSocket::from_stream(stream, token, log.clone()), peer)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    logging::warn!(log, "accept failed"; "error" => %e);
                    cb(Err(ErrorCode::from_io_error(&e)));
                    break;
                }
            }
        };

        let mut guard = self.listener.lock().unwrap();
        let result = ctx
            .reactor_mut()
            .add(&mut *guard, token, Interest::read(), false, Box::new(callback));
        drop(guard);
        result
    }

    pub fn close(self, ctx: &mut IoContext) -> IoResult<()> {
        let mut guard = self.listener.lock().unwrap();
        ctx.reactor_mut().delete(&mut *guard, self.token)
    }
}

/// An async UDP socket.
pub struct UdpSocket {
    socket: Arc<Mutex<MioUdpSocket>>,
    token: Token,
    log: Logger,
}

impl UdpSocket {
    pub fn bind(ctx: &IoContext, addr: SocketAddr, log: Logger) -> IoResult<UdpSocket> {
        let socket = MioUdpSocket::bind(addr).map_err(ErrorCode::from)?;
        let token = ctx.alloc_token();
        Ok(UdpSocket { socket: Arc::new(Mutex::new(socket)), token, log })
    }

    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.socket.lock().unwrap().local_addr().map_err(ErrorCode::from)
    }

    pub fn async_send_to(
        &mut self,
        ctx: &mut IoContext,
        data: Vec<u8>,
        addr: SocketAddr,
        cb: Box<dyn FnOnce(IoResult<usize>) + Send>,
    ) -> IoResult<()> {
        let socket = self.socket.clone();
        logging::trace!(self.log, "udp send_to submitted"; "addr" => %addr);

        let attempt = Box::new(move || socket.lock().unwrap().send_to(&data, addr));

        let mut guard = self.socket.lock().unwrap();
        let result = ctx.proactor_mut().submit(&mut *guard, self.token, Interest::write(), attempt, cb);
        drop(guard);
        result
    }

    /// Receives a single datagram. Only registers write-readiness interest when a send would
    /// block; receiving always registers for read-readiness.
    pub fn async_receive_from(
        &mut self,
        ctx: &mut IoContext,
        buf: Vec<u8>,
        cb: Box<dyn FnOnce(IoResult<(usize, SocketAddr, Vec<u8>)>) + Send>,
    ) -> IoResult<()> {
        let socket = self.socket.clone();
        let buf_slot = Arc::new(Mutex::new(buf));
        let addr_slot: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
        let attempt_buf = buf_slot.clone();
        let attempt_addr = addr_slot.clone();

        let attempt = Box::new(move || {
            let mut buf_guard = attempt_buf.lock().unwrap();
            match socket.lock().unwrap().recv_from(&mut buf_guard) {
                Ok((n, addr)) => {
                    *attempt_addr.lock().unwrap() = Some(addr);
                    Ok(n)
                }
                Err(e) => Err(e),
            }
        });

        let relay: Box<dyn FnOnce(IoResult<usize>) + Send> = Box::new(move |result| {
            let buf = buf_slot.lock().unwrap().clone();
            let addr = addr_slot.lock().unwrap().unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
            cb(result.map(|n| (n, addr, buf)))
        });

        let mut guard = self.socket.lock().unwrap();
        let result = ctx.proactor_mut().submit(&mut *guard, self.token, Interest::read(), attempt, relay);
        drop(guard);
        result
    }

    pub fn close(self, ctx: &mut IoContext) -> IoResult<()> {
        let mut guard = self.socket.lock().unwrap();
        ctx.proactor_mut().cancel(&mut *guard, self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux::logging;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn tcp_accept_and_echo() {
        let mut ctx = IoContext::new(logging::discard()).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut acceptor = TcpAcceptor::bind(&ctx, addr, logging::discard()).unwrap();
        let bound_addr = acceptor.local_addr().unwrap();

        let received = Arc::new(StdMutex::new(None));
        let received_cb = received.clone();

        acceptor
            .async_accept(
                &mut ctx,
                Box::new(move |result| {
                    if let Ok((_socket, peer)) = result {
                        *received_cb.lock().unwrap() = Some(peer);
                    }
                }),
            )
            .unwrap();

        let _client = TcpStream::connect(bound_addr).unwrap();

        let start = std::time::Instant::now();
        while received.lock().unwrap().is_none() && start.elapsed() < Duration::from_secs(2) {
            ctx.reactor_mut().poll(Some(Duration::from_millis(50))).unwrap();
        }

        assert!(received.lock().unwrap().is_some());
    }

    #[test]
    fn tcp_send_completes_once_writable() {
        let mut ctx = IoContext::new(logging::discard()).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut acceptor = TcpAcceptor::bind(&ctx, addr, logging::discard()).unwrap();
        let bound_addr = acceptor.local_addr().unwrap();
        acceptor.async_accept(&mut ctx, Box::new(|_| {})).unwrap();

        let mut client = TcpSocket::connect(&ctx, bound_addr, logging::discard()).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let done_cb = done.clone();

        client
            .async_send(&mut ctx, b"hello".to_vec(), None, None, Box::new(move |result| {
                assert!(result.is_ok());
                done_cb.store(true, Ordering::SeqCst);
            }))
            .unwrap();

        let start = std::time::Instant::now();
        while !done.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(2) {
            ctx.proactor_mut().poll(Some(Duration::from_millis(50))).unwrap();
            ctx.reactor_mut().poll(Some(Duration::from_millis(0))).unwrap();
        }

        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn send_honors_timeout_when_peer_never_reads() {
        let mut ctx = IoContext::new(logging::discard()).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut acceptor = TcpAcceptor::bind(&ctx, addr, logging::discard()).unwrap();
        let bound_addr = acceptor.local_addr().unwrap();

        // Keep accepted peers alive without reading from them so the client's send queue
        // eventually backs up and write-readiness disappears. Not exercised directly here; this
        // test instead drives a timeout whose delay is shorter than any reasonable handshake,
        // exercising the timeout-wins-the-race branch of `guard_with_timeout` in isolation.
        acceptor.async_accept(&mut ctx, Box::new(|_| {})).unwrap();

        let mut client = TcpSocket::connect(&ctx, bound_addr, logging::discard()).unwrap();

        let result_slot = Arc::new(StdMutex::new(None));
        let result_cb = result_slot.clone();

        // A zero-duration timeout races the real completion; either the send finishes first
        // (small payload, loopback) or the timeout claims it — both are valid outcomes of the
        // race, the property under test is that `cb` fires exactly once either way.
        client
            .async_send(
                &mut ctx,
                b"hi".to_vec(),
                Some(Duration::from_nanos(1)),
                None,
                Box::new(move |result| {
                    *result_cb.lock().unwrap() = Some(result);
                }),
            )
            .unwrap();

        let start = std::time::Instant::now();
        while result_slot.lock().unwrap().is_none() && start.elapsed() < Duration::from_secs(2) {
            ctx.proactor_mut().poll(Some(Duration::from_millis(10))).unwrap();
            ctx.reactor_mut().poll(Some(Duration::from_millis(0))).unwrap();
        }

        assert!(result_slot.lock().unwrap().is_some());
    }

    #[test]
    fn udp_send_completes() {
        let ctx = IoContext::new(logging::discard()).unwrap();
        let mut ctx = ctx;
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut a = UdpSocket::bind(&ctx, addr, logging::discard()).unwrap();
        let b = MioUdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_local = b.local_addr().unwrap();
        drop(b);

        let done = Arc::new(AtomicBool::new(false));
        let done_cb = done.clone();

        a.async_send_to(
            &mut ctx,
            b"hi".to_vec(),
            b_local,
            Box::new(move |result| {
                assert!(result.is_ok());
                done_cb.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();

        for _ in 0..20 {
            ctx.proactor_mut().poll(Some(Duration::from_millis(20))).unwrap();
            if done.load(Ordering::SeqCst) {
                break;
            }
        }

        assert!(done.load(Ordering::SeqCst));
    }
}
