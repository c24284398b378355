//! Per-worker mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls, draining each socket until it
//! would block (mio's notifications are edge-triggered). One iteration reads
//! the clock once, sweeps connection deadlines, blocks in `poll` no longer
//! than the nearest deadline, and processes the delivered batch in order.
//!
//! Admission control: when the pool is full the listener is deregistered
//! from the poller entirely, so pending connections wait in the kernel
//! backlog instead of waking the loop; it is re-registered as soon as a slot
//! frees.

use crate::config::{Config, OverflowPolicy};
use crate::http::parser::{split_fields, FeedResult};
use crate::http::response;
use crate::runtime::pool::{ConnPool, ConnSlot};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Readiness events drained per poll call.
const EVENT_BATCH: usize = 64;

/// What to do with a connection after handling its event.
enum Disposition {
    Keep,
    Close,
}

/// How far a send attempt got.
enum SendProgress {
    /// The whole response was flushed.
    Done,
    /// The transport would block; wait for writability.
    Blocked,
}

/// Run one worker's accept/parse/respond loop until a fatal error.
///
/// Everything here is single-owner: the pool, the scratch buffer, and the
/// poller registrations are mutated only by this thread.
pub fn worker_loop(worker_id: usize, addr: SocketAddr, config: &Config) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENT_BATCH);

    let listener = create_listener_with_reuseport(addr)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let mut listener_active = true;

    let mut pool = ConnPool::new(config.max_connections, config.field_buffer_size);

    // One scratch buffer stages both socket reads and outbound responses; at
    // most one connection touches it per event, so there is no contention.
    let mut scratch = vec![0u8; config.buffer_size];

    let grace = Duration::from_millis(config.grace_ms);

    info!(
        worker = worker_id,
        capacity = pool.capacity(),
        grace_ms = config.grace_ms,
        "Worker started"
    );

    loop {
        let now = Instant::now();
        let timeout = sweep_deadlines(&mut poll, &mut pool, now);

        // Resume accepting if slots freed up while the listener was paused.
        if !listener_active && !pool.is_full() {
            poll.registry()
                .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
            listener_active = true;
        }

        poll.poll(&mut events, timeout)?;

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &mut listener,
                        &mut listener_active,
                        &mut poll,
                        &mut pool,
                        grace,
                        worker_id,
                    )?;
                }
                Token(conn_id) => {
                    match handle_connection_event(
                        conn_id,
                        event,
                        &mut poll,
                        &mut pool,
                        &mut scratch,
                        config.overflow,
                    ) {
                        Ok(Disposition::Keep) => {}
                        Ok(Disposition::Close) => {
                            close_connection(&mut poll, &mut pool, conn_id);
                        }
                        Err(e) => {
                            debug!(conn_id, error = %e, "Connection error");
                            close_connection(&mut poll, &mut pool, conn_id);
                        }
                    }
                }
            }
        }
    }
}

/// Close expired connections and return how long the poller may block
/// before the next deadline fires. `None` means block indefinitely.
fn sweep_deadlines(poll: &mut Poll, pool: &mut ConnPool, now: Instant) -> Option<Duration> {
    // Walk a snapshot of the occupancy word, lowest bit first; closing a
    // slot mutates the live bitmap but not the snapshot, and nothing here
    // touches the heap.
    let mut snapshot = pool.occupied_bits();
    while snapshot != 0 {
        let conn_id = snapshot.trailing_zeros() as usize;
        snapshot &= snapshot - 1;

        if now >= pool.get(conn_id).deadline {
            debug!(conn_id, "Request timed out");
            close_connection(poll, pool, conn_id);
        }
    }

    next_timeout(pool, now)
}

/// Minimum remaining time-to-deadline across occupied slots.
fn next_timeout(pool: &ConnPool, now: Instant) -> Option<Duration> {
    pool.occupied_ids()
        .map(|id| pool.get(id).deadline.saturating_duration_since(now))
        .min()
}

/// Drain pending connections from the listener until it would block or the
/// pool fills. At capacity the listener is deregistered; the top of the
/// worker loop re-registers it once a slot frees.
fn accept_connections(
    listener: &mut TcpListener,
    listener_active: &mut bool,
    poll: &mut Poll,
    pool: &mut ConnPool,
    grace: Duration,
    worker_id: usize,
) -> io::Result<()> {
    loop {
        if pool.is_full() {
            poll.registry().deregister(listener)?;
            *listener_active = false;
            debug!(worker = worker_id, "Pool full, pausing listener");
            return Ok(());
        }

        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let Some(conn_id) = pool.alloc() else {
                    // Saturated despite the check above; drop the socket
                    // without touching any slot.
                    warn!(worker = worker_id, "Connection pool exhausted, rejecting");
                    drop(stream);
                    continue;
                };

                let slot = pool.get_mut(conn_id);
                slot.deadline = Instant::now() + grace;
                let stream = slot.stream.insert(stream);
                poll.registry()
                    .register(stream, Token(conn_id), Interest::READABLE)?;

                debug!(
                    worker = worker_id,
                    conn_id,
                    peer = %peer_addr,
                    "Accepted connection"
                );
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                // The queued connection may already be gone (ECONNABORTED
                // and friends). Keep draining: the listener notification is
                // edge-triggered, so stopping short with a non-empty backlog
                // would stall accepts until the next connection arrives.
                warn!(worker = worker_id, error = %e, "Accept error");
                continue;
            }
        }
    }
}

fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    poll: &mut Poll,
    pool: &mut ConnPool,
    scratch: &mut [u8],
    overflow: OverflowPolicy,
) -> io::Result<Disposition> {
    if !pool.contains(conn_id) {
        return Ok(Disposition::Keep);
    }

    // Peer hangup or socket error ends the connection no matter which phase
    // it was in; no response is attempted.
    if event.is_error() || event.is_read_closed() {
        return Ok(Disposition::Close);
    }

    if event.is_readable() {
        return handle_readable(conn_id, poll, pool, scratch, overflow);
    }

    if event.is_writable() {
        return handle_writable(conn_id, pool, scratch);
    }

    Ok(Disposition::Keep)
}

/// Read and parse until the socket would block or the request reaches a
/// terminal parse result.
fn handle_readable(
    conn_id: usize,
    poll: &mut Poll,
    pool: &mut ConnPool,
    scratch: &mut [u8],
    overflow: OverflowPolicy,
) -> io::Result<Disposition> {
    loop {
        let slot = pool.get_mut(conn_id);
        let Some(stream) = slot.stream.as_mut() else {
            return Ok(Disposition::Close);
        };

        let n = match stream.read(scratch) {
            // Peer closed before the request completed.
            Ok(0) => return Ok(Disposition::Close),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Disposition::Keep),
            Err(e) => return Err(e),
        };

        let ConnSlot { parser, fields, .. } = &mut *slot;
        match parser.feed(&scratch[..n], fields) {
            FeedResult::NeedMoreData => continue,
            FeedResult::Malformed => {
                debug!(conn_id, "Malformed request");
                return Ok(Disposition::Close);
            }
            FeedResult::FieldsTooSmall => {
                if overflow == OverflowPolicy::Close {
                    debug!(conn_id, "Request too large, closing");
                    return Ok(Disposition::Close);
                }
                slot.overflowed = true;
                return start_response(conn_id, poll, pool, scratch);
            }
            FeedResult::Complete => {
                return start_response(conn_id, poll, pool, scratch);
            }
        }
    }
}

/// The request is done; try to send the response right away. The socket is
/// often already writable, so this usually finishes without another poll
/// round trip.
fn start_response(
    conn_id: usize,
    poll: &mut Poll,
    pool: &mut ConnPool,
    scratch: &mut [u8],
) -> io::Result<Disposition> {
    let slot = pool.get_mut(conn_id);
    match drive_send(slot, scratch)? {
        SendProgress::Done => Ok(Disposition::Close),
        SendProgress::Blocked => {
            // Stop reading; wait until the transport accepts more bytes.
            let Some(stream) = slot.stream.as_mut() else {
                return Ok(Disposition::Close);
            };
            poll.registry()
                .reregister(stream, Token(conn_id), Interest::WRITABLE)?;
            Ok(Disposition::Keep)
        }
    }
}

fn handle_writable(
    conn_id: usize,
    pool: &mut ConnPool,
    scratch: &mut [u8],
) -> io::Result<Disposition> {
    let slot = pool.get_mut(conn_id);
    match drive_send(slot, scratch)? {
        SendProgress::Done => Ok(Disposition::Close),
        // Still registered for writability.
        SendProgress::Blocked => Ok(Disposition::Keep),
    }
}

/// Serialize the response into the scratch buffer and push the unsent tail
/// into the socket until done or blocked.
fn drive_send(slot: &mut ConnSlot, scratch: &mut [u8]) -> io::Result<SendProgress> {
    // Rebuild the response on every attempt: the packed fields persist, so
    // the bytes are identical and only the sent counter moves. For most
    // connections this happens exactly once.
    let len = if slot.overflowed {
        response::render_too_long(scratch)
    } else {
        let Some((path, host)) = split_fields(&slot.fields) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "field buffer missing path or host",
            ));
        };
        response::render_redirect(path, host, scratch)
    };
    if len == 0 {
        // Config validation sizes the scratch buffer to fit any response.
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "response exceeds scratch buffer",
        ));
    }

    let Some(stream) = slot.stream.as_mut() else {
        return Err(io::Error::new(io::ErrorKind::NotConnected, "no socket"));
    };

    while slot.sent < len {
        match stream.write(&scratch[slot.sent..len]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => slot.sent += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(SendProgress::Blocked)
            }
            Err(e) => return Err(e),
        }
    }

    Ok(SendProgress::Done)
}

fn close_connection(poll: &mut Poll, pool: &mut ConnPool, conn_id: usize) {
    if !pool.contains(conn_id) {
        return;
    }

    if let Some(mut stream) = pool.get_mut(conn_id).stream.take() {
        let _ = poll.registry().deregister(&mut stream);
        // Dropping the stream closes the socket.
    }
    pool.free(conn_id);

    debug!(conn_id, "Connection closed");
}

/// Create a TCP listener with SO_REUSEPORT so every worker binds the same
/// address and the kernel load-balances accepts between them.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_deadlines(now: Instant, offsets_ms: &[u64]) -> ConnPool {
        let mut pool = ConnPool::new(8, 16);
        for &ms in offsets_ms {
            let id = pool.alloc().unwrap();
            pool.get_mut(id).deadline = now + Duration::from_millis(ms);
        }
        pool
    }

    #[test]
    fn test_next_timeout_empty_pool() {
        let pool = ConnPool::new(4, 16);
        assert_eq!(next_timeout(&pool, Instant::now()), None);
    }

    #[test]
    fn test_next_timeout_picks_minimum() {
        let now = Instant::now();
        let pool = pool_with_deadlines(now, &[500, 120, 2000]);

        let timeout = next_timeout(&pool, now).unwrap();
        assert_eq!(timeout, Duration::from_millis(120));

        // The wait bound never exceeds any slot's remaining time.
        for id in pool.occupied_ids() {
            assert!(timeout <= pool.get(id).deadline.saturating_duration_since(now));
        }
    }

    #[test]
    fn test_next_timeout_expired_deadline_saturates() {
        let now = Instant::now();
        let mut pool = ConnPool::new(4, 16);
        let id = pool.alloc().unwrap();
        pool.get_mut(id).deadline = now - Duration::from_millis(50);

        // An already-expired deadline demands an immediate wakeup, not a
        // panic or an underflow.
        assert_eq!(next_timeout(&pool, now), Some(Duration::ZERO));
    }

    #[test]
    fn test_sweep_closes_only_expired() {
        let now = Instant::now();
        let mut poll = Poll::new().unwrap();
        let mut pool = ConnPool::new(8, 16);

        let expired = pool.alloc().unwrap();
        pool.get_mut(expired).deadline = now - Duration::from_millis(1);
        let live = pool.alloc().unwrap();
        pool.get_mut(live).deadline = now + Duration::from_millis(800);

        let timeout = sweep_deadlines(&mut poll, &mut pool, now);

        assert!(!pool.contains(expired));
        assert!(pool.contains(live));
        assert_eq!(timeout, Some(Duration::from_millis(800)));
    }

    #[test]
    fn test_sweep_closes_all_expired_among_live() {
        let now = Instant::now();
        let mut poll = Poll::new().unwrap();
        let mut pool = ConnPool::new(8, 16);

        // Interleave expired and live slots so freeing during the sweep
        // cannot skip a later expired id.
        for i in 0..5 {
            let id = pool.alloc().unwrap();
            pool.get_mut(id).deadline = if i % 2 == 0 {
                now - Duration::from_millis(1)
            } else {
                now + Duration::from_millis(300)
            };
        }

        let timeout = sweep_deadlines(&mut poll, &mut pool, now);

        let remaining: Vec<usize> = pool.occupied_ids().collect();
        assert_eq!(remaining, vec![1, 3]);
        assert_eq!(timeout, Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_accept_drains_backlog_to_would_block() {
        let mut poll = Poll::new().unwrap();
        let std_listener =
            create_listener_with_reuseport("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let mut listener = TcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .unwrap();
        let mut listener_active = true;
        let mut pool = ConnPool::new(4, 16);

        // Queue two connections before draining; one edge must yield both.
        let _clients: Vec<std::net::TcpStream> = (0..2)
            .map(|_| std::net::TcpStream::connect(addr).unwrap())
            .collect();

        let mut events = Events::with_capacity(8);
        let give_up = Instant::now() + Duration::from_secs(2);
        while pool.len() < 2 && Instant::now() < give_up {
            poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    accept_connections(
                        &mut listener,
                        &mut listener_active,
                        &mut poll,
                        &mut pool,
                        Duration::from_secs(2),
                        0,
                    )
                    .unwrap();
                }
            }
        }

        assert_eq!(pool.len(), 2);
        assert!(listener_active);
        for id in pool.occupied_ids() {
            assert!(pool.get(id).stream.is_some());
        }
    }

    #[test]
    fn test_sweep_at_exact_deadline_closes() {
        let now = Instant::now();
        let mut poll = Poll::new().unwrap();
        let mut pool = ConnPool::new(4, 16);

        let id = pool.alloc().unwrap();
        pool.get_mut(id).deadline = now;

        let timeout = sweep_deadlines(&mut poll, &mut pool, now);
        assert!(!pool.contains(id));
        assert_eq!(timeout, None);
    }
}
