//! multiprocess::pipe — bidirectional, poll-capable process-pair channels.
//!
//! Purpose
//! -------
//! Provide the byte transport every protocol in this layer runs on: a
//! pair of endpoints created before a fork, each exclusively owned by one
//! process afterwards, carrying framed typed messages with explicit
//! flush-commit and poll-based readiness.
//!
//! Key behaviors
//! -------------
//! - Two transports behind one API: a shared-memory ring per direction
//!   (lower latency; readiness signalled through a socketpair so `poll`
//!   works on a file descriptor) and a plain socketpair.
//! - Writes accumulate in a userspace buffer and hit the wire only on
//!   [`PipeEnd::flush`]; a flush against a full ring blocks until the peer
//!   consumes.
//! - Reads consume exactly the bytes written by the matching send; framing
//!   errors surface as fatal protocol errors.
//! - [`poll_pipes`] multiplexes readiness over any set of endpoints with
//!   per-pipe FIFO ordering and no cross-pipe guarantees.
//! - [`PipeEnd::close`] collects the attached child's exit status on the
//!   parent side.
//!
//! Invariants & assumptions
//! ------------------------
//! - Each endpoint is read and written by exactly one process after the
//!   fork; ring cursors are single-producer/single-consumer atomics.
//! - Ring capacity is far above any protocol batch; a single frame larger
//!   than the ring is rejected outright rather than deadlocking.
//! - Endpoints are not Send: a process's endpoints live on the thread that
//!   forked.
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::multiprocess::errors::{MpError, MpResult};
use crate::multiprocess::messages::WireTag;

/// Per-direction ring capacity. Power of two; index masks depend on it.
pub const RING_CAPACITY: usize = 1 << 20;
/// Cursor block at the head of each mapping, cache-line separated.
const RING_HEADER: usize = 128;
/// Upper bound on a single length-prefixed blob; guards framing errors
/// from being amplified into huge allocations.
const MAX_BLOB: usize = 1 << 30;

/// Transport selection for a pipe pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// mmap'd single-producer/single-consumer ring per direction.
    SharedMemory,
    /// AF_UNIX stream socketpair.
    SocketPair,
}

// ---- Shared-memory ring ----

/// One direction of a shared-memory pipe: an anonymous MAP_SHARED mapping
/// holding consumer/producer cursors and a power-of-two data area. Created
/// before the fork; both processes address the same physical pages.
struct SharedRing {
    base: *mut u8,
}

impl SharedRing {
    fn create() -> MpResult<SharedRing> {
        // Safety: anonymous shared mapping with no file backing; checked
        // for MAP_FAILED before use.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                RING_HEADER + RING_CAPACITY,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MpError::last_os("mmap shared ring"));
        }
        Ok(SharedRing { base: base as *mut u8 })
    }

    /// Consumer cursor; advanced only by the reading process.
    fn head(&self) -> &AtomicUsize {
        // Safety: offset 0 of the mapping, aligned and initialized to zero
        // by the kernel.
        unsafe { &*(self.base as *const AtomicUsize) }
    }

    /// Producer cursor; advanced only by the writing process.
    fn tail(&self) -> &AtomicUsize {
        // Safety: one cache line into the header block.
        unsafe { &*(self.base.add(64) as *const AtomicUsize) }
    }

    fn data(&self) -> *mut u8 {
        // Safety: data area starts after the header block.
        unsafe { self.base.add(RING_HEADER) }
    }

    /// Bytes ready for the consumer.
    fn available(&self) -> usize {
        self.tail().load(Ordering::Acquire).wrapping_sub(self.head().load(Ordering::Relaxed))
    }

    /// Bytes of free space seen by the producer.
    fn free(&self) -> usize {
        RING_CAPACITY
            - self.tail().load(Ordering::Relaxed).wrapping_sub(self.head().load(Ordering::Acquire))
    }

    /// Copy `bytes` into the ring. Caller must have checked `free()`.
    fn push(&self, bytes: &[u8]) {
        let tail = self.tail().load(Ordering::Relaxed);
        let idx = tail & (RING_CAPACITY - 1);
        let first = bytes.len().min(RING_CAPACITY - idx);
        // Safety: the producer owns [tail, tail+len) while head lags by at
        // least len, as checked by the caller via free().
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data().add(idx), first);
            if first < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    self.data(),
                    bytes.len() - first,
                );
            }
        }
        self.tail().store(tail.wrapping_add(bytes.len()), Ordering::Release);
    }

    /// Copy up to `out.len()` available bytes out of the ring; returns the
    /// number copied.
    fn pop(&self, out: &mut [u8]) -> usize {
        let head = self.head().load(Ordering::Relaxed);
        let avail = self.tail().load(Ordering::Acquire).wrapping_sub(head);
        let n = avail.min(out.len());
        if n == 0 {
            return 0;
        }
        let idx = head & (RING_CAPACITY - 1);
        let first = n.min(RING_CAPACITY - idx);
        // Safety: the consumer owns [head, head+n); bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data().add(idx), out.as_mut_ptr(), first);
            if first < n {
                std::ptr::copy_nonoverlapping(self.data(), out.as_mut_ptr().add(first), n - first);
            }
        }
        self.head().store(head.wrapping_add(n), Ordering::Release);
        n
    }
}

impl Drop for SharedRing {
    fn drop(&mut self) {
        // Safety: base came from mmap with this exact length. Unmapping is
        // per-process; the peer's mapping is unaffected.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, RING_HEADER + RING_CAPACITY);
        }
    }
}

/// Both directions of a shared-memory pipe. Shared by the two pre-fork
/// endpoints through `Rc` so dropping the unused end after the fork does
/// not unmap the survivor's rings.
struct RingPair {
    a_to_b: SharedRing,
    b_to_a: SharedRing,
}

impl RingPair {
    fn inbound(&self, side: Side) -> &SharedRing {
        match side {
            Side::A => &self.b_to_a,
            Side::B => &self.a_to_b,
        }
    }

    fn outbound(&self, side: Side) -> &SharedRing {
        match side {
            Side::A => &self.a_to_b,
            Side::B => &self.b_to_a,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
    A,
    B,
}

enum Channel {
    Shm { rings: Rc<RingPair>, side: Side, fd: libc::c_int },
    Socket { fd: libc::c_int },
}

impl Channel {
    fn fd(&self) -> libc::c_int {
        match self {
            Channel::Shm { fd, .. } => *fd,
            Channel::Socket { fd } => *fd,
        }
    }
}

/// One endpoint of a bidirectional pipe.
///
/// Created in pairs by [`PipeEnd::pair`] before a fork; afterwards each
/// process keeps exactly one end and drops the other. All sends buffer
/// until [`PipeEnd::flush`].
pub struct PipeEnd {
    channel: Channel,
    wbuf: Vec<u8>,
    peer_pid: Option<libc::pid_t>,
    good: bool,
    closed: bool,
}

fn set_nonblocking(fd: libc::c_int) -> MpResult<()> {
    // Safety: plain fcntl flag manipulation on an owned fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(MpError::last_os("fcntl O_NONBLOCK"));
        }
    }
    Ok(())
}

impl PipeEnd {
    /// Create a connected endpoint pair on the chosen transport.
    ///
    /// For the shared-memory transport the socketpair carries only
    /// readiness signals; payload bytes live in the rings.
    pub fn pair(transport: Transport) -> MpResult<(PipeEnd, PipeEnd)> {
        let mut fds = [0 as libc::c_int; 2];
        // Safety: out-param socketpair; checked return.
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(MpError::last_os("socketpair"));
        }

        let make = |channel: Channel| PipeEnd {
            channel,
            wbuf: Vec::with_capacity(256),
            peer_pid: None,
            good: true,
            closed: false,
        };

        match transport {
            Transport::SharedMemory => {
                set_nonblocking(fds[0])?;
                set_nonblocking(fds[1])?;
                let rings = Rc::new(RingPair {
                    a_to_b: SharedRing::create()?,
                    b_to_a: SharedRing::create()?,
                });
                Ok((
                    make(Channel::Shm { rings: Rc::clone(&rings), side: Side::A, fd: fds[0] }),
                    make(Channel::Shm { rings, side: Side::B, fd: fds[1] }),
                ))
            }
            Transport::SocketPair => Ok((
                make(Channel::Socket { fd: fds[0] }),
                make(Channel::Socket { fd: fds[1] }),
            )),
        }
    }

    /// Record the child pid whose exit status [`PipeEnd::close`] collects.
    pub fn attach_child(&mut self, pid: libc::pid_t) {
        self.peer_pid = Some(pid);
    }

    /// False once any transport operation failed or the peer vanished.
    pub fn good(&self) -> bool {
        self.good
    }

    /// File descriptor to poll for read readiness.
    pub(crate) fn poll_fd(&self) -> libc::c_int {
        self.channel.fd()
    }

    /// True when a framed read would make progress without blocking.
    pub(crate) fn readable_now(&self) -> bool {
        self.bytes_readable_nonblocking() > 0
    }

    /// Bytes available to read right now, without blocking.
    pub fn bytes_readable_nonblocking(&self) -> usize {
        match &self.channel {
            Channel::Shm { rings, side, .. } => rings.inbound(*side).available(),
            Channel::Socket { fd } => {
                let mut n: libc::c_int = 0;
                // Safety: FIONREAD writes an int byte count.
                let rc = unsafe { libc::ioctl(*fd, libc::FIONREAD, &mut n) };
                if rc < 0 { 0 } else { n.max(0) as usize }
            }
        }
    }

    // ---- Buffered sends ----

    fn write_raw(&mut self, bytes: &[u8]) {
        self.wbuf.extend_from_slice(bytes);
    }

    pub fn send_u32(&mut self, v: u32) {
        self.write_raw(&v.to_ne_bytes());
    }

    pub fn send_u64(&mut self, v: u64) {
        self.write_raw(&v.to_ne_bytes());
    }

    pub fn send_f64(&mut self, v: f64) {
        self.write_raw(&v.to_ne_bytes());
    }

    pub fn send_bool(&mut self, v: bool) {
        self.write_raw(&[u8::from(v)]);
    }

    /// Length-prefixed byte blob.
    pub fn send_blob(&mut self, bytes: &[u8]) {
        self.send_u64(bytes.len() as u64);
        self.write_raw(bytes);
    }

    pub fn send_tag<T: WireTag>(&mut self, tag: T) {
        self.send_u32(tag.tag());
    }

    /// Commit everything buffered since the last flush.
    ///
    /// Socket transport: a blocking `write` loop. Shared-memory transport:
    /// wait for ring space (yield loop; rings dwarf any protocol batch),
    /// publish, then nudge the peer's poll fd with one signal byte.
    pub fn flush(&mut self) -> MpResult<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        match &self.channel {
            Channel::Socket { fd } => {
                let fd = *fd;
                let mut sent = 0;
                while sent < self.wbuf.len() {
                    // Safety: write from an owned buffer slice.
                    let rc = unsafe {
                        libc::write(
                            fd,
                            self.wbuf[sent..].as_ptr() as *const libc::c_void,
                            self.wbuf.len() - sent,
                        )
                    };
                    if rc < 0 {
                        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                        if errno == libc::EINTR {
                            continue;
                        }
                        self.good = false;
                        return Err(MpError::Io { context: "socket flush", errno });
                    }
                    sent += rc as usize;
                }
            }
            Channel::Shm { rings, side, fd } => {
                let fd = *fd;
                if self.wbuf.len() > RING_CAPACITY {
                    return Err(MpError::FrameTooLarge {
                        len: self.wbuf.len(),
                        capacity: RING_CAPACITY,
                    });
                }
                let ring = rings.outbound(*side);
                while ring.free() < self.wbuf.len() {
                    // Safety: cooperative wait for the peer to drain.
                    unsafe { libc::sched_yield() };
                }
                ring.push(&self.wbuf);
                let byte = [1u8];
                // Safety: one-byte nonblocking signal write; EAGAIN means
                // enough wakeups are already queued.
                let rc = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
                if rc < 0 {
                    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                    if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
                        self.good = false;
                        return Err(MpError::Io { context: "shm signal", errno });
                    }
                }
            }
        }
        self.wbuf.clear();
        Ok(())
    }

    // ---- Blocking framed reads ----

    /// Fill `out` exactly, blocking as needed.
    fn fill(&mut self, out: &mut [u8]) -> MpResult<()> {
        match &self.channel {
            Channel::Socket { fd } => {
                let fd = *fd;
                let mut got = 0;
                while got < out.len() {
                    // Safety: read into an owned buffer slice.
                    let rc = unsafe {
                        libc::read(
                            fd,
                            out[got..].as_mut_ptr() as *mut libc::c_void,
                            out.len() - got,
                        )
                    };
                    if rc == 0 {
                        self.good = false;
                        return Err(MpError::PeerClosed { context: "socket read" });
                    }
                    if rc < 0 {
                        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                        if errno == libc::EINTR {
                            continue;
                        }
                        self.good = false;
                        return Err(MpError::Io { context: "socket read", errno });
                    }
                    got += rc as usize;
                }
                Ok(())
            }
            Channel::Shm { rings, side, fd } => {
                let fd = *fd;
                let ring = rings.inbound(*side);
                let mut got = 0;
                while got < out.len() {
                    let n = ring.pop(&mut out[got..]);
                    got += n;
                    if got < out.len() && n == 0 {
                        if let Err(e) = wait_signal(fd) {
                            self.good = false;
                            return Err(e);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    pub fn recv_u32(&mut self) -> MpResult<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(u32::from_ne_bytes(b))
    }

    pub fn recv_u64(&mut self) -> MpResult<u64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(u64::from_ne_bytes(b))
    }

    pub fn recv_f64(&mut self) -> MpResult<f64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(f64::from_ne_bytes(b))
    }

    pub fn recv_bool(&mut self) -> MpResult<bool> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0] != 0)
    }

    pub fn recv_blob(&mut self) -> MpResult<Vec<u8>> {
        let len = self.recv_u64()? as usize;
        if len > MAX_BLOB {
            return Err(MpError::FrameTooLarge { len, capacity: MAX_BLOB });
        }
        let mut bytes = vec![0u8; len];
        self.fill(&mut bytes)?;
        Ok(bytes)
    }

    pub fn recv_tag<T: WireTag>(&mut self) -> MpResult<T> {
        T::from_tag(self.recv_u32()?)
    }

    /// Read one tag and require it to be `expected`.
    pub fn expect_tag<T: WireTag + PartialEq>(
        &mut self, expected: T, name: &'static str,
    ) -> MpResult<()> {
        let tag = self.recv_u32()?;
        if T::from_tag(tag)? != expected {
            return Err(MpError::Handshake { expected: name, tag });
        }
        Ok(())
    }

    /// Close the endpoint; on a parent end with an attached child, reap it
    /// and return its exit status (0 otherwise).
    pub fn close(&mut self) -> MpResult<i32> {
        if !self.closed {
            // Safety: closing an fd owned by this endpoint.
            unsafe { libc::close(self.channel.fd()) };
            self.closed = true;
            self.good = false;
        }
        if let Some(pid) = self.peer_pid.take() {
            let mut status: libc::c_int = 0;
            // Safety: blocking wait on a child this process forked.
            let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
            if rc < 0 {
                return Err(MpError::last_os("waitpid"));
            }
            if libc::WIFEXITED(status) {
                return Ok(libc::WEXITSTATUS(status));
            }
            if libc::WIFSIGNALED(status) {
                return Ok(128 + libc::WTERMSIG(status));
            }
        }
        Ok(0)
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        if !self.closed {
            // Safety: closing an fd owned by this endpoint. Children are
            // reaped by explicit close(); never block in a destructor.
            unsafe { libc::close(self.channel.fd()) };
            self.closed = true;
        }
    }
}

/// Block until `fd` is readable, then consume one signal byte. EOF means
/// the peer is gone.
fn wait_signal(fd: libc::c_int) -> MpResult<()> {
    loop {
        let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        // Safety: single pollfd with infinite timeout.
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            return Err(MpError::Io { context: "signal poll", errno });
        }
        let mut byte = [0u8; 1];
        // Safety: one-byte read on an owned nonblocking fd.
        let rc = unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        if rc == 0 {
            return Err(MpError::PeerClosed { context: "signal read" });
        }
        if rc < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR || errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                continue;
            }
            return Err(MpError::Io { context: "signal read", errno });
        }
        return Ok(());
    }
}

// ---- Readiness multiplexing ----

/// One pipe's slot in a [`poll_pipes`] call; `ready` is set when a framed
/// read on this pipe would make progress (or fail fast on a dead peer).
pub struct PollEntry<'a> {
    pub pipe: &'a mut PipeEnd,
    pub ready: bool,
}

impl<'a> PollEntry<'a> {
    pub fn new(pipe: &'a mut PipeEnd) -> Self {
        PollEntry { pipe, ready: false }
    }
}

/// Wait until at least one entry is readable; returns how many are.
///
/// `timeout_ms < 0` waits indefinitely; `0` is a nonblocking scan. Shared
/// memory entries drain stale signal bytes internally, so a wakeup with an
/// empty ring re-polls instead of reporting a false positive. A peer that
/// died with an empty ring is reported ready so the subsequent read can
/// surface the failure.
pub fn poll_pipes(entries: &mut [PollEntry<'_>], timeout_ms: i32) -> MpResult<usize> {
    loop {
        let mut n_ready = 0;
        for entry in entries.iter_mut() {
            entry.ready = entry.pipe.readable_now();
            if entry.ready {
                n_ready += 1;
            }
        }
        if n_ready > 0 || timeout_ms == 0 {
            return Ok(n_ready);
        }

        let mut fds: Vec<libc::pollfd> = entries
            .iter()
            .map(|e| libc::pollfd { fd: e.pipe.poll_fd(), events: libc::POLLIN, revents: 0 })
            .collect();
        // Safety: fds points at a live vector of initialized pollfds.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            return Err(MpError::Io { context: "poll", errno });
        }
        if rc == 0 {
            return Ok(0);
        }

        let mut any_dead = false;
        for (entry, pfd) in entries.iter_mut().zip(&fds) {
            if pfd.revents == 0 {
                continue;
            }
            match &entry.pipe.channel {
                Channel::Shm { .. } => {
                    // Drain queued signal bytes; data they announce is
                    // visible in the ring by the time the signal lands.
                    let mut sink = [0u8; 32];
                    // Safety: nonblocking read on an owned fd.
                    unsafe {
                        libc::read(pfd.fd, sink.as_mut_ptr() as *mut libc::c_void, sink.len())
                    };
                    let hup = pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0;
                    if hup && !entry.pipe.readable_now() {
                        // Dead peer, nothing buffered: report ready so the
                        // reader trips over PeerClosed instead of spinning.
                        entry.ready = true;
                        any_dead = true;
                    }
                }
                Channel::Socket { .. } => {
                    // POLLIN with zero buffered bytes is EOF on a stream
                    // socket; report ready so the reader surfaces
                    // PeerClosed instead of poll spinning on the hangup.
                    if !entry.pipe.readable_now() {
                        entry.ready = true;
                        any_dead = true;
                    }
                }
            }
        }
        if any_dead {
            return Ok(entries.iter().filter(|e| e.ready).count());
        }
        // Re-scan; socket data or freshly signalled rings show up in
        // readable_now() on the next pass.
    }
}
