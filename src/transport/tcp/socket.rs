//! Network socket: framed messaging over TCP or Unix-domain streams.
//!
//! Each part travels as `[flags u8][len u64 le][payload]`; bit 0 of the
//! flags marks "more parts follow". A bound socket runs an acceptor thread;
//! a connecting socket runs one connector thread per endpoint which keeps
//! retrying until the remote appears and reconnects if it goes away. Every
//! live peer has a reader thread that pushes complete part groups into the
//! socket's inbox under a single lock, which is what makes multipart
//! delivery atomic for consumers.

use super::message::TcpMessage;
use crate::error::{TransferError, TransferResult, TransportError};
use crate::parts::Parts;
use crate::transport::{
    parse_endpoint, Endpoint, Message, MessagePtr, Socket, SocketType, Transport, OPT_LINGER,
    OPT_RCV_HWM, OPT_RCV_KERNEL_SIZE, OPT_RCV_SIZE, OPT_SND_HWM, OPT_SND_KERNEL_SIZE,
    OPT_SND_SIZE,
};
use parking_lot::{Condvar, Mutex};
use socket2::SockRef;
use std::collections::{HashSet, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const IO_SLICE: Duration = Duration::from_millis(50);
const ACCEPT_SLICE: Duration = Duration::from_millis(10);
const CONNECT_RETRY: Duration = Duration::from_millis(100);
const NO_PEER_RETRY: Duration = Duration::from_millis(2);
const FLAG_MORE: u8 = 0x01;
// Sanity bound for a single part; protects against garbage framing.
const MAX_PART: u64 = 1 << 33;

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn try_clone(&self) -> std::io::Result<Stream> {
        match self {
            Stream::Tcp(s) => s.try_clone().map(Stream::Tcp),
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
        }
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(dur),
            Stream::Unix(s) => s.set_read_timeout(dur),
        }
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_write_timeout(dur),
            Stream::Unix(s) => s.set_write_timeout(dur),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }

    /// Apply kernel buffer sizes and latency options to a fresh connection.
    fn configure(&self, snd_kernel: i32, rcv_kernel: i32) {
        if let Stream::Tcp(s) = self {
            let _ = s.set_nodelay(true);
        }
        let sock = match self {
            Stream::Tcp(s) => SockRef::from(s),
            Stream::Unix(s) => SockRef::from(s),
        };
        if snd_kernel > 0 {
            if let Err(e) = sock.set_send_buffer_size(snd_kernel as usize) {
                warn!("could not set send kernel buffer size: {e}");
            }
        }
        if rcv_kernel > 0 {
            if let Err(e) = sock.set_recv_buffer_size(rcv_kernel as usize) {
                warn!("could not set receive kernel buffer size: {e}");
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    fn accept(&self) -> std::io::Result<Stream> {
        match self {
            Listener::Tcp(l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
            Listener::Unix(l) => l.accept().map(|(s, _)| Stream::Unix(s)),
        }
    }
}

struct InPart {
    data: Vec<u8>,
    more: bool,
}

struct Peer {
    id: u64,
    writer: Arc<Mutex<Stream>>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct Options {
    linger: AtomicI32,
    snd_hwm: AtomicI32,
    rcv_hwm: AtomicI32,
    snd_kernel: AtomicI32,
    rcv_kernel: AtomicI32,
}

#[derive(Default)]
struct Counters {
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    msgs_tx: AtomicU64,
    msgs_rx: AtomicU64,
}

struct Shared {
    inbox: Mutex<VecDeque<InPart>>,
    cv: Condvar,
    peers: Mutex<Vec<Peer>>,
    next_peer_id: AtomicU64,
    rr: AtomicUsize,
    options: Options,
    counters: Counters,
    closed: AtomicBool,
    interrupt: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attach a fresh connection: register the write half, spawn a reader
    /// for the read half. Returns the peer's liveness flag.
    fn add_peer(self: &Arc<Self>, stream: Stream, id_for_log: &str) -> Option<Arc<AtomicBool>> {
        let _ = stream.set_read_timeout(Some(IO_SLICE));
        let _ = stream.set_write_timeout(Some(IO_SLICE));
        stream.configure(
            self.options.snd_kernel.load(Ordering::Relaxed),
            self.options.rcv_kernel.load(Ordering::Relaxed),
        );
        let reader = match stream.try_clone() {
            Ok(r) => r,
            Err(e) => {
                warn!("{id_for_log}: could not clone stream for reading: {e}");
                return None;
            }
        };
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        self.peers.lock().push(Peer {
            id: peer_id,
            writer: Arc::new(Mutex::new(stream)),
            alive: alive.clone(),
        });
        let shared = self.clone();
        let reader_alive = alive.clone();
        let handle = thread::spawn(move || shared.reader_loop(reader, peer_id, reader_alive));
        self.threads.lock().push(handle);
        trace!("{id_for_log}: peer {peer_id} attached");
        Some(alive)
    }

    fn remove_peer(&self, peer_id: u64) {
        let mut peers = self.peers.lock();
        if let Some(pos) = peers.iter().position(|p| p.id == peer_id) {
            peers[pos].alive.store(false, Ordering::Release);
            peers.remove(pos);
        }
    }

    /// Read exactly `buf.len()` bytes, riding out timeout slices. Returns
    /// false on EOF, hard error or socket close.
    fn read_full(&self, stream: &mut Stream, buf: &mut [u8]) -> bool {
        let mut read = 0;
        while read < buf.len() {
            if self.closed() {
                return false;
            }
            match stream.read(&mut buf[read..]) {
                Ok(0) => return false,
                Ok(n) => read += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(_) => return false,
            }
        }
        true
    }

    fn reader_loop(self: Arc<Self>, mut stream: Stream, peer_id: u64, alive: Arc<AtomicBool>) {
        let mut group: Vec<InPart> = Vec::new();
        'conn: while !self.closed() && alive.load(Ordering::Acquire) {
            let mut header = [0u8; 9];
            if !self.read_full(&mut stream, &mut header) {
                break;
            }
            let more = header[0] & FLAG_MORE != 0;
            let len = u64::from_le_bytes(header[1..9].try_into().expect("9-byte header"));
            if len > MAX_PART {
                warn!("peer {peer_id}: oversized part of {len} bytes, dropping connection");
                break;
            }
            let mut data = vec![0u8; len as usize];
            if !self.read_full(&mut stream, &mut data) {
                break;
            }
            group.push(InPart { data, more });
            if more {
                continue;
            }

            // Deliver the whole group under one inbox lock; a consumer
            // either sees all parts or none of them.
            let mut inbox = self.inbox.lock();
            loop {
                let hwm = self.options.rcv_hwm.load(Ordering::Relaxed);
                if hwm <= 0 || inbox.len() < hwm as usize {
                    break;
                }
                if self.closed() {
                    break 'conn;
                }
                let _ = self.cv.wait_for(&mut inbox, IO_SLICE);
            }
            let bytes: usize = group.iter().map(|p| p.data.len()).sum();
            let parts = group.len() as u64;
            for part in group.drain(..) {
                inbox.push_back(part);
            }
            drop(inbox);
            self.counters.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
            self.counters.msgs_rx.fetch_add(parts, Ordering::Relaxed);
            self.cv.notify_all();
        }
        self.remove_peer(peer_id);
    }

    /// Write all of `buf`, bounded by `deadline`. Returns the failure kind
    /// and whether any bytes of the current group already hit the wire.
    fn write_all_deadline(
        &self,
        stream: &mut Stream,
        buf: &[u8],
        deadline: Option<Instant>,
        dirty: &mut bool,
    ) -> Result<(), TransferError> {
        let mut written = 0;
        while written < buf.len() {
            if self.interrupted() {
                return Err(TransferError::Interrupted);
            }
            match stream.write(&buf[written..]) {
                Ok(0) => return Err(TransferError::Error),
                Ok(n) => {
                    written += n;
                    *dirty = true;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(TransferError::Timeout);
                        }
                    }
                }
                Err(_) => return Err(TransferError::Error),
            }
        }
        Ok(())
    }

    /// Send a complete part group to one peer. `Err((kind, dirty))` reports
    /// whether the stream was left mid-frame (and must be dropped).
    fn write_group(
        &self,
        peer: &Peer,
        views: &[&[u8]],
        deadline: Option<Instant>,
    ) -> Result<(), (TransferError, bool)> {
        let mut writer = peer.writer.lock();
        let mut dirty = false;
        let last = views.len() - 1;
        for (i, view) in views.iter().enumerate() {
            let mut header = [0u8; 9];
            header[0] = if i < last { FLAG_MORE } else { 0 };
            header[1..9].copy_from_slice(&(view.len() as u64).to_le_bytes());
            self.write_all_deadline(&mut writer, &header, deadline, &mut dirty)
                .map_err(|e| (e, dirty))?;
            self.write_all_deadline(&mut writer, view, deadline, &mut dirty)
                .map_err(|e| (e, dirty))?;
        }
        let _ = writer.flush();
        Ok(())
    }

    fn send_views(
        &self,
        stype: SocketType,
        views: &[&[u8]],
        timeout_ms: i64,
    ) -> Result<usize, TransferError> {
        let deadline = deadline_of(timeout_ms);
        loop {
            if self.interrupted() {
                return Err(TransferError::Interrupted);
            }
            // Snapshot the candidate peers for this attempt.
            let candidates: Vec<(u64, Peer)> = {
                let peers = self.peers.lock();
                if peers.is_empty() {
                    Vec::new()
                } else if stype.broadcasts() {
                    peers
                        .iter()
                        .map(|p| {
                            (p.id, Peer {
                                id: p.id,
                                writer: p.writer.clone(),
                                alive: p.alive.clone(),
                            })
                        })
                        .collect()
                } else {
                    let idx = self.rr.fetch_add(1, Ordering::Relaxed) % peers.len();
                    let p = &peers[idx];
                    vec![(p.id, Peer {
                        id: p.id,
                        writer: p.writer.clone(),
                        alive: p.alive.clone(),
                    })]
                }
            };

            if candidates.is_empty() {
                if reached(deadline) {
                    return Err(TransferError::Timeout);
                }
                thread::sleep(NO_PEER_RETRY);
                continue;
            }

            let mut delivered = false;
            for (peer_id, peer) in &candidates {
                match self.write_group(peer, views, deadline) {
                    Ok(()) => delivered = true,
                    Err((kind, dirty)) => {
                        if dirty || kind == TransferError::Error {
                            // Mid-frame abort corrupts the stream.
                            peer.writer.lock().shutdown();
                            self.remove_peer(*peer_id);
                        }
                        if kind != TransferError::Error && !delivered {
                            return Err(kind);
                        }
                    }
                }
            }
            if delivered {
                let bytes: usize = views.iter().map(|v| v.len()).sum();
                self.counters.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
                self.counters
                    .msgs_tx
                    .fetch_add(views.len() as u64, Ordering::Relaxed);
                return Ok(bytes);
            }
            if reached(deadline) {
                return Err(TransferError::Timeout);
            }
            // All candidates failed hard; retry against surviving peers.
        }
    }

    fn recv_one(&self, timeout_ms: i64) -> Result<InPart, TransferError> {
        let deadline = deadline_of(timeout_ms);
        let mut inbox = self.inbox.lock();
        loop {
            if self.interrupted() {
                return Err(TransferError::Interrupted);
            }
            if let Some(part) = inbox.pop_front() {
                self.cv.notify_all();
                return Ok(part);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransferError::Timeout);
                    }
                    let slice = IO_SLICE.min(deadline - now);
                    let _ = self.cv.wait_for(&mut inbox, slice);
                }
                None => {
                    let _ = self.cv.wait_for(&mut inbox, IO_SLICE);
                }
            }
        }
    }
}

fn deadline_of(timeout_ms: i64) -> Option<Instant> {
    if timeout_ms < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
    }
}

fn reached(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |d| Instant::now() >= d)
}

/// Network transport socket.
pub struct TcpSocket {
    id: String,
    stype: SocketType,
    shared: Arc<Shared>,
    bound: Mutex<HashSet<String>>,
    connecting: Mutex<HashSet<String>>,
}

impl TcpSocket {
    pub(crate) fn new(stype: SocketType, id: &str, interrupt: Arc<AtomicBool>) -> Self {
        let shared = Arc::new(Shared {
            inbox: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            peers: Mutex::new(Vec::new()),
            next_peer_id: AtomicU64::new(1),
            rr: AtomicUsize::new(0),
            options: Options {
                linger: AtomicI32::new(crate::defaults::LINGER_MS),
                snd_hwm: AtomicI32::new(crate::defaults::SND_BUF_SIZE),
                rcv_hwm: AtomicI32::new(crate::defaults::RCV_BUF_SIZE),
                snd_kernel: AtomicI32::new(0),
                rcv_kernel: AtomicI32::new(0),
            },
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            interrupt,
            threads: Mutex::new(Vec::new()),
        });
        Self {
            id: id.to_owned(),
            stype,
            shared,
            bound: Mutex::new(HashSet::new()),
            connecting: Mutex::new(HashSet::new()),
        }
    }

    fn check_transport(&self, msg: &MessagePtr) -> Result<(), TransferError> {
        if msg.transport() != Transport::Zeromq {
            warn!(
                "{}: dropping send of {} message on {} socket",
                self.id,
                msg.transport(),
                Transport::Zeromq
            );
            return Err(TransferError::Error);
        }
        Ok(())
    }
}

impl Socket for TcpSocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn transport(&self) -> Transport {
        Transport::Zeromq
    }

    fn bind(&self, address: &str) -> Result<(), TransportError> {
        {
            let mut bound = self.bound.lock();
            if bound.contains(address) {
                return Ok(()); // re-entering a bind is a no-op
            }
            bound.insert(address.to_owned());
        }
        let listener = match parse_endpoint(address)? {
            Endpoint::Tcp(authority) => {
                let l = TcpListener::bind(&authority)?;
                l.set_nonblocking(true)?;
                Listener::Tcp(l)
            }
            Endpoint::Ipc(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(&path);
                }
                let l = UnixListener::bind(&path)?;
                l.set_nonblocking(true)?;
                Listener::Unix(l)
            }
        };
        debug!("{}: listening on {address}", self.id);
        let shared = self.shared.clone();
        let id = self.id.clone();
        let handle = thread::spawn(move || loop {
            if shared.closed() {
                break;
            }
            match listener.accept() {
                Ok(stream) => {
                    shared.add_peer(stream, &id);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_SLICE),
                Err(e) => {
                    if !shared.closed() {
                        warn!("{id}: accept failed: {e}");
                    }
                    thread::sleep(ACCEPT_SLICE);
                }
            }
        });
        self.shared.threads.lock().push(handle);
        Ok(())
    }

    fn connect(&self, address: &str) -> Result<(), TransportError> {
        {
            let mut connecting = self.connecting.lock();
            if connecting.contains(address) {
                return Ok(());
            }
            connecting.insert(address.to_owned());
        }
        let endpoint = parse_endpoint(address)?;
        debug!("{}: connecting to {address}", self.id);
        let shared = self.shared.clone();
        let id = self.id.clone();
        let handle = thread::spawn(move || loop {
            if shared.closed() {
                break;
            }
            let attempt = match &endpoint {
                Endpoint::Tcp(authority) => TcpStream::connect(authority).map(Stream::Tcp),
                Endpoint::Ipc(path) => UnixStream::connect(path).map(Stream::Unix),
            };
            match attempt {
                Ok(stream) => match shared.add_peer(stream, &id) {
                    Some(alive) => {
                        // Sit on the live connection; reconnect when the
                        // reader declares it gone.
                        while alive.load(Ordering::Acquire) && !shared.closed() {
                            thread::sleep(CONNECT_RETRY);
                        }
                    }
                    None => thread::sleep(CONNECT_RETRY),
                },
                Err(_) => thread::sleep(CONNECT_RETRY),
            }
        });
        self.shared.threads.lock().push(handle);
        Ok(())
    }

    fn send(&self, msg: &mut MessagePtr, timeout_ms: i64) -> TransferResult {
        self.check_transport(msg)?;
        let bytes = {
            let view = msg.data();
            self.shared.send_views(self.stype, &[view], timeout_ms)?
        };
        if let Some(tcp) = msg.as_any_mut().downcast_mut::<TcpMessage>() {
            tcp.complete_send();
        }
        Ok(bytes)
    }

    fn receive(&self, msg: &mut MessagePtr, timeout_ms: i64) -> TransferResult {
        let part = self.shared.recv_one(timeout_ms)?;
        let bytes = part.data.len();
        *msg = Box::new(TcpMessage::from_vec(part.data));
        Ok(bytes)
    }

    fn send_parts(&self, parts: &mut Parts, timeout_ms: i64) -> TransferResult {
        if parts.is_empty() {
            return Err(TransferError::Error);
        }
        for part in parts.iter() {
            self.check_transport(part)?;
        }
        let bytes = {
            let views: Vec<&[u8]> = parts.iter().map(|p| p.data()).collect();
            self.shared.send_views(self.stype, &views, timeout_ms)?
        };
        for part in parts.iter_mut() {
            if let Some(tcp) = part.as_any_mut().downcast_mut::<TcpMessage>() {
                tcp.complete_send();
            }
        }
        Ok(bytes)
    }

    fn receive_parts(&self, parts: &mut Parts, timeout_ms: i64) -> TransferResult {
        let first = self.shared.recv_one(timeout_ms)?;
        let mut bytes = first.data.len();
        let mut more = first.more;
        parts.add_part(Box::new(TcpMessage::from_vec(first.data)));
        // Remaining parts of the group are already queued: the reader
        // pushed the whole group atomically.
        while more {
            let part = self.shared.recv_one(-1)?;
            bytes += part.data.len();
            more = part.more;
            parts.add_part(Box::new(TcpMessage::from_vec(part.data)));
        }
        Ok(bytes)
    }

    fn set_option(&self, name: &str, value: i32) -> Result<(), TransportError> {
        let opts = &self.shared.options;
        match name {
            OPT_LINGER => opts.linger.store(value, Ordering::Relaxed),
            OPT_SND_HWM | OPT_SND_SIZE => opts.snd_hwm.store(value, Ordering::Relaxed),
            OPT_RCV_HWM | OPT_RCV_SIZE => opts.rcv_hwm.store(value, Ordering::Relaxed),
            OPT_SND_KERNEL_SIZE => opts.snd_kernel.store(value, Ordering::Relaxed),
            OPT_RCV_KERNEL_SIZE => opts.rcv_kernel.store(value, Ordering::Relaxed),
            other => {
                return Err(TransportError::Socket(format!(
                    "unknown socket option: \"{other}\""
                )))
            }
        }
        Ok(())
    }

    fn option(&self, name: &str) -> Result<i32, TransportError> {
        let opts = &self.shared.options;
        let value = match name {
            OPT_LINGER => opts.linger.load(Ordering::Relaxed),
            OPT_SND_HWM | OPT_SND_SIZE => opts.snd_hwm.load(Ordering::Relaxed),
            OPT_RCV_HWM | OPT_RCV_SIZE => opts.rcv_hwm.load(Ordering::Relaxed),
            OPT_SND_KERNEL_SIZE => opts.snd_kernel.load(Ordering::Relaxed),
            OPT_RCV_KERNEL_SIZE => opts.rcv_kernel.load(Ordering::Relaxed),
            other => {
                return Err(TransportError::Socket(format!(
                    "unknown socket option: \"{other}\""
                )))
            }
        };
        Ok(value)
    }

    fn bytes_tx(&self) -> u64 {
        self.shared.counters.bytes_tx.load(Ordering::Relaxed)
    }

    fn bytes_rx(&self) -> u64 {
        self.shared.counters.bytes_rx.load(Ordering::Relaxed)
    }

    fn messages_tx(&self) -> u64 {
        self.shared.counters.msgs_tx.load(Ordering::Relaxed)
    }

    fn messages_rx(&self) -> u64 {
        self.shared.counters.msgs_rx.load(Ordering::Relaxed)
    }

    fn connected_peers(&self) -> usize {
        self.shared.peers.lock().len()
    }

    fn has_input(&self) -> bool {
        !self.shared.inbox.lock().is_empty()
    }

    fn has_output(&self) -> bool {
        !self.shared.peers.lock().is_empty()
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        for peer in self.shared.peers.lock().iter() {
            peer.alive.store(false, Ordering::Release);
            peer.writer.lock().shutdown();
        }
        self.shared.cv.notify_all();
        let handles: Vec<JoinHandle<()>> = self.shared.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}
