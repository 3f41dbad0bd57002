//! # Transport Abstraction
//!
//! One uniform message/socket/poller contract with two concrete
//! implementations:
//!
//! - [`tcp`], the network transport ("zeromq" in configuration): payloads
//!   travel inline over TCP or Unix-domain streams with length-prefixed
//!   framing.
//! - [`shmem`], the shared-memory transport: payloads live in shared
//!   segments or unmanaged regions; only small descriptors travel over an
//!   internal network meta-channel, so large buffers move by reference.
//!
//! A [`TransportFactory`] produces all objects of one transport kind.
//! Messages carry the tag of the factory that created them; a send on a
//! socket of a different transport fails rather than silently mixing wire
//! formats.

use crate::error::{TransferResult, TransportError};
use crate::parts::Parts;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub mod poller;
pub mod shmem;
pub mod tcp;

pub use poller::GenericPoller;

/// The transport kinds a channel can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// Resolved to the device-wide default before any factory is created.
    Default,
    /// Network transport (configuration name kept for compatibility with
    /// the message-queuing heritage of the wire).
    Zeromq,
    /// Shared-memory transport.
    Shmem,
}

impl Transport {
    pub fn name(self) -> &'static str {
        match self {
            Transport::Default => "default",
            Transport::Zeromq => "zeromq",
            Transport::Shmem => "shmem",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transport {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Transport::Default),
            "zeromq" => Ok(Transport::Zeromq),
            "shmem" => Ok(Transport::Shmem),
            other => Err(TransportError::UnknownTransport(other.to_owned())),
        }
    }
}

/// Messaging pattern of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    Pair,
    Pub,
    Sub,
    XPub,
    XSub,
    Push,
    Pull,
    Req,
    Rep,
    Dealer,
    Router,
}

impl SocketType {
    pub fn name(self) -> &'static str {
        match self {
            SocketType::Pair => "pair",
            SocketType::Pub => "pub",
            SocketType::Sub => "sub",
            SocketType::XPub => "xpub",
            SocketType::XSub => "xsub",
            SocketType::Push => "push",
            SocketType::Pull => "pull",
            SocketType::Req => "req",
            SocketType::Rep => "rep",
            SocketType::Dealer => "dealer",
            SocketType::Router => "router",
        }
    }

    /// Whether a send fans out to every connected peer (publish patterns)
    /// instead of round-robining over them.
    pub fn broadcasts(self) -> bool {
        matches!(self, SocketType::Pub | SocketType::XPub)
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SocketType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [SocketType; 11] = [
            SocketType::Pair,
            SocketType::Pub,
            SocketType::Sub,
            SocketType::XPub,
            SocketType::XSub,
            SocketType::Push,
            SocketType::Pull,
            SocketType::Req,
            SocketType::Rep,
            SocketType::Dealer,
            SocketType::Router,
        ];
        ALL.iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| TransportError::Socket(format!("unknown socket type: \"{s}\"")))
    }
}

/// Requested payload alignment in bytes; 0 leaves it to the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Alignment(pub usize);

/// Hook invoked with the buffer when a user-supplied payload leaves a
/// message's ownership (after a successful send, a rebuild, or drop).
pub type ReleaseHook = Box<dyn FnOnce(Vec<u8>) + Send>;

/// An opaque byte buffer owned by one transport.
///
/// A message is referred to through a unique handle ([`MessagePtr`]); the
/// buffer is valid from construction until the handle is dropped or the
/// payload is moved into a successful send, after which the handle stays
/// usable but empty. An interrupted or failed send leaves the payload
/// untouched so the caller can retry.
pub trait Message: Send {
    /// Discard the current payload and allocate a fresh one of `size` bytes.
    fn rebuild(&mut self, size: usize) -> Result<(), TransportError>;

    /// Like [`rebuild`](Self::rebuild) with an explicit alignment request.
    fn rebuild_aligned(&mut self, size: usize, alignment: Alignment) -> Result<(), TransportError>;

    /// Adopt a user-owned buffer without copying. `on_release` is invoked
    /// with the buffer once it leaves this message's ownership.
    fn rebuild_from(
        &mut self,
        data: Vec<u8>,
        on_release: Option<ReleaseHook>,
    ) -> Result<(), TransportError>;

    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];

    /// Used size in bytes; after [`set_used_size`](Self::set_used_size) all
    /// size queries return the new used size.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shrink the message in place. Growing is rejected (`false`); copies
    /// constructed afterwards inherit the new size.
    fn set_used_size(&mut self, size: usize) -> bool;

    /// Tag of the transport this message was created on.
    fn transport(&self) -> Transport;

    /// Copy the buffer from another message of the same transport. The
    /// transport may share the underlying buffer instead of copying bytes;
    /// mixing transports is rejected.
    fn copy_from(&mut self, other: &dyn Message) -> Result<(), TransportError>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Unique-ownership handle to a message.
pub type MessagePtr = Box<dyn Message>;

/// Tuning options a channel applies to its sockets, addressed by the
/// neutral names used in configuration.
pub const OPT_LINGER: &str = "linger";
pub const OPT_SND_HWM: &str = "snd-hwm";
pub const OPT_RCV_HWM: &str = "rcv-hwm";
pub const OPT_SND_SIZE: &str = "snd-size";
pub const OPT_RCV_SIZE: &str = "rcv-size";
pub const OPT_SND_KERNEL_SIZE: &str = "snd-kernel-size";
pub const OPT_RCV_KERNEL_SIZE: &str = "rcv-kernel-size";

/// One endpoint of a channel in one transport.
///
/// A socket is bound to exactly one channel and lives no longer than it.
/// All methods take `&self`: sockets synchronize internally so the worker
/// thread can move data while option reads (stats, rate logging) happen
/// elsewhere.
pub trait Socket: Send + Sync {
    fn id(&self) -> &str;

    fn transport(&self) -> Transport;

    /// Open a listening endpoint. Idempotent for the same address.
    fn bind(&self, address: &str) -> Result<(), TransportError>;

    /// Start a connection attempt, retried in the background until the
    /// remote appears. Idempotent for the same address.
    fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one message. `timeout_ms < 0` blocks until completion or
    /// interruption, `0` tries once, positive values bound the wait.
    /// On success the payload is moved out of `msg`.
    fn send(&self, msg: &mut MessagePtr, timeout_ms: i64) -> TransferResult;

    /// Receive one message into `msg`, replacing its payload.
    fn receive(&self, msg: &mut MessagePtr, timeout_ms: i64) -> TransferResult;

    /// Send all parts atomically: the receiver observes all or none. An
    /// error partway through leaves `parts` intact for a retry.
    fn send_parts(&self, parts: &mut Parts, timeout_ms: i64) -> TransferResult;

    /// Receive one atomic group of parts, appended to `parts`.
    fn receive_parts(&self, parts: &mut Parts, timeout_ms: i64) -> TransferResult;

    /// Set a tuning option by its neutral name (see the `OPT_*` constants).
    fn set_option(&self, name: &str, value: i32) -> Result<(), TransportError>;

    /// Read a tuning option by its neutral name.
    fn option(&self, name: &str) -> Result<i32, TransportError>;

    fn bytes_tx(&self) -> u64;
    fn bytes_rx(&self) -> u64;
    fn messages_tx(&self) -> u64;
    fn messages_rx(&self) -> u64;

    fn connected_peers(&self) -> usize;

    /// Readiness snapshots for pollers.
    fn has_input(&self) -> bool;
    fn has_output(&self) -> bool;
}

pub type SocketPtr = Arc<dyn Socket>;

/// Waits on the readability/writability of several sockets with a timeout.
///
/// Callers must not tear down a channel while a poll is in progress on it.
pub trait Poller: Send {
    /// Block until at least one member is ready or the timeout elapses
    /// (`timeout_ms < 0` waits forever).
    fn poll(&self, timeout_ms: i64) -> Result<(), TransportError>;

    fn check_input(&self, index: usize) -> bool;
    fn check_output(&self, index: usize) -> bool;

    /// Readiness of sub-socket `index` of the named channel.
    fn check_input_of(&self, channel: &str, index: usize) -> bool;
    fn check_output_of(&self, channel: &str, index: usize) -> bool;
}

pub type PollerPtr = Box<dyn Poller>;

/// A freed sub-range of an unmanaged region, reported back to its creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionBlock {
    pub offset: usize,
    pub size: usize,
}

/// Release notification style. The bulk form is preferred: the core calls
/// it with batches as acknowledgements arrive.
pub enum RegionCallback {
    PerBlock(Box<dyn FnMut(RegionBlock) + Send>),
    Bulk(Box<dyn FnMut(&[RegionBlock]) + Send>),
}

impl RegionCallback {
    pub(crate) fn deliver(&mut self, blocks: &[RegionBlock]) {
        match self {
            RegionCallback::PerBlock(f) => {
                for block in blocks {
                    f(*block);
                }
            }
            RegionCallback::Bulk(f) => f(blocks),
        }
    }
}

/// Creation parameters for an unmanaged region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub size: usize,
    /// Explicit identifier; `None` lets the transport pick the next free one.
    pub id: Option<u16>,
    /// Opaque to the core, readable back by the user.
    pub user_flags: i64,
    /// Lock the region into RAM on creation.
    pub lock: bool,
    /// Zero the region memory on creation.
    pub zero: bool,
    /// How long region teardown waits for outstanding acknowledgements.
    pub linger_ms: u64,
}

impl RegionConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            id: None,
            user_flags: 0,
            lock: false,
            zero: false,
            linger_ms: crate::defaults::REGION_LINGER_MS,
        }
    }
}

/// Transfer accounting of a region, for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub sent_blocks: u64,
    pub sent_bytes: u64,
    pub acked_blocks: u64,
    pub acked_bytes: u64,
}

/// A large contiguous buffer allocated once, from which zero-copy messages
/// are carved.
///
/// While the region exists, messages may reference sub-ranges of it; when
/// such a message completes its transfer at the receiver, the region's
/// release callback is eventually invoked on the creator side with the
/// freed sub-range(s). Teardown waits up to the configured linger for
/// outstanding acknowledgements and logs what never arrived.
pub trait UnmanagedRegion: Send + Sync {
    /// Identifier, unique within the transport (for shared memory: within
    /// the session).
    fn id(&self) -> u16;

    fn size(&self) -> usize;

    fn user_flags(&self) -> i64;

    fn transport(&self) -> Transport;

    /// Base pointer of the region. Carving non-overlapping sub-ranges is
    /// the caller's responsibility.
    fn data_ptr(&self) -> *mut u8;

    /// Carve a zero-copy message out of `[offset, offset + size)`.
    fn new_message(&self, offset: usize, size: usize) -> Result<MessagePtr, TransportError>;

    fn set_linger(&self, ms: u64);
    fn linger(&self) -> u64;

    fn stats(&self) -> RegionStats;

    /// Copy `data` into the region at `offset` (bounds-checked).
    fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), TransportError> {
        if offset.checked_add(data.len()).map_or(true, |end| end > self.size()) {
            return Err(TransportError::Region(format!(
                "write of {} bytes at offset {} exceeds region size {}",
                data.len(),
                offset,
                self.size()
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.data_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

pub type RegionPtr = Arc<dyn UnmanagedRegion>;

/// Placement strategy of a managed data segment's allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentAlgorithm {
    /// Smallest adequate free block.
    #[default]
    BestFit,
    /// First adequate free block.
    SeqFit,
}

impl fmt::Display for SegmentAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SegmentAlgorithm::BestFit => "rbtree_best_fit",
            SegmentAlgorithm::SeqFit => "simple_seq_fit",
        })
    }
}

impl FromStr for SegmentAlgorithm {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rbtree_best_fit" => Ok(SegmentAlgorithm::BestFit),
            "simple_seq_fit" => Ok(SegmentAlgorithm::SeqFit),
            other => Err(TransportError::Shmem(format!(
                "unknown allocation algorithm: \"{other}\""
            ))),
        }
    }
}

/// Session-scoped settings a factory is constructed against.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub session: String,
    pub device_id: String,
    pub shm_segment_size: usize,
    pub shm_allocation: SegmentAlgorithm,
    pub shm_mlock_segment: bool,
    pub shm_zero_segment: bool,
    pub shm_mlock_segment_on_creation: bool,
    pub shm_zero_segment_on_creation: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            session: "default".to_owned(),
            device_id: String::new(),
            shm_segment_size: crate::defaults::SHM_SEGMENT_SIZE,
            shm_allocation: SegmentAlgorithm::BestFit,
            shm_mlock_segment: false,
            shm_zero_segment: false,
            shm_mlock_segment_on_creation: false,
            shm_zero_segment_on_creation: false,
        }
    }
}

/// Factory producing messages, sockets, pollers and unmanaged regions for
/// one transport kind.
pub trait TransportFactory: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> Transport;

    fn new_message(&self) -> MessagePtr;

    fn new_message_with_size(&self, size: usize) -> Result<MessagePtr, TransportError>;

    fn new_message_aligned(
        &self,
        size: usize,
        alignment: Alignment,
    ) -> Result<MessagePtr, TransportError>;

    fn new_socket(&self, stype: SocketType, id: &str) -> Result<SocketPtr, TransportError>;

    /// Build a poller over `(channel name, sub-sockets)` groups.
    fn new_poller(&self, channels: &[(String, Vec<SocketPtr>)]) -> Result<PollerPtr, TransportError> {
        Ok(Box::new(GenericPoller::new(channels)))
    }

    fn new_region(
        &self,
        config: RegionConfig,
        callback: RegionCallback,
    ) -> Result<RegionPtr, TransportError>;

    /// Make every blocking operation on this transport return
    /// `Interrupted` until [`resume`](Self::resume) is called.
    fn interrupt(&self);

    fn resume(&self);

    fn interrupted(&self) -> bool;
}

pub type FactoryPtr = Arc<dyn TransportFactory>;

/// Instantiate a concrete transport. `Transport::Default` must be resolved
/// by the caller beforehand.
pub fn create_transport_factory(
    kind: Transport,
    id: &str,
    config: &FactoryConfig,
) -> Result<FactoryPtr, TransportError> {
    match kind {
        Transport::Zeromq => Ok(Arc::new(tcp::TcpFactory::new(id))),
        Transport::Shmem => Ok(Arc::new(shmem::ShmemFactory::new(id, config)?)),
        Transport::Default => Err(TransportError::UnknownTransport(
            "\"default\" must be resolved to a concrete transport before factory creation"
                .to_owned(),
        )),
    }
}

/// Concrete locator of the network transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Endpoint {
    /// `host:port`; a `*` host binds all interfaces.
    Tcp(String),
    /// Filesystem path of a Unix-domain socket.
    Ipc(PathBuf),
}

pub(crate) fn parse_endpoint(address: &str) -> Result<Endpoint, TransportError> {
    if let Some(authority) = address.strip_prefix("tcp://") {
        let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
            TransportError::BadAddress {
                address: address.to_owned(),
                reason: "expected tcp://host:port".to_owned(),
            }
        })?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(TransportError::BadAddress {
                address: address.to_owned(),
                reason: "expected tcp://host:port".to_owned(),
            });
        }
        let host = if host == "*" { "0.0.0.0" } else { host };
        Ok(Endpoint::Tcp(format!("{host}:{port}")))
    } else if let Some(path) = address.strip_prefix("ipc://") {
        if path.is_empty() {
            return Err(TransportError::BadAddress {
                address: address.to_owned(),
                reason: "empty ipc path".to_owned(),
            });
        }
        Ok(Endpoint::Ipc(PathBuf::from(path)))
    } else if address.starts_with("inproc://") || address.starts_with("verbs://") {
        Err(TransportError::BadAddress {
            address: address.to_owned(),
            reason: "scheme not supported by this transport".to_owned(),
        })
    } else {
        Err(TransportError::BadAddress {
            address: address.to_owned(),
            reason: "unknown scheme".to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names_round_trip() {
        for t in [Transport::Default, Transport::Zeromq, Transport::Shmem] {
            assert_eq!(t.name().parse::<Transport>().unwrap(), t);
        }
        assert!("nanomsg".parse::<Transport>().is_err());
    }

    #[test]
    fn socket_type_parses() {
        assert_eq!("xpub".parse::<SocketType>().unwrap(), SocketType::XPub);
        assert!("socket".parse::<SocketType>().is_err());
    }

    #[test]
    fn segment_algorithm_parses() {
        assert_eq!(
            "simple_seq_fit".parse::<SegmentAlgorithm>().unwrap(),
            SegmentAlgorithm::SeqFit
        );
        assert_eq!(
            "rbtree_best_fit".parse::<SegmentAlgorithm>().unwrap(),
            SegmentAlgorithm::BestFit
        );
        assert!("buddy".parse::<SegmentAlgorithm>().is_err());
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("tcp://*:15001").unwrap(),
            Endpoint::Tcp("0.0.0.0:15001".to_owned())
        );
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:5555").unwrap(),
            Endpoint::Tcp("127.0.0.1:5555".to_owned())
        );
        assert_eq!(
            parse_endpoint("ipc:///tmp/sock").unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/sock"))
        );
        assert!(parse_endpoint("tcp://nohost").is_err());
        assert!(parse_endpoint("inproc://x").is_err());
        assert!(parse_endpoint("bogus").is_err());
    }
}
