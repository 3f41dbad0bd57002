//! # pipemq
//!
//! A message-passing runtime for composing distributed data-processing
//! pipelines out of independent worker processes ("devices") that exchange
//! typed byte buffers over named channels.
//!
//! A device declares inbound and outbound [`Channel`]s, plugs user logic
//! into lifecycle hooks, and lets the framework drive it through a
//! well-defined state machine while moving messages across one of two
//! transports behind a single message/socket/poller interface:
//!
//! - **zeromq**: payloads travel inline over TCP or Unix-domain streams;
//! - **shmem**: payloads live in shared-memory segments, only small
//!   descriptors cross the wire, and bulk "unmanaged regions" move large
//!   buffers with asynchronous release acknowledgement.
//!
//! ## Threading model
//!
//! Parallel threads with explicit rendezvous, not an event loop. The
//! thread calling [`Device::run_state_machine`] applies transitions and
//! runs most hooks; a worker thread owns the `Running` phase; the
//! shared-memory transport adds one acknowledgement thread. External
//! controllers rendezvous through transition requests and [`StateQueue`]s.

pub mod channel;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod logging;
pub mod parts;
pub mod properties;
pub mod runner;
pub mod signal;
pub mod state_machine;
pub mod states;
pub mod transport;

pub use channel::{Channel, Method, SocketConfig};
pub use device::{ConditionalRunHook, DataHandler, Device, DeviceHooks, Hook};
pub use error::{
    ConfigError, DeviceError, TransferError, TransferResult, TransportError,
};
pub use parts::Parts;
pub use properties::{Property, PropertyStore};
pub use states::{State, StateQueue, Transition};
pub use transport::{
    Alignment, FactoryConfig, Message, MessagePtr, Poller, PollerPtr, RegionBlock,
    RegionCallback, RegionConfig, RegionStats, SegmentAlgorithm, Socket, SocketPtr, SocketType,
    Transport, TransportFactory, UnmanagedRegion,
};

/// The current version of the runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values shared by the CLI, channels and
/// transports.
pub mod defaults {
    /// Session joined when none is configured.
    pub const SESSION: &str = "default";

    /// Socket linger on teardown, in milliseconds.
    pub const LINGER_MS: i32 = 500;

    /// Send high-water mark, in messages.
    pub const SND_BUF_SIZE: i32 = 1000;

    /// Receive high-water mark, in messages.
    pub const RCV_BUF_SIZE: i32 = 1000;

    /// Size of the default shared-memory data segment.
    pub const SHM_SEGMENT_SIZE: usize = 2_000_000_000;

    /// How long region teardown waits for outstanding acknowledgements,
    /// in milliseconds.
    pub const REGION_LINGER_MS: u64 = 500;
}
