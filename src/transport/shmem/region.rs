//! Unmanaged regions in shared memory.
//!
//! The creator maps a dedicated segment and carves zero-copy messages out
//! of it; receivers map the same segment on first contact. When a receiver
//! releases a range, the acknowledgement travels back through the control
//! segment ring and the factory's acknowledgement thread invokes the
//! creator's callback with a batch.

use super::ShmemState;
use crate::error::TransportError;
use crate::transport::tcp::region::StatCounters;
use crate::transport::{
    MessagePtr, RegionCallback, RegionConfig, RegionStats, Transport, UnmanagedRegion,
};
use parking_lot::Mutex;
use shared_memory::Shmem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Creator-side state of one region, shared with the factory's
/// acknowledgement thread.
pub(crate) struct LocalRegion {
    pub(crate) id: u16,
    shmem: Shmem,
    size: usize,
    user_flags: i64,
    pub(crate) callback: Mutex<RegionCallback>,
    pub(crate) stats: StatCounters,
    linger_ms: AtomicU64,
}

unsafe impl Send for LocalRegion {}
unsafe impl Sync for LocalRegion {}

impl LocalRegion {
    pub(crate) fn create(
        name: &str,
        id: u16,
        config: &RegionConfig,
        callback: RegionCallback,
    ) -> Result<Self, TransportError> {
        let (shmem, created) = super::open_or_create_mapping(name, config.size)?;
        if !created {
            return Err(TransportError::Region(format!(
                "region mapping {name} already exists"
            )));
        }
        let base = shmem.as_ptr();
        if config.lock {
            debug!("locking region {id} into memory");
            if unsafe { libc::mlock(base.cast(), shmem.len()) } == -1 {
                error!(
                    "could not lock region {id}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
        if config.zero {
            debug!("zeroing region {id}");
            unsafe { std::ptr::write_bytes(base, 0, shmem.len()) };
        }
        Ok(Self {
            id,
            shmem,
            size: config.size,
            user_flags: config.user_flags,
            callback: Mutex::new(callback),
            stats: StatCounters::default(),
            linger_ms: AtomicU64::new(config.linger_ms),
        })
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

/// Receiver-side mapping of a region created elsewhere.
pub(crate) struct RemoteRegionMapping {
    _shmem: Shmem,
    base: *mut u8,
    len: usize,
}

unsafe impl Send for RemoteRegionMapping {}
unsafe impl Sync for RemoteRegionMapping {}

impl RemoteRegionMapping {
    pub(crate) fn open(name: &str) -> Result<Self, TransportError> {
        let shmem = super::open_mapping(name)?;
        let base = shmem.as_ptr();
        let len = shmem.len();
        Ok(Self {
            _shmem: shmem,
            base,
            len,
        })
    }

    pub(crate) fn ptr_at(&self, offset: u64, size: u64) -> Result<*mut u8, TransportError> {
        if offset + size > self.len as u64 {
            return Err(TransportError::Region(format!(
                "range [{offset}, {offset}+{size}) outside mapped region of {} bytes",
                self.len
            )));
        }
        Ok(unsafe { self.base.add(offset as usize) })
    }
}

/// The user-facing region handle of the shared-memory transport.
pub struct ShmemRegion {
    state: Arc<ShmemState>,
    local: Arc<LocalRegion>,
}

impl ShmemRegion {
    pub(crate) fn new(state: Arc<ShmemState>, local: Arc<LocalRegion>) -> Self {
        Self { state, local }
    }
}

impl UnmanagedRegion for ShmemRegion {
    fn id(&self) -> u16 {
        self.local.id
    }

    fn size(&self) -> usize {
        self.local.size
    }

    fn user_flags(&self) -> i64 {
        self.local.user_flags
    }

    fn transport(&self) -> Transport {
        Transport::Shmem
    }

    fn data_ptr(&self) -> *mut u8 {
        self.local.base()
    }

    fn new_message(&self, offset: usize, size: usize) -> Result<MessagePtr, TransportError> {
        if offset.checked_add(size).map_or(true, |end| end > self.local.size) {
            return Err(TransportError::Region(format!(
                "sub-range [{offset}, {offset}+{size}) exceeds region {} of size {}",
                self.local.id, self.local.size
            )));
        }
        Ok(Box::new(super::message::ShmemMessage::for_region(
            self.state.clone(),
            self.local.id,
            offset as u64,
            size as u64,
        )))
    }

    fn set_linger(&self, ms: u64) {
        self.local.linger_ms.store(ms, Ordering::Release);
    }

    fn linger(&self) -> u64 {
        self.local.linger_ms.load(Ordering::Acquire)
    }

    fn stats(&self) -> RegionStats {
        self.local.stats.snapshot()
    }
}

impl Drop for ShmemRegion {
    fn drop(&mut self) {
        // Bounded wait for outstanding acknowledgements, then give up and
        // report what never came back.
        let linger = Duration::from_millis(self.local.linger_ms.load(Ordering::Acquire));
        let deadline = Instant::now() + linger;
        loop {
            let stats = self.local.stats.snapshot();
            if stats.acked_blocks >= stats.sent_blocks {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "destroying region {} with {} unacknowledged block(s)",
                    self.local.id,
                    stats.sent_blocks - stats.acked_blocks
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        debug!("destroying region {}", self.local.id);
        self.state.forget_region(self.local.id);
    }
}
