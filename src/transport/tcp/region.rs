//! Unmanaged regions of the network transport.
//!
//! Regions here are plain process-local allocations: payloads still travel
//! inline on the wire, so a carved message's sub-range is released as soon
//! as the bytes are sent. There is no remote acknowledgement.

use crate::error::TransportError;
use crate::transport::{
    MessagePtr, RegionBlock, RegionCallback, RegionConfig, RegionStats, Transport, UnmanagedRegion,
};
use parking_lot::Mutex;
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const REGION_ALIGN: usize = 64;

#[derive(Default)]
pub(crate) struct StatCounters {
    pub sent_blocks: AtomicU64,
    pub sent_bytes: AtomicU64,
    pub acked_blocks: AtomicU64,
    pub acked_bytes: AtomicU64,
}

impl StatCounters {
    pub(crate) fn snapshot(&self) -> RegionStats {
        RegionStats {
            sent_blocks: self.sent_blocks.load(Ordering::Acquire),
            sent_bytes: self.sent_bytes.load(Ordering::Acquire),
            acked_blocks: self.acked_blocks.load(Ordering::Acquire),
            acked_bytes: self.acked_bytes.load(Ordering::Acquire),
        }
    }
}

pub(crate) struct TcpRegionInner {
    id: u16,
    buf: *mut u8,
    size: usize,
    user_flags: i64,
    callback: Mutex<RegionCallback>,
    stats: StatCounters,
    linger_ms: AtomicU64,
}

unsafe impl Send for TcpRegionInner {}
unsafe impl Sync for TcpRegionInner {}

impl TcpRegionInner {
    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size.max(1), REGION_ALIGN).expect("valid region layout")
    }

    pub(crate) fn new(id: u16, config: &RegionConfig, callback: RegionCallback) -> Result<Self, TransportError> {
        let layout = Self::layout(config.size);
        let buf = unsafe {
            if config.zero {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        if buf.is_null() {
            return Err(TransportError::Region(format!(
                "allocation of {} bytes for region {} failed",
                config.size, id
            )));
        }
        if config.lock {
            debug!("locking region {} into memory", id);
            if unsafe { libc::mlock(buf.cast(), config.size) } == -1 {
                error!(
                    "could not lock region {}: {}",
                    id,
                    std::io::Error::last_os_error()
                );
            }
        }
        Ok(Self {
            id,
            buf,
            size: config.size,
            user_flags: config.user_flags,
            callback: Mutex::new(callback),
            stats: StatCounters::default(),
            linger_ms: AtomicU64::new(config.linger_ms),
        })
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.buf
    }

    /// Wire transfer done: account the block and notify the creator.
    pub(crate) fn acknowledge_sent(&self, offset: usize, size: usize) {
        self.stats.sent_blocks.fetch_add(1, Ordering::AcqRel);
        self.stats.sent_bytes.fetch_add(size as u64, Ordering::AcqRel);
        self.callback
            .lock()
            .deliver(&[RegionBlock { offset, size }]);
        self.stats.acked_blocks.fetch_add(1, Ordering::AcqRel);
        self.stats.acked_bytes.fetch_add(size as u64, Ordering::AcqRel);
    }
}

impl Drop for TcpRegionInner {
    fn drop(&mut self) {
        unsafe { dealloc(self.buf, Self::layout(self.size)) };
    }
}

/// Process-local unmanaged region handed out by the network transport.
pub struct TcpRegion {
    inner: Arc<TcpRegionInner>,
}

impl TcpRegion {
    pub(crate) fn new(
        id: u16,
        config: RegionConfig,
        callback: RegionCallback,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            inner: Arc::new(TcpRegionInner::new(id, &config, callback)?),
        })
    }
}

impl UnmanagedRegion for TcpRegion {
    fn id(&self) -> u16 {
        self.inner.id
    }

    fn size(&self) -> usize {
        self.inner.size
    }

    fn user_flags(&self) -> i64 {
        self.inner.user_flags
    }

    fn transport(&self) -> Transport {
        Transport::Zeromq
    }

    fn data_ptr(&self) -> *mut u8 {
        self.inner.data_ptr()
    }

    fn new_message(&self, offset: usize, size: usize) -> Result<MessagePtr, TransportError> {
        if offset.checked_add(size).map_or(true, |end| end > self.inner.size) {
            return Err(TransportError::Region(format!(
                "sub-range [{offset}, {offset}+{size}) exceeds region {} of size {}",
                self.inner.id, self.inner.size
            )));
        }
        Ok(Box::new(super::message::TcpMessage::for_region(
            self.inner.clone(),
            offset,
            size,
        )))
    }

    fn set_linger(&self, ms: u64) {
        self.inner.linger_ms.store(ms, Ordering::Release);
    }

    fn linger(&self) -> u64 {
        self.inner.linger_ms.load(Ordering::Acquire)
    }

    fn stats(&self) -> RegionStats {
        self.inner.stats.snapshot()
    }
}

impl Drop for TcpRegion {
    fn drop(&mut self) {
        // Acknowledgements are local and immediate, so normally nothing is
        // pending; the linger wait covers in-flight sends on other threads.
        let deadline =
            Instant::now() + Duration::from_millis(self.inner.linger_ms.load(Ordering::Acquire));
        loop {
            let stats = self.inner.stats.snapshot();
            if stats.acked_blocks >= stats.sent_blocks {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "destroying region {} with {} unacknowledged block(s)",
                    self.inner.id,
                    stats.sent_blocks - stats.acked_blocks
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        debug!("destroying region {}", self.inner.id);
    }
}
