//! # Shared-Memory Transport
//!
//! Per session, cooperating processes share:
//!
//! - a **control segment** (`fmq_<id>_mng`) with the registry of data
//!   segments and regions, an event counter, and per-region
//!   acknowledgement rings;
//! - **managed data segments** (`fmq_<id>_m_<n>`) carrying allocator state
//!   inline, from which ordinary messages are allocated;
//! - **unmanaged regions** (`fmq_<id>_r_<n>`), bulk areas the user carves
//!   zero-copy messages from, with release acknowledgement back to the
//!   creator.
//!
//! `<id>` derives deterministically from the session name and the
//! effective user id, so unrelated users on one host never collide.
//! Descriptors travel over an internal network meta-channel (see
//! [`socket`]); an acknowledgement thread per factory drains region rings
//! and invokes user callbacks in batches.

pub(crate) mod control;
mod message;
mod region;
mod segment;
mod socket;

pub use message::ShmemMessage;
pub use region::ShmemRegion;
pub use socket::ShmemSocket;

use crate::error::TransportError;
use crate::transport::{
    Alignment, FactoryConfig, MessagePtr, RegionCallback, RegionConfig, RegionPtr, SocketPtr,
    SocketType, Transport, TransportFactory,
};
use parking_lot::Mutex;
use region::{LocalRegion, RemoteRegionMapping};
use segment::SegmentMapping;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) const SEG_ALGO_BEST_FIT: u32 = 0;
pub(crate) const SEG_ALGO_SEQ_FIT: u32 = 1;

const ACK_DRAIN_INTERVAL: Duration = Duration::from_millis(2);
const DEFAULT_SEGMENT_ID: u16 = 0;

/// Session identifier: a deterministic hash of the session name and the
/// effective user id, so every device of one user and session derives the
/// same shared-memory names.
pub fn make_shm_id(session: &str) -> String {
    let mut hasher = DefaultHasher::new();
    session.hash(&mut hasher);
    unsafe { libc::geteuid() }.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

/// On-disk name of one shared-memory object of the session.
/// `kind` is `mng` (control), `m` (managed data segment) or `r` (region).
pub(crate) fn shm_name(shm_id: &str, kind: &str, id: Option<u16>) -> String {
    match id {
        Some(id) => format!("fmq_{shm_id}_{kind}_{id}"),
        None => format!("fmq_{shm_id}_{kind}"),
    }
}

/// Remove every shared-memory artefact of a session. Safe to call when
/// nothing exists; used by tests and operational cleanup.
pub fn cleanup_session(session: &str) {
    let shm_id = make_shm_id(session);
    let mut names = vec![shm_name(&shm_id, "mng", None)];
    for id in 0..control::MAX_SEGMENTS as u16 {
        names.push(shm_name(&shm_id, "m", Some(id)));
    }
    for id in 0..control::MAX_REGIONS as u16 {
        names.push(shm_name(&shm_id, "r", Some(id)));
    }
    for name in names {
        if let Ok(cname) = std::ffi::CString::new(name) {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
    }
}

pub(crate) fn open_or_create_mapping(
    name: &str,
    size: usize,
) -> Result<(Shmem, bool), TransportError> {
    match ShmemConf::new().size(size).os_id(name).create() {
        Ok(m) => Ok((m, true)),
        Err(ShmemError::MappingIdExists) => open_mapping(name).map(|m| (m, false)),
        Err(e) => Err(TransportError::Shmem(format!("cannot create {name}: {e}"))),
    }
}

pub(crate) fn open_mapping(name: &str) -> Result<Shmem, TransportError> {
    ShmemConf::new()
        .os_id(name)
        .open()
        .map_err(|e| TransportError::Shmem(format!("cannot open {name}: {e}")))
}

/// Cross-process spinlock over a word in shared memory.
pub(crate) fn spin_lock(lock: &std::sync::atomic::AtomicU32) {
    let mut spins = 0u32;
    while lock
        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        spins += 1;
        if spins < 64 {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

pub(crate) fn spin_unlock(lock: &std::sync::atomic::AtomicU32) {
    lock.store(0, Ordering::Release);
}

/// Shared internals of one factory: mappings, regions, the control
/// segment. Messages and sockets hold an `Arc` of this so mappings stay
/// valid for as long as anything can point into them.
pub(crate) struct ShmemState {
    shm_id: String,
    config: FactoryConfig,
    control: control::ControlSegment,
    segments: Mutex<HashMap<u16, Arc<SegmentMapping>>>,
    local_regions: Mutex<HashMap<u16, Arc<LocalRegion>>>,
    remote_regions: Mutex<HashMap<u16, Arc<RemoteRegionMapping>>>,
    interrupt: Arc<AtomicBool>,
}

impl ShmemState {
    fn new(config: &FactoryConfig) -> Result<Self, TransportError> {
        let shm_id = make_shm_id(&config.session);
        let control = control::ControlSegment::open_or_create(&shm_name(&shm_id, "mng", None))?;
        Ok(Self {
            shm_id,
            config: config.clone(),
            control,
            segments: Mutex::new(HashMap::new()),
            local_regions: Mutex::new(HashMap::new()),
            remote_regions: Mutex::new(HashMap::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub(crate) fn default_segment(&self) -> Result<Arc<SegmentMapping>, TransportError> {
        self.segment(DEFAULT_SEGMENT_ID)
    }

    /// Mapping of data segment `id`, created on first contact.
    pub(crate) fn segment(&self, id: u16) -> Result<Arc<SegmentMapping>, TransportError> {
        if let Some(mapping) = self.segments.lock().get(&id) {
            return Ok(mapping.clone());
        }
        let name = shm_name(&self.shm_id, "m", Some(id));
        let best_fit = self.config.shm_allocation == crate::transport::SegmentAlgorithm::BestFit;
        let (mapping, _created) = SegmentMapping::open_or_create(
            &name,
            id,
            self.config.shm_segment_size,
            best_fit,
            self.config.shm_zero_segment_on_creation || self.config.shm_zero_segment,
            self.config.shm_mlock_segment_on_creation,
            self.config.shm_mlock_segment,
        )?;
        self.control.register_segment(id, best_fit)?;
        let mapping = Arc::new(mapping);
        Ok(self
            .segments
            .lock()
            .entry(id)
            .or_insert(mapping)
            .clone())
    }

    /// Resolve a region range to a pointer, mapping remote regions on
    /// first contact.
    pub(crate) fn region_ptr(
        &self,
        id: u16,
        offset: u64,
        size: u64,
    ) -> Result<*mut u8, TransportError> {
        if let Some(local) = self.local_regions.lock().get(&id) {
            if offset + size > local.size() as u64 {
                return Err(TransportError::Region(format!(
                    "range [{offset}, {offset}+{size}) outside region {id}"
                )));
            }
            return Ok(unsafe { local.base().add(offset as usize) });
        }
        {
            let remotes = self.remote_regions.lock();
            if let Some(remote) = remotes.get(&id) {
                return remote.ptr_at(offset, size);
            }
        }
        let mapping = RemoteRegionMapping::open(&shm_name(&self.shm_id, "r", Some(id)))?;
        let mut remotes = self.remote_regions.lock();
        let entry = remotes.entry(id).or_insert_with(|| Arc::new(mapping));
        entry.ptr_at(offset, size)
    }

    pub(crate) fn push_region_ack(&self, id: u16, offset: u64, size: u64) {
        self.control.push_ack(id, offset, size);
    }

    /// Sender-side accounting: a region range of ours went out.
    pub(crate) fn note_region_sent(&self, id: u16, size: u64) {
        if let Some(local) = self.local_regions.lock().get(&id) {
            local.stats.sent_blocks.fetch_add(1, Ordering::AcqRel);
            local.stats.sent_bytes.fetch_add(size, Ordering::AcqRel);
        }
    }

    pub(crate) fn forget_region(&self, id: u16) {
        self.local_regions.lock().remove(&id);
        self.control.release_region(id);
    }

    pub(crate) fn event_count(&self) -> u64 {
        self.control.event_count()
    }

    /// One pass of the acknowledgement thread: drain every owned region's
    /// ring and deliver the batch to its callback.
    fn drain_region_acks(&self, batch: &mut Vec<crate::transport::RegionBlock>) {
        let regions: Vec<Arc<LocalRegion>> =
            self.local_regions.lock().values().cloned().collect();
        for local in regions {
            batch.clear();
            self.control.drain_acks(local.id, batch);
            if batch.is_empty() {
                continue;
            }
            let bytes: u64 = batch.iter().map(|b| b.size as u64).sum();
            local
                .stats
                .acked_blocks
                .fetch_add(batch.len() as u64, Ordering::AcqRel);
            local.stats.acked_bytes.fetch_add(bytes, Ordering::AcqRel);
            local.callback.lock().deliver(batch);
        }
    }
}

/// Factory of the shared-memory transport.
pub struct ShmemFactory {
    id: String,
    state: Arc<ShmemState>,
    ack_stop: Arc<AtomicBool>,
    ack_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ShmemFactory {
    pub fn new(id: &str, config: &FactoryConfig) -> Result<Self, TransportError> {
        let state = Arc::new(ShmemState::new(config)?);
        debug!(
            "shared-memory factory {id} attached to session \"{}\" (shm id {})",
            config.session, state.shm_id
        );
        Ok(Self {
            id: id.to_owned(),
            state,
            ack_stop: Arc::new(AtomicBool::new(false)),
            ack_thread: Mutex::new(None),
        })
    }

    /// Observable registration count of the session (segments + regions).
    pub fn session_event_count(&self) -> u64 {
        self.state.event_count()
    }

    /// Free bytes remaining in data segment `id`.
    pub fn segment_free_memory(&self, id: u16) -> Result<u64, TransportError> {
        Ok(self.state.segment(id)?.free_memory())
    }

    /// Start the acknowledgement thread on first region creation.
    fn ensure_ack_thread(&self) {
        let mut guard = self.ack_thread.lock();
        if guard.is_some() {
            return;
        }
        let weak: Weak<ShmemState> = Arc::downgrade(&self.state);
        let stop = self.ack_stop.clone();
        *guard = Some(std::thread::spawn(move || {
            let mut batch = Vec::new();
            loop {
                let Some(state) = weak.upgrade() else { break };
                state.drain_region_acks(&mut batch);
                let stopping = stop.load(Ordering::Acquire);
                drop(state);
                if stopping {
                    break;
                }
                std::thread::sleep(ACK_DRAIN_INTERVAL);
            }
        }));
    }
}

impl TransportFactory for ShmemFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> Transport {
        Transport::Shmem
    }

    fn new_message(&self) -> MessagePtr {
        Box::new(ShmemMessage::empty(self.state.clone()))
    }

    fn new_message_with_size(&self, size: usize) -> Result<MessagePtr, TransportError> {
        Ok(Box::new(ShmemMessage::allocate(self.state.clone(), size, 0)?))
    }

    fn new_message_aligned(
        &self,
        size: usize,
        alignment: Alignment,
    ) -> Result<MessagePtr, TransportError> {
        Ok(Box::new(ShmemMessage::allocate(
            self.state.clone(),
            size,
            alignment.0,
        )?))
    }

    fn new_socket(&self, stype: SocketType, id: &str) -> Result<SocketPtr, TransportError> {
        Ok(Arc::new(ShmemSocket::new(stype, id, self.state.clone())))
    }

    fn new_region(
        &self,
        config: RegionConfig,
        callback: RegionCallback,
    ) -> Result<RegionPtr, TransportError> {
        let id = self.state.control.claim_region(config.id)?;
        let name = shm_name(&self.state.shm_id, "r", Some(id));
        let local = match LocalRegion::create(&name, id, &config, callback) {
            Ok(local) => Arc::new(local),
            Err(e) => {
                self.state.control.release_region(id);
                return Err(e);
            }
        };
        self.state.local_regions.lock().insert(id, local.clone());
        self.ensure_ack_thread();
        Ok(Arc::new(ShmemRegion::new(self.state.clone(), local)))
    }

    fn interrupt(&self) {
        self.state.interrupt.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.state.interrupt.store(false, Ordering::Release);
    }

    fn interrupted(&self) -> bool {
        self.state.interrupt.load(Ordering::Acquire)
    }
}

impl Drop for ShmemFactory {
    fn drop(&mut self) {
        self.ack_stop.store(true, Ordering::Release);
        if let Some(handle) = self.ack_thread.lock().take() {
            let _ = handle.join();
        }
        if !self.state.local_regions.lock().is_empty() {
            warn!("factory {} dropped with live regions", self.id);
        }
    }
}
