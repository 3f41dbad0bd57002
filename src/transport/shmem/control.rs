//! Session control segment.
//!
//! One small shared segment per session holds the metadata every process
//! agrees on: which data segments and unmanaged regions exist, an event
//! counter bumped on every registration, and one acknowledgement ring per
//! region. Receivers push freed sub-ranges into the ring; the creator's
//! acknowledgement thread drains it and invokes the user callback.
//!
//! Everything in the segment is plain `#[repr(C)]` data plus atomics, so
//! the layout is identical in every mapping. Mutation of non-atomic ring
//! entries happens only under the per-slot spinlock.

use super::{spin_lock, spin_unlock, SEG_ALGO_BEST_FIT, SEG_ALGO_SEQ_FIT};
use crate::error::TransportError;
use crate::transport::RegionBlock;
use shared_memory::Shmem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

pub(crate) const MAX_SEGMENTS: usize = 16;
pub(crate) const MAX_REGIONS: usize = 64;
const ACK_RING: u64 = 1024;

#[repr(C)]
#[derive(Clone, Copy)]
struct AckEntry {
    offset: u64,
    size: u64,
}

#[repr(C)]
struct RegionSlot {
    active: AtomicU32,
    lock: AtomicU32,
    head: AtomicU64,
    tail: AtomicU64,
    entries: [AckEntry; ACK_RING as usize],
}

#[repr(C)]
struct SegmentSlot {
    active: AtomicU32,
    algo: AtomicU32,
}

#[repr(C)]
struct ControlHeader {
    event_counter: AtomicU64,
    segments: [SegmentSlot; MAX_SEGMENTS],
    regions: [RegionSlot; MAX_REGIONS],
}

pub(crate) struct ControlSegment {
    // Keeps the mapping alive; the header pointer aliases into it.
    _shmem: Shmem,
    header: *mut ControlHeader,
}

unsafe impl Send for ControlSegment {}
unsafe impl Sync for ControlSegment {}

impl ControlSegment {
    pub(crate) fn control_size() -> usize {
        std::mem::size_of::<ControlHeader>()
    }

    /// Map (creating if needed) the session's control segment. A fresh
    /// segment is all zeroes, which is a valid initial state for every
    /// field, so no explicit initialization step is required.
    pub(crate) fn open_or_create(name: &str) -> Result<Self, TransportError> {
        let (shmem, created) = super::open_or_create_mapping(name, Self::control_size())?;
        if created {
            debug!("created control segment {name}");
        }
        let header = shmem.as_ptr() as *mut ControlHeader;
        Ok(Self {
            _shmem: shmem,
            header,
        })
    }

    fn header(&self) -> &ControlHeader {
        unsafe { &*self.header }
    }

    pub(crate) fn event_count(&self) -> u64 {
        self.header().event_counter.load(Ordering::Acquire)
    }

    /// Record a data segment in the session registry. Newly registered
    /// segments bump the event counter.
    pub(crate) fn register_segment(&self, id: u16, best_fit: bool) -> Result<(), TransportError> {
        let slot = self
            .header()
            .segments
            .get(id as usize)
            .ok_or_else(|| TransportError::Shmem(format!("segment id {id} out of range")))?;
        let algo = if best_fit { SEG_ALGO_BEST_FIT } else { SEG_ALGO_SEQ_FIT };
        if slot
            .active
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            slot.algo.store(algo, Ordering::Release);
            self.header().event_counter.fetch_add(1, Ordering::AcqRel);
        } else if slot.algo.load(Ordering::Acquire) != algo {
            warn!("segment {id} already registered with a different allocation algorithm");
        }
        Ok(())
    }

    /// Claim a region slot: the requested id, or the next free one.
    pub(crate) fn claim_region(&self, requested: Option<u16>) -> Result<u16, TransportError> {
        let header = self.header();
        let candidates: Vec<usize> = match requested {
            Some(id) => vec![id as usize],
            None => (0..MAX_REGIONS).collect(),
        };
        for idx in candidates {
            let slot = header
                .regions
                .get(idx)
                .ok_or_else(|| TransportError::Region(format!("region id {idx} out of range")))?;
            if slot
                .active
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.head.store(0, Ordering::Release);
                slot.tail.store(0, Ordering::Release);
                header.event_counter.fetch_add(1, Ordering::AcqRel);
                return Ok(idx as u16);
            }
        }
        Err(TransportError::Region(match requested {
            Some(id) => format!("region id {id} already in use"),
            None => "no free region slot in session".to_owned(),
        }))
    }

    pub(crate) fn release_region(&self, id: u16) {
        if let Some(slot) = self.header().regions.get(id as usize) {
            slot.active.store(0, Ordering::Release);
        }
    }

    /// Enqueue a freed sub-range for the region's creator (receiver side).
    pub(crate) fn push_ack(&self, id: u16, offset: u64, size: u64) {
        let Some(slot) = self.header().regions.get(id as usize) else {
            return;
        };
        spin_lock(&slot.lock);
        let head = slot.head.load(Ordering::Relaxed);
        let tail = slot.tail.load(Ordering::Relaxed);
        if tail - head >= ACK_RING {
            spin_unlock(&slot.lock);
            warn!("acknowledgement ring of region {id} full, dropping ack for {size} bytes");
            return;
        }
        unsafe {
            let entries = std::ptr::addr_of!((*self.header).regions[id as usize].entries)
                as *mut AckEntry;
            *entries.add((tail % ACK_RING) as usize) = AckEntry { offset, size };
        }
        slot.tail.store(tail + 1, Ordering::Relaxed);
        spin_unlock(&slot.lock);
    }

    /// Drain pending acknowledgements of one region, in FIFO order
    /// (creator side).
    pub(crate) fn drain_acks(&self, id: u16, out: &mut Vec<RegionBlock>) {
        let Some(slot) = self.header().regions.get(id as usize) else {
            return;
        };
        spin_lock(&slot.lock);
        let head = slot.head.load(Ordering::Relaxed);
        let tail = slot.tail.load(Ordering::Relaxed);
        for i in head..tail {
            let entry = unsafe {
                let entries = std::ptr::addr_of!((*self.header).regions[id as usize].entries)
                    as *const AckEntry;
                *entries.add((i % ACK_RING) as usize)
            };
            out.push(RegionBlock {
                offset: entry.offset as usize,
                size: entry.size as usize,
            });
        }
        slot.head.store(tail, Ordering::Relaxed);
        spin_unlock(&slot.lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestControl {
        control: ControlSegment,
        name: String,
    }

    impl Drop for TestControl {
        fn drop(&mut self) {
            if let Ok(name) = std::ffi::CString::new(self.name.clone()) {
                unsafe { libc::shm_unlink(name.as_ptr()) };
            }
        }
    }

    fn control() -> TestControl {
        let name = format!("fmq_test_{}", uuid::Uuid::new_v4().simple());
        TestControl {
            control: ControlSegment::open_or_create(&name).unwrap(),
            name,
        }
    }

    #[test]
    fn registrations_bump_the_event_counter_once() {
        let ctl = control();
        assert_eq!(ctl.control.event_count(), 0);
        ctl.control.register_segment(0, true).unwrap();
        ctl.control.register_segment(0, true).unwrap();
        assert_eq!(ctl.control.event_count(), 1);
        let id = ctl.control.claim_region(None).unwrap();
        assert_eq!(ctl.control.event_count(), 2);
        ctl.control.release_region(id);
    }

    #[test]
    fn explicit_region_ids_conflict() {
        let ctl = control();
        assert_eq!(ctl.control.claim_region(Some(7)).unwrap(), 7);
        assert!(ctl.control.claim_region(Some(7)).is_err());
        ctl.control.release_region(7);
        assert_eq!(ctl.control.claim_region(Some(7)).unwrap(), 7);
    }

    #[test]
    fn ack_ring_is_fifo_per_region() {
        let ctl = control();
        let id = ctl.control.claim_region(None).unwrap();
        for i in 0..10u64 {
            ctl.control.push_ack(id, i * 100, 100);
        }
        let mut drained = Vec::new();
        ctl.control.drain_acks(id, &mut drained);
        assert_eq!(drained.len(), 10);
        for (i, block) in drained.iter().enumerate() {
            assert_eq!(block.offset, i * 100);
            assert_eq!(block.size, 100);
        }
        // Nothing left afterwards.
        drained.clear();
        ctl.control.drain_acks(id, &mut drained);
        assert!(drained.is_empty());
    }
}
