//! Managed data segments.
//!
//! A data segment is a memory-mapped file shared by every device of the
//! session. It carries its own allocator state inline (offset-based free
//! list guarded by a spinlock), so any process mapping the segment can
//! allocate and free blocks: ownership of a payload effectively moves
//! between processes by reference. Two placement strategies exist, chosen
//! at creation: best fit (smallest adequate free block) and sequential fit
//! (first adequate free block).
//!
//! Each allocated block is preceded by a small header with a cross-process
//! reference count; a block returns to the free list when the count drops
//! to zero, wherever that happens.

use super::{spin_lock, spin_unlock, SEG_ALGO_BEST_FIT};
use crate::error::TransportError;
use shared_memory::Shmem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error};

const DATA_START: u64 = 64;
const BLOCK_HDR: u64 = 16;
const MIN_FREE: u64 = 32;
const NIL: u64 = 0;

#[repr(C)]
struct SegmentHeader {
    lock: AtomicU32,
    // 0 = raw, 1 = initializing, 2 = ready
    init: AtomicU32,
    algo: AtomicU32,
    _pad: u32,
    free_head: AtomicU64,
    capacity: AtomicU64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FreeNode {
    size: u64,
    next: u64,
}

#[repr(C)]
struct BlockHeader {
    span: u64,
    start_delta: u32,
    refs: AtomicU32,
}

pub(crate) struct SegmentMapping {
    _shmem: Shmem,
    base: *mut u8,
    len: usize,
    id: u16,
}

unsafe impl Send for SegmentMapping {}
unsafe impl Sync for SegmentMapping {}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

impl SegmentMapping {
    pub(crate) fn open_or_create(
        name: &str,
        id: u16,
        size: usize,
        best_fit: bool,
        zero_on_creation: bool,
        mlock_on_creation: bool,
        mlock_on_open: bool,
    ) -> Result<(Self, bool), TransportError> {
        let (shmem, created) = super::open_or_create_mapping(name, size)?;
        let base = shmem.as_ptr();
        let len = shmem.len();
        let mapping = Self {
            _shmem: shmem,
            base,
            len,
            id,
        };
        let header = mapping.header();
        if created {
            header
                .init
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| TransportError::Shmem(format!("segment {name} double-initialized")))?;
            header.capacity.store(len as u64, Ordering::Release);
            header.algo.store(
                if best_fit { SEG_ALGO_BEST_FIT } else { super::SEG_ALGO_SEQ_FIT },
                Ordering::Release,
            );
            mapping.write_free_node(
                DATA_START,
                FreeNode {
                    size: len as u64 - DATA_START,
                    next: NIL,
                },
            );
            header.free_head.store(DATA_START, Ordering::Release);
            if zero_on_creation {
                debug!("zeroing segment {id} ({} bytes)", len as u64 - DATA_START);
                unsafe {
                    std::ptr::write_bytes(
                        base.add(DATA_START as usize),
                        0,
                        len - DATA_START as usize,
                    );
                }
            }
            header.init.store(2, Ordering::Release);
            debug!("created segment {id} of size {len}");
        } else {
            // Another process may still be between create and init-done.
            let deadline = Instant::now() + Duration::from_secs(2);
            while header.init.load(Ordering::Acquire) != 2 {
                if Instant::now() >= deadline {
                    return Err(TransportError::Shmem(format!(
                        "segment {name} never finished initialization"
                    )));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        if (created && mlock_on_creation) || (!created && mlock_on_open) {
            debug!("locking segment {id} into memory");
            if unsafe { libc::mlock(base.cast(), len) } == -1 {
                error!(
                    "could not lock segment {id}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
        Ok((mapping, created))
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn ptr_at(&self, offset: u64) -> *mut u8 {
        debug_assert!((offset as usize) < self.len);
        unsafe { self.base.add(offset as usize) }
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    fn read_free_node(&self, offset: u64) -> FreeNode {
        unsafe { *(self.ptr_at(offset) as *const FreeNode) }
    }

    fn write_free_node(&self, offset: u64, node: FreeNode) {
        unsafe { *(self.ptr_at(offset) as *mut FreeNode) = node }
    }

    fn set_link(&self, prev: u64, value: u64) {
        if prev == NIL {
            self.header().free_head.store(value, Ordering::Relaxed);
        } else {
            let mut node = self.read_free_node(prev);
            node.next = value;
            self.write_free_node(prev, node);
        }
    }

    fn block_header(&self, data: u64) -> &BlockHeader {
        unsafe { &*(self.ptr_at(data - BLOCK_HDR) as *const BlockHeader) }
    }

    /// Allocate `size` bytes with the requested alignment; returns the data
    /// offset within the segment. The block starts with one reference.
    pub(crate) fn alloc(&self, size: usize, align: usize) -> Result<u64, TransportError> {
        let size = size as u64;
        let align = (align.max(8) as u64).next_power_of_two();
        let header = self.header();
        let best_fit = header.algo.load(Ordering::Relaxed) == SEG_ALGO_BEST_FIT;

        spin_lock(&header.lock);
        let mut prev = NIL;
        let mut cur = header.free_head.load(Ordering::Relaxed);
        // (prev, node, data offset, leftover)
        let mut chosen: Option<(u64, u64, u64, u64)> = None;
        while cur != NIL {
            let node = self.read_free_node(cur);
            let data = align_up(cur + BLOCK_HDR, align);
            let end = data + size;
            if end <= cur + node.size {
                let leftover = cur + node.size - end;
                let better = match chosen {
                    None => true,
                    Some((_, _, _, best_leftover)) => leftover < best_leftover,
                };
                if better {
                    chosen = Some((prev, cur, data, leftover));
                }
                if !best_fit {
                    break; // sequential fit takes the first match
                }
            }
            prev = cur;
            cur = node.next;
        }

        let Some((prev, start, data, _)) = chosen else {
            spin_unlock(&header.lock);
            return Err(TransportError::Shmem(format!(
                "segment {}: not enough free memory for {size} bytes",
                self.id
            )));
        };

        let node = self.read_free_node(start);
        let node_end = start + node.size;
        let remainder = align_up(data + size, 8);
        let span;
        if node_end > remainder && node_end - remainder >= MIN_FREE {
            self.write_free_node(
                remainder,
                FreeNode {
                    size: node_end - remainder,
                    next: node.next,
                },
            );
            self.set_link(prev, remainder);
            span = remainder - start;
        } else {
            self.set_link(prev, node.next);
            span = node.size;
        }
        unsafe {
            std::ptr::write(
                self.ptr_at(data - BLOCK_HDR) as *mut BlockHeader,
                BlockHeader {
                    span,
                    start_delta: (data - BLOCK_HDR - start) as u32,
                    refs: AtomicU32::new(1),
                },
            );
        }
        spin_unlock(&header.lock);
        Ok(data)
    }

    /// Return the block at `data` to the free list, coalescing with its
    /// address neighbours.
    pub(crate) fn free(&self, data: u64) {
        let block = self.block_header(data);
        let span = block.span;
        let start = data - BLOCK_HDR - block.start_delta as u64;
        let header = self.header();

        spin_lock(&header.lock);
        let mut prev = NIL;
        let mut cur = header.free_head.load(Ordering::Relaxed);
        while cur != NIL && cur < start {
            prev = cur;
            cur = self.read_free_node(cur).next;
        }
        let mut new_size = span;
        let mut new_next = cur;
        if cur != NIL && start + span == cur {
            let next_node = self.read_free_node(cur);
            new_size += next_node.size;
            new_next = next_node.next;
        }
        if prev != NIL {
            let mut prev_node = self.read_free_node(prev);
            if prev + prev_node.size == start {
                prev_node.size += new_size;
                prev_node.next = new_next;
                self.write_free_node(prev, prev_node);
                spin_unlock(&header.lock);
                return;
            }
        }
        self.write_free_node(
            start,
            FreeNode {
                size: new_size,
                next: new_next,
            },
        );
        self.set_link(prev, start);
        spin_unlock(&header.lock);
    }

    pub(crate) fn inc_ref(&self, data: u64) {
        self.block_header(data).refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; frees the block when the last one goes.
    pub(crate) fn dec_ref(&self, data: u64) {
        if self.block_header(data).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.free(data);
        }
    }

    /// Total free bytes (sum over the free list).
    pub(crate) fn free_memory(&self) -> u64 {
        let header = self.header();
        spin_lock(&header.lock);
        let mut total = 0;
        let mut cur = header.free_head.load(Ordering::Relaxed);
        while cur != NIL {
            let node = self.read_free_node(cur);
            total += node.size;
            cur = node.next;
        }
        spin_unlock(&header.lock);
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestSegment {
        mapping: SegmentMapping,
        name: String,
    }

    impl Drop for TestSegment {
        fn drop(&mut self) {
            if let Ok(name) = std::ffi::CString::new(self.name.clone()) {
                unsafe { libc::shm_unlink(name.as_ptr()) };
            }
        }
    }

    fn segment(size: usize) -> TestSegment {
        let name = format!("fmq_test_{}", uuid::Uuid::new_v4().simple());
        let (mapping, created) =
            SegmentMapping::open_or_create(&name, 0, size, true, false, false, false).unwrap();
        assert!(created);
        TestSegment { mapping, name }
    }

    #[test]
    fn alloc_free_round_trips_all_memory() {
        let seg = segment(1 << 20);
        let before = seg.mapping.free_memory();

        let a = seg.mapping.alloc(1000, 0).unwrap();
        let b = seg.mapping.alloc(5000, 0).unwrap();
        let c = seg.mapping.alloc(200, 0).unwrap();
        assert!(seg.mapping.free_memory() < before);

        // Out-of-order frees must coalesce back to one block.
        seg.mapping.free(b);
        seg.mapping.free(a);
        seg.mapping.free(c);
        assert_eq!(seg.mapping.free_memory(), before);
    }

    #[test]
    fn allocations_do_not_overlap() {
        let seg = segment(1 << 20);
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for size in [64u64, 1000, 8, 4096, 300] {
            let off = seg.mapping.alloc(size as usize, 0).unwrap();
            for (o, s) in &ranges {
                assert!(off + size <= *o || *o + *s <= off, "overlap at {off}");
            }
            ranges.push((off, size));
        }
    }

    #[test]
    fn alignment_is_honored() {
        let seg = segment(1 << 20);
        let base = seg.mapping.ptr_at(0) as usize;
        for align in [64usize, 256, 4096] {
            let off = seg.mapping.alloc(100, align).unwrap();
            assert_eq!((base + off as usize) % align, 0);
        }
    }

    #[test]
    fn exhaustion_reports_an_error() {
        let seg = segment(64 << 10);
        assert!(seg.mapping.alloc(1 << 20, 0).is_err());
    }

    #[test]
    fn best_fit_reuses_the_snuggest_hole() {
        let seg = segment(1 << 20);
        let small = seg.mapping.alloc(256, 0).unwrap();
        let _spacer1 = seg.mapping.alloc(64, 0).unwrap();
        let large = seg.mapping.alloc(8192, 0).unwrap();
        let _spacer2 = seg.mapping.alloc(64, 0).unwrap();
        seg.mapping.free(small);
        seg.mapping.free(large);

        // 256 bytes fit both holes; best fit picks the small one.
        let again = seg.mapping.alloc(256, 0).unwrap();
        assert_eq!(again, small);
    }

    #[test]
    fn sequential_fit_takes_the_first_hole() {
        let name = format!("fmq_test_{}", uuid::Uuid::new_v4().simple());
        let (mapping, created) =
            SegmentMapping::open_or_create(&name, 0, 1 << 20, false, false, false, false).unwrap();
        assert!(created);
        let seg = TestSegment { mapping, name };

        let large = seg.mapping.alloc(8192, 0).unwrap();
        let _spacer1 = seg.mapping.alloc(64, 0).unwrap();
        let small = seg.mapping.alloc(256, 0).unwrap();
        let _spacer2 = seg.mapping.alloc(64, 0).unwrap();
        seg.mapping.free(large);
        seg.mapping.free(small);

        // Both holes fit; sequential fit takes the first one by address
        // even though the later one is snugger.
        let again = seg.mapping.alloc(256, 0).unwrap();
        assert_eq!(again, large);
    }

    #[test]
    fn zeroing_on_creation_is_observable() {
        let name = format!("fmq_test_{}", uuid::Uuid::new_v4().simple());
        let (mapping, created) =
            SegmentMapping::open_or_create(&name, 0, 1 << 20, true, true, false, false).unwrap();
        assert!(created);
        let seg = TestSegment { mapping, name };

        let block = seg.mapping.alloc(4096, 0).unwrap();
        let data = unsafe { std::slice::from_raw_parts(seg.mapping.ptr_at(block), 4096) };
        assert!(data.iter().all(|b| *b == 0));
    }

    #[test]
    fn reference_counting_frees_on_last_release() {
        let seg = segment(1 << 20);
        let before = seg.mapping.free_memory();
        let block = seg.mapping.alloc(4096, 0).unwrap();
        seg.mapping.inc_ref(block);
        seg.mapping.dec_ref(block);
        assert!(seg.mapping.free_memory() < before, "still referenced");
        seg.mapping.dec_ref(block);
        assert_eq!(seg.mapping.free_memory(), before);
    }

    #[test]
    fn reopening_sees_the_same_allocator_state() {
        let seg = segment(1 << 20);
        let block = seg.mapping.alloc(1234, 0).unwrap();
        let (reopened, created) =
            SegmentMapping::open_or_create(&seg.name, 0, 1 << 20, true, false, false, false)
                .unwrap();
        assert!(!created);
        assert_eq!(reopened.free_memory(), seg.mapping.free_memory());
        reopened.free(block);
        assert_eq!(reopened.free_memory(), seg.mapping.free_memory());
    }
}
