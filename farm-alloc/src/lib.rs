//! Size-classed slab allocator backing a worker's local heap.
//!
//! This allocator deals purely in offsets into an abstract `heap_size`-byte
//! address space; it does not own the bytes themselves (the worker's heap
//! buffer does — see `farm-worker::Heap`). Keeping the two separate means the
//! allocator never needs `unsafe` pointer arithmetic: an allocated "pointer"
//! here is just a `u64` offset that the caller indexes a byte buffer with.
//!
//! Grounded on `original_source/include/slabs.h` and `src/slabs.cc`: classes
//! indexed from 1, each successive class's chunk size the previous
//! multiplied by a growth factor and aligned up to 8 bytes, free list per
//! class, side map from offset to class id for `free`.

use std::collections::VecDeque;

use rapidhash::RapidHashMap;
use tracing::{debug, trace, warn};

/// Chunk sizes are rounded up to a multiple of this so the version word
/// embedded at the front of every object is always naturally aligned
/// (spec §3: "version word MUST be naturally aligned to 8 bytes").
pub const CHUNK_ALIGN_BYTES: u64 = 8;

/// Every slab page carved from the arena is this many bytes; the largest
/// class's chunk size is fixed at exactly one page (spec §4.1).
pub const SLAB_PAGE_SIZE: u64 = 1 << 20;

fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}

#[derive(Debug)]
struct SlabClass {
    chunk_size: u64,
    free_list: VecDeque<u64>,
    slabs: u32,
    /// Free items across all slab pages of this class.
    sl_curr: u32,
    /// Bytes actually requested by live (non-freed) allocations in this
    /// class, i.e. excluding the rounding-up slack to `chunk_size`.
    requested: u64,
}

impl SlabClass {
    fn new(chunk_size: u64) -> SlabClass {
        SlabClass { chunk_size, free_list: VecDeque::new(), slabs: 0, sl_curr: 0, requested: 0 }
    }
}

#[derive(Debug, Clone, Copy)]
struct SideMapEntry {
    class_idx: usize,
    requested: u64,
}

/// Per-class snapshot for diagnostics and the allocator invariant test in
/// spec §8.
#[derive(Debug, Clone, Copy)]
pub struct ClassStats {
    pub class_id: u32,
    pub chunk_size: u64,
    pub slabs: u32,
    pub sl_curr: u32,
    pub requested: u64,
}

/// Outcome of [`SlabAllocator::realloc`]. The allocator doesn't own the
/// backing bytes, so when a reallocation must move to a different class it
/// reports both offsets and the copy length, leaving the actual `memcpy` to
/// the caller (who does own the heap buffer).
#[derive(Clone, Copy)]
pub enum Realloc {
    /// The existing chunk's class already accommodates `new_size`; only
    /// bookkeeping changed, the offset is unchanged.
    SameChunk { offset: u64 },
    /// A new chunk was allocated; the caller must copy
    /// `min(old_size, new_size)` bytes from `old_offset` to `new_offset`
    /// before treating `old_offset` as free.
    Moved { old_offset: u64, new_offset: u64, copy_len: u64 },
    /// The arena is exhausted and no free-list entry exists for the
    /// destination class.
    OutOfMemory,
}

pub struct SlabAllocator {
    classes: Vec<SlabClass>,
    heap_size: u64,
    /// Bytes carved from the arena into slab pages so far (monotonic).
    carved: u64,
    side_map: RapidHashMap<u64, SideMapEntry>,
}

impl SlabAllocator {
    /// Builds the class ladder for `heap_size` bytes of backing space, with
    /// each class's chunk size `factor` times the previous, aligned up to 8
    /// bytes, until the ladder reaches exactly `SLAB_PAGE_SIZE` (spec
    /// §4.1).
    pub fn new(heap_size: u64, factor: f64) -> SlabAllocator {
        assert!(factor > 1.0, "slab growth factor must exceed 1.0");
        let mut classes = Vec::new();
        let mut size = CHUNK_ALIGN_BYTES;
        loop {
            let aligned = align_up(size, CHUNK_ALIGN_BYTES).min(SLAB_PAGE_SIZE);
            classes.push(SlabClass::new(aligned));
            if aligned >= SLAB_PAGE_SIZE {
                break;
            }
            size = ((aligned as f64) * factor).ceil() as u64;
        }
        // reserved capacity sized off the heap divided by the smallest
        // class's chunk size, per the design notes: this avoids rehashes on
        // the alloc hot path.
        let smallest = classes[0].chunk_size.max(1);
        let reserve = (heap_size / smallest).min(1 << 20) as usize;
        debug!(classes = classes.len(), heap_size, reserve, "slab allocator initialized");
        let mut side_map = RapidHashMap::default();
        side_map.reserve(reserve);
        SlabAllocator { classes, heap_size, carved: 0, side_map }
    }

    pub fn max_object_size(&self) -> u64 {
        self.classes.last().map(|c| c.chunk_size).unwrap_or(0)
    }

    /// The smallest class whose chunk size is >= `size`, or `None` if no
    /// class is big enough (spec: object sizes exceeding the max slab class
    /// are a non-goal).
    fn class_for(&self, size: u64) -> Option<usize> {
        self.classes.iter().position(|c| c.chunk_size >= size)
    }

    fn carve_new_slab(&mut self, class_idx: usize) -> bool {
        if self.carved + SLAB_PAGE_SIZE > self.heap_size {
            return false;
        }
        let base = self.carved;
        self.carved += SLAB_PAGE_SIZE;
        let chunk_size = self.classes[class_idx].chunk_size;
        let n = SLAB_PAGE_SIZE / chunk_size;
        let class = &mut self.classes[class_idx];
        for i in 0..n {
            class.free_list.push_back(base + i * chunk_size);
        }
        class.slabs += 1;
        class.sl_curr += n as u32;
        trace!(class_idx, chunks = n, "carved new slab page");
        true
    }

    /// Selects a size class and hands back an offset; `None` iff the arena
    /// is exhausted and the chosen class's free list is empty too (spec:
    /// surfaced by the caller as `ALLOC_ERROR`).
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        let class_idx = self.class_for(size)?;
        if self.classes[class_idx].free_list.is_empty() && !self.carve_new_slab(class_idx) {
            warn!(size, "slab allocator exhausted");
            return None;
        }
        let class = &mut self.classes[class_idx];
        let offset = class.free_list.pop_front()?;
        class.sl_curr -= 1;
        class.requested += size;
        self.side_map.insert(offset, SideMapEntry { class_idx, requested: size });
        Some(offset)
    }

    /// Like [`Self::alloc`], but the returned offset satisfies
    /// `offset % block == 0`. The class chosen is the smallest one whose
    /// chunk size both accommodates `size` and is itself a multiple of
    /// `block` — equivalent to the spec's "round the chunk size down to a
    /// BLOCK_SIZE multiple" in the case where rounding down would otherwise
    /// fall under `size`.
    pub fn aligned_alloc(&mut self, size: u64, block: u64) -> Option<u64> {
        assert!(block > 0 && block.is_power_of_two(), "block size must be a power of two");
        let needed = align_up(size, block);
        let class_idx = self
            .classes
            .iter()
            .position(|c| c.chunk_size >= needed && c.chunk_size % block == 0)?;
        if self.classes[class_idx].free_list.is_empty() && !self.carve_new_slab(class_idx) {
            return None;
        }
        let class = &mut self.classes[class_idx];
        let offset = class.free_list.pop_front()?;
        class.sl_curr -= 1;
        class.requested += size;
        self.side_map.insert(offset, SideMapEntry { class_idx, requested: size });
        debug_assert_eq!(offset % block, 0);
        Some(offset)
    }

    pub fn free(&mut self, offset: u64) {
        let Some(entry) = self.side_map.remove(&offset) else {
            warn!(offset, "free() of an offset not tracked by the allocator");
            return;
        };
        let class = &mut self.classes[entry.class_idx];
        class.requested -= entry.requested;
        class.free_list.push_back(offset);
        class.sl_curr += 1;
    }

    pub fn is_free(&self, offset: u64) -> bool {
        !self.side_map.contains_key(&offset)
    }

    pub fn size_of(&self, offset: u64) -> Option<u64> {
        self.side_map.get(&offset).map(|e| e.requested)
    }

    /// Size of the allocator's backing chunk (not the caller's requested
    /// size) for `offset`; this is the "block" §4.4 checks requested
    /// object sizes against.
    pub fn chunk_size_of(&self, offset: u64) -> Option<u64> {
        self.side_map.get(&offset).map(|e| self.classes[e.class_idx].chunk_size)
    }

    pub fn realloc(&mut self, offset: u64, new_size: u64) -> Realloc {
        let Some(entry) = self.side_map.get(&offset).copied() else {
            return Realloc::OutOfMemory;
        };
        let old_size = entry.requested;
        let chunk_size = self.classes[entry.class_idx].chunk_size;
        if new_size <= chunk_size {
            let class = &mut self.classes[entry.class_idx];
            class.requested = class.requested - old_size + new_size;
            self.side_map.get_mut(&offset).unwrap().requested = new_size;
            return Realloc::SameChunk { offset };
        }
        let Some(new_offset) = self.alloc(new_size) else {
            return Realloc::OutOfMemory;
        };
        self.free(offset);
        Realloc::Moved { old_offset: offset, new_offset, copy_len: old_size.min(new_size) }
    }

    /// Bytes not yet carved from the arena, plus bytes sitting on free
    /// lists (spec §4.1).
    pub fn get_avail(&self) -> u64 {
        (self.heap_size - self.carved) + self.free_list_bytes()
    }

    fn free_list_bytes(&self) -> u64 {
        self.classes.iter().map(|c| c.chunk_size * c.sl_curr as u64).sum()
    }

    /// Bytes occupied by chunks currently handed out (not on a free list).
    pub fn bytes_in_use(&self) -> u64 {
        self.carved - self.free_list_bytes()
    }

    pub fn heap_size(&self) -> u64 {
        self.heap_size
    }

    pub fn stats(&self) -> Vec<ClassStats> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, c)| ClassStats {
                class_id: (i + 1) as u32,
                chunk_size: c.chunk_size,
                slabs: c.slabs,
                sl_curr: c.sl_curr,
                requested: c.requested,
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_returns_distinct_offsets() {
        let mut a = SlabAllocator::new(4 << 20, 1.25);
        let p1 = a.alloc(100).unwrap();
        let p2 = a.alloc(100).unwrap();
        assert_ne!(p1, p2);
    }

    #[test]
    fn free_then_alloc_reuses_chunk() {
        let mut a = SlabAllocator::new(4 << 20, 1.25);
        let p1 = a.alloc(100).unwrap();
        a.free(p1);
        let p2 = a.alloc(100).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn class_boundary_and_next_class() {
        let mut a = SlabAllocator::new(4 << 20, 1.25);
        let class_size = {
            let idx = a.class_for(64).unwrap();
            a.classes[idx].chunk_size
        };
        let at_boundary = a.alloc(class_size).unwrap();
        assert_eq!(a.chunk_size_of(at_boundary), Some(class_size));

        let next_idx = a.class_for(class_size + 1).unwrap();
        let bumped = a.alloc(class_size + 1).unwrap();
        assert_eq!(a.chunk_size_of(bumped), Some(a.classes[next_idx].chunk_size));
        assert!(a.classes[next_idx].chunk_size > class_size);
    }

    #[test]
    fn largest_class_is_exactly_one_mebibyte() {
        let a = SlabAllocator::new(16 << 20, 1.25);
        assert_eq!(a.max_object_size(), SLAB_PAGE_SIZE);
    }

    #[test]
    fn alloc_fails_above_max_class() {
        let mut a = SlabAllocator::new(16 << 20, 1.25);
        assert!(a.alloc(SLAB_PAGE_SIZE + 1).is_none());
    }

    #[test]
    fn exhausts_arena_and_reports_none() {
        let mut a = SlabAllocator::new(SLAB_PAGE_SIZE, 1.25);
        // First slab page for the smallest class is fully handed out...
        let chunk = a.classes[0].chunk_size;
        let per_page = (SLAB_PAGE_SIZE / chunk) as usize;
        let mut ptrs = Vec::new();
        for _ in 0..per_page {
            ptrs.push(a.alloc(chunk).unwrap());
        }
        // ...and the arena has no more pages to carve for any class.
        assert!(a.alloc(chunk).is_none());
    }

    #[test]
    fn aligned_alloc_respects_block_alignment() {
        let mut a = SlabAllocator::new(8 << 20, 1.25);
        for _ in 0..8 {
            let p = a.aligned_alloc(100, 4096).unwrap();
            assert_eq!(p % 4096, 0);
        }
    }

    #[test]
    fn realloc_same_class_keeps_offset() {
        let mut a = SlabAllocator::new(4 << 20, 1.25);
        let p = a.alloc(8).unwrap();
        let chunk = a.chunk_size_of(p).unwrap();
        match a.realloc(p, chunk) {
            Realloc::SameChunk { offset } => assert_eq!(offset, p),
            other => panic!("expected SameChunk, got {other:?}"),
        }
    }

    #[test]
    fn realloc_bigger_moves_and_reports_copy_len() {
        let mut a = SlabAllocator::new(4 << 20, 1.25);
        let p = a.alloc(8).unwrap();
        let big = a.max_object_size();
        match a.realloc(p, big) {
            Realloc::Moved { old_offset, new_offset, copy_len } => {
                assert_eq!(old_offset, p);
                assert_ne!(new_offset, p);
                assert_eq!(copy_len, 8);
            }
            other => panic!("expected Moved, got {other:?}"),
        }
        assert!(a.is_free(p));
    }

    #[test]
    fn allocator_invariant_holds_across_alloc_and_free() {
        let a_size = 4 << 20;
        let mut a = SlabAllocator::new(a_size, 1.25);
        let mut ptrs = Vec::new();
        for _ in 0..20 {
            ptrs.push(a.alloc(64).unwrap());
        }
        for p in ptrs.iter().step_by(2) {
            a.free(*p);
        }
        let free_list_bytes: u64 = a.stats().iter().map(|s| s.chunk_size * s.sl_curr as u64).sum();
        assert_eq!(a.bytes_in_use() + a.get_avail(), a_size - free_list_bytes + a.get_avail());
        assert_eq!(
            a.bytes_in_use() + (a_size - a.carved) + free_list_bytes,
            a_size
        );
    }
}

impl std::fmt::Debug for Realloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Realloc::SameChunk { offset } => write!(f, "SameChunk(offset={offset})"),
            Realloc::Moved { old_offset, new_offset, copy_len } => {
                write!(f, "Moved(old={old_offset}, new={new_offset}, len={copy_len})")
            }
            Realloc::OutOfMemory => write!(f, "OutOfMemory"),
        }
    }
}
