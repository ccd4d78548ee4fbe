//! Concrete local storage for one worker: a [`farm_alloc::SlabAllocator`]
//! for offsets, plus the version words and payload bytes those offsets
//! name. Implements [`farm_txn::LocalStore`] so the protocol crate never
//! needs to know how bytes are actually kept.
//!
//! Grounded on `original_source/include/worker.h`'s `base`/`size` heap
//! fields and `src/slabs.cc`'s `sb_get_item`/`sb_item_free`, adapted to
//! keep the version word in a side table instead of embedded in a raw byte
//! buffer. [`LocalStore`] takes `&self` (the coordinator/participant hold
//! only shared references while driving many addresses through a
//! transaction), so the allocator and the object table sit behind a
//! `RefCell` rather than needing `unsafe` interior mutability.

use std::cell::RefCell;

use rapidhash::RapidHashMap;
use tracing::{error, trace, warn};

use farm_base::{GAddr, WorkerId};
use farm_txn::{LocalStore, VersionWord};

struct Entry {
    version: VersionWord,
    payload: Vec<u8>,
}

pub struct Heap {
    self_wid: WorkerId,
    alloc: RefCell<farm_alloc::SlabAllocator>,
    objects: RefCell<RapidHashMap<u64, Entry>>,
}

impl Heap {
    pub fn new(self_wid: WorkerId, size: u64, factor: f64) -> Heap {
        Heap {
            self_wid,
            alloc: RefCell::new(farm_alloc::SlabAllocator::new(size, factor)),
            objects: RefCell::new(RapidHashMap::default()),
        }
    }

    pub fn get_avail(&self) -> u64 {
        self.alloc.borrow().get_avail()
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.alloc.borrow().bytes_in_use()
    }

    pub fn heap_size(&self) -> u64 {
        self.alloc.borrow().heap_size()
    }

    pub fn max_object_size(&self) -> u64 {
        self.alloc.borrow().max_object_size()
    }

    /// Whether `addr` currently carries RLOCK or WLOCK — used by the
    /// dispatch loop to decide whether a plain read must be deferred
    /// behind an in-flight transaction's PREPARE (spec §4.5).
    pub fn is_locked(&self, addr: GAddr) -> bool {
        self.objects.borrow().get(&addr.off()).is_some_and(|e| e.version.is_locked())
    }

    /// Reallocates the object at `addr` to `new_size`, copying the
    /// overlapping prefix if the class changed. Returns the (possibly new)
    /// address, or `None` if the heap is exhausted.
    pub fn realloc(&self, addr: GAddr, new_size: u64) -> Option<GAddr> {
        let outcome = self.alloc.borrow_mut().realloc(addr.off(), new_size);
        let mut objects = self.objects.borrow_mut();
        match outcome {
            farm_alloc::Realloc::SameChunk { .. } => {
                if let Some(entry) = objects.get_mut(&addr.off()) {
                    entry.payload.resize(new_size as usize, 0);
                }
                Some(addr)
            }
            farm_alloc::Realloc::Moved { old_offset, new_offset, copy_len } => {
                let mut payload = vec![0u8; new_size as usize];
                if let Some(old) = objects.remove(&old_offset) {
                    let n = copy_len as usize;
                    payload[..n].copy_from_slice(&old.payload[..n]);
                }
                objects.insert(new_offset, Entry { version: VersionWord::new(), payload });
                Some(GAddr::new(self.self_wid, new_offset))
            }
            farm_alloc::Realloc::OutOfMemory => None,
        }
    }
}

impl LocalStore for Heap {
    fn rlock(&self, addr: GAddr) -> bool {
        match self.objects.borrow().get(&addr.off()) {
            Some(e) => e.version.rlock(),
            None => {
                warn!(?addr, "rlock() on an address with no live object");
                false
            }
        }
    }

    fn wlock(&self, addr: GAddr) -> bool {
        match self.objects.borrow().get(&addr.off()) {
            Some(e) => e.version.wlock(),
            None => false,
        }
    }

    fn runlock(&self, addr: GAddr) {
        if let Some(e) = self.objects.borrow().get(&addr.off()) {
            e.version.runlock();
        }
    }

    fn wunlock(&self, addr: GAddr) {
        if let Some(e) = self.objects.borrow().get(&addr.off()) {
            e.version.wunlock();
        }
    }

    /// The raw version word, RLOCK/WLOCK bits included. VALIDATE needs to
    /// see a concurrently-held RLOCK even when the counter hasn't moved
    /// (spec §4.4 Phase 2); the masked counter alone can't express that.
    fn version(&self, addr: GAddr) -> u64 {
        self.objects.borrow().get(&addr.off()).map_or(0, |e| e.version.load())
    }

    fn is_freed(&self, addr: GAddr) -> bool {
        !self.objects.borrow().contains_key(&addr.off())
    }

    fn block_size(&self, addr: GAddr) -> Option<u64> {
        self.alloc.borrow().chunk_size_of(addr.off())
    }

    fn apply_write(&self, addr: GAddr, size: i32, payload: &[u8]) {
        if size < 0 {
            self.objects.borrow_mut().remove(&addr.off());
            self.alloc.borrow_mut().free(addr.off());
            trace!(?addr, "applied free");
            return;
        }
        if let Some(block) = self.alloc.borrow().chunk_size_of(addr.off()) {
            if (payload.len() as u64) > block {
                error!(?addr, payload_len = payload.len(), block, "write exceeds its slab chunk; PREPARE should have rejected this");
            }
        }
        let mut objects = self.objects.borrow_mut();
        match objects.get_mut(&addr.off()) {
            Some(e) => {
                e.payload.clear();
                e.payload.extend_from_slice(payload);
            }
            None => {
                objects.insert(addr.off(), Entry { version: VersionWord::new(), payload: payload.to_vec() });
            }
        }
    }

    fn read(&self, addr: GAddr) -> (u64, Vec<u8>) {
        match self.objects.borrow().get(&addr.off()) {
            Some(e) => (e.version.version(), e.payload.clone()),
            None => (0, Vec::new()),
        }
    }

    fn alloc(&self, size: u32) -> GAddr {
        let offset = self.alloc.borrow_mut().alloc(size as u64);
        match offset {
            Some(offset) => {
                self.objects
                    .borrow_mut()
                    .insert(offset, Entry { version: VersionWord::new(), payload: vec![0u8; size as usize] });
                GAddr::new(self.self_wid, offset)
            }
            None => GAddr::NULL,
        }
    }
}
