//! The PUT/GET key-value side-channel: a small global namespace layered on
//! top of the GAS, keyed by `u64` rather than by `GAddr`, used by clients to
//! publish well-known roots (spec §6 `Put`/`Get` op codes).
//!
//! Grounded on `original_source/include/workrequest.h`'s `KV_PUT`/`KV_GET`
//! and the coordinator-resident key table it implies.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct KvStore {
    entries: HashMap<u64, Vec<u8>>,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore::default()
    }

    pub fn put(&mut self, key: u64, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: u64) -> Option<&[u8]> {
        self.entries.get(&key).map(|v| v.as_slice())
    }
}
