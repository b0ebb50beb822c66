use std::num::NonZeroUsize;
use std::sync::Arc;

use aero_addrspace::{CodeBlock, GuestMode};
use lru::LruCache;
use parking_lot::Mutex;

use super::Compiler;
use crate::decoder::InstructionStream;

/// Decoded instructions carry ip-relative targets, so the start address is part of the key.
type Key = (GuestMode, u32, Box<[u8]>);

fn key(stream: &InstructionStream) -> Key {
    (stream.mode(), stream.start(), stream.bytes().into())
}

/// LRU of background-compiled units, shared between the promotion worker and the decode path.
///
/// Lookups never wait: if the worker holds the lock the lookup is a miss and the caller builds
/// an interpreted unit instead.
#[derive(Debug)]
pub struct CompiledBlockCache {
    entries: Mutex<LruCache<Key, Arc<CodeBlock>>>,
}

impl CompiledBlockCache {
    /// A zero capacity keeps a single entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn insert(&self, stream: &InstructionStream, unit: Arc<CodeBlock>) {
        self.entries.lock().put(key(stream), unit);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Compiler for CompiledBlockCache {
    fn compile(&self, stream: &InstructionStream) -> Option<Arc<CodeBlock>> {
        let mut entries = self.entries.try_lock()?;
        entries.get(&key(stream)).cloned()
    }
}
