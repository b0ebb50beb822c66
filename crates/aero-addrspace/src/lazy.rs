//! Guest RAM block with lazily allocated storage and per-mode executable-unit caches.

use std::sync::Arc;

use tracing::trace;

use crate::block::{Fetched, MemoryBlock};
use crate::code::{ByteSource, CodeBlock, CodeSource, Decoded, GuestMode};
use crate::error::{ExecError, PageFault};
use crate::BLOCK_SIZE;

/// Reads of an unallocated block answer zero until this many have happened; the block then
/// materializes its storage so later reads take the direct path.
pub const READ_MISS_ALLOCATION_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Empty,
    /// Covered by a unit whose head is at a lower offset.
    Placeholder,
    Head(Arc<CodeBlock>),
}

#[derive(Debug)]
struct ModeCache {
    slots: Box<[Slot]>,
    units: usize,
    /// Longest unit ever installed; bounds how far back a write can reach a head.
    longest: usize,
}

impl ModeCache {
    fn new() -> Self {
        Self {
            slots: vec![Slot::Empty; BLOCK_SIZE].into_boxed_slice(),
            units: 0,
            longest: 0,
        }
    }

    fn install(&mut self, offset: usize, unit: &Arc<CodeBlock>) {
        let len = unit.x86_length() as usize;
        debug_assert!(!matches!(self.slots[offset], Slot::Head(_)));
        self.slots[offset] = Slot::Head(Arc::clone(unit));
        self.units += 1;
        let end = (offset + len).min(BLOCK_SIZE);
        for slot in &mut self.slots[offset + 1..end] {
            if !matches!(slot, Slot::Head(_)) {
                *slot = Slot::Placeholder;
            }
        }
        self.longest = self.longest.max(len);
    }

    fn remove_head(&mut self, offset: usize, len: usize) {
        self.slots[offset] = Slot::Empty;
        self.units -= 1;
        let end = (offset + len).min(BLOCK_SIZE);
        for slot in &mut self.slots[offset + 1..end] {
            if matches!(slot, Slot::Head(_)) {
                break;
            }
            *slot = Slot::Empty;
        }
    }

    /// Drop every unit overlapping `[start, end)` that agrees it is invalidated. Returns the
    /// number of units removed.
    fn invalidate(&mut self, bytes: Option<&[u8; BLOCK_SIZE]>, start: usize, end: usize) -> u64 {
        let floor = (start + 1).saturating_sub(self.longest);
        let mut removed = 0;
        let mut cleared_end = end;

        for head in (floor..end).rev() {
            let Slot::Head(unit) = &self.slots[head] else {
                continue;
            };
            let len = unit.x86_length() as usize;
            if head + len <= start {
                continue;
            }
            let unit_end = (head + len).min(BLOCK_SIZE);
            let current = bytes.map_or(&[][..], |b| &b[head..unit_end]);
            if !unit.invalidated_by(start.saturating_sub(head)..end - head, current) {
                continue;
            }
            self.remove_head(head, len);
            cleared_end = cleared_end.max(unit_end);
            removed += 1;
        }

        if removed > 0 {
            self.repair(floor.saturating_sub(self.longest), floor, cleared_end);
        }
        removed
    }

    /// Restore placeholder runs of surviving units that a removal cut through, and drop
    /// placeholders at or after `floor` that no surviving unit reaches.
    ///
    /// Heads before `lo` cannot reach `floor`, so coverage from `floor` on is fully known.
    fn repair(&mut self, lo: usize, floor: usize, hi: usize) {
        let mut reach = 0;
        for offset in lo..hi {
            let next = match &self.slots[offset] {
                Slot::Head(unit) => {
                    reach = reach.max(offset + unit.x86_length() as usize);
                    continue;
                }
                Slot::Empty if offset < reach => Slot::Placeholder,
                Slot::Placeholder if offset >= floor && offset >= reach => Slot::Empty,
                _ => continue,
            };
            self.slots[offset] = next;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub installs: u64,
    pub invalidations: u64,
    pub span_tail_clears: u64,
    /// Heads replaced because the block was entered through a different address.
    pub alias_rebuilds: u64,
}

/// RAM block with deferred allocation and three executable-unit caches (one per [`GuestMode`])
/// over the same bytes.
///
/// Every mutation funnels through [`LazyCodeMemory::on_write`], so a unit is never returned
/// after any byte it covers changed.
#[derive(Debug, Default)]
pub struct LazyCodeMemory {
    bytes: Option<Box<[u8; BLOCK_SIZE]>>,
    read_misses: u32,
    caches: [Option<Box<ModeCache>>; 3],
    /// Leading bytes that hold the tail of a spanning unit starting in the previous block.
    span_tails: [usize; 3],
    stats: CodeCacheStats,
}

impl LazyCodeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block pre-filled with `data` (zero padded).
    pub fn with_contents(data: &[u8]) -> Self {
        let mut block = Self::new();
        block.load_contents(Some(data));
        block
    }

    pub fn stats(&self) -> CodeCacheStats {
        self.stats
    }

    pub fn cached_units(&self, mode: GuestMode) -> usize {
        self.caches[mode.index()].as_ref().map_or(0, |cache| cache.units)
    }

    #[inline]
    fn readable(&mut self) -> Option<&[u8; BLOCK_SIZE]> {
        if self.bytes.is_none() {
            self.read_misses += 1;
            if self.read_misses < READ_MISS_ALLOCATION_THRESHOLD {
                return None;
            }
            trace!(misses = self.read_misses, "materializing block after repeated reads");
            self.bytes = Some(Box::new([0; BLOCK_SIZE]));
        }
        self.bytes.as_deref()
    }

    #[inline]
    fn writable(&mut self) -> &mut [u8; BLOCK_SIZE] {
        self.bytes.get_or_insert_with(|| Box::new([0; BLOCK_SIZE]))
    }

    #[inline]
    fn read_array<const N: usize>(&mut self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(bytes) = self.readable() {
            out.copy_from_slice(&bytes[offset..offset + N]);
        }
        out
    }

    /// Invalidate every cached unit, in every mode, that covers any byte of
    /// `[offset, offset + width)`.
    ///
    /// Called after the bytes have changed. Repeating it over an already clean range is a no-op.
    pub fn on_write(&mut self, offset: usize, width: usize) {
        if width == 0 || offset >= BLOCK_SIZE {
            return;
        }
        let end = (offset + width).min(BLOCK_SIZE);

        for mode in GuestMode::ALL {
            let idx = mode.index();
            if offset < self.span_tails[idx] {
                trace!(?mode, offset, "write into spanning tail");
                self.span_tails[idx] = 0;
                self.stats.span_tail_clears += 1;
            }

            let Some(cache) = self.caches[idx].as_deref_mut() else {
                continue;
            };
            let removed = cache.invalidate(self.bytes.as_deref(), offset, end);
            if removed > 0 {
                trace!(?mode, offset, end, removed, "invalidated cached units");
                self.stats.invalidations += removed;
            }
            if cache.units == 0 {
                self.caches[idx] = None;
            }
        }
    }

    fn drop_caches(&mut self) {
        for (cache, tail) in self.caches.iter_mut().zip(self.span_tails.iter_mut()) {
            if let Some(cache) = cache.take() {
                self.stats.invalidations += cache.units as u64;
            }
            *tail = 0;
        }
    }
}

struct BlockBytes<'a> {
    data: Option<&'a [u8; BLOCK_SIZE]>,
    offset: usize,
    addr: u32,
}

impl ByteSource for BlockBytes<'_> {
    fn start(&self) -> u32 {
        self.addr
    }

    fn limit(&self) -> Option<usize> {
        Some(BLOCK_SIZE - self.offset)
    }

    fn byte_at(&mut self, index: usize) -> Result<u8, PageFault> {
        Ok(self
            .data
            .and_then(|d| d.get(self.offset + index).copied())
            .unwrap_or(0))
    }
}

impl MemoryBlock for LazyCodeMemory {
    fn is_allocated(&self) -> bool {
        self.bytes.is_some()
    }

    #[inline]
    fn read_u8(&mut self, offset: usize) -> u8 {
        self.readable().map_or(0, |bytes| bytes[offset])
    }

    #[inline]
    fn read_u16(&mut self, offset: usize) -> u16 {
        u16::from_le_bytes(self.read_array(offset))
    }

    #[inline]
    fn read_u32(&mut self, offset: usize) -> u32 {
        u32::from_le_bytes(self.read_array(offset))
    }

    #[inline]
    fn read_u64(&mut self, offset: usize) -> u64 {
        u64::from_le_bytes(self.read_array(offset))
    }

    fn read_bytes(&mut self, offset: usize, dst: &mut [u8]) {
        match self.readable() {
            Some(bytes) => dst.copy_from_slice(&bytes[offset..offset + dst.len()]),
            None => dst.fill(0),
        }
    }

    #[inline]
    fn write_u8(&mut self, offset: usize, value: u8) {
        self.writable()[offset] = value;
        self.on_write(offset, 1);
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    fn write_bytes(&mut self, offset: usize, src: &[u8]) {
        self.writable()[offset..offset + src.len()].copy_from_slice(src);
        self.on_write(offset, src.len());
    }

    fn executable_at(
        &mut self,
        mode: GuestMode,
        offset: usize,
        addr: u32,
        source: &dyn CodeSource,
    ) -> Result<Fetched, ExecError> {
        // A head decoded through another alias of this block is rebuilt for `addr`.
        let stale = match self.cached_unit(mode, offset) {
            Some(unit) if unit.start() == addr => return Ok(Fetched::Unit(unit)),
            Some(unit) => Some(unit.x86_length() as usize),
            None => None,
        };

        let decoded = {
            let mut bytes = BlockBytes {
                data: self.bytes.as_deref(),
                offset,
                addr,
            };
            source.get_unit(mode, &mut bytes)?
        };

        match decoded {
            Decoded::Unit(unit) if offset + unit.x86_length() as usize <= BLOCK_SIZE => {
                let cache = self.caches[mode.index()]
                    .get_or_insert_with(|| Box::new(ModeCache::new()));
                if let Some(len) = stale {
                    cache.remove_head(offset, len);
                    self.stats.alias_rebuilds += 1;
                }
                cache.install(offset, &unit);
                self.stats.installs += 1;
                trace!(?mode, offset, addr, len = unit.x86_length(), "installed unit");
                Ok(Fetched::Unit(unit))
            }
            Decoded::Unit(_) | Decoded::CrossesBoundary => Ok(Fetched::Spanning),
        }
    }

    fn cached_unit(&self, mode: GuestMode, offset: usize) -> Option<Arc<CodeBlock>> {
        match self.caches[mode.index()].as_ref()?.slots.get(offset)? {
            Slot::Head(unit) => Some(Arc::clone(unit)),
            _ => None,
        }
    }

    fn is_covered(&self, mode: GuestMode, offset: usize) -> bool {
        let idx = mode.index();
        if offset < self.span_tails[idx] {
            return true;
        }
        self.caches[idx]
            .as_ref()
            .and_then(|cache| cache.slots.get(offset))
            .is_some_and(|slot| !matches!(slot, Slot::Empty))
    }

    fn replace_unit(
        &mut self,
        mode: GuestMode,
        offset: usize,
        old: &Arc<CodeBlock>,
        new: Arc<CodeBlock>,
    ) {
        let Some(cache) = self.caches[mode.index()].as_deref_mut() else {
            return;
        };
        let Some(Slot::Head(current)) = cache.slots.get(offset) else {
            return;
        };
        if !Arc::ptr_eq(current, old) {
            return;
        }
        if new.x86_length() == old.x86_length() {
            cache.slots[offset] = Slot::Head(new);
        } else if offset + new.x86_length() as usize <= BLOCK_SIZE {
            cache.remove_head(offset, old.x86_length() as usize);
            cache.install(offset, &new);
        }
    }

    fn mark_span_tail(&mut self, mode: GuestMode, len: usize) {
        let tail = &mut self.span_tails[mode.index()];
        *tail = (*tail).max(len.min(BLOCK_SIZE));
    }

    fn contents(&self) -> Option<&[u8]> {
        self.bytes.as_deref().map(|b| &b[..])
    }

    fn load_contents(&mut self, data: Option<&[u8]>) {
        match data {
            Some(data) => {
                let len = data.len().min(BLOCK_SIZE);
                let bytes = self.writable();
                bytes[..len].copy_from_slice(&data[..len]);
                bytes[len..].fill(0);
            }
            None => {
                self.bytes = None;
                self.read_misses = 0;
            }
        }
        self.drop_caches();
    }
}
