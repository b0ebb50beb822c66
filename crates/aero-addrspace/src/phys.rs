use std::fmt;
use std::io::{Read, Write};
use std::mem;
use std::sync::Arc;

use tracing::debug;

use crate::block::{Fetched, MemoryBlock, UnconnectedBlock};
use crate::code::{CodeBlock, CodeSource, GuestMode, Processor};
use crate::error::{ExecError, MapError, PageFault};
use crate::lazy::LazyCodeMemory;
use crate::snapshot::{self, ReadLeExt, SnapshotError, WriteLeExt};
use crate::space::{run_unit, AddressSpace};
use crate::spanning::SpanningUnit;
use crate::{BLOCK_COUNT, BLOCK_MASK, BLOCK_SHIFT, BLOCK_SIZE};

/// Handle to a block owned by a [`PhysicalAddressSpace`].
///
/// Ids are recycled once a block is no longer mapped anywhere; holders outside the address space
/// must revalidate against [`PhysicalAddressSpace::mapping_epoch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

impl BlockId {
    pub const UNCONNECTED: BlockId = BlockId(0);

    #[inline]
    pub fn is_unconnected(self) -> bool {
        self == Self::UNCONNECTED
    }
}

const SPARSE_SHIFT: usize = 10;
const SPARSE_INNER: usize = 1 << SPARSE_SHIFT;
const SPARSE_OUTER: usize = BLOCK_COUNT >> SPARSE_SHIFT;

/// Page-number bit corresponding to address line 20.
const A20_PAGE_BIT: usize = 1 << (20 - BLOCK_SHIFT);

const PRIMARY: usize = 0;
const MASKED: usize = 1;

/// `address >> 12` to block map: a dense window over RAM plus a two-level sparse table whose inner
/// tables are created on demand.
#[derive(Debug)]
struct PageIndex {
    quick: Box<[BlockId]>,
    sparse: Vec<Option<Box<[BlockId]>>>,
}

impl PageIndex {
    fn new(quick_pages: usize) -> Self {
        Self {
            quick: vec![BlockId::UNCONNECTED; quick_pages].into_boxed_slice(),
            sparse: (0..SPARSE_OUTER).map(|_| None).collect(),
        }
    }

    #[inline]
    fn get(&self, page: usize) -> BlockId {
        match self.quick.get(page) {
            Some(id) => *id,
            None => self.sparse[page >> SPARSE_SHIFT]
                .as_ref()
                .map_or(BlockId::UNCONNECTED, |inner| inner[page & (SPARSE_INNER - 1)]),
        }
    }

    /// Store `id` for `page`, returning the previous occupant.
    fn set(&mut self, page: usize, id: BlockId) -> BlockId {
        if let Some(slot) = self.quick.get_mut(page) {
            return mem::replace(slot, id);
        }
        let outer = &mut self.sparse[page >> SPARSE_SHIFT];
        if outer.is_none() && id.is_unconnected() {
            return BlockId::UNCONNECTED;
        }
        let inner = outer
            .get_or_insert_with(|| vec![BlockId::UNCONNECTED; SPARSE_INNER].into_boxed_slice());
        mem::replace(&mut inner[page & (SPARSE_INNER - 1)], id)
    }

    /// Mapped pages in ascending order.
    fn mapped(&self) -> impl Iterator<Item = (usize, BlockId)> + '_ {
        let quick = self.quick.iter().copied().enumerate();
        let sparse = self
            .sparse
            .iter()
            .enumerate()
            .filter_map(|(outer, inner)| inner.as_ref().map(|inner| (outer, inner)))
            .flat_map(|(outer, inner)| {
                inner
                    .iter()
                    .copied()
                    .enumerate()
                    .map(move |(i, id)| ((outer << SPARSE_SHIFT) | i, id))
            })
            .filter(|(page, _)| *page >= self.quick.len());
        quick.chain(sparse).filter(|(_, id)| !id.is_unconnected())
    }
}

const STATE_MAGIC: [u8; 4] = *b"APHY";
const STATE_VERSION: u16 = 1;

/// Flat 4GiB guest-physical memory assembled from 4KiB blocks.
///
/// Two indices are kept: the primary one and a shadow with address line 20 forced low. Every map
/// and unmap updates both, so toggling the A20 gate only switches which index lookups use.
pub struct PhysicalAddressSpace {
    blocks: Vec<Option<Box<dyn MemoryBlock>>>,
    refs: Vec<u32>,
    free: Vec<u32>,
    unconnected: UnconnectedBlock,
    index: [PageIndex; 2],
    gate_a20: bool,
    epoch: u64,
    code: Option<Arc<dyn CodeSource>>,
}

impl fmt::Debug for PhysicalAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalAddressSpace")
            .field("ram_pages", &self.index[PRIMARY].quick.len())
            .field("live_blocks", &self.live_blocks())
            .field("gate_a20", &self.gate_a20)
            .field("epoch", &self.epoch)
            .field("code_source", &self.code.is_some())
            .finish()
    }
}

impl PhysicalAddressSpace {
    /// Empty address space whose dense index covers `[0, ram_size)`.
    pub fn new(ram_size: u32) -> Self {
        let quick_pages = (ram_size as usize).div_ceil(BLOCK_SIZE);
        Self {
            blocks: vec![None],
            refs: vec![0],
            free: Vec::new(),
            unconnected: UnconnectedBlock,
            index: [PageIndex::new(quick_pages), PageIndex::new(quick_pages)],
            gate_a20: true,
            epoch: 0,
            code: None,
        }
    }

    pub fn with_code_source(mut self, source: Arc<dyn CodeSource>) -> Self {
        self.code = Some(source);
        self
    }

    pub fn set_code_source(&mut self, source: Arc<dyn CodeSource>) {
        self.code = Some(source);
    }

    pub fn code_source(&self) -> Option<&Arc<dyn CodeSource>> {
        self.code.as_ref()
    }

    /// Bumped by every change to address resolution (map, unmap, A20 toggle).
    pub fn mapping_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn gate_a20(&self) -> bool {
        self.gate_a20
    }

    /// Enable or disable address line 20. While disabled, `addr` and `addr ^ 0x10_0000` resolve
    /// to the block mapped with bit 20 clear.
    pub fn set_gate_a20(&mut self, enabled: bool) {
        if self.gate_a20 != enabled {
            debug!(enabled, "A20 gate");
            self.gate_a20 = enabled;
            self.epoch += 1;
        }
    }

    /// Number of distinct blocks currently mapped.
    pub fn live_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// Map `block` at the 4KiB-aligned `addr`, replacing whatever was there.
    pub fn map(&mut self, addr: u32, block: Box<dyn MemoryBlock>) -> Result<BlockId, MapError> {
        if addr & BLOCK_MASK != 0 {
            return Err(MapError::Unaligned { addr });
        }
        if block.size() < BLOCK_SIZE {
            return Err(MapError::Undersized { size: block.size() });
        }

        let id = self.alloc(block);
        self.install((addr >> BLOCK_SHIFT) as usize, id);
        self.epoch += 1;
        debug!(addr = format_args!("{addr:#010x}"), id = id.0, "mapped block");
        Ok(id)
    }

    /// Map fresh RAM blocks over `[addr, addr + len)`.
    pub fn allocate(&mut self, addr: u32, len: u64) -> Result<(), MapError> {
        for page in Self::pages(addr, len)? {
            self.map((page << BLOCK_SHIFT) as u32, Box::new(LazyCodeMemory::new()))?;
        }
        Ok(())
    }

    /// Reset `[addr, addr + len)` to the unconnected sentinel.
    pub fn unmap(&mut self, addr: u32, len: u64) -> Result<(), MapError> {
        for page in Self::pages(addr, len)? {
            self.install(page, BlockId::UNCONNECTED);
        }
        self.epoch += 1;
        debug!(
            addr = format_args!("{addr:#010x}"),
            len = format_args!("{len:#x}"),
            "unmapped range"
        );
        Ok(())
    }

    fn pages(addr: u32, len: u64) -> Result<std::ops::Range<usize>, MapError> {
        if addr & BLOCK_MASK != 0 {
            return Err(MapError::Unaligned { addr });
        }
        if len & u64::from(BLOCK_MASK) != 0 {
            return Err(MapError::UnalignedLength { len });
        }
        if u64::from(addr) + len > 1 << 32 {
            return Err(MapError::OutOfRange { addr, len });
        }
        let first = (addr >> BLOCK_SHIFT) as usize;
        Ok(first..first + (len >> BLOCK_SHIFT) as usize)
    }

    fn alloc(&mut self, block: Box<dyn MemoryBlock>) -> BlockId {
        match self.free.pop() {
            Some(slot) => {
                self.blocks[slot as usize] = Some(block);
                self.refs[slot as usize] = 0;
                BlockId(slot)
            }
            None => {
                self.blocks.push(Some(block));
                self.refs.push(0);
                BlockId((self.blocks.len() - 1) as u32)
            }
        }
    }

    fn install(&mut self, page: usize, id: BlockId) {
        self.set_slot(PRIMARY, page, id);
        if page & A20_PAGE_BIT == 0 {
            self.set_slot(MASKED, page, id);
            self.set_slot(MASKED, page | A20_PAGE_BIT, id);
        }
    }

    fn set_slot(&mut self, which: usize, page: usize, id: BlockId) {
        let old = self.index[which].set(page, id);
        if old != id {
            if !id.is_unconnected() {
                self.refs[id.0 as usize] += 1;
            }
            self.release(old);
        }
    }

    fn release(&mut self, id: BlockId) {
        if id.is_unconnected() {
            return;
        }
        let slot = id.0 as usize;
        self.refs[slot] -= 1;
        if self.refs[slot] == 0 {
            self.blocks[slot] = None;
            self.free.push(id.0);
        }
    }

    #[inline]
    fn active(&self) -> &PageIndex {
        &self.index[if self.gate_a20 { PRIMARY } else { MASKED }]
    }

    /// Block that `addr` currently resolves to.
    #[inline]
    pub fn block_id(&self, addr: u32) -> BlockId {
        self.active().get((addr >> BLOCK_SHIFT) as usize)
    }

    pub fn block(&self, id: BlockId) -> &dyn MemoryBlock {
        match self.blocks.get(id.0 as usize).and_then(|b| b.as_deref()) {
            Some(block) => block,
            None => &self.unconnected,
        }
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut dyn MemoryBlock {
        match self.blocks.get_mut(id.0 as usize).and_then(|b| b.as_deref_mut()) {
            Some(block) => block,
            None => &mut self.unconnected,
        }
    }

    #[inline]
    fn block_at(&mut self, addr: u32) -> (&mut dyn MemoryBlock, usize) {
        let id = self.block_id(addr);
        (self.block_mut(id), (addr & BLOCK_MASK) as usize)
    }

    /// Unit cached at `addr` for `mode`, without decoding.
    pub fn cached_unit(&self, mode: GuestMode, addr: u32) -> Option<Arc<CodeBlock>> {
        self.block(self.block_id(addr))
            .cached_unit(mode, (addr & BLOCK_MASK) as usize)
    }

    pub fn is_covered(&self, mode: GuestMode, addr: u32) -> bool {
        self.block(self.block_id(addr))
            .is_covered(mode, (addr & BLOCK_MASK) as usize)
    }

    /// Unit starting at `addr`, decoding and caching it on a miss.
    pub fn get_executable_at(&mut self, mode: GuestMode, addr: u32) -> Result<Fetched, ExecError> {
        let source = self.code.clone().ok_or(ExecError::NoCodeSource)?;
        let id = self.block_id(addr);
        self.fetch_in(id, mode, addr, &*source)
    }

    pub(crate) fn fetch_in(
        &mut self,
        id: BlockId,
        mode: GuestMode,
        addr: u32,
        source: &dyn CodeSource,
    ) -> Result<Fetched, ExecError> {
        self.block_mut(id)
            .executable_at(mode, (addr & BLOCK_MASK) as usize, addr, source)
    }

    #[inline]
    fn read_slow<const N: usize>(&mut self, addr: u32) -> [u8; N] {
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            let (block, offset) = self.block_at(addr.wrapping_add(i as u32));
            *byte = block.read_u8(offset);
        }
        out
    }

    #[inline]
    fn write_slow(&mut self, addr: u32, bytes: &[u8]) {
        for (i, byte) in bytes.iter().copied().enumerate() {
            let (block, offset) = self.block_at(addr.wrapping_add(i as u32));
            block.write_u8(offset, byte);
        }
    }

    /// Serialize the A20 gate and the contents of every mapped page.
    pub fn save_state<W: Write>(&self, w: &mut W) -> snapshot::Result<()> {
        w.write_bytes(&STATE_MAGIC)?;
        w.write_u16_le(STATE_VERSION)?;
        w.write_u8(u8::from(self.gate_a20))?;

        let pages: Vec<(usize, BlockId)> = self.index[PRIMARY].mapped().collect();
        w.write_u32_le(pages.len() as u32)?;
        for (page, id) in pages {
            w.write_u32_le(page as u32)?;
            match self.block(id).contents() {
                Some(bytes) => {
                    w.write_u8(1)?;
                    w.write_bytes(bytes)?;
                }
                None => w.write_u8(0)?,
            }
        }
        Ok(())
    }

    /// Restore state written by [`PhysicalAddressSpace::save_state`]. Pages missing from this
    /// space are mapped as fresh RAM. Cached code is discarded.
    pub fn load_state<R: Read>(&mut self, r: &mut R) -> snapshot::Result<()> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != STATE_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if version != STATE_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let gate_a20 = match r.read_u8()? {
            0 => false,
            1 => true,
            _ => return Err(SnapshotError::Corrupt("invalid A20 flag")),
        };

        let count = r.read_u32_le()?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        for _ in 0..count {
            let page = r.read_u32_le()? as usize;
            if page >= BLOCK_COUNT {
                return Err(SnapshotError::Corrupt("page number out of range"));
            }
            let data = match r.read_u8()? {
                0 => None,
                1 => {
                    r.read_exact(&mut buf)?;
                    Some(&buf[..])
                }
                _ => return Err(SnapshotError::Corrupt("invalid page allocation flag")),
            };

            let mut id = self.index[PRIMARY].get(page);
            if id.is_unconnected() {
                id = self.map((page << BLOCK_SHIFT) as u32, Box::new(LazyCodeMemory::new()))?;
            }
            self.block_mut(id).load_contents(data);
        }

        self.set_gate_a20(gate_a20);
        self.epoch += 1;
        Ok(())
    }
}

impl AddressSpace for PhysicalAddressSpace {
    #[inline]
    fn read_u8(&mut self, addr: u32) -> Result<u8, PageFault> {
        let (block, offset) = self.block_at(addr);
        Ok(block.read_u8(offset))
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, PageFault> {
        let (block, offset) = self.block_at(addr);
        if offset <= BLOCK_SIZE - 2 {
            return Ok(block.read_u16(offset));
        }
        Ok(u16::from_le_bytes(self.read_slow(addr)))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, PageFault> {
        let (block, offset) = self.block_at(addr);
        if offset <= BLOCK_SIZE - 4 {
            return Ok(block.read_u32(offset));
        }
        Ok(u32::from_le_bytes(self.read_slow(addr)))
    }

    fn read_u64(&mut self, addr: u32) -> Result<u64, PageFault> {
        let (block, offset) = self.block_at(addr);
        if offset <= BLOCK_SIZE - 8 {
            return Ok(block.read_u64(offset));
        }
        Ok(u64::from_le_bytes(self.read_slow(addr)))
    }

    #[inline]
    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), PageFault> {
        let (block, offset) = self.block_at(addr);
        block.write_u8(offset, value);
        Ok(())
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), PageFault> {
        let (block, offset) = self.block_at(addr);
        if offset <= BLOCK_SIZE - 2 {
            block.write_u16(offset, value);
        } else {
            self.write_slow(addr, &value.to_le_bytes());
        }
        Ok(())
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), PageFault> {
        let (block, offset) = self.block_at(addr);
        if offset <= BLOCK_SIZE - 4 {
            block.write_u32(offset, value);
        } else {
            self.write_slow(addr, &value.to_le_bytes());
        }
        Ok(())
    }

    fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), PageFault> {
        let (block, offset) = self.block_at(addr);
        if offset <= BLOCK_SIZE - 8 {
            block.write_u64(offset, value);
        } else {
            self.write_slow(addr, &value.to_le_bytes());
        }
        Ok(())
    }

    fn read_bytes(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < dst.len() {
            let (block, offset) = self.block_at(addr.wrapping_add(done as u32));
            let chunk = (BLOCK_SIZE - offset).min(dst.len() - done);
            block.read_bytes(offset, &mut dst[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn write_bytes(&mut self, addr: u32, src: &[u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < src.len() {
            let (block, offset) = self.block_at(addr.wrapping_add(done as u32));
            let chunk = (BLOCK_SIZE - offset).min(src.len() - done);
            block.write_bytes(offset, &src[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn execute(
        &mut self,
        mode: GuestMode,
        cpu: &mut dyn Processor,
        addr: u32,
    ) -> Result<u32, ExecError> {
        let source = self.code.clone().ok_or(ExecError::NoCodeSource)?;
        let id = self.block_id(addr);
        match self.fetch_in(id, mode, addr, &*source)? {
            Fetched::Unit(unit) => run_unit(self, cpu, mode, addr, unit, true),
            Fetched::Spanning => SpanningUnit::new(mode, addr).execute(cpu, self, &*source),
        }
    }

    fn replace_unit(
        &mut self,
        mode: GuestMode,
        addr: u32,
        old: &Arc<CodeBlock>,
        new: Arc<CodeBlock>,
    ) {
        let (block, offset) = self.block_at(addr);
        block.replace_unit(mode, offset, old, new);
    }

    fn mark_span_tail(&mut self, mode: GuestMode, addr: u32, len: usize) {
        let (block, _) = self.block_at(addr);
        block.mark_span_tail(mode, len);
    }
}
