use std::fmt;
use std::sync::Arc;

use crate::code::{CodeBlock, CodeSource, GuestMode};
use crate::error::ExecError;
use crate::BLOCK_SIZE;

/// What a block hands back for an execute request.
#[derive(Debug, Clone)]
pub enum Fetched {
    Unit(Arc<CodeBlock>),
    /// Code at this offset runs into the next block; serve it with a spanning unit.
    Spanning,
}

/// One 4KiB region of the physical address space.
///
/// Offsets are block-relative. Callers never issue an access that straddles the end of the block;
/// address spaces split those into byte accesses.
pub trait MemoryBlock: Send + fmt::Debug {
    fn size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Whether backing storage has been materialized.
    fn is_allocated(&self) -> bool;

    fn read_u8(&mut self, offset: usize) -> u8;
    fn write_u8(&mut self, offset: usize, value: u8);

    fn read_u16(&mut self, offset: usize) -> u16 {
        u16::from_le_bytes([self.read_u8(offset), self.read_u8(offset + 1)])
    }

    fn read_u32(&mut self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_u64(&mut self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(offset, &mut buf);
        u64::from_le_bytes(buf)
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

    fn read_bytes(&mut self, offset: usize, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(offset + i);
        }
    }

    fn write_bytes(&mut self, offset: usize, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(offset + i, byte);
        }
    }

    /// Executable unit starting at `offset`, decoding through `source` on a miss.
    ///
    /// `addr` is the guest address the request came in on; it seeds the decoder and error
    /// reports. A cached unit decoded at a different address does not satisfy the request.
    fn executable_at(
        &mut self,
        _mode: GuestMode,
        _offset: usize,
        addr: u32,
        _source: &dyn CodeSource,
    ) -> Result<Fetched, ExecError> {
        Err(ExecError::Unconnected { addr })
    }

    /// Unit cached with its head at `offset`, without decoding, whatever address it was decoded
    /// at.
    fn cached_unit(&self, _mode: GuestMode, _offset: usize) -> Option<Arc<CodeBlock>> {
        None
    }

    /// Whether `offset` lies inside some cached unit (its head, a placeholder or a span tail).
    fn is_covered(&self, _mode: GuestMode, _offset: usize) -> bool {
        false
    }

    fn replace_unit(
        &mut self,
        _mode: GuestMode,
        _offset: usize,
        _old: &Arc<CodeBlock>,
        _new: Arc<CodeBlock>,
    ) {
    }

    fn mark_span_tail(&mut self, _mode: GuestMode, _len: usize) {}

    /// Raw contents for save-state, `None` when nothing was ever written.
    fn contents(&self) -> Option<&[u8]> {
        None
    }

    /// Replace the contents wholesale. `None` resets the block to all zeroes.
    fn load_contents(&mut self, _data: Option<&[u8]>) {}
}

/// Sentinel for holes in the physical address space: reads float high and writes vanish.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconnectedBlock;

impl MemoryBlock for UnconnectedBlock {
    fn is_allocated(&self) -> bool {
        false
    }

    #[inline]
    fn read_u8(&mut self, _offset: usize) -> u8 {
        0xff
    }

    #[inline]
    fn write_u8(&mut self, _offset: usize, _value: u8) {}

    fn read_u16(&mut self, _offset: usize) -> u16 {
        u16::MAX
    }

    fn read_u32(&mut self, _offset: usize) -> u32 {
        u32::MAX
    }

    fn read_u64(&mut self, _offset: usize) -> u64 {
        u64::MAX
    }

    fn read_bytes(&mut self, _offset: usize, dst: &mut [u8]) {
        dst.fill(0xff);
    }

    fn write_bytes(&mut self, _offset: usize, _src: &[u8]) {}
}
