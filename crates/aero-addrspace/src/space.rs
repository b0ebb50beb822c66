use std::sync::Arc;

use crate::code::{CodeBlock, Completion, GuestMode, Processor};
use crate::error::{ExecError, PageFault};

/// Guest-visible memory capability shared by the physical and linear address spaces.
///
/// Accesses take `&mut self` because even reads update state: TLB fills, accessed bits in guest
/// page tables and the lazy-allocation counters of RAM blocks. Multi-byte values are
/// little-endian and may straddle block boundaries.
pub trait AddressSpace {
    fn read_u8(&mut self, addr: u32) -> Result<u8, PageFault>;
    fn read_u16(&mut self, addr: u32) -> Result<u16, PageFault>;
    fn read_u32(&mut self, addr: u32) -> Result<u32, PageFault>;
    fn read_u64(&mut self, addr: u32) -> Result<u64, PageFault>;

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), PageFault>;
    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), PageFault>;
    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), PageFault>;
    fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), PageFault>;

    /// Copy guest memory starting at `addr` into `dst`.
    ///
    /// The default falls back to byte-at-a-time reads. A fault leaves `dst` partially filled.
    fn read_bytes(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), PageFault> {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(addr.wrapping_add(i as u32))?;
        }
        Ok(())
    }

    /// Copy `src` into guest memory starting at `addr`.
    fn write_bytes(&mut self, addr: u32, src: &[u8]) -> Result<(), PageFault> {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), byte)?;
        }
        Ok(())
    }

    /// Run the unit starting at `addr` decoded for `mode`, returning the number of guest
    /// instructions it retired.
    fn execute(
        &mut self,
        mode: GuestMode,
        cpu: &mut dyn Processor,
        addr: u32,
    ) -> Result<u32, ExecError>;

    fn execute_real(&mut self, cpu: &mut dyn Processor, addr: u32) -> Result<u32, ExecError> {
        self.execute(GuestMode::Real, cpu, addr)
    }

    fn execute_protected(&mut self, cpu: &mut dyn Processor, addr: u32) -> Result<u32, ExecError> {
        self.execute(GuestMode::Protected, cpu, addr)
    }

    fn execute_virtual8086(
        &mut self,
        cpu: &mut dyn Processor,
        addr: u32,
    ) -> Result<u32, ExecError> {
        self.execute(GuestMode::Virtual8086, cpu, addr)
    }

    /// Swap `old` for `new` in the code cache slot at `addr`, if the slot still holds `old`.
    fn replace_unit(
        &mut self,
        _mode: GuestMode,
        _addr: u32,
        _old: &Arc<CodeBlock>,
        _new: Arc<CodeBlock>,
    ) {
    }

    /// Record that the first `len` bytes of the block at `addr` are the tail of a spanning unit.
    fn mark_span_tail(&mut self, _mode: GuestMode, _addr: u32, _len: usize) {}
}

/// Drive `unit` to completion, following replacement signals.
///
/// Replacements are written back into the cache slot at `addr` only when `install` is set;
/// spanning units run their fresh inner unit without touching any slot.
pub(crate) fn run_unit(
    mem: &mut dyn AddressSpace,
    cpu: &mut dyn Processor,
    mode: GuestMode,
    addr: u32,
    mut unit: Arc<CodeBlock>,
    install: bool,
) -> Result<u32, ExecError> {
    loop {
        match unit.execute(cpu, mem)? {
            Completion::Retired(count) => return Ok(count),
            Completion::NeedsReplacement(next) => {
                if install {
                    mem.replace_unit(mode, addr, &unit, Arc::clone(&next));
                }
                unit = next;
            }
        }
    }
}
