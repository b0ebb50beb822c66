//! Units whose bytes run past the end of the block they start in.
//!
//! Such units are never cached. Each execution decodes afresh through the address space, so a
//! write to either block is always observed.

use tracing::trace;

use crate::code::{ByteSource, CodeSource, Decoded, GuestMode, Processor};
use crate::error::{DecodeError, ExecError, PageFault};
use crate::space::{run_unit, AddressSpace};
use crate::BLOCK_MASK;

/// Code bytes read through an [`AddressSpace`], unbounded by block edges.
pub struct SpaceBytes<'a> {
    mem: &'a mut dyn AddressSpace,
    start: u32,
}

impl<'a> SpaceBytes<'a> {
    pub fn new(mem: &'a mut dyn AddressSpace, start: u32) -> Self {
        Self { mem, start }
    }
}

impl ByteSource for SpaceBytes<'_> {
    fn start(&self) -> u32 {
        self.start
    }

    fn limit(&self) -> Option<usize> {
        None
    }

    #[inline]
    fn byte_at(&mut self, index: usize) -> Result<u8, PageFault> {
        self.mem.read_u8(self.start.wrapping_add(index as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanningUnit {
    mode: GuestMode,
    start: u32,
}

impl SpanningUnit {
    pub fn new(mode: GuestMode, start: u32) -> Self {
        Self { mode, start }
    }

    pub fn mode(&self) -> GuestMode {
        self.mode
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    /// Decode the unit at the start address through `mem`, mark the bytes it occupies in the
    /// following block and run it once.
    pub fn execute(
        &self,
        cpu: &mut dyn Processor,
        mem: &mut dyn AddressSpace,
        source: &dyn CodeSource,
    ) -> Result<u32, ExecError> {
        let decoded = source
            .get_unit(self.mode, &mut SpaceBytes::new(mem, self.start))
            .map_err(|e| match e {
                // Same shape as a fetch fault on the block-local path.
                DecodeError::Fetch(fault) => ExecError::PageFault(fault),
                other => ExecError::Decode(other),
            })?;
        let unit = match decoded {
            Decoded::Unit(unit) => unit,
            // An unbounded source has no boundary to cross.
            Decoded::CrossesBoundary => {
                return Err(DecodeError::InvalidInstruction { addr: self.start }.into())
            }
        };

        let next = u64::from(self.start | BLOCK_MASK) + 1;
        let end = u64::from(self.start) + u64::from(unit.x86_length());
        if end > next {
            let tail = (end - next) as usize;
            trace!(
                start = format_args!("{:#010x}", self.start),
                tail,
                "spanning unit"
            );
            mem.mark_span_tail(self.mode, next as u32, tail);
        }
        run_unit(mem, cpu, self.mode, self.start, unit, false)
    }
}
