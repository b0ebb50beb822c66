use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use iced_x86::Instruction;

use crate::error::{DecodeError, ExecError, PageFault};
use crate::space::AddressSpace;

/// CPU mode a unit was decoded for. The same bytes may decode differently per mode, so every
/// block keeps one unit cache per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestMode {
    Real,
    Protected,
    Virtual8086,
}

impl GuestMode {
    pub const ALL: [GuestMode; 3] = [GuestMode::Real, GuestMode::Protected, GuestMode::Virtual8086];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            GuestMode::Real => 0,
            GuestMode::Protected => 1,
            GuestMode::Virtual8086 => 2,
        }
    }

    /// Default operand/address size used when decoding in this mode.
    #[inline]
    pub const fn bitness(self) -> u32 {
        match self {
            GuestMode::Real | GuestMode::Virtual8086 => 16,
            GuestMode::Protected => 32,
        }
    }
}

/// How control leaves a unit after its last instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockExit {
    /// Execution continues at the byte after the unit.
    FallsThrough,
    Branch,
    Call,
    Return,
    Trap,
}

/// Outcome of running a unit body once.
#[derive(Debug, Clone)]
pub enum Completion {
    /// The unit ran to its end and retired this many guest instructions.
    Retired(u32),
    /// The unit has a faster equivalent. The caller installs it in place of the current unit
    /// and invokes it instead; nothing was executed.
    NeedsReplacement(Arc<CodeBlock>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Interpreted,
    Compiled,
    /// Interpreted body wrapped with an execution counter awaiting background compilation.
    Promotable,
}

/// Executable body of a [`CodeBlock`].
pub trait Executable: Send + Sync + fmt::Debug {
    fn execute(
        &self,
        cpu: &mut dyn Processor,
        mem: &mut dyn AddressSpace,
    ) -> Result<Completion, ExecError>;

    /// Whether a write to `range` (relative to the unit start) invalidates this body.
    ///
    /// `current` holds the unit's bytes as they are after the write. Bodies that only depend on
    /// bytes they can verify may answer `false`.
    fn invalidated_by(&self, _range: Range<usize>, _current: &[u8]) -> bool {
        true
    }

    fn tier(&self) -> Tier;

    /// Compiled replacement already produced for this body, if any.
    fn promoted(&self) -> Option<Arc<CodeBlock>> {
        None
    }
}

/// A decoded, ready-to-run run of guest instructions.
///
/// Units are immutable once built and shared through `Arc`: a cache slot, the promotion queue and
/// an in-flight execution can all hold the same unit. A unit is only valid when entered at its
/// [`CodeBlock::start`]; the same bytes reached through another address need their own unit.
#[derive(Debug)]
pub struct CodeBlock {
    mode: GuestMode,
    start: u32,
    x86_length: u32,
    x86_count: u32,
    exit: BlockExit,
    body: Box<dyn Executable>,
}

impl CodeBlock {
    pub fn new(
        mode: GuestMode,
        start: u32,
        x86_length: u32,
        x86_count: u32,
        exit: BlockExit,
        body: Box<dyn Executable>,
    ) -> Self {
        debug_assert!(x86_count >= 1);
        debug_assert!(x86_length >= x86_count);
        Self {
            mode,
            start,
            x86_length,
            x86_count,
            exit,
            body,
        }
    }

    pub fn mode(&self) -> GuestMode {
        self.mode
    }

    /// Guest address the unit was decoded at. Instruction pointers and relative branch targets
    /// inside the body are fixed to it.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Guest bytes covered by the unit.
    pub fn x86_length(&self) -> u32 {
        self.x86_length
    }

    /// Guest instructions retired by one complete execution.
    pub fn x86_count(&self) -> u32 {
        self.x86_count
    }

    pub fn exit(&self) -> BlockExit {
        self.exit
    }

    pub fn tier(&self) -> Tier {
        self.body.tier()
    }

    pub fn promoted(&self) -> Option<Arc<CodeBlock>> {
        self.body.promoted()
    }

    #[inline]
    pub fn execute(
        &self,
        cpu: &mut dyn Processor,
        mem: &mut dyn AddressSpace,
    ) -> Result<Completion, ExecError> {
        self.body.execute(cpu, mem)
    }

    pub fn invalidated_by(&self, range: Range<usize>, current: &[u8]) -> bool {
        self.body.invalidated_by(range, current)
    }
}

/// The register file and instruction semantics, opaque to this crate.
pub trait Processor {
    /// Execute one decoded instruction, including advancing the instruction pointer.
    fn execute(&mut self, instr: &Instruction, mem: &mut dyn AddressSpace) -> Result<(), ExecError>;

    /// Advance the instruction pointer past `bytes` of instructions with no other effect.
    fn skip(&mut self, bytes: u32);
}

/// Random-access cursor over guest code bytes starting at a fixed address.
pub trait ByteSource {
    /// Guest address of byte 0.
    fn start(&self) -> u32;

    /// Number of bytes readable before the end of the backing block, or `None` when the source
    /// follows the address space across block boundaries.
    fn limit(&self) -> Option<usize>;

    fn byte_at(&mut self, index: usize) -> Result<u8, PageFault>;
}

/// Result of asking the pipeline for a unit.
#[derive(Debug, Clone)]
pub enum Decoded {
    Unit(Arc<CodeBlock>),
    /// An instruction needs bytes past the end of the source's block; the caller must serve this
    /// address with a spanning unit.
    CrossesBoundary,
}

/// Decode/compile pipeline as seen from the code cache.
pub trait CodeSource: Send + Sync {
    fn get_unit(&self, mode: GuestMode, bytes: &mut dyn ByteSource) -> Result<Decoded, DecodeError>;
}
