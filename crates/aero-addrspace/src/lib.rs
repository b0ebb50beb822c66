//! Guest address spaces and the per-block code cache for the x86 execution core.
//!
//! The crate is built leaf to root:
//! - [`MemoryBlock`]: a 4KiB backing region. [`LazyCodeMemory`] is guest RAM with lazily
//!   allocated storage and three per-mode executable-unit caches; [`UnconnectedBlock`] floats
//!   every bit high.
//! - [`PhysicalAddressSpace`]: a flat 4GiB space of blocks with A20 aliasing.
//! - [`TranslationCache`]: the software TLB, in a direct-mapped ([`FastTlb`]) and an exact sparse
//!   ([`SlowTlb`]) flavour.
//! - [`LinearAddressSpace`]: legacy 32-bit paging (4KiB and 4MiB pages) on top of the physical
//!   space.
//!
//! Both address spaces implement [`AddressSpace`], which is what a [`Processor`] sees while it
//! executes a [`CodeBlock`]. Units are produced by a [`CodeSource`] (the decode/compile pipeline
//! lives in `aero-codeblock`).

mod block;
mod code;
mod error;
mod lazy;
mod linear;
mod phys;
mod snapshot;
mod space;
mod spanning;
mod tlb;

pub use crate::block::{Fetched, MemoryBlock, UnconnectedBlock};
pub use crate::code::{
    BlockExit, ByteSource, CodeBlock, CodeSource, Completion, Decoded, Executable, GuestMode,
    Processor, Tier,
};
pub use crate::error::{DecodeError, ExecError, MapError, PageFault, ProcessorException};
pub use crate::lazy::{CodeCacheStats, LazyCodeMemory, READ_MISS_ALLOCATION_THRESHOLD};
pub use crate::linear::{LinearAddressSpace, PageEntryFlags, TranslationStats};
pub use crate::phys::{BlockId, PhysicalAddressSpace};
pub use crate::snapshot::SnapshotError;
pub use crate::space::AddressSpace;
pub use crate::spanning::{SpaceBytes, SpanningUnit};
pub use crate::tlb::{FastTlb, PageSize, SlowTlb, TranslationCache};

/// Re-exported so collaborators name the same instruction type the pipeline decodes into.
pub use iced_x86::Instruction;

pub const BLOCK_SHIFT: u32 = 12;
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;
pub const BLOCK_MASK: u32 = (BLOCK_SIZE as u32) - 1;

/// Number of 4KiB blocks in the 32-bit physical address space.
pub const BLOCK_COUNT: usize = 1 << (32 - BLOCK_SHIFT);

const _: () = {
    assert!(BLOCK_SIZE == 4096);
    assert!(BLOCK_COUNT == 1024 * 1024);
};
