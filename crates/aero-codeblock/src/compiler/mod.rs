//! Instruction streams to executable units.
//!
//! - [`InterpretingCompiler`]: the immediate tier. Never fails; hands each instruction to the
//!   processor in turn.
//! - [`MicrocodeCompiler`]: the background tier. Lowers a stream through a static table and
//!   refuses shapes it cannot run on its own.
//! - [`CompiledBlockCache`]: remembers background results so the same code decoded again starts
//!   out compiled.

mod cache;
mod interp;
mod microcode;

use std::sync::Arc;

use aero_addrspace::CodeBlock;

use crate::decoder::InstructionStream;

pub use cache::CompiledBlockCache;
pub use interp::InterpretingCompiler;
pub use microcode::MicrocodeCompiler;

pub trait Compiler: Send + Sync {
    /// Build a unit equivalent to `stream`, or `None` when this compiler cannot handle it.
    fn compile(&self, stream: &InstructionStream) -> Option<Arc<CodeBlock>>;
}
