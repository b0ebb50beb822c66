//! Decode/compile pipeline for the x86 execution core.
//!
//! [`CodeBlockManager`] implements [`aero_addrspace::CodeSource`]. For each request it decodes
//! guest bytes with iced-x86, reuses a background-compiled unit when the same code has been seen
//! before, and otherwise builds an interpreted unit on the spot. Interpreted units count their
//! executions; hot ones are compiled on a worker thread and swapped in by the code cache the next
//! time they run.

pub mod compiler;
mod config;
pub mod decoder;
mod manager;
mod promotion;
mod stats;

pub use crate::compiler::{
    CompiledBlockCache, Compiler, InterpretingCompiler, MicrocodeCompiler,
};
pub use crate::config::CodeBlockConfig;
pub use crate::decoder::{
    DecodeOutcome, Decoder, IcedDecoder, InstructionStream, MAX_INSTRUCTION_LEN,
};
pub use crate::manager::{CodeBlockManager, PipelineError, Result};
pub use crate::promotion::PromotionState;
pub use crate::stats::PipelineStats;
