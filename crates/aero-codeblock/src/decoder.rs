//! Guest byte streams to instruction streams.

use std::sync::Arc;

use aero_addrspace::{
    BlockExit, ByteSource, DecodeError, GuestMode, PageFault, BLOCK_MASK, BLOCK_SIZE,
};
use iced_x86::{DecoderError, DecoderOptions, FlowControl, Instruction, Mnemonic, Register};
use tracing::trace;

/// Architectural limit on the length of one instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Decoded run of guest instructions plus the bytes they came from.
#[derive(Debug, Clone)]
pub struct InstructionStream {
    mode: GuestMode,
    start: u32,
    bytes: Box<[u8]>,
    instructions: Arc<[Instruction]>,
    exit: BlockExit,
}

impl InstructionStream {
    pub fn mode(&self) -> GuestMode {
        self.mode
    }

    /// Guest address of the first instruction.
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub(crate) fn shared_instructions(&self) -> Arc<[Instruction]> {
        Arc::clone(&self.instructions)
    }

    pub fn x86_length(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn x86_count(&self) -> u32 {
        self.instructions.len() as u32
    }

    pub fn exit(&self) -> BlockExit {
        self.exit
    }
}

#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    Complete(InstructionStream),
    /// Some instruction needs bytes past the source's limit; the whole run must be decoded again
    /// from an unbounded source.
    CrossesBoundary,
}

/// Byte-level x86 decoder as seen by the pipeline.
pub trait Decoder: Send + Sync {
    /// Decode at most `max_instructions` starting at byte 0 of `bytes`.
    ///
    /// Decoding stops after the first control transfer. A bounded source reports
    /// [`DecodeOutcome::CrossesBoundary`] when an instruction would read past its limit.
    fn decode(
        &self,
        bytes: &mut dyn ByteSource,
        mode: GuestMode,
        max_instructions: usize,
    ) -> Result<DecodeOutcome, DecodeError>;
}

/// [`Decoder`] backed by iced-x86.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcedDecoder;

impl IcedDecoder {
    pub fn new() -> Self {
        Self
    }
}

enum Step {
    Instruction(Instruction),
    Crosses,
    /// Soft end of an unbounded source reached mid-instruction.
    End,
    Invalid,
    Fault(PageFault),
}

struct Fetcher<'a> {
    source: &'a mut dyn ByteSource,
    buf: Vec<u8>,
}

impl Fetcher<'_> {
    fn fill(&mut self, upto: usize) -> Result<(), PageFault> {
        while self.buf.len() < upto {
            let byte = self.source.byte_at(self.buf.len())?;
            self.buf.push(byte);
        }
        Ok(())
    }

    /// Decode the instruction at `offset`, fetching only the bytes it needs. Bytes on the next
    /// page are requested only once the current page has run out.
    fn decode_at(&mut self, mode: GuestMode, offset: usize, end: usize, bounded: bool) -> Step {
        let addr = self.source.start().wrapping_add(offset as u32);
        let cap = (offset + MAX_INSTRUCTION_LEN).min(end);
        let page_end = offset + (BLOCK_SIZE - (addr & BLOCK_MASK) as usize);
        let mut avail = cap.min(page_end);

        loop {
            if let Err(fault) = self.fill(avail) {
                return Step::Fault(fault);
            }
            let mut decoder = iced_x86::Decoder::with_ip(
                mode.bitness(),
                &self.buf[offset..avail],
                u64::from(addr),
                DecoderOptions::NONE,
            );
            let mut instr = Instruction::default();
            decoder.decode_out(&mut instr);
            match decoder.last_error() {
                DecoderError::None => return Step::Instruction(instr),
                DecoderError::NoMoreBytes if avail < cap => avail = cap,
                DecoderError::NoMoreBytes if cap < offset + MAX_INSTRUCTION_LEN => {
                    return if bounded { Step::Crosses } else { Step::End };
                }
                _ => return Step::Invalid,
            }
        }
    }
}

/// How `instr` ends a unit, if it does.
fn classify(instr: &Instruction) -> Option<BlockExit> {
    match instr.flow_control() {
        FlowControl::UnconditionalBranch
        | FlowControl::IndirectBranch
        | FlowControl::ConditionalBranch
        | FlowControl::XbeginXabortXend => Some(BlockExit::Branch),
        FlowControl::Call | FlowControl::IndirectCall => Some(BlockExit::Call),
        FlowControl::Return => Some(BlockExit::Return),
        FlowControl::Interrupt | FlowControl::Exception => Some(BlockExit::Trap),
        _ if instr.mnemonic() == Mnemonic::Hlt => Some(BlockExit::Trap),
        _ if changes_decode_mode(instr) => Some(BlockExit::FallsThrough),
        _ => None,
    }
}

/// Control register writes may change how the following bytes decode or map.
fn changes_decode_mode(instr: &Instruction) -> bool {
    match instr.mnemonic() {
        Mnemonic::Lmsw => true,
        Mnemonic::Mov => matches!(
            instr.op0_register(),
            Register::CR0 | Register::CR3 | Register::CR4
        ),
        _ => false,
    }
}

impl Decoder for IcedDecoder {
    fn decode(
        &self,
        bytes: &mut dyn ByteSource,
        mode: GuestMode,
        max_instructions: usize,
    ) -> Result<DecodeOutcome, DecodeError> {
        let start = bytes.start();
        let (end, bounded) = match bytes.limit() {
            Some(limit) => (limit, true),
            // Spanning units reach at most to the end of the following block.
            None => (2 * BLOCK_SIZE - (start & BLOCK_MASK) as usize, false),
        };
        let max = max_instructions.max(1);

        let mut fetcher = Fetcher {
            source: bytes,
            buf: Vec::with_capacity(64),
        };
        let mut instructions = Vec::new();
        let mut offset = 0;
        let mut exit = BlockExit::FallsThrough;

        while instructions.len() < max && offset < end {
            let instr = match fetcher.decode_at(mode, offset, end, bounded) {
                Step::Instruction(instr) => instr,
                Step::Crosses => {
                    trace!(
                        start = format_args!("{start:#010x}"),
                        offset,
                        "decode crosses block boundary"
                    );
                    return Ok(DecodeOutcome::CrossesBoundary);
                }
                Step::End => break,
                Step::Invalid if instructions.is_empty() => {
                    return Err(DecodeError::InvalidInstruction {
                        addr: start.wrapping_add(offset as u32),
                    });
                }
                Step::Fault(fault) if instructions.is_empty() => {
                    return Err(DecodeError::Fetch(fault));
                }
                Step::Invalid | Step::Fault(_) => break,
            };

            offset += instr.len();
            let ends = classify(&instr);
            instructions.push(instr);
            if let Some(kind) = ends {
                exit = kind;
                break;
            }
        }

        let mut code = fetcher.buf;
        code.truncate(offset);
        Ok(DecodeOutcome::Complete(InstructionStream {
            mode,
            start,
            bytes: code.into_boxed_slice(),
            instructions: instructions.into(),
            exit,
        }))
    }
}
