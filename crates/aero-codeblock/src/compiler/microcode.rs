use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, LazyLock};

use aero_addrspace::{
    AddressSpace, CodeBlock, Completion, ExecError, Executable, Instruction, Processor, Tier,
};
use iced_x86::Mnemonic;
use tracing::trace;

use super::Compiler;
use crate::decoder::InstructionStream;

#[derive(Debug, Clone)]
enum MicroOp {
    /// Advance past instructions with no architectural effect.
    Skip(u32),
    Execute(Instruction),
}

/// `None` rejects the whole unit.
type LowerFn = fn(&Instruction) -> Option<MicroOp>;

fn lower_skip(instr: &Instruction) -> Option<MicroOp> {
    Some(MicroOp::Skip(instr.len() as u32))
}

fn reject(_instr: &Instruction) -> Option<MicroOp> {
    None
}

fn lower_execute(instr: &Instruction) -> Option<MicroOp> {
    Some(MicroOp::Execute(*instr))
}

/// Lowering for mnemonics that need special handling; everything else executes as is.
static LOWERING: LazyLock<HashMap<Mnemonic, LowerFn>> = LazyLock::new(|| {
    let mut table: HashMap<Mnemonic, LowerFn> = HashMap::new();
    for mnemonic in [Mnemonic::Nop, Mnemonic::Pause] {
        table.insert(mnemonic, lower_skip);
    }
    // Port I/O, halts and explicit traps stay with the interpreter.
    for mnemonic in [
        Mnemonic::In,
        Mnemonic::Out,
        Mnemonic::Insb,
        Mnemonic::Insw,
        Mnemonic::Insd,
        Mnemonic::Outsb,
        Mnemonic::Outsw,
        Mnemonic::Outsd,
        Mnemonic::Hlt,
        Mnemonic::Int,
        Mnemonic::Int1,
        Mnemonic::Int3,
        Mnemonic::Into,
        Mnemonic::Ud0,
        Mnemonic::Ud1,
        Mnemonic::Ud2,
    ] {
        table.insert(mnemonic, reject);
    }
    table
});

#[derive(Debug)]
struct Microcode {
    ops: Box<[MicroOp]>,
    count: u32,
    /// Guest bytes the unit was built from.
    bytes: Box<[u8]>,
}

impl Executable for Microcode {
    fn execute(
        &self,
        cpu: &mut dyn Processor,
        mem: &mut dyn AddressSpace,
    ) -> Result<Completion, ExecError> {
        for op in self.ops.iter() {
            match op {
                MicroOp::Skip(bytes) => cpu.skip(*bytes),
                MicroOp::Execute(instr) => cpu.execute(instr, mem)?,
            }
        }
        Ok(Completion::Retired(self.count))
    }

    /// Survives writes that leave its bytes as they were.
    fn invalidated_by(&self, range: Range<usize>, current: &[u8]) -> bool {
        let end = range.end.min(self.bytes.len());
        let start = range.start.min(end);
        current.get(start..end) != self.bytes.get(start..end)
    }

    fn tier(&self) -> Tier {
        Tier::Compiled
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MicrocodeCompiler;

impl MicrocodeCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl Compiler for MicrocodeCompiler {
    fn compile(&self, stream: &InstructionStream) -> Option<Arc<CodeBlock>> {
        let mut ops: Vec<MicroOp> = Vec::with_capacity(stream.instructions().len());
        for instr in stream.instructions() {
            let lower = LOWERING
                .get(&instr.mnemonic())
                .copied()
                .unwrap_or(lower_execute as LowerFn);
            let Some(op) = lower(instr) else {
                trace!(
                    start = format_args!("{:#010x}", stream.start()),
                    mnemonic = ?instr.mnemonic(),
                    "unit not compilable"
                );
                return None;
            };
            match (ops.last_mut(), op) {
                (Some(MicroOp::Skip(run)), MicroOp::Skip(bytes)) => *run += bytes,
                (_, op) => ops.push(op),
            }
        }

        Some(Arc::new(CodeBlock::new(
            stream.mode(),
            stream.start(),
            stream.x86_length(),
            stream.x86_count(),
            stream.exit(),
            Box::new(Microcode {
                ops: ops.into_boxed_slice(),
                count: stream.x86_count(),
                bytes: stream.bytes().into(),
            }),
        )))
    }
}
