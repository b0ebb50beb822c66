use std::sync::Arc;

use aero_addrspace::{
    AddressSpace, CodeBlock, Completion, ExecError, Executable, Instruction, Processor, Tier,
};

use super::Compiler;
use crate::decoder::InstructionStream;

#[derive(Debug)]
struct Interpreted {
    instructions: Arc<[Instruction]>,
}

impl Executable for Interpreted {
    fn execute(
        &self,
        cpu: &mut dyn Processor,
        mem: &mut dyn AddressSpace,
    ) -> Result<Completion, ExecError> {
        for instr in self.instructions.iter() {
            cpu.execute(instr, mem)?;
        }
        Ok(Completion::Retired(self.instructions.len() as u32))
    }

    fn tier(&self) -> Tier {
        Tier::Interpreted
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InterpretingCompiler;

impl InterpretingCompiler {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, stream: &InstructionStream) -> Arc<CodeBlock> {
        Arc::new(CodeBlock::new(
            stream.mode(),
            stream.start(),
            stream.x86_length(),
            stream.x86_count(),
            stream.exit(),
            Box::new(Interpreted {
                instructions: stream.shared_instructions(),
            }),
        ))
    }
}

impl Compiler for InterpretingCompiler {
    fn compile(&self, stream: &InstructionStream) -> Option<Arc<CodeBlock>> {
        Some(self.build(stream))
    }
}
