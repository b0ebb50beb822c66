use thiserror::Error;

/// Invalid mapping request. These are configuration mistakes made by the machine builder, not
/// guest-triggerable conditions, so nothing retries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("mapping address {addr:#x} is not 4KiB aligned")]
    Unaligned { addr: u32 },

    #[error("mapping length {len:#x} is not a multiple of 4KiB")]
    UnalignedLength { len: u64 },

    #[error("backing block of {size:#x} bytes is smaller than a 4KiB page")]
    Undersized { size: usize },

    #[error("region {addr:#x}+{len:#x} extends past the 4GiB address space")]
    OutOfRange { addr: u32, len: u64 },
}

pub const PF_ERR_PRESENT: u32 = 1 << 0;
pub const PF_ERR_WRITE: u32 = 1 << 1;
pub const PF_ERR_USER: u32 = 1 << 2;

/// Page fault raised by a linear-address access.
///
/// The error code uses the architectural bit layout so the processor can push it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page fault at {addr:#010x} (error code {error_code:#x})")]
pub struct PageFault {
    pub addr: u32,
    pub error_code: u32,
}

impl PageFault {
    #[inline]
    fn code(present: bool, write: bool, user: bool) -> u32 {
        let mut code = 0;
        if present {
            code |= PF_ERR_PRESENT;
        }
        if write {
            code |= PF_ERR_WRITE;
        }
        if user {
            code |= PF_ERR_USER;
        }
        code
    }

    pub fn not_present(addr: u32, write: bool, user: bool) -> Self {
        Self {
            addr,
            error_code: Self::code(false, write, user),
        }
    }

    pub fn protection(addr: u32, write: bool, user: bool) -> Self {
        Self {
            addr,
            error_code: Self::code(true, write, user),
        }
    }

    pub fn is_present(&self) -> bool {
        self.error_code & PF_ERR_PRESENT != 0
    }

    pub fn is_write(&self) -> bool {
        self.error_code & PF_ERR_WRITE != 0
    }

    pub fn is_user(&self) -> bool {
        self.error_code & PF_ERR_USER != 0
    }
}

/// Architectural exception raised by the processor while it executed an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("processor exception {vector:#x}")]
pub struct ProcessorException {
    pub vector: u8,
    pub error_code: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid instruction at {addr:#010x}")]
    InvalidInstruction { addr: u32 },

    #[error("instruction fetch failed: {0}")]
    Fetch(#[from] PageFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error(transparent)]
    PageFault(#[from] PageFault),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Processor(#[from] ProcessorException),

    #[error("attempted to execute unconnected memory at {addr:#010x}")]
    Unconnected { addr: u32 },

    #[error("no code source attached to the address space")]
    NoCodeSource,
}
