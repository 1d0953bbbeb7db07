//! faultcontext reads the CPU register state that the kernel hands to a fault signal handler and
//! exposes it in a platform independent manner. Currently it provides:
//! - A register file per supported architecture (x86_64, aarch64, 32-bit ARM) with named slots.
//! - The DWARF numbering of those registers, which is what both libunwind and the generic
//!   `_Unwind_*` ABI use to address them.
//! - A `FaultContext` snapshot built either from the raw signal arguments or by hand, so that code
//!   consuming it can be tested without faulting.
//!
//! The snapshot is a plain copy. Nothing here allocates, so it can be built inside a signal
//! handler.

extern crate thiserror;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod linux;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("signal was delivered without a ucontext")]
    NullContext,
    #[error("no register mapping for the target architecture")]
    UnsupportedArchitecture,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Architectures with a register mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86_64,
    Aarch64,
    /// 32-bit ARM, where code addresses may carry the Thumb bit.
    Arm,
}

impl Architecture {
    /// The architecture this crate was compiled for, if it has a mapping.
    pub fn current() -> Option<Architecture> {
        if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Architecture::Aarch64)
        } else if cfg!(target_arch = "arm") {
            Some(Architecture::Arm)
        } else {
            None
        }
    }

    /// Mask to apply to a code address before using it as a symbol lookup key.
    ///
    /// 32-bit ARM tags Thumb code addresses with the lowest bit, which symbol tables don't carry.
    pub fn code_address_mask(self) -> u64 {
        match self {
            Architecture::Arm => !1,
            Architecture::X86_64 | Architecture::Aarch64 => !0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct X86_64Registers {
    pub rax: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aarch64Registers {
    /// x0 to x30. x29 is the frame pointer and x30 the link register.
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArmRegisters {
    /// r0 to r10.
    pub r: [u32; 11],
    /// r11
    pub fp: u32,
    /// r12, the intra-procedure-call scratch register.
    pub ip: u32,
    /// r13
    pub sp: u32,
    /// r14
    pub lr: u32,
    /// r15
    pub pc: u32,
}

/// Register state at the moment of the fault, keyed by architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFile {
    X86_64(X86_64Registers),
    Aarch64(Aarch64Registers),
    Arm(ArmRegisters),
}

impl RegisterFile {
    pub fn architecture(&self) -> Architecture {
        match self {
            RegisterFile::X86_64(_) => Architecture::X86_64,
            RegisterFile::Aarch64(_) => Architecture::Aarch64,
            RegisterFile::Arm(_) => Architecture::Arm,
        }
    }

    /// Address of the faulting instruction.
    pub fn instruction_pointer(&self) -> u64 {
        match self {
            RegisterFile::X86_64(regs) => regs.rip,
            RegisterFile::Aarch64(regs) => regs.pc,
            RegisterFile::Arm(regs) => u64::from(regs.pc),
        }
    }

    pub fn stack_pointer(&self) -> u64 {
        match self {
            RegisterFile::X86_64(regs) => regs.rsp,
            RegisterFile::Aarch64(regs) => regs.sp,
            RegisterFile::Arm(regs) => u64::from(regs.sp),
        }
    }

    /// Every general purpose register, together with the stack pointer and (where the ABI gives
    /// it a number) the program counter, in DWARF register numbering order.
    pub fn dwarf_registers(&self) -> DwarfRegisters {
        let mut out = DwarfRegisters::new();
        match self {
            RegisterFile::X86_64(regs) => {
                let values = [
                    regs.rax, regs.rdx, regs.rcx, regs.rbx, regs.rsi, regs.rdi, regs.rbp,
                    regs.rsp, regs.r8, regs.r9, regs.r10, regs.r11, regs.r12, regs.r13, regs.r14,
                    regs.r15, regs.rip,
                ];
                for (number, value) in values.iter().enumerate() {
                    out.push(number as u16, *value);
                }
            }
            RegisterFile::Aarch64(regs) => {
                for (number, value) in regs.x.iter().enumerate() {
                    out.push(number as u16, *value);
                }
                // DWARF has no number for the aarch64 pc.
                out.push(31, regs.sp);
            }
            RegisterFile::Arm(regs) => {
                for (number, value) in regs.r.iter().enumerate() {
                    out.push(number as u16, u64::from(*value));
                }
                out.push(11, u64::from(regs.fp));
                out.push(12, u64::from(regs.ip));
                out.push(13, u64::from(regs.sp));
                out.push(14, u64::from(regs.lr));
                out.push(15, u64::from(regs.pc));
            }
        }
        out
    }
}

/// Largest register set produced by `RegisterFile::dwarf_registers` (aarch64: x0-x30 and sp).
pub const MAX_DWARF_REGISTERS: usize = 32;

/// Fixed size list of `(dwarf register number, value)` pairs.
#[derive(Clone, Copy)]
pub struct DwarfRegisters {
    entries: [(u16, u64); MAX_DWARF_REGISTERS],
    len: usize,
}

impl DwarfRegisters {
    fn new() -> Self {
        DwarfRegisters {
            entries: [(0, 0); MAX_DWARF_REGISTERS],
            len: 0,
        }
    }

    fn push(&mut self, number: u16, value: u64) {
        debug_assert!(self.len < MAX_DWARF_REGISTERS);
        self.entries[self.len] = (number, value);
        self.len += 1;
    }

    pub fn as_slice(&self) -> &[(u16, u64)] {
        &self.entries[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<'a> IntoIterator for &'a DwarfRegisters {
    type Item = &'a (u16, u64);
    type IntoIter = std::slice::Iter<'a, (u16, u64)>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl std::fmt::Debug for DwarfRegisters {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// Snapshot of the faulting thread, valid for as long as the handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    registers: RegisterFile,
    signal: Option<i32>,
    fault_address: Option<u64>,
}

impl FaultContext {
    /// Builds a context from registers alone. Useful for synthetic faults.
    pub fn new(registers: RegisterFile) -> Self {
        FaultContext {
            registers,
            signal: None,
            fault_address: None,
        }
    }

    pub fn with_signal(mut self, signal: i32, fault_address: Option<u64>) -> Self {
        self.signal = Some(signal);
        self.fault_address = fault_address;
        self
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn architecture(&self) -> Architecture {
        self.registers.architecture()
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.registers.instruction_pointer()
    }

    pub fn stack_pointer(&self) -> u64 {
        self.registers.stack_pointer()
    }

    /// Signal number, when built from a delivered signal.
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// The memory address whose access faulted, as reported by the kernel.
    pub fn fault_address(&self) -> Option<u64> {
        self.fault_address
    }
}
