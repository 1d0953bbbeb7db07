extern crate libc;

use std::os::raw::{c_int, c_void};

use super::{Error, FaultContext, RegisterFile, Result};

impl FaultContext {
    /// Builds a context from the arguments of an `SA_SIGINFO` signal handler.
    ///
    /// `info` may be null, in which case no fault address is recorded.
    ///
    /// # Safety
    ///
    /// `ucontext` must be null or point to the `ucontext_t` the kernel delivered with the signal,
    /// and `info` must be null or point to the matching `siginfo_t`.
    pub unsafe fn from_raw(
        signal: c_int,
        info: *const libc::siginfo_t,
        ucontext: *const c_void,
    ) -> Result<FaultContext> {
        let ucontext = (ucontext as *const libc::ucontext_t)
            .as_ref()
            .ok_or(Error::NullContext)?;
        let registers = RegisterFile::from_mcontext(&ucontext.uc_mcontext)?;
        let fault_address = info.as_ref().map(|info| info.si_addr() as u64);
        Ok(FaultContext::new(registers).with_signal(signal, fault_address))
    }
}

impl RegisterFile {
    #[cfg(target_arch = "x86_64")]
    pub fn from_mcontext(mcontext: &libc::mcontext_t) -> Result<RegisterFile> {
        let reg = |index: c_int| mcontext.gregs[index as usize] as u64;
        Ok(RegisterFile::X86_64(super::X86_64Registers {
            rax: reg(libc::REG_RAX),
            rdx: reg(libc::REG_RDX),
            rcx: reg(libc::REG_RCX),
            rbx: reg(libc::REG_RBX),
            rsi: reg(libc::REG_RSI),
            rdi: reg(libc::REG_RDI),
            rbp: reg(libc::REG_RBP),
            rsp: reg(libc::REG_RSP),
            r8: reg(libc::REG_R8),
            r9: reg(libc::REG_R9),
            r10: reg(libc::REG_R10),
            r11: reg(libc::REG_R11),
            r12: reg(libc::REG_R12),
            r13: reg(libc::REG_R13),
            r14: reg(libc::REG_R14),
            r15: reg(libc::REG_R15),
            rip: reg(libc::REG_RIP),
        }))
    }

    #[cfg(target_arch = "aarch64")]
    pub fn from_mcontext(mcontext: &libc::mcontext_t) -> Result<RegisterFile> {
        let mut x = [0u64; 31];
        for (slot, value) in x.iter_mut().zip(mcontext.regs.iter()) {
            *slot = *value as u64;
        }
        Ok(RegisterFile::Aarch64(super::Aarch64Registers {
            x,
            sp: mcontext.sp as u64,
            pc: mcontext.pc as u64,
        }))
    }

    #[cfg(target_arch = "arm")]
    pub fn from_mcontext(mcontext: &libc::mcontext_t) -> Result<RegisterFile> {
        Ok(RegisterFile::Arm(super::ArmRegisters {
            r: [
                mcontext.arm_r0 as u32,
                mcontext.arm_r1 as u32,
                mcontext.arm_r2 as u32,
                mcontext.arm_r3 as u32,
                mcontext.arm_r4 as u32,
                mcontext.arm_r5 as u32,
                mcontext.arm_r6 as u32,
                mcontext.arm_r7 as u32,
                mcontext.arm_r8 as u32,
                mcontext.arm_r9 as u32,
                mcontext.arm_r10 as u32,
            ],
            fp: mcontext.arm_fp as u32,
            ip: mcontext.arm_ip as u32,
            sp: mcontext.arm_sp as u32,
            lr: mcontext.arm_lr as u32,
            pc: mcontext.arm_pc as u32,
        }))
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
    pub fn from_mcontext(_mcontext: &libc::mcontext_t) -> Result<RegisterFile> {
        Err(Error::UnsupportedArchitecture)
    }
}
