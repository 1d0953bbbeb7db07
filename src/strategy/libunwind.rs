use std::mem;

use self::sys::*;
use super::super::collector::BacktraceState;
use super::UnwindError;

/// Walks the faulted stack with a local libunwind cursor.
///
/// The cursor is initialised from a context whose registers are then all replaced with the values
/// from the fault context, so the first step lands in the caller of the faulting function.
/// libunwind numbers x86_64 and ARM registers like DWARF does.
pub(crate) fn unwind(state: &mut BacktraceState) -> Result<(), UnwindError> {
    let fault = state.context();

    // This is a stack allocation, so it is OK.
    let mut context: unw_context_t = unsafe { mem::zeroed() };
    let mut cursor: unw_cursor_t = unsafe { mem::zeroed() };
    let r = unsafe { seed_context(fault, &mut context) };
    if r < 0 {
        return Err(UnwindError::Libunwind(r));
    }
    let r = unsafe { unw_init_local(&mut cursor, &mut context) };
    if r < 0 {
        return Err(UnwindError::Libunwind(r));
    }

    for &(register, value) in &fault.registers().dwarf_registers() {
        let r = unsafe {
            unw_set_reg(&mut cursor, unw_regnum_t::from(register), value as unw_word_t)
        };
        if r < 0 {
            trace!("unw_set_reg({}) failed with {}", register, r);
        }
    }
    unsafe {
        unw_set_reg(&mut cursor, UNW_REG_IP, fault.instruction_pointer() as unw_word_t);
        unw_set_reg(&mut cursor, UNW_REG_SP, fault.stack_pointer() as unw_word_t);
    }

    // unw_step() only yields the frames above the one the cursor starts in.
    let _ = state.add_address(fault.instruction_pointer() as usize);

    loop {
        let step = unsafe { unw_step(&mut cursor) };
        if step == 0 {
            // No more frames.
            break;
        } else if step < 0 {
            return Err(UnwindError::Libunwind(step));
        }

        let mut ip: unw_word_t = 0;
        let r = unsafe { unw_get_reg(&mut cursor, UNW_REG_IP, &mut ip) };
        if r < 0 {
            return Err(UnwindError::Libunwind(r));
        }
        if state.add_address(ip as usize).is_err() {
            break;
        }
    }

    Ok(())
}

#[cfg(target_arch = "x86_64")]
mod sys {
    extern crate unwind_sys;

    pub use self::unwind_sys::{
        unw_context_t, unw_cursor_t, unw_get_reg, unw_init_local, unw_regnum_t, unw_set_reg,
        unw_step, unw_word_t, UNW_REG_IP, UNW_REG_SP,
    };

    use faultcontext::FaultContext;
    use std::os::raw::c_int;

    /// Fills `context` with this thread's registers. They are all overwritten once the cursor
    /// exists.
    pub unsafe fn seed_context(_fault: &FaultContext, context: *mut unw_context_t) -> c_int {
        self::unwind_sys::unw_tdep_getcontext(context)
    }
}

// unwind-sys has no ARM backend, so the handful of local unwinding entry points are bound here
// against the generic library, the way unwind-sys binds x86_64.
#[cfg(target_arch = "arm")]
#[allow(non_camel_case_types)]
mod sys {
    use faultcontext::FaultContext;
    use std::os::raw::c_int;

    pub type unw_word_t = u32;
    pub type unw_regnum_t = c_int;

    pub const UNW_ARM_R13: unw_regnum_t = 13;
    pub const UNW_ARM_R15: unw_regnum_t = 15;
    pub const UNW_REG_IP: unw_regnum_t = UNW_ARM_R15;
    pub const UNW_REG_SP: unw_regnum_t = UNW_ARM_R13;

    const UNW_TDEP_CURSOR_LEN: usize = 4096;

    #[repr(C)]
    pub struct unw_context_t {
        pub regs: [unw_word_t; 16],
    }

    #[repr(C)]
    pub struct unw_cursor_t {
        pub opaque: [unw_word_t; UNW_TDEP_CURSOR_LEN],
    }

    #[link(name = "unwind-generic")]
    extern "C" {
        #[link_name = "_Uarm_init_local"]
        pub fn unw_init_local(cur: *mut unw_cursor_t, ctx: *mut unw_context_t) -> c_int;

        #[link_name = "_Uarm_step"]
        pub fn unw_step(cur: *mut unw_cursor_t) -> c_int;

        #[link_name = "_Uarm_get_reg"]
        pub fn unw_get_reg(cur: *mut unw_cursor_t, reg: unw_regnum_t, valp: *mut unw_word_t)
            -> c_int;

        #[link_name = "_Uarm_set_reg"]
        pub fn unw_set_reg(cur: *mut unw_cursor_t, reg: unw_regnum_t, val: unw_word_t) -> c_int;
    }

    /// Fills `context` straight from the fault registers.
    ///
    /// An ARM unw_context_t is nothing but r0-r15, which is what the kernel saved at the fault.
    pub unsafe fn seed_context(fault: &FaultContext, context: *mut unw_context_t) -> c_int {
        let context = &mut *context;
        for &(register, value) in &fault.registers().dwarf_registers() {
            if let Some(slot) = context.regs.get_mut(register as usize) {
                *slot = value as unw_word_t;
            }
        }
        0
    }
}
