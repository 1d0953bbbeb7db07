//! Bindings to the generic `_Unwind_*` ABI provided by the platform unwinder (libgcc_s or the
//! LLVM libunwind), which std already links.
//!
//! On 32-bit ARM the EHABI exposes register access through the virtual register set, and the
//! `_Unwind_GetGR`/`_Unwind_SetGR`/`_Unwind_GetIP` entry points only exist as inline helpers in
//! the C header, so they are rebuilt here.

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

extern crate libc;

use self::libc::{c_int, c_void, uintptr_t};
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::{Flow, Frame, UnwindError};

pub enum _Unwind_Context {}

pub type _Unwind_Reason_Code = c_int;

pub const _URC_NO_REASON: _Unwind_Reason_Code = 0;
pub const _URC_NORMAL_STOP: _Unwind_Reason_Code = 4;
pub const _URC_END_OF_STACK: _Unwind_Reason_Code = 5;

pub type _Unwind_Trace_Fn =
    extern "C" fn(*mut _Unwind_Context, *mut c_void) -> _Unwind_Reason_Code;

extern "C" {
    pub fn _Unwind_Backtrace(trace: _Unwind_Trace_Fn, arg: *mut c_void) -> _Unwind_Reason_Code;
}

#[cfg(not(target_arch = "arm"))]
extern "C" {
    pub fn _Unwind_GetIP(context: *mut _Unwind_Context) -> uintptr_t;
    pub fn _Unwind_SetGR(context: *mut _Unwind_Context, index: c_int, value: uintptr_t);
}

#[cfg(target_arch = "arm")]
pub use self::arm::*;

#[cfg(target_arch = "arm")]
mod arm {
    use super::libc::{c_int, c_void, uintptr_t};
    use super::_Unwind_Context;

    type _Unwind_VRS_Result = c_int;
    type _Unwind_VRS_RegClass = c_int;
    type _Unwind_VRS_DataRepresentation = c_int;

    const _UVRSC_CORE: _Unwind_VRS_RegClass = 0;
    const _UVRSD_UINT32: _Unwind_VRS_DataRepresentation = 0;

    const UNWIND_IP_REG: c_int = 15;

    extern "C" {
        fn _Unwind_VRS_Get(
            context: *mut _Unwind_Context,
            regclass: _Unwind_VRS_RegClass,
            regno: u32,
            repr: _Unwind_VRS_DataRepresentation,
            data: *mut c_void,
        ) -> _Unwind_VRS_Result;

        fn _Unwind_VRS_Set(
            context: *mut _Unwind_Context,
            regclass: _Unwind_VRS_RegClass,
            regno: u32,
            repr: _Unwind_VRS_DataRepresentation,
            data: *mut c_void,
        ) -> _Unwind_VRS_Result;
    }

    pub unsafe fn _Unwind_GetGR(context: *mut _Unwind_Context, index: c_int) -> uintptr_t {
        let mut value: uintptr_t = 0;
        _Unwind_VRS_Get(
            context,
            _UVRSC_CORE,
            index as u32,
            _UVRSD_UINT32,
            &mut value as *mut uintptr_t as *mut c_void,
        );
        value
    }

    pub unsafe fn _Unwind_SetGR(context: *mut _Unwind_Context, index: c_int, value: uintptr_t) {
        let mut value = value;
        _Unwind_VRS_Set(
            context,
            _UVRSC_CORE,
            index as u32,
            _UVRSD_UINT32,
            &mut value as *mut uintptr_t as *mut c_void,
        );
    }

    // The Thumb bit is not part of the address.
    pub unsafe fn _Unwind_GetIP(context: *mut _Unwind_Context) -> uintptr_t {
        _Unwind_GetGR(context, UNWIND_IP_REG) & !1
    }
}

/// One frame as seen from inside an `_Unwind_Backtrace` callback.
pub struct ContextFrame(*mut _Unwind_Context);

impl Frame for ContextFrame {
    fn ip(&mut self) -> usize {
        unsafe { _Unwind_GetIP(self.0) as usize }
    }

    fn set_gr(&mut self, register: u16, value: u64) {
        unsafe { _Unwind_SetGR(self.0, c_int::from(register), value as uintptr_t) }
    }
}

struct TraceData<F> {
    on_frame: F,
    stopped: bool,
}

/// Walks the current thread's stack, calling `on_frame` once per frame, innermost first, until it
/// returns `Flow::Stop` or the unwinder runs out of frames.
///
/// The first frame reported is this function's own.
#[inline(never)]
pub fn backtrace<F>(on_frame: F) -> Result<(), UnwindError>
where
    F: FnMut(&mut ContextFrame) -> Flow,
{
    extern "C" fn trace<F>(context: *mut _Unwind_Context, arg: *mut c_void) -> _Unwind_Reason_Code
    where
        F: FnMut(&mut ContextFrame) -> Flow,
    {
        let data = unsafe { &mut *(arg as *mut TraceData<F>) };
        let mut frame = ContextFrame(context);
        // Unwinding a panic through the C unwinder is undefined; treat it as the end.
        let flow = catch_unwind(AssertUnwindSafe(|| (data.on_frame)(&mut frame)))
            .unwrap_or(Flow::Stop);
        match flow {
            Flow::Continue => _URC_NO_REASON,
            Flow::Stop => {
                data.stopped = true;
                _URC_END_OF_STACK
            }
        }
    }

    let mut data = TraceData {
        on_frame,
        stopped: false,
    };
    let code = unsafe {
        _Unwind_Backtrace(trace::<F>, &mut data as *mut TraceData<F> as *mut c_void)
    };
    // Stopping from the callback makes some unwinders report a phase 1 error.
    if data.stopped {
        return Ok(());
    }
    match code {
        _URC_NO_REASON | _URC_NORMAL_STOP | _URC_END_OF_STACK => Ok(()),
        code => Err(UnwindError::Backtrace(code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn collect(limit: usize) -> Vec<usize> {
        let mut ips = Vec::new();
        backtrace(|frame| {
            ips.push(frame.ip());
            if ips.len() == limit {
                Flow::Stop
            } else {
                Flow::Continue
            }
        })
        .expect("backtrace succeeded");
        ips
    }

    #[test]
    fn walks_own_stack() {
        let ips = collect(64);
        // At least this function, the test harness and the thread entry.
        assert!(ips.len() > 3);
        assert!(ips.iter().take(3).all(|ip| *ip != 0));
    }

    #[test]
    fn stop_is_honoured() {
        assert_eq!(collect(2).len(), 2);
    }
}
