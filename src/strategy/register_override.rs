use super::super::collector::BacktraceState;
use super::{Flow, Frame, UnwindError};

/// Decides what to do with one frame of the walk.
///
/// The first frame `_Unwind_Backtrace` reports is the handler's own, so instead of reading it the
/// fault registers are written over it and the faulting instruction is recorded directly. The
/// walk then continues from the faulted code.
pub(crate) fn on_frame<F: Frame>(frame: &mut F, state: &mut BacktraceState) -> Flow {
    if state.is_empty() {
        override_registers(frame, state);
        return Flow::Continue;
    }

    match state.add_address(frame.ip()) {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Stop,
    }
}

fn override_registers<F: Frame>(frame: &mut F, state: &mut BacktraceState) {
    let context = state.context();
    for &(register, value) in &context.registers().dwarf_registers() {
        frame.set_gr(register, value);
    }
    // The callbacks never report the faulting instruction itself.
    let _ = state.add_address(context.instruction_pointer() as usize);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn unwind(state: &mut BacktraceState) -> Result<(), UnwindError> {
    super::uw::backtrace(|frame| on_frame(frame, state))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn unwind(_state: &mut BacktraceState) -> Result<(), UnwindError> {
    Err(UnwindError::Unavailable)
}
