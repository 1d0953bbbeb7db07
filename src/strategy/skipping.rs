use super::super::collector::BacktraceState;
use super::{Flow, Frame, UnwindError};

/// Decides what to do with one frame of the walk.
///
/// The first `skip_count` frames are assumed to belong to the handler and the signal trampoline
/// and are dropped whatever they contain.
pub(crate) fn on_frame<F: Frame>(frame: &mut F, state: &mut BacktraceState) -> Flow {
    if state.take_skip() {
        return Flow::Continue;
    }

    match state.add_address(frame.ip()) {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Stop,
    }
}

/// Frames of this crate the walk always starts in: `uw::backtrace`, `unwind` and
/// `Strategy::run`. All three are kept out of line, so the skip count only has to cover what sits
/// between the caller of `Strategy::run` and the faulting code.
#[cfg(any(target_os = "linux", target_os = "android"))]
const OWN_FRAMES: usize = 3;

#[cfg(any(target_os = "linux", target_os = "android"))]
#[inline(never)]
pub(crate) fn unwind(state: &mut BacktraceState) -> Result<(), UnwindError> {
    let mut own = OWN_FRAMES;
    let result = super::uw::backtrace(|frame| {
        if own > 0 {
            own -= 1;
            return Flow::Continue;
        }
        on_frame(frame, state)
    });
    // Not a tail call, so this frame is really there.
    trace!("skipping walk stopped with {} addresses", state.len());
    result
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn unwind(_state: &mut BacktraceState) -> Result<(), UnwindError> {
    Err(UnwindError::Unavailable)
}

#[cfg(test)]
mod tests {
    use super::super::register_override::tests::MockFrame;
    use super::*;
    use crate::collector::{ADDRESS_COUNT_MAX, DEFAULT_SKIP_COUNT};
    use faultcontext::{FaultContext, RegisterFile, X86_64Registers};

    fn context() -> FaultContext {
        FaultContext::new(RegisterFile::X86_64(X86_64Registers::default()))
    }

    #[test]
    fn leading_frames_are_skipped() {
        let context = context();
        let mut state = BacktraceState::new(&context);
        for i in 0..DEFAULT_SKIP_COUNT {
            let mut frame = MockFrame::at(0x1000 + i);
            assert_eq!(on_frame(&mut frame, &mut state), Flow::Continue);
            assert_eq!(frame.ip_reads, 0);
        }
        assert!(state.is_empty());

        let mut first = MockFrame::at(0x4000);
        on_frame(&mut first, &mut state);
        assert_eq!(first.ip_reads, 1);
        assert_eq!(state.addresses(), &[0x4000]);
    }

    #[test]
    fn registers_are_never_touched() {
        let context = context();
        let mut state = BacktraceState::new(&context).with_skip_count(0);
        let mut frame = MockFrame::at(0x4000);
        on_frame(&mut frame, &mut state);
        assert!(frame.written.is_empty());
        assert_eq!(state.addresses(), &[0x4000]);
    }

    #[test]
    fn stops_when_full() {
        let context = context();
        let mut state = BacktraceState::new(&context).with_skip_count(1);
        on_frame(&mut MockFrame::at(1), &mut state);
        for i in 0..ADDRESS_COUNT_MAX {
            on_frame(&mut MockFrame::at(0x1000 + i * 4), &mut state);
        }
        assert_eq!(on_frame(&mut MockFrame::at(0x9000), &mut state), Flow::Stop);
        assert_eq!(state.addresses()[0], 0x1000);
    }
}
