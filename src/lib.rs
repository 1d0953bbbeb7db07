//! crashtrace prints a best-effort backtrace from inside a fatal signal handler.
//!
//! When a fault is delivered, every configured unwinding strategy gets its own fresh
//! `BacktraceState` built from the same fault context, collects up to
//! `collector::ADDRESS_COUNT_MAX` addresses, and the result is symbolized and written as one
//! block per strategy. The strategies trade portability for precision, so their blocks can be
//! compared side by side.
//!
//! Installing the handler on Linux:
//!
//! ```no_run
//! let handle = crashtrace::install(crashtrace::HandlerConfig::new()).expect("handler installed");
//! // ... run code that may crash ...
//! crashtrace::uninstall(handle).expect("handler uninstalled");
//! ```

#[macro_use]
extern crate log;
extern crate faultcontext;
extern crate thiserror;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod lib_linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use lib_linux::*;

pub mod collector;
pub mod error;
pub mod output;
pub mod strategy;
pub mod symbolizer;

use std::io::Write;

pub use collector::BacktraceState;
pub use error::{Error, Result};
pub use faultcontext::{Architecture, FaultContext, RegisterFile};
pub use strategy::{Capabilities, Strategy};

/// Runs each strategy on its own state and writes one block per strategy to `out`.
pub fn report<W: Write>(
    context: &FaultContext,
    strategies: &[Strategy],
    out: &mut W,
) -> Result<()> {
    report_with_skip(context, strategies, collector::DEFAULT_SKIP_COUNT, out)
}

/// Like `report`, with the number of leading frames the skipping strategy drops.
///
/// Inside the fault handler those are this function, the handler and the kernel's signal
/// trampoline, which is what `collector::DEFAULT_SKIP_COUNT` counts.
#[inline(never)]
pub fn report_with_skip<W: Write>(
    context: &FaultContext,
    strategies: &[Strategy],
    skip_count: usize,
    out: &mut W,
) -> Result<()> {
    for &strategy in strategies {
        let mut state = BacktraceState::new(context).with_skip_count(skip_count);
        // A strategy that gives up still reports what it got.
        if let Err(e) = strategy.run(&mut state) {
            debug!("{} stopped after {} frames: {}", strategy, state.len(), e);
        }
        output::print_backtrace(out, strategy, &state)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultcontext::{ArmRegisters, X86_64Registers};

    #[test]
    fn one_block_per_strategy() {
        let context = FaultContext::new(RegisterFile::X86_64(X86_64Registers::default()));
        let strategies = [Strategy::SkipHeuristicCallback, Strategy::SkipHeuristicCallback];
        let mut out = Vec::new();
        report(&context, &strategies, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text.matches("Backtrace captured using skip-heuristic-callback:\n").count(),
            2
        );
    }

    #[test]
    fn failed_strategy_still_reports() {
        // Foreign registers can't be injected, so the register based strategies collect nothing.
        let context = FaultContext::new(RegisterFile::Arm(ArmRegisters::default()));
        let foreign = if cfg!(target_arch = "arm") {
            FaultContext::new(RegisterFile::X86_64(X86_64Registers::default()))
        } else {
            context
        };
        let mut out = Vec::new();
        report(
            &foreign,
            &[Strategy::ContextSeededWalk, Strategy::RegisterOverrideCallback],
            &mut out,
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Backtrace captured using context-seeded-walk:\n\
             Backtrace captured using register-override-callback:\n"
        );
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[inline(never)]
    fn recurse(depth: usize, out: &mut Vec<usize>) -> usize {
        if depth == 0 {
            let context = FaultContext::new(RegisterFile::X86_64(X86_64Registers::default()));
            let mut state = BacktraceState::new(&context).with_skip_count(0);
            Strategy::SkipHeuristicCallback.run(&mut state).unwrap();
            out.extend_from_slice(state.addresses());
            return out.len();
        }
        // Not a tail call, so every level keeps a frame.
        recurse(depth - 1, out) + depth
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn recursion_collapses_to_one_frame() {
        if !Strategy::SkipHeuristicCallback.compiled_in() {
            return;
        }
        let mut addresses = Vec::new();
        recurse(5, &mut addresses);
        // The five recursive frames share one return address, and only a run of equal
        // addresses is collapsed.
        assert!(addresses.len() > 3, "only {} frames", addresses.len());
        assert!(addresses.windows(2).all(|pair| pair[0] != pair[1]));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[inline(never)]
    fn walk_from_here() -> Vec<usize> {
        let context = FaultContext::new(RegisterFile::X86_64(X86_64Registers::default()));
        let mut state = BacktraceState::new(&context).with_skip_count(0);
        Strategy::SkipHeuristicCallback.run(&mut state).unwrap();
        state.addresses().to_vec()
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        feature = "symtab",
        feature = "demangle"
    ))]
    #[test]
    fn skipping_starts_at_the_caller() {
        if !Strategy::SkipHeuristicCallback.compiled_in() {
            return;
        }
        let addresses = walk_from_here();
        let first = symbolizer::resolve(addresses[0]);
        assert!(
            first.display_name().ends_with("walk_from_here"),
            "first frame is {:?}",
            first
        );
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
    #[inline(never)]
    fn capture_at_depth(depth: usize, check: &mut dyn FnMut(&FaultContext)) -> usize {
        if depth == 0 {
            let mut ucontext: libc::ucontext_t = unsafe { std::mem::zeroed() };
            assert_eq!(unsafe { libc::getcontext(&mut ucontext) }, 0);
            let context = unsafe {
                FaultContext::from_raw(
                    libc::SIGSEGV,
                    std::ptr::null(),
                    &ucontext as *const libc::ucontext_t as *const std::os::raw::c_void,
                )
            }
            .unwrap();
            check(&context);
            return 0;
        }
        capture_at_depth(depth - 1, check) + depth
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
    #[test]
    fn fault_pc_is_reported_module_relative() {
        capture_at_depth(5, &mut |context| {
            let pc = context.instruction_pointer() as usize;
            let expected = symbolizer::resolve(pc);
            assert!(expected.module_base != 0);

            for strategy in Capabilities::detect().strategies() {
                let mut state = BacktraceState::new(context).with_skip_count(0);
                let _ = strategy.run(&mut state);
                assert!(!state.is_empty(), "{} collected nothing", strategy);
                let frames: Vec<_> = state
                    .addresses()
                    .iter()
                    .map(|&address| symbolizer::resolve(address))
                    .collect();
                match strategy {
                    // Walks the live stack, so only the module is known to match.
                    Strategy::SkipHeuristicCallback => assert!(frames
                        .iter()
                        .any(|frame| frame.module_base == expected.module_base)),
                    _ => assert_eq!(frames[0].relative_address, pc - expected.module_base),
                }
            }
        });
    }
}
