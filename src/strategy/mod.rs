//! The unwinding strategies. Each one turns a fault context into an ordered address list on its
//! own; they are peers, run side by side so their output can be compared.

#[cfg(all(
    feature = "context-seeded-walk",
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "arm")
))]
mod libunwind;
mod register_override;
mod skipping;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod uw;

use std::fmt;
use std::str::FromStr;

use faultcontext::Architecture;
use thiserror::Error;

use super::collector::BacktraceState;
use super::error::Error;

/// What the per-frame logic sees of a frame during a callback walk.
pub trait Frame {
    /// Instruction pointer of the frame.
    fn ip(&mut self) -> usize;

    /// Overwrites a general purpose register, by DWARF number.
    fn set_gr(&mut self, register: u16, value: u64);
}

/// Whether a callback walk should go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnwindError {
    #[error("strategy is not compiled in for this target")]
    Unavailable,
    #[error("fault context is for {0:?}, not the running architecture")]
    ArchitectureMismatch(Architecture),
    #[error("libunwind failed with code {0}")]
    Libunwind(i32),
    #[error("_Unwind_Backtrace gave up with reason {0}")]
    Backtrace(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Seed a libunwind cursor with the fault registers and step it.
    ContextSeededWalk,
    /// `_Unwind_Backtrace`, with the fault registers written into the first frame.
    RegisterOverrideCallback,
    /// `_Unwind_Backtrace`, dropping the handler's own frames by count.
    SkipHeuristicCallback,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::ContextSeededWalk,
        Strategy::RegisterOverrideCallback,
        Strategy::SkipHeuristicCallback,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::ContextSeededWalk => "context-seeded-walk",
            Strategy::RegisterOverrideCallback => "register-override-callback",
            Strategy::SkipHeuristicCallback => "skip-heuristic-callback",
        }
    }

    /// Whether the code for this strategy was built into this binary.
    pub fn compiled_in(self) -> bool {
        match self {
            Strategy::ContextSeededWalk => cfg!(all(
                feature = "context-seeded-walk",
                any(target_os = "linux", target_os = "android"),
                any(target_arch = "x86_64", target_arch = "arm")
            )),
            Strategy::RegisterOverrideCallback => cfg!(all(
                feature = "register-override-callback",
                any(target_os = "linux", target_os = "android")
            )),
            Strategy::SkipHeuristicCallback => cfg!(all(
                feature = "skip-heuristic-callback",
                any(target_os = "linux", target_os = "android")
            )),
        }
    }

    /// Whether the running architecture can execute this strategy safely.
    ///
    /// Only the ARM EHABI virtual register set accepts writes for every register. The DWARF
    /// unwinders elsewhere have no save slot for most registers of the first frame, and writing
    /// one faults inside the handler.
    pub fn runs_on(self, architecture: Option<Architecture>) -> bool {
        match self {
            Strategy::ContextSeededWalk => architecture.is_some(),
            Strategy::RegisterOverrideCallback => architecture == Some(Architecture::Arm),
            Strategy::SkipHeuristicCallback => true,
        }
    }

    /// Collects addresses for the fault in `state`.
    ///
    /// Whatever was collected before a failure stays in `state`. A strategy that can't run on this
    /// architecture returns `UnwindError::Unavailable` without touching the unwinder.
    #[inline(never)]
    pub fn run(self, state: &mut BacktraceState) -> Result<(), UnwindError> {
        if !self.compiled_in() || !self.runs_on(Architecture::current()) {
            return Err(UnwindError::Unavailable);
        }
        let result = match self {
            Strategy::ContextSeededWalk => {
                check_native(state).and_then(|()| run_context_seeded_walk(state))
            }
            Strategy::RegisterOverrideCallback => {
                check_native(state).and_then(|()| register_override::unwind(state))
            }
            Strategy::SkipHeuristicCallback => skipping::unwind(state),
        };
        trace!("{} collected {} addresses", self, state.len());
        result
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Strategy, Error> {
        Strategy::ALL
            .iter()
            .cloned()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| Error::UnknownStrategy(s.to_string()))
    }
}

// Register injection writes the fault registers into this process's unwinder, so they must be
// this process's registers.
fn check_native(state: &BacktraceState) -> Result<(), UnwindError> {
    let architecture = state.context().architecture();
    if Architecture::current() == Some(architecture) {
        Ok(())
    } else {
        Err(UnwindError::ArchitectureMismatch(architecture))
    }
}

#[cfg(all(
    feature = "context-seeded-walk",
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "arm")
))]
fn run_context_seeded_walk(state: &mut BacktraceState) -> Result<(), UnwindError> {
    libunwind::unwind(state)
}

#[cfg(not(all(
    feature = "context-seeded-walk",
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "arm")
)))]
fn run_context_seeded_walk(_state: &mut BacktraceState) -> Result<(), UnwindError> {
    Err(UnwindError::Unavailable)
}

/// The strategies that can run here, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    architecture: Option<Architecture>,
    compiled: [bool; 3],
}

impl Capabilities {
    pub fn detect() -> Capabilities {
        let caps = Capabilities {
            architecture: Architecture::current(),
            compiled: [
                Strategy::ContextSeededWalk.compiled_in(),
                Strategy::RegisterOverrideCallback.compiled_in(),
                Strategy::SkipHeuristicCallback.compiled_in(),
            ],
        };
        debug!("detected capabilities {:?}", caps);
        caps
    }

    pub fn architecture(&self) -> Option<Architecture> {
        self.architecture
    }

    pub fn supports(&self, strategy: Strategy) -> bool {
        let compiled = match strategy {
            Strategy::ContextSeededWalk => self.compiled[0],
            Strategy::RegisterOverrideCallback => self.compiled[1],
            Strategy::SkipHeuristicCallback => self.compiled[2],
        };
        compiled && strategy.runs_on(self.architecture)
    }

    /// Supported strategies, most precise first.
    pub fn strategies(&self) -> Vec<Strategy> {
        Strategy::ALL
            .iter()
            .cloned()
            .filter(|strategy| self.supports(*strategy))
            .collect()
    }
}
