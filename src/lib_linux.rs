extern crate libc;
extern crate nix;

use self::nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::cmp;
use std::convert::TryFrom;
use std::io::{self, Write};
use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::collector::DEFAULT_SKIP_COUNT;
use super::error::{Error, Result};
use super::strategy::{Capabilities, Strategy};
use super::{report_with_skip, FaultContext};

/// Smallest alternate stack handed to the kernel. Symbolization needs more than `SIGSTKSZ`.
pub const MIN_ALT_STACK_SIZE: usize = 64 * 1024;

/// What the fault handler does when a signal arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Strategies to run, in order. Each produces its own backtrace block.
    pub strategies: Vec<Strategy>,
    pub signals: Vec<Signal>,
    pub alt_stack_size: usize,
    /// Leading frames the skipping strategy drops.
    pub skip_count: usize,
    /// Status the process exits with after reporting.
    pub exit_code: i32,
}

impl HandlerConfig {
    pub fn new() -> Self {
        HandlerConfig {
            strategies: Capabilities::detect().strategies(),
            signals: vec![Signal::SIGSEGV],
            alt_stack_size: cmp::max(libc::SIGSTKSZ, MIN_ALT_STACK_SIZE),
            skip_count: DEFAULT_SKIP_COUNT,
            exit_code: 0,
        }
    }

    pub fn strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn signals(mut self, signals: Vec<Signal>) -> Self {
        self.signals = signals;
        self
    }

    pub fn skip_count(mut self, skip_count: usize) -> Self {
        self.skip_count = skip_count;
        self
    }

    pub fn exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self::new()
    }
}

// The signal API has no user data pointer, so the live config has to be reachable from here.
static ACTIVE: AtomicPtr<HandlerConfig> = AtomicPtr::new(ptr::null_mut());
// Handlers that entered before looking at ACTIVE. A handler that reports never leaves.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Keeps the fault handler installed. Pass it to `uninstall`, or drop it, to restore the previous
/// signal actions.
///
/// The alternate stack is per thread: it is set up for the thread that called `install` and must
/// be torn down from that same thread.
pub struct HandlerHandle {
    config: *mut HandlerConfig,
    previous: Vec<(Signal, SigAction)>,
    previous_stack: libc::stack_t,
    alt_stack: Option<Box<[u8]>>,
    restored: bool,
}

impl HandlerHandle {
    pub fn config(&self) -> &HandlerConfig {
        unsafe { &*self.config }
    }

    fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }

        while let Some((signal, action)) = self.previous.pop() {
            if let Err(e) = unsafe { signal::sigaction(signal, &action) } {
                self.previous.push((signal, action));
                return Err(e.into());
            }
        }

        if let Some(stack) = self.alt_stack.take() {
            if unsafe { libc::sigaltstack(&self.previous_stack, ptr::null_mut()) } != 0 {
                // The kernel may still run handlers on it.
                mem::forget(stack);
                return Err(Error::AltStack(io::Error::last_os_error()));
            }
        }

        ACTIVE.store(ptr::null_mut(), Ordering::SeqCst);
        unsafe { release_config(self.config) };
        self.restored = true;
        debug!("fault handler uninstalled");
        Ok(())
    }
}

/// Frees a config that is no longer published in `ACTIVE`, unless a handler may still be using
/// it. That handler is about to `_exit` the process, so the config is leaked instead. Returns
/// whether it was freed.
unsafe fn release_config(config: *mut HandlerConfig) -> bool {
    if IN_FLIGHT.load(Ordering::SeqCst) > 0 {
        debug!("a fault handler is running, leaking its config");
        return false;
    }
    drop(Box::from_raw(config));
    true
}

impl Drop for HandlerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("failed to uninstall the fault handler: {}", e);
        }
    }
}

/// Installs the fault handler for every signal in `config`.
///
/// Only one handler may be installed per process at a time. Every requested strategy must be
/// supported here; see `Capabilities::supports`.
pub fn install(config: HandlerConfig) -> Result<HandlerHandle> {
    if config.strategies.is_empty() {
        return Err(Error::NoStrategies);
    }
    let capabilities = Capabilities::detect();
    for &strategy in &config.strategies {
        if !capabilities.supports(strategy) {
            return Err(Error::StrategyUnavailable(strategy.name()));
        }
    }

    let config = Box::into_raw(Box::new(config));
    if ACTIVE
        .compare_exchange(ptr::null_mut(), config, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        unsafe { drop(Box::from_raw(config)) };
        return Err(Error::AlreadyInstalled);
    }

    let mut handle = HandlerHandle {
        config,
        previous: Vec::new(),
        previous_stack: unsafe { mem::zeroed() },
        alt_stack: None,
        restored: false,
    };
    // On failure dropping the handle undoes whatever was done so far.
    set_up_alt_stack(&mut handle)?;
    set_up_sigaction_handlers(&mut handle)?;

    debug!(
        "fault handler installed for {:?} with {:?}",
        handle.config().signals,
        handle.config().strategies
    );
    Ok(handle)
}

/// Restores the signal actions and alternate stack that were in place before `install`.
pub fn uninstall(mut handle: HandlerHandle) -> Result<()> {
    handle.restore()
}

fn set_up_alt_stack(handle: &mut HandlerHandle) -> Result<()> {
    let size = handle.config().alt_stack_size;
    let mut alt_stack = vec![0u8; size].into_boxed_slice();

    let mut stack: libc::stack_t = unsafe { mem::zeroed() };
    stack.ss_sp = alt_stack.as_mut_ptr() as *mut c_void;
    stack.ss_size = size;
    stack.ss_flags = 0;

    if unsafe { libc::sigaltstack(&stack, &mut handle.previous_stack) } != 0 {
        return Err(Error::AltStack(io::Error::last_os_error()));
    }
    handle.alt_stack = Some(alt_stack);
    Ok(())
}

fn set_up_sigaction_handlers(handle: &mut HandlerHandle) -> Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(fault_handler),
        SaFlags::SA_RESTART | SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );
    let signals = handle.config().signals.clone();
    for signal in signals {
        let previous = unsafe { signal::sigaction(signal, &action) }?;
        handle.previous.push((signal, previous));
    }
    Ok(())
}

/// Unbuffered, unsynchronized writer to stdout.
///
/// The faulting thread may hold the lock of `io::stdout()`, so the handler can't use it.
pub struct RawStdout;

impl Write for RawStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let r =
            unsafe { libc::write(libc::STDOUT_FILENO, buf.as_ptr() as *const c_void, buf.len()) };
        if r < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(r as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

extern "C" fn fault_handler(sig: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    // Must be counted before ACTIVE is read, so `restore` can tell the config is in use.
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let config = match unsafe { ACTIVE.load(Ordering::SeqCst).as_ref() } {
        Some(config) => config,
        None => {
            // Uninstalled while the signal was in flight; let it fault again with the default
            // action.
            if let Ok(signal) = Signal::try_from(sig) {
                let _ = unsafe { signal::signal(signal, SigHandler::SigDfl) };
            }
            IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    };

    match unsafe { FaultContext::from_raw(sig, info, ctx) } {
        Ok(context) => {
            if let Err(e) = report_with_skip(
                &context,
                &config.strategies,
                config.skip_count,
                &mut RawStdout,
            ) {
                debug!("writing the report failed: {}", e);
            }
        }
        Err(e) => {
            let _ = writeln!(RawStdout, "No backtrace: {}", e);
        }
    }

    // The faulted state can't be resumed.
    unsafe { libc::_exit(config.exit_code) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_handler(signal: Signal) -> SigHandler {
        let default_action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let current = unsafe { signal::sigaction(signal, &default_action) }.unwrap();
        unsafe { signal::sigaction(signal, &current) }.unwrap();
        current.handler()
    }

    // Installation is process wide, so the whole lifecycle lives in one test.
    #[test]
    fn install_lifecycle() {
        let config = HandlerConfig::new()
            .strategies(vec![Strategy::SkipHeuristicCallback])
            .signals(vec![Signal::SIGUSR2]);
        if !Strategy::SkipHeuristicCallback.compiled_in() {
            assert!(install(config).is_err());
            return;
        }

        let handle = install(config.clone()).expect("installed");
        assert_eq!(handle.config().signals, vec![Signal::SIGUSR2]);
        assert_eq!(
            current_handler(Signal::SIGUSR2),
            SigHandler::SigAction(fault_handler)
        );

        match install(config.clone()) {
            Err(Error::AlreadyInstalled) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        uninstall(handle).expect("uninstalled");
        assert_eq!(current_handler(Signal::SIGUSR2), SigHandler::SigDfl);

        // Dropping the handle uninstalls as well.
        {
            let _handle = install(config.clone()).expect("installed again");
        }
        assert_eq!(current_handler(Signal::SIGUSR2), SigHandler::SigDfl);

        match install(config.clone().strategies(Vec::new())) {
            Err(Error::NoStrategies) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        if !Capabilities::detect().supports(Strategy::RegisterOverrideCallback) {
            let mixed = config.strategies(vec![
                Strategy::SkipHeuristicCallback,
                Strategy::RegisterOverrideCallback,
            ]);
            match install(mixed) {
                Err(Error::StrategyUnavailable(name)) => {
                    assert_eq!(name, "register-override-callback")
                }
                other => panic!("unexpected {:?}", other.map(|_| ())),
            }
            // Nothing was left behind by the refused install.
            assert_eq!(current_handler(Signal::SIGUSR2), SigHandler::SigDfl);
        }
    }

    #[test]
    fn config_in_use_is_not_freed() {
        let config = Box::into_raw(Box::new(HandlerConfig::new()));
        IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
        assert!(!unsafe { release_config(config) });
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);

        // Still valid after the refused release.
        assert_eq!(unsafe { &*config }.skip_count, DEFAULT_SKIP_COUNT);
        assert!(unsafe { release_config(config) });
    }

    #[test]
    fn default_config() {
        let config = HandlerConfig::default();
        assert_eq!(config.signals, vec![Signal::SIGSEGV]);
        assert!(config.alt_stack_size >= MIN_ALT_STACK_SIZE);
        assert_eq!(config.skip_count, DEFAULT_SKIP_COUNT);
        assert_eq!(config.strategies, Capabilities::detect().strategies());
    }

    #[test]
    fn raw_stdout_writes() {
        writeln!(RawStdout, "raw stdout works").unwrap();
    }
}
