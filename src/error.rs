use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("a fault handler is already installed")]
    AlreadyInstalled,
    #[error("no unwinding strategy is enabled")]
    NoStrategies,
    #[error("strategy {0} is not available on this target")]
    StrategyUnavailable(&'static str),
    #[error("unknown strategy {0:?}")]
    UnknownStrategy(String),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[error("failed to change a signal action")]
    SignalAction(#[from] nix::Error),
    #[error("failed to set up the alternate signal stack")]
    AltStack(#[source] io::Error),
    #[error("failed to write the backtrace")]
    Output(#[from] io::Error),
    #[error(transparent)]
    Context(#[from] faultcontext::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
