use faultcontext::FaultContext;
use thiserror::Error;

/// Most addresses a single backtrace holds.
pub const ADDRESS_COUNT_MAX: usize = 30;

/// Frames the skipping strategy drops before collecting, counted from the caller of
/// `Strategy::run`. In the fault handler these are the reporting entry point, the handler and the
/// kernel trampoline. It is a heuristic, not derived from the context.
pub const DEFAULT_SKIP_COUNT: usize = 3;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("backtrace buffer is full ({} addresses)", ADDRESS_COUNT_MAX)]
pub struct BufferFull;

/// Addresses collected by one unwinding strategy for one fault.
///
/// Storage is inline so that collecting never allocates. Create a fresh state per strategy run.
pub struct BacktraceState<'a> {
    context: &'a FaultContext,
    skip_count: usize,
    count: usize,
    addresses: [usize; ADDRESS_COUNT_MAX],
}

impl<'a> BacktraceState<'a> {
    pub fn new(context: &'a FaultContext) -> Self {
        BacktraceState {
            context,
            skip_count: DEFAULT_SKIP_COUNT,
            count: 0,
            addresses: [0; ADDRESS_COUNT_MAX],
        }
    }

    pub fn with_skip_count(mut self, skip_count: usize) -> Self {
        self.skip_count = skip_count;
        self
    }

    pub fn context(&self) -> &'a FaultContext {
        self.context
    }

    /// Appends `ip` unless it is filtered out.
    ///
    /// Once the buffer is full every call fails and callers should stop unwinding. A zero address
    /// after the first one is dropped: optimized code may have clobbered the link register. An
    /// address equal to the previous one is dropped too, since the register override and the
    /// unwinder's own first callback can both report the same frame. Only the immediately
    /// preceding entry is compared; recursion further apart is kept.
    pub fn add_address(&mut self, ip: usize) -> Result<(), BufferFull> {
        if self.count >= ADDRESS_COUNT_MAX {
            return Err(BufferFull);
        }

        let ip = ip & (self.context.architecture().code_address_mask() as usize);

        if self.count > 0 {
            if ip == 0 {
                return Ok(());
            }
            if ip == self.addresses[self.count - 1] {
                return Ok(());
            }
        }

        self.addresses[self.count] = ip;
        self.count += 1;
        Ok(())
    }

    /// Consumes one unit of the skip budget. Returns false once it is exhausted.
    pub fn take_skip(&mut self) -> bool {
        if self.skip_count > 0 {
            self.skip_count -= 1;
            true
        } else {
            false
        }
    }

    pub fn skip_count(&self) -> usize {
        self.skip_count
    }

    pub fn addresses(&self) -> &[usize] {
        &self.addresses[..self.count]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count >= ADDRESS_COUNT_MAX
    }
}
