use std::io::{self, Write};

use super::collector::BacktraceState;
use super::strategy::Strategy;
use super::symbolizer::{self, ResolvedFrame};

/// Writes one frame as `  #NN:  0x<relative address>  <name>`.
pub fn write_frame<W: Write>(out: &mut W, index: usize, frame: &ResolvedFrame) -> io::Result<()> {
    writeln!(
        out,
        "  #{:02}:  0x{:x}  {}",
        index,
        frame.relative_address,
        frame.display_name()
    )
}

/// Writes already resolved frames, in order.
pub fn render<'a, W, I>(out: &mut W, frames: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a ResolvedFrame>,
{
    for (index, frame) in frames.into_iter().enumerate() {
        write_frame(out, index, frame)?;
    }
    Ok(())
}

/// Resolves every address collected by `strategy` and writes the block for it.
///
/// Frames are resolved one at a time as they are written.
pub fn print_backtrace<W: Write>(
    out: &mut W,
    strategy: Strategy,
    state: &BacktraceState,
) -> io::Result<()> {
    writeln!(out, "Backtrace captured using {}:", strategy)?;
    for (index, &address) in state.addresses().iter().enumerate() {
        let frame = symbolizer::resolve(address);
        write_frame(out, index, &frame)?;
    }
    Ok(())
}
