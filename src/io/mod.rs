//! I/O layer - process invocation and duplex streaming
//!
//! - **Transport**: multiplexes a child's stdin and stdout in one loop
//! - **Process**: spawns one child per invocation and reports its exit status
//!
//! Nothing here knows about GPG; the `gpg` module builds invocations and
//! interprets their output.

pub mod process;
pub mod transport;

pub use process::{CommandRunner, Invocation, ProcessError, ProcessOutput, SubprocessRunner};
pub use transport::{PumpOptions, PumpOutcome, TransportError, pump};
