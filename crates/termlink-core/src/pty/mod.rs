//! PTY session hosting.

mod session;
mod termination;

pub use session::{PtySession, PtySessionOptions, SessionEvent};
pub use termination::{Termination, TerminationPhase};
