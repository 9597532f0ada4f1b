use std::io;

/// Errors surfaced while setting up or running the reactor stack.
///
/// Runtime invariant violations (wrong-thread access, identity mismatches,
/// double starts) are not represented here; those panic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("worker thread exited before publishing its event loop")]
    WorkerStartup,
}
