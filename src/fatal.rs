//! Fatal-error policy
//!
//! Programmer-error invariants (accounting underflow, impossible states)
//! abort the process after the log line is emitted; there is no recovery
//! path for corrupted internal bookkeeping. The graceful variant raises
//! SIGUSR1 instead, which routes through the normal shutdown sequence for
//! situations where a controlled exit is still safe (e.g. unusable disk
//! state detected at stream creation).

/// Abort after logging. Used via [`fatal_assert!`]; not intended to be
/// called with a recoverable condition.
pub fn fatal_error(message: &str, file: &str, line: u32) -> ! {
    tracing::error!(file, line, "fatal invariant violation: {message}");
    // Give the subscriber a chance to flush before the abort.
    std::process::abort();
}

/// Raise SIGUSR1 so the runtime exits through the shutdown sequence.
pub fn graceful_fatal_error(message: &str, file: &str, line: u32) {
    tracing::error!(file, line, "fatal error, requesting graceful exit: {message}");
    #[allow(unsafe_code)]
    unsafe {
        libc::raise(libc::SIGUSR1);
    }
}

/// Assert an internal invariant; abort the process on violation.
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            $crate::fatal::fatal_error($msg, file!(), line!());
        }
    };
}

/// Assert an invariant where a controlled exit is safe; raises SIGUSR1 on
/// violation instead of aborting.
#[macro_export]
macro_rules! graceful_fatal_assert {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            $crate::fatal::graceful_fatal_error($msg, file!(), line!());
        }
    };
}
