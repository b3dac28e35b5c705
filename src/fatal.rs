//! Unrecoverable faults.
//!
//! These macros are for broken invariants only. They log a `crit` record to the given logger and
//! then panic; nothing is cleaned up.

/// Log a fatal error and panic.
///
/// The first argument is a `slog::Logger`, the second a `&str` describing the fault.
macro_rules! fatal {
    ($log:expr, $msg:expr) => {{
        crit!($log, "fatal error"; "reason" => $msg);
        panic!("fatal error: {}", $msg)
    }};
}

/// Fail fatally unless a condition holds.
macro_rules! precond {
    ($log:expr, $cond:expr) => {
        if !$cond {
            fatal!($log, concat!("failed precondition (", stringify!($cond), ")"));
        }
    };
}
