//! FILENAME: engine/src/logging.rs
//! PURPOSE: Category-tagged logging macros for the engine.
//! CONTEXT: Every engine log line carries a short category tag
//! ("RESOLVER", "AGGREGATE", "MIGRATE", "JOBS") and a process-wide sequence
//! number, then goes through the `log` facade so the host application decides
//! where it ends up.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global sequence counter for engine log lines
static LOG_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst) + 1
}

/// Forwards one tagged line to the `log` facade.
pub fn write_log(level: &str, category: &str, message: &str) {
    let level = match level {
        "D" => log::Level::Debug,
        "I" => log::Level::Info,
        "W" => log::Level::Warn,
        _ => log::Level::Error,
    };
    log::log!(target: category, level, "[{}] {}", next_seq(), message);
}

// ============================================================================
// MACRO DEFINITIONS & EXPORTS
// ============================================================================

#[macro_export]
macro_rules! log_debug {
    ($cat:expr, $($arg:tt)*) => {
        $crate::logging::write_log("D", $cat, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($cat:expr, $($arg:tt)*) => {
        $crate::logging::write_log("I", $cat, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($cat:expr, $($arg:tt)*) => {
        $crate::logging::write_log("W", $cat, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($cat:expr, $($arg:tt)*) => {
        $crate::logging::write_log("E", $cat, &format!($($arg)*))
    };
}
