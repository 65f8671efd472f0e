//! Kernel logging facility
//!
//! Provides thread-safe logging functionality for the kernel using the `log`
//! crate. The core has no device drivers, so records are kept in a bounded
//! in-memory buffer that the embedder (or the tests) can drain.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Most recent records kept before the oldest are dropped.
const CAPTURE_CAPACITY: usize = 256;

/// Thread-safe logger implementation
pub struct Logger {
    records: Mutex<VecDeque<String>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a new logger instance
    pub const fn new() -> Logger {
        Logger {
            records: Mutex::new(VecDeque::new()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message" and appends them to the
    /// capture buffer, dropping the oldest record once full.
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut records = self.records.lock();
            if records.len() == CAPTURE_CAPACITY {
                records.pop_front();
            }
            records.push_back(format!("[{}] {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Initializes the logging system.
///
/// Idempotent: only the first caller installs the logger. Sets different
/// log levels for debug/release builds:
///   - Debug builds: LevelFilter::Debug
///   - Release builds: LevelFilter::Info
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(
            #[cfg(debug_assertions)]
            LevelFilter::Debug,
            #[cfg(not(debug_assertions))]
            LevelFilter::Info,
        );
    }
}

/// Drains and returns everything logged since the last call.
pub fn take_records() -> Vec<String> {
    LOGGER.records.lock().drain(..).collect()
}
