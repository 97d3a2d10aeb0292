//! Kernel console output and the `log` backend.
//!
//! All diagnostics funnel through one byte sink, installed by the board
//! layer as early as possible (before the MMU is even on, the boot code
//! installs the early console here). `kprint!`/`kprintln!` format directly
//! to the sink; the [`log`] facade is routed to the same place with a
//! level/target prefix.

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::RwLock;

use crate::sync::ReentrantSpinlock;

/// The installed console byte sink. `None` until the board console is up;
/// output is dropped silently in that window.
static PUTCHAR: RwLock<Option<fn(u8)>> = RwLock::new(None);

/// Serializes whole writes so concurrent output does not interleave.
/// Reentrant: a panic or fault handler printing while its own process
/// already holds the console gets through instead of deadlocking.
static CONSOLE_LOCK: ReentrantSpinlock = ReentrantSpinlock::new();

struct Console;

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(putchar) = *PUTCHAR.read() {
            for byte in s.bytes() {
                if byte == b'\n' {
                    putchar(b'\r');
                }
                putchar(byte);
            }
        }
        Ok(())
    }
}

/// Install the console byte sink.
pub fn set_console(putchar: fn(u8)) {
    *PUTCHAR.write() = Some(putchar);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    CONSOLE_LOCK.take();
    // Write never fails; the sink has no error path.
    let _ = Console.write_fmt(args);
    CONSOLE_LOCK.release();
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

/// `log::Log` implementation writing to the kernel console.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            kprintln!("[{:5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Called once during bootstrap; later calls
/// are ignored (the `log` facade only accepts one logger).
pub fn init_logger(max_level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::sync::Mutex;
    use std::{string::String, vec::Vec};

    use super::*;

    static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn capture_byte(b: u8) {
        CAPTURED.lock().unwrap().push(b);
    }

    // One test owns the global sink; split assertions would race on it.
    #[test]
    fn test_print_goes_through_installed_sink() {
        set_console(capture_byte);
        CAPTURED.lock().unwrap().clear();
        kprint!("ok {}", 42);
        let bytes = CAPTURED.lock().unwrap().clone();
        assert_eq!(String::from_utf8(bytes).unwrap(), "ok 42");

        CAPTURED.lock().unwrap().clear();
        kprint!("\n");
        let bytes = CAPTURED.lock().unwrap().clone();
        assert_eq!(bytes, b"\r\n");
    }
}
