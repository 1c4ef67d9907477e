//! Kernel logging facility
//!
//! Routes the `log` crate's macros to the console layer's "write string"
//! primitive. The console is an external collaborator, so it is injected
//! at [`init`] rather than linked in; until then log records are dropped.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Byte-oriented write-string primitive supplied by the console/serial
/// layer. Its return value, if it had one, would not be consulted.
pub type ConsoleWrite = fn(&str);

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

const LINE_CAPACITY: usize = 256;

/// Formats each record into a fixed stack buffer and hands the finished
/// line to the console. No heap involved; the heap depends on this
/// module's users, not the other way around.
pub struct Logger {
    console: Mutex<Option<ConsoleWrite>>,
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            console: Mutex::new(None),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

struct LineBuffer {
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            bytes: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        // Only ever filled from &str fragments, so this stays valid UTF-8.
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let take = s.len().min(room);
        // Truncate on a char boundary so as_str never sees a torn char.
        let mut take = take;
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let guard = self.console.lock();
        if let Some(console) = *guard {
            let mut line = LineBuffer::new();
            let _ = write!(line, "[{}] {}\n", record.level(), record.args());
            console(line.as_str());
        }
    }

    fn flush(&self) {}
}

/// Wires the console in and registers the logger with the `log` facade.
///
/// Log levels follow the build configuration the way the rest of the
/// kernel family does it: `Debug` in debug builds, `Info` in release.
pub fn init(console: ConsoleWrite) {
    *LOGGER.console.lock() = Some(console);
    let _ = log::set_logger(&LOGGER).map(|()| {
        log::set_max_level({
            #[cfg(debug_assertions)]
            {
                LevelFilter::Debug
            }
            #[cfg(not(debug_assertions))]
            {
                LevelFilter::Info
            }
        })
    });
}
