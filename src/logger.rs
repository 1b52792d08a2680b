//! Serial backend for the `log` facade.
//!
//! Records are written to COM1 as `[LEVEL target] message`. The VGA console
//! is left to the user-facing messages printed with [crate::println].

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::serial_println;

struct SerialLogger;

impl Log for SerialLogger {
  fn enabled(&self, metadata: &Metadata<'_>) -> bool {
    metadata.level() <= log::max_level()
  }

  fn log(&self, record: &Record<'_>) {
    if !self.enabled(record.metadata()) {
      return;
    }
    serial_println!("[{:<5} {}] {}", record.level(), record.target(), record.args());
  }

  fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger with the given maximum level.
///
/// Fails if a logger was already installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
  log::set_logger(&LOGGER)?;
  log::set_max_level(level);
  Ok(())
}
