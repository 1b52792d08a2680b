//! This module drives the first serial port (COM1), which carries the
//! kernel log and the output of the QEMU integration tests.

use spin::Mutex;
use uart_16550::SerialPort;

/// I/O base of COM1.
const COM1: u16 = 0x3F8;

lazy_static! {
  /// Global serial port, initialized on first use.
  pub static ref SERIAL1: Mutex<SerialPort> = {
    let mut serial_port = unsafe { SerialPort::new(COM1) };
    serial_port.init();
    Mutex::new(serial_port)
  };
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
  use core::fmt::Write;
  use x86_64::instructions::interrupts;

  // the timer callback may print too, so keep it out while we hold the port
  interrupts::without_interrupts(|| {
    SERIAL1
      .lock()
      .write_fmt(args)
      .expect("Printing to serial failed");
  });
}

/// Prints to the host through the serial interface.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*));
    };
}

/// Prints to the host through the serial interface, appending a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*));
}
