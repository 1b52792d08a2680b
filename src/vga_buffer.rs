//! This module provides the kernel console on top of the VGA text buffer:
//! the [Console] contract used by the syscall gate and the `print!` macros.

use core::result::Result::Ok;
use spin::Mutex;
use volatile::Volatile;

lazy_static! {
    /// Global writer instance that drives the VGA buffer.
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        column_position: 0,
        color_code: ColorCode::new(Color::White, Color::Black),
        /// we know that the buffer locates at memory-mapped address 0xb8000
        buffer: unsafe { &mut *(0xb8000 as *mut Buffer) },
    });
}

/// Output operations the rest of the kernel expects from a text console.
pub trait Console {
  /// Print text as-is; bytes outside printable ASCII show as a block.
  fn print(&mut self, text: &[u8]);

  /// Print `value` as `0x` followed by eight upper-case hex digits.
  fn print_hex(&mut self, value: u32) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = *b"0x00000000";
    for (i, shift) in (0..8).rev().map(|n| n * 4).enumerate() {
      out[2 + i] = DIGITS[((value >> shift) & 0xf) as usize];
    }
    self.print(&out);
  }

  /// Blank the whole screen and move the cursor home.
  fn clear_screen(&mut self);
}

/// Print to the global VGA buffer writer
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::vga_buffer::_print(format_args!($($arg)*)));
}

/// Print ending with newline
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
  use core::fmt::Write;
  use x86_64::instructions::interrupts;

  // a timer callback printing through the syscall gate must not find the
  // writer locked by the code it interrupted
  interrupts::without_interrupts(|| {
    WRITER.lock().write_fmt(args).unwrap();
  });
}

/// Represents the color recognized by VGA
/// Each color occupies at most the small four bits
/// of the underlieing u8
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Color {
  Black = 0,
  Blue = 1,
  Green = 2,
  Cyan = 3,
  Red = 4,
  Magenta = 5,
  Brown = 6,
  LightGray = 7,
  DarkGray = 8,
  LightBlue = 9,
  LightGreen = 10,
  LightCyan = 11,
  LightRed = 12,
  Pink = 13,
  Yellow = 14,
  White = 15,
}

/// ColorCode represents an entire color code byte for VGA,
/// whose layout is <background>|<foreground>.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
  fn new(foreground: Color, background: Color) -> ColorCode {
    let color: u8 = (background as u8) << 4 | foreground as u8;
    Self(color)
  }
}

/// One display cell: an ASCII byte followed by its [ColorCode].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
  ascii_character: u8,
  color_code: ColorCode,
}

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

#[derive(Debug)]
#[repr(transparent)]
struct Buffer {
  chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

/// Writer keeps the cursor column and the current color; text always goes
/// to the bottom row and scrolls up.
#[derive(Debug)]
pub struct Writer {
  column_position: usize,
  color_code: ColorCode,
  buffer: &'static mut Buffer,
}

impl Writer {
  fn write_byte(&mut self, byte: u8) {
    match byte {
      b'\n' => {
        self.new_line();
      }

      byte => {
        if self.column_position >= BUFFER_WIDTH {
          self.new_line();
        }

        let row = BUFFER_HEIGHT - 1;
        let col = self.column_position;
        let color_code = self.color_code;

        self.buffer.chars[row][col].write(ScreenChar {
          ascii_character: byte,
          color_code,
        });

        self.column_position += 1;
      }
    }
  }

  fn new_line(&mut self) {
    for row in 1..BUFFER_HEIGHT {
      for col in 0..BUFFER_WIDTH {
        let c = self.buffer.chars[row][col].read();
        self.buffer.chars[row - 1][col].write(c);
      }
    }
    self.clear_row(BUFFER_HEIGHT - 1);
    self.column_position = 0;
  }

  fn clear_row(&mut self, row: usize) {
    let blank = ScreenChar {
      ascii_character: b' ',
      color_code: self.color_code,
    };
    for col in 0..BUFFER_WIDTH {
      self.buffer.chars[row][col].write(blank);
    }
  }

  fn write_bytes(&mut self, bytes: &[u8]) {
    for &byte in bytes {
      match byte {
        // printable ASCII byte or newline
        0x20..=0x7e | b'\n' => self.write_byte(byte),
        // not part of printable ASCII range
        _ => self.write_byte(0xfe),
      }
    }
  }
}

impl Console for Writer {
  fn print(&mut self, text: &[u8]) {
    self.write_bytes(text);
  }

  fn clear_screen(&mut self) {
    for row in 0..BUFFER_HEIGHT {
      self.clear_row(row);
    }
    self.column_position = 0;
  }
}

impl core::fmt::Write for Writer {
  fn write_str(&mut self, s: &str) -> core::fmt::Result {
    self.write_bytes(s.as_bytes());
    Ok(())
  }
}
