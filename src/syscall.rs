//! The `int 0x80` syscall gate.
//!
//! RAX holds the 1-based syscall number, RBX the single argument. On return
//! RAX holds 0, or [SYSCALL_FAILED] if the call could not be performed.
//!
//! | RAX | call                | RBX                                  |
//! |-----|---------------------|--------------------------------------|
//! | 1   | register timer      | callback address, 0 to remove        |
//! | 2   | print hex           | value, low 32 bits                   |
//! | 3   | print string        | address of a NUL-terminated string   |

use core::fmt;

use crate::interrupts::frame::TrapFrame;
use crate::timer::TimerCallback;
use crate::vga_buffer::Console;

/// RAX value returned for a failed call.
pub const SYSCALL_FAILED: u64 = u64::MAX;

/// Longest string the print call will read before giving up on the NUL.
pub const MAX_PRINT_LEN: usize = 4096;

/// Bytes copied out of the caller's string per console write.
const PRINT_CHUNK: usize = 64;

/// Syscall numbers.
pub mod number {
  /// Register (or remove) the timer callback.
  pub const REGISTER_TIMER: u64 = 1;
  /// Print a 32-bit value as hex.
  pub const PRINT_HEX: u64 = 2;
  /// Print a NUL-terminated string.
  pub const PRINT: u64 = 3;
}

/// A decoded syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
  /// Replace the timer callback.
  RegisterTimer(Option<TimerCallback>),
  /// Print a value as `0x%08X`.
  PrintHex(u32),
  /// Print the NUL-terminated string at this address.
  Print(u64),
}

/// Why a syscall failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
  /// RAX does not name a syscall.
  Unknown(u64),
  /// The string argument was a null pointer.
  NullPointer,
}

impl fmt::Display for SyscallError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SyscallError::Unknown(number) => write!(f, "unknown syscall {}", number),
      SyscallError::NullPointer => write!(f, "null string pointer"),
    }
  }
}

impl Syscall {
  /// Decode the saved registers. Every RAX value maps to a call or to
  /// [SyscallError::Unknown].
  pub fn decode(frame: &TrapFrame) -> Result<Self, SyscallError> {
    let argument = frame.rbx;
    match frame.rax {
      number::REGISTER_TIMER => Ok(Syscall::RegisterTimer(timer_callback(argument))),
      number::PRINT_HEX => Ok(Syscall::PrintHex(argument as u32)),
      number::PRINT if argument == 0 => Err(SyscallError::NullPointer),
      number::PRINT => Ok(Syscall::Print(argument)),
      other => Err(SyscallError::Unknown(other)),
    }
  }
}

fn timer_callback(address: u64) -> Option<TimerCallback> {
  if address == 0 {
    None
  } else {
    // the caller hands us the address of a `fn()` in the flat address space
    Some(unsafe { core::mem::transmute::<usize, TimerCallback>(address as usize) })
  }
}

/// The kernel services a syscall reaches. Each method takes whatever lock
/// it needs and releases it before returning, so a caller's memory is
/// never touched while the machine or the console is held.
pub trait SyscallHost {
  /// Load one byte of the caller's memory. A hooked page faults here and
  /// is serviced by the trap engine like any other access.
  ///
  /// # Safety
  /// `address` must be readable by the caller.
  unsafe fn read_byte(&mut self, address: u64) -> u8;

  /// Replace the timer callback.
  fn register_timer_handler(&mut self, callback: Option<TimerCallback>);

  /// Run `f` with the console held.
  fn with_console(&mut self, f: &mut dyn FnMut(&mut dyn Console));
}

/// Copy the NUL-terminated string at `address` to the console, at most
/// [MAX_PRINT_LEN] bytes. The string is copied out in chunks so the console
/// is only held while printing bytes already read.
///
/// # Safety
/// `address` must be readable up to the NUL or the cap.
unsafe fn print_string(host: &mut impl SyscallHost, address: u64) {
  let mut chunk = [0u8; PRINT_CHUNK];
  let mut read = 0;
  loop {
    let mut len = 0;
    let mut done = false;
    while len < PRINT_CHUNK {
      if read == MAX_PRINT_LEN {
        done = true;
        break;
      }
      let byte = unsafe { host.read_byte(address + read as u64) };
      if byte == 0 {
        done = true;
        break;
      }
      chunk[len] = byte;
      len += 1;
      read += 1;
    }
    if len > 0 {
      host.with_console(&mut |console| console.print(&chunk[..len]));
    }
    if done {
      return;
    }
  }
}

/// Perform the call described by `frame` and store the result in RAX.
pub fn dispatch(host: &mut impl SyscallHost, frame: &mut TrapFrame) -> Result<(), SyscallError> {
  log::trace!("syscall {} ({:#x})", frame.rax, frame.rbx);
  let result = Syscall::decode(frame).map(|call| match call {
    Syscall::RegisterTimer(callback) => host.register_timer_handler(callback),
    Syscall::PrintHex(value) => host.with_console(&mut |console| console.print_hex(value)),
    Syscall::Print(address) => unsafe { print_string(host, address) },
  });

  frame.rax = match result {
    Ok(()) => 0,
    Err(_) => SYSCALL_FAILED,
  };
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::device::VaultDevice;
  use crate::hardware::Hardware;
  use crate::machine::Machine;
  use crate::paging::{IdentityPageTable, PAGE_SIZE};
  use crate::sim::{self, SimulatedHardware};
  use crate::trap::TrapState;
  use spin::Mutex;
  use x86_64::VirtAddr;

  #[derive(Default)]
  struct Transcript(Vec<u8>);

  impl Console for Transcript {
    fn print(&mut self, text: &[u8]) {
      self.0.extend_from_slice(text);
    }

    fn clear_screen(&mut self) {
      self.0.clear();
    }
  }

  /// The kernel side of the gate over simulated memory. Locks are modelled
  /// the way the interrupt handlers take them: the trap engine only gets
  /// the machine through `try_lock`.
  struct SimHost {
    machine: Mutex<Box<Machine<SimulatedHardware>>>,
    console: Mutex<Transcript>,
  }

  impl SimHost {
    fn new() -> Self {
      SimHost {
        machine: Mutex::new(Box::new(Machine::new(SimulatedHardware::new()))),
        console: Mutex::new(Transcript::default()),
      }
    }

    fn place(&self, address: u64, bytes: &[u8]) {
      let mut machine = self.machine.lock();
      for (i, &byte) in bytes.iter().enumerate() {
        let at = address as usize + i;
        let page = IdentityPageTable::page_at(at / PAGE_SIZE);
        machine.hardware_mut().page_mut(page).0[at % PAGE_SIZE] = byte;
      }
    }

    fn output(&self) -> Vec<u8> {
      self.console.lock().0.clone()
    }
  }

  impl SyscallHost for SimHost {
    unsafe fn read_byte(&mut self, address: u64) -> u8 {
      assert!(self.console.try_lock().is_some(), "string read with the console held");
      let mut machine = self.machine.try_lock().expect("string read with the machine held");
      sim::load_u8(&mut machine, VirtAddr::new(address)).unwrap()
    }

    fn register_timer_handler(&mut self, callback: Option<TimerCallback>) {
      self.machine.lock().register_timer_handler(callback);
    }

    fn with_console(&mut self, f: &mut dyn FnMut(&mut dyn Console)) {
      f(&mut *self.console.lock());
    }
  }

  fn call(number: u64, argument: u64) -> TrapFrame {
    TrapFrame {
      rax: number,
      rbx: argument,
      ..TrapFrame::default()
    }
  }

  fn on_tick() {}

  #[test]
  fn test_register_timer_takes_effect_on_next_tick() {
    let mut host = SimHost::new();
    assert_eq!(host.machine.lock().timer.tick(), None);

    let mut frame = call(number::REGISTER_TIMER, on_tick as usize as u64);
    dispatch(&mut host, &mut frame).unwrap();

    assert_eq!(frame.rax, 0);
    let callback = host.machine.lock().timer.tick().expect("callback registered");
    assert_eq!(callback as usize, on_tick as usize);

    let mut frame = call(number::REGISTER_TIMER, 0);
    dispatch(&mut host, &mut frame).unwrap();
    assert_eq!(host.machine.lock().timer.tick(), None);
  }

  #[test]
  fn test_print_calls() {
    let mut host = SimHost::new();
    host.place(0x5000, b"[User Mode] Hello!\n\0ignored");

    dispatch(&mut host, &mut call(number::PRINT, 0x5000)).unwrap();
    dispatch(&mut host, &mut call(number::PRINT_HEX, 0x1_CAFE_BABF)).unwrap();

    assert_eq!(host.output(), b"[User Mode] Hello!\n0xCAFEBABF");
  }

  #[test]
  fn test_long_string_is_printed_in_chunks() {
    let mut host = SimHost::new();
    let text: Vec<u8> = (0..200).map(|i| b'a' + (i % 26) as u8).collect();
    host.place(0x6000, &text);

    dispatch(&mut host, &mut call(number::PRINT, 0x6000)).unwrap();
    assert_eq!(host.output(), text);
  }

  #[test]
  fn test_print_from_hooked_page_goes_through_the_device() {
    static VAULT: VaultDevice = VaultDevice::new();
    let mut host = SimHost::new();
    host
      .machine
      .lock()
      .register_hook(VirtAddr::new(0x1f_0000), &VAULT)
      .unwrap();

    let mut frame = call(number::PRINT, 0x1f_0000);
    dispatch(&mut host, &mut frame).unwrap();

    assert_eq!(frame.rax, 0);
    // every byte load faults, each one injects the next value at offset 0
    assert_eq!(VAULT.reads(), 5);
    assert_eq!(host.output(), [0xBF, 0xBA, 0xFE, 0xCA]);
    let machine = host.machine.lock();
    assert_eq!(machine.trap_state(), TrapState::Hidden);
    assert!(!machine.page_table().is_present(VirtAddr::new(0x1f_0000)));
  }

  #[test]
  fn test_unknown_numbers_fail_cleanly() {
    let mut host = SimHost::new();

    for number in [0, 4, 0x80, u64::MAX] {
      let mut frame = call(number, 0xdead);
      assert_eq!(dispatch(&mut host, &mut frame), Err(SyscallError::Unknown(number)));
      assert_eq!(frame.rax, SYSCALL_FAILED);
    }
    assert!(host.output().is_empty());
    assert_eq!(host.machine.lock().timer().callback(), None);
  }

  #[test]
  fn test_null_string_is_refused() {
    let frame = call(number::PRINT, 0);
    assert_eq!(Syscall::decode(&frame), Err(SyscallError::NullPointer));
  }

  #[test]
  fn test_unterminated_string_is_capped() {
    let mut host = SimHost::new();
    host.place(0x8000, &[b'x'; MAX_PRINT_LEN + 16]);

    dispatch(&mut host, &mut call(number::PRINT, 0x8000)).unwrap();
    assert_eq!(host.output().len(), MAX_PRINT_LEN);
  }
}
