//! This module contains the kernel's interrupt handling: the IDT, the 8259
//! PIC pair and the Rust handlers that the naked entry stubs call into.
//!
//! | vector | source              | handler                      |
//! |--------|---------------------|------------------------------|
//! | 1      | single-step trap    | second half of a device trap |
//! | 8      | double fault        | fatal, on its own stack      |
//! | 13     | general protection  | fatal                        |
//! | 14     | page fault          | first half of a device trap  |
//! | 32     | PIT (IRQ0)          | tick and timer callback      |
//! | 0x80   | `int 0x80`          | syscall gate                 |

use core::fmt::{self, Write};

use pic8259::ChainedPics;
use spin::Mutex;

use crate::config::{PIC_1_OFFSET, PIC_2_OFFSET};
use crate::syscall::{self, SyscallHost};
use crate::timer::TimerCallback;
use crate::vga_buffer::{self, Console};
use crate::{gdt, machine};

mod entry;
pub mod frame;
pub mod idt;

use frame::TrapFrame;
use idt::{EntryOptions, Idt};

/// Debug exception, raised after one instruction when TF is set.
pub const DEBUG_VECTOR: u8 = 1;
/// Double fault.
pub const DOUBLE_FAULT_VECTOR: u8 = 8;
/// General protection fault.
pub const GENERAL_PROTECTION_VECTOR: u8 = 13;
/// Page fault.
pub const PAGE_FAULT_VECTOR: u8 = 14;
/// IRQ0, the PIT.
pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
/// Software interrupt used as the syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Only IRQ0 is unmasked on the master PIC.
const MASTER_MASK: u8 = 0xFE;
/// Every slave line stays masked.
const SLAVE_MASK: u8 = 0xFF;

/// The two cascaded 8259 PICs, remapped past the CPU exceptions.
pub static PICS: Mutex<ChainedPics> =
  Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

lazy_static! {
  static ref IDT: Idt = {
    let mut idt = Idt::new();
    idt.set_handler(DEBUG_VECTOR, entry::debug_entry, EntryOptions::new());
    // the TSS table is 0-based, the descriptor field is 1-based
    let mut double_fault = EntryOptions::new();
    double_fault.set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX + 1);
    idt.set_handler(DOUBLE_FAULT_VECTOR, entry::double_fault_entry, double_fault);
    idt.set_handler(GENERAL_PROTECTION_VECTOR, entry::general_protection_entry, EntryOptions::new());
    idt.set_handler(PAGE_FAULT_VECTOR, entry::page_fault_entry, EntryOptions::new());
    idt.set_handler(TIMER_VECTOR, entry::timer_entry, EntryOptions::new());
    idt.set_handler(SYSCALL_VECTOR, entry::syscall_entry, EntryOptions::new());
    idt
  };
}

/// Every vector with a handler installed.
pub const INSTALLED_VECTORS: [u8; 6] = [
  DEBUG_VECTOR,
  DOUBLE_FAULT_VECTOR,
  GENERAL_PROTECTION_VECTOR,
  PAGE_FAULT_VECTOR,
  TIMER_VECTOR,
  SYSCALL_VECTOR,
];

/// Load the interrupt descriptor table
pub fn init_idt() {
  IDT.load();
  for vector in INSTALLED_VECTORS {
    let entry = IDT.entry(vector);
    log::debug!(
      "vector {:#04x} -> {:#x}, options {:#06x}",
      vector,
      entry.handler_address(),
      entry.options().bits()
    );
  }
  log::info!("IDT loaded, {} gates", INSTALLED_VECTORS.len());
}

/// Remap both PICs to [PIC_1_OFFSET]/[PIC_2_OFFSET] and leave only the
/// timer line open.
pub fn init_pics() {
  let mut pics = PICS.lock();
  unsafe {
    pics.initialize();
    pics.write_masks(MASTER_MASK, SLAVE_MASK);
  }
  log::info!(
    "PIC remapped to {:#x}/{:#x}, masks {:#04x}/{:#04x}",
    PIC_1_OFFSET,
    PIC_2_OFFSET,
    MASTER_MASK,
    SLAVE_MASK
  );
}

/// Report an exception the kernel cannot recover from and stop the CPU.
///
/// The screen only gets the report if the writer is free: the fault may
/// have hit code that holds it.
fn fatal(what: &str, reason: &dyn fmt::Display, frame: &TrapFrame) -> ! {
  log::error!("{}: {}", what, reason);
  if let Some(mut writer) = vga_buffer::WRITER.try_lock() {
    let _ = writeln!(writer, "EXCEPTION: {}\n{}\n{:#x?}", what, reason, frame);
  }
  crate::halt()
}

struct Locked;

impl fmt::Display for Locked {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "raised while the machine state was locked")
  }
}

extern "C" fn debug_handler(frame: &mut TrapFrame) {
  let mut machine = match machine::try_lock() {
    Some(machine) => machine,
    None => fatal("DEBUG", &Locked, frame),
  };
  let result = machine.single_step(frame);
  drop(machine);
  if let Err(error) = result {
    fatal("DEVICE TRAP", &error, frame);
  }
}

extern "C" fn double_fault_handler(frame: &mut TrapFrame) -> ! {
  fatal("DOUBLE FAULT", &format_args!("error code {:#x}", frame.error_code), frame)
}

extern "C" fn general_protection_handler(frame: &mut TrapFrame) -> ! {
  fatal(
    "GENERAL PROTECTION FAULT",
    &format_args!("error code {:#x}", frame.error_code),
    frame,
  )
}

extern "C" fn page_fault_handler(frame: &mut TrapFrame) {
  let mut machine = match machine::try_lock() {
    Some(machine) => machine,
    None => fatal("PAGE FAULT", &Locked, frame),
  };
  let result = machine.page_fault(frame);
  drop(machine);
  if let Err(error) = result {
    fatal("PAGE FAULT", &error, frame);
  }
}

extern "C" fn timer_handler(_frame: &mut TrapFrame) {
  let callback = machine::lock().timer.tick();
  unsafe {
    PICS.lock().notify_end_of_interrupt(TIMER_VECTOR);
  }
  // run after EOI and without the machine lock: callbacks use the syscall gate
  if let Some(callback) = callback {
    callback();
  }
}

/// The syscall gate's view of the running kernel.
struct KernelServices;

impl SyscallHost for KernelServices {
  unsafe fn read_byte(&mut self, address: u64) -> u8 {
    unsafe { core::ptr::read_volatile(address as *const u8) }
  }

  fn register_timer_handler(&mut self, callback: Option<TimerCallback>) {
    machine::lock().register_timer_handler(callback);
  }

  fn with_console(&mut self, f: &mut dyn FnMut(&mut dyn Console)) {
    f(&mut *vga_buffer::WRITER.lock());
  }
}

extern "C" fn syscall_handler(frame: &mut TrapFrame) {
  if let Err(error) = syscall::dispatch(&mut KernelServices, frame) {
    log::warn!("{}", error);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_vectors_do_not_collide() {
    let vectors = INSTALLED_VECTORS;
    for (i, a) in vectors.iter().enumerate() {
      for b in &vectors[i + 1..] {
        assert_ne!(a, b);
      }
    }
    // hardware lines sit past the 32 CPU exceptions
    assert!(PIC_1_OFFSET >= 32);
    assert_eq!(TIMER_VECTOR, 0x20);
  }

  #[test]
  fn test_only_the_timer_line_is_open() {
    assert_eq!(!MASTER_MASK, 1 << 0);
    assert_eq!(SLAVE_MASK, 0xFF);
  }
}
