//! This crate provides the library code of trap_os: a small x86_64 kernel
//! that emulates devices behind ordinary memory pages by trapping every
//! access to them.

#![cfg_attr(not(test), no_std)]
#![feature(naked_functions)] // enable naked functions for interrupt entry stubs
#![feature(asm_sym)] // enable sym keyword in rust asm
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

#[macro_use]
extern crate lazy_static;

pub mod acpi;
pub mod ata;
pub mod config;
pub mod device;
pub mod fs;
pub mod gdt;
pub mod hardware;
pub mod hook;
pub mod interrupts;
pub mod logger;
pub mod machine;
pub mod memory;
pub mod paging;
pub mod serial;
pub mod syscall;
#[cfg(feature = "qemu-test")]
pub mod test_harness;
pub mod timer;
pub mod trap;
pub mod vga_buffer;

#[cfg(test)]
mod sim;

use x86_64::VirtAddr;

use crate::hardware::X86Hardware;

/// Bring the CPU into the state the trap engine needs: logger, GDT, IDT,
/// remapped PICs, PIT and the identity page table. Interrupts stay
/// disabled; call [x86_64::instructions::interrupts::enable] once the
/// hooks are registered.
pub fn init(physical_memory_offset: VirtAddr) {
  // a second init keeps the first logger
  let _ = logger::init(config::LOG_LEVEL);
  gdt::init_gdt();
  interrupts::init_idt();
  interrupts::init_pics();
  if let Err(error) = timer::init_pit(config::TIMER_FREQUENCY_HZ) {
    log::warn!("timer not started: {}", error);
  }
  machine::init(X86Hardware::new(physical_memory_offset));
}

/// Halt the cpu until the next interrupt occurs using
/// a much cpu-cheap mechanism of the hlt instruction.
pub fn hlt_loop() -> ! {
  loop {
    x86_64::instructions::hlt();
  }
}

/// Stop for good: no interrupt will wake the CPU again.
pub fn halt() -> ! {
  x86_64::instructions::interrupts::disable();
  hlt_loop()
}
