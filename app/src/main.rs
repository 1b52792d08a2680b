//! The application the kernel loads from disk. It greets through the
//! syscall gate, reads and resets the vault device and leaves a timer
//! callback behind when it returns.

#![no_std]
#![no_main]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU32, Ordering};

use trap_os::config::{TIMER_FREQUENCY_HZ, VAULT_DEVICE_ADDRESS};
use trap_os::device::VAULT_RESET;

mod syscall;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// One dot per second of ticks.
fn on_tick() {
  if TICKS.fetch_add(1, Ordering::Relaxed) % TIMER_FREQUENCY_HZ == 0 {
    syscall::print(b".\0");
  }
}

/// Entry point, linked first so it sits at the load address.
#[no_mangle]
#[link_section = ".text.entry"]
pub extern "C" fn start_app() {
  syscall::print(b"[User Mode] Hello! I was loaded from the filesystem!\n\0");

  let device = VAULT_DEVICE_ADDRESS as *mut u32;
  // each access faults into the vault
  let value = unsafe { core::ptr::read_volatile(device) };
  syscall::print(b"[User Mode] vault says \0");
  syscall::print_hex(value);
  syscall::print(b"\n\0");
  unsafe { core::ptr::write_volatile(device, VAULT_RESET) };

  syscall::register_timer(Some(on_tick));
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
  syscall::print(b"[User Mode] panic\n\0");
  trap_os::hlt_loop()
}
