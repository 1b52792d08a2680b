//! Wrappers around `int 0x80`: RAX carries the call number, RBX the
//! argument, RAX the result.

use core::arch::asm;

use trap_os::syscall::number;

fn syscall(call: u64, argument: u64) -> u64 {
  let result: u64;
  unsafe {
    // rbx is reserved by LLVM and cannot be an operand
    asm!(
      "xchg rbx, {argument}",
      "int 0x80",
      "xchg rbx, {argument}",
      argument = inout(reg) argument => _,
      inout("rax") call => result,
    );
  }
  result
}

/// Run `callback` on every timer tick, or stop with `None`.
pub fn register_timer(callback: Option<fn()>) -> u64 {
  syscall(number::REGISTER_TIMER, callback.map_or(0, |f| f as usize as u64))
}

/// Print `value` as `0x%08X`.
pub fn print_hex(value: u32) -> u64 {
  syscall(number::PRINT_HEX, u64::from(value))
}

/// Print a NUL-terminated string.
pub fn print(text: &[u8]) -> u64 {
  debug_assert_eq!(text.last(), Some(&0));
  syscall(number::PRINT, text.as_ptr() as u64)
}
