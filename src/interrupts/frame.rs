//! This module contains the register snapshot our entry stubs build on the
//! interrupt stack before calling into Rust.

use x86_64::registers::rflags::RFlags;

/// [TrapFrame] is the stack content seen by a handler, lowest address first:
/// [General purpose registers, pushed by the entry stub, r15 last]
/// [Error Code, pushed by the CPU or a dummy 0 pushed by the stub]
/// [Instruction Pointer]
/// [Code Segment]
/// [RFLAGS]
/// [Stack Pointer]
/// [Stack Segment]
///
/// The stub restores every field on the way out, so a handler changes the
/// interrupted context by writing to the frame (the trap flag, or RAX for a
/// syscall return value).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
  pub r15: u64,
  pub r14: u64,
  pub r13: u64,
  pub r12: u64,
  pub r11: u64,
  pub r10: u64,
  pub r9: u64,
  pub r8: u64,
  pub rbp: u64,
  pub rdi: u64,
  pub rsi: u64,
  pub rdx: u64,
  pub rcx: u64,
  pub rbx: u64,
  pub rax: u64,
  pub error_code: u64,
  pub instruction_pointer: u64,
  pub code_segment: u64,
  pub cpu_flags: u64,
  pub stack_pointer: u64,
  pub stack_segment: u64,
}

impl TrapFrame {
  /// Whether the saved RFLAGS request a single-step trap.
  pub fn trap_flag(&self) -> bool {
    self.flags().contains(RFlags::TRAP_FLAG)
  }

  /// Set or clear the single-step request in the saved RFLAGS.
  pub fn set_trap_flag(&mut self, enabled: bool) {
    let mut flags = self.flags();
    flags.set(RFlags::TRAP_FLAG, enabled);
    self.cpu_flags = flags.bits();
  }

  fn flags(&self) -> RFlags {
    RFlags::from_bits_truncate(self.cpu_flags)
  }
}
