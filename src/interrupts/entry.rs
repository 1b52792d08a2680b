//! Naked entry stubs. Each one completes the [super::frame::TrapFrame] on
//! the interrupt stack, hands it to a Rust handler by reference and returns
//! with `iretq`, restoring whatever the handler left in the frame.

/// Wrap an `extern "C" fn(&mut TrapFrame)` in a naked stub usable as an
/// [super::idt::HandlerFunc].
///
/// For vectors where the CPU pushes no error code, pass `"push 0"` as the
/// prologue so every frame has the same layout.
macro_rules! trap_entry {
  ($name:ident => $handler:path $(, $prologue:literal)?) => {
    #[naked]
    pub(super) extern "C" fn $name() -> ! {
      unsafe {
        core::arch::asm!(
          $($prologue,)?
          "cld",
          "push rax",
          "push rbx",
          "push rcx",
          "push rdx",
          "push rsi",
          "push rdi",
          "push rbp",
          "push r8",
          "push r9",
          "push r10",
          "push r11",
          "push r12",
          "push r13",
          "push r14",
          "push r15",
          // rdi is the first argument in the C calling convention; the frame
          // starts at rsp. 21 words leave rsp 8 bytes off 16-byte alignment.
          "mov rdi, rsp",
          "sub rsp, 8",
          "call {handler}",
          "add rsp, 8",
          "pop r15",
          "pop r14",
          "pop r13",
          "pop r12",
          "pop r11",
          "pop r10",
          "pop r9",
          "pop r8",
          "pop rbp",
          "pop rdi",
          "pop rsi",
          "pop rdx",
          "pop rcx",
          "pop rbx",
          "pop rax",
          // drop the error code
          "add rsp, 8",
          "iretq",
          handler = sym $handler,
          options(noreturn)
        );
      }
    }
  };
}

trap_entry!(debug_entry => super::debug_handler, "push 0");
trap_entry!(double_fault_entry => super::double_fault_handler);
trap_entry!(general_protection_entry => super::general_protection_handler);
trap_entry!(page_fault_entry => super::page_fault_handler);
trap_entry!(timer_entry => super::timer_handler, "push 0");
trap_entry!(syscall_entry => super::syscall_handler, "push 0");
