//! This modules defines the IDT (Interrupt Descriptor Table) type for
//! x86_64 long mode. Handlers are the naked entry stubs of
//! [super::entry], which take care of the calling convention themselves.

use x86_64::instructions::segmentation;
use x86_64::registers::segmentation::Segment;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

/// Number of vectors an x86_64 CPU can deliver.
pub const IDT_ENTRIES: usize = 256;

/// IDT is just an array of IDT entries, one per vector:
/// 0..=31 are CPU exceptions (1 -> Debug, 8 -> Double fault,
/// 13 -> General protection fault, 14 -> Page fault, ...), 32..=47 are the
/// remapped PIC lines and the rest are free for software interrupts such as
/// `int 0x80`.
/// See https://wiki.osdev.org/Exceptions for detailed reference
#[repr(C, align(16))]
pub struct Idt([Entry; IDT_ENTRIES]);

impl Idt {
  /// Create an IDT with every entry missing
  pub fn new() -> Self {
    Self([Entry::missing(); IDT_ENTRIES])
  }

  /// Install `handler` at `vector`, running in the current code segment.
  pub fn set_handler(&mut self, vector: u8, handler: HandlerFunc, options: EntryOptions) {
    self.set_handler_in(segmentation::CS::get_reg(), vector, handler, options);
  }

  /// Install `handler` at `vector`, running in the segment `selector`.
  pub fn set_handler_in(
    &mut self,
    selector: SegmentSelector,
    vector: u8,
    handler: HandlerFunc,
    options: EntryOptions,
  ) {
    let mut entry = Entry::new(selector, handler);
    entry.options = options;
    self.0[vector as usize] = entry;
  }

  /// The entry for `vector`.
  pub fn entry(&self, vector: u8) -> Entry {
    self.0[vector as usize]
  }

  /// Load the IDT for the cpu to use
  /// * `&'static self` we need self to live for the whole lifetime of the program.
  /// Otherwise, cpu might read freed memory where it thinks the IDT resides.
  pub fn load(&'static self) {
    use core::mem::size_of;
    use x86_64::instructions::tables::{lidt, DescriptorTablePointer};

    let ptr = DescriptorTablePointer {
      base: x86_64::VirtAddr::new(self as *const _ as u64),
      // limit is the maximum-addressible byte, which is size - 1.
      limit: (size_of::<Self>() - 1) as u16,
    };

    unsafe { lidt(&ptr) };
  }
}

/// An IDT entry of the following format:
/// Type		Name			Description
/// u16			pointer_low		lower bits of the address of handler function
/// u16			gdt selector	selector of a code segment in the GDT.
/// u16			Options			See [EntryOptions]
/// u16			pointer_mid		middle bits of the address of handler function
/// u32			pointer_high	upper bits of the address of handler function
/// u32			reserved
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Entry {
  pointer_low: u16,
  gdt_selector: SegmentSelector,
  options: EntryOptions,
  pointer_middle: u16,
  pointer_high: u32,
  reserved: u32,
}

impl Entry {
  /// Create a present interrupt-gate entry for `handler`
  pub fn new(gdt_selector: SegmentSelector, handler: HandlerFunc) -> Self {
    let pointer = handler as u64;
    Entry {
      gdt_selector,
      pointer_low: pointer as u16,
      pointer_middle: (pointer >> 16) as u16,
      pointer_high: (pointer >> 32) as u32,
      options: EntryOptions::new(),
      reserved: 0,
    }
  }

  /// Create a missing IDT entry
  fn missing() -> Self {
    Entry {
      gdt_selector: SegmentSelector::new(0, PrivilegeLevel::Ring0),
      pointer_low: 0,
      pointer_middle: 0,
      pointer_high: 0,
      options: EntryOptions::minimal(),
      reserved: 0,
    }
  }

  /// Address of the handler.
  pub fn handler_address(&self) -> u64 {
    let (low, middle, high) = (self.pointer_low, self.pointer_middle, self.pointer_high);
    u64::from(low) | u64::from(middle) << 16 | u64::from(high) << 32
  }

  /// The option bits.
  pub fn options(&self) -> EntryOptions {
    self.options
  }
}

/// EntryOptions wraps a 16-bit integer with the following structure:
/// Bits		Name							Description
/// 0-2			Interrupt Stack Table Index		0: don't switch stack, 1-7: switch to the nth stack in the table
/// 3-7			Reserved
/// 8			0: Interrupt Gate, 1: Trap Gate	If 0, disable hardware interrupts
/// 9-11		Must be 1
/// 12			Must be 0
/// 13-14		Descriptor Privilage Level		The minimal privilege level required for calling this handler.
/// 15			Present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions(u16);

const MINIMAL_VALID_OPTION: u16 = 0b0000111000000000;

impl EntryOptions {
  /// Create a new option with all 0s except must-1 bits
  pub fn minimal() -> Self {
    EntryOptions(MINIMAL_VALID_OPTION)
  }

  /// Present interrupt gate, DPL 0, no stack switch.
  pub fn new() -> Self {
    let mut opt = Self::minimal();
    opt.set_present(true).disable_interrupts(true);
    opt
  }

  /// Raw bits as stored in the descriptor.
  pub fn bits(&self) -> u16 {
    self.0
  }

  /// Set the present bit of the option.
  pub fn set_present(&mut self, present: bool) -> &mut Self {
    if present {
      self.0 |= 1 << 15;
    } else {
      self.0 &= !(1 << 15);
    }

    self
  }

  /// Choose between an interrupt gate (`true`) and a trap gate.
  pub fn disable_interrupts(&mut self, disable: bool) -> &mut Self {
    if disable {
      self.0 &= !(1 << 8);
    } else {
      self.0 |= 1 << 8;
    }

    self
  }

  /// Set the raw IST field: 0 keeps the current stack, `n` switches to
  /// `interrupt_stack_table[n - 1]` of the TSS.
  pub fn set_stack_index(&mut self, index: u16) -> &mut Self {
    if index >= 8 {
      panic!("Invalid stack index {}", index);
    }
    self.0 = (self.0 & 0xfff8) | index;

    self
  }
}

/// Type for interrupt entry points.
/// The CPU does not use `call` and `ret` with these: it jumps to them with
/// the interrupt frame on the stack and expects `iretq` back, so from Rust's
/// point of view they never return.
pub type HandlerFunc = extern "C" fn() -> !;

#[cfg(test)]
mod tests {
  use super::*;

  extern "C" fn never_called() -> ! {
    loop {}
  }

  #[test]
  fn test_default() {
    let opt = EntryOptions::minimal();
    assert_eq!(MINIMAL_VALID_OPTION, opt.bits());
  }

  #[test]
  fn test_stack_index() {
    let mut opt = EntryOptions::minimal();
    opt.set_stack_index(7);
    assert_eq!(0b0000111000000111, opt.bits());
  }

  #[test]
  fn test_set_present() {
    let mut opt = EntryOptions::minimal();
    opt.set_stack_index(4).set_present(true);
    assert_eq!(0b1000111000000100, opt.bits());
  }

  #[test]
  fn test_trap_gate() {
    let mut opt = EntryOptions::minimal();
    opt.disable_interrupts(false).set_present(true);
    assert_eq!(0b1000111100000000, opt.bits());
    opt.disable_interrupts(true);
    assert_eq!(EntryOptions::new(), opt);
  }

  #[test]
  fn test_entry_layout() {
    assert_eq!(core::mem::size_of::<Entry>(), 16);
    assert_eq!(core::mem::size_of::<Idt>(), 16 * 256);
  }

  #[test]
  fn test_handler_address_round_trip() {
    let mut idt = Idt::new();
    let selector = SegmentSelector::new(1, PrivilegeLevel::Ring0);
    idt.set_handler_in(selector, 0x80, never_called, EntryOptions::new());

    let entry = idt.entry(0x80);
    assert_eq!(entry.handler_address(), never_called as u64);
    assert_eq!(entry.options(), EntryOptions::new());
    assert_eq!(idt.entry(0x81).options(), EntryOptions::minimal());
  }
}
