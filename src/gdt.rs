//! This module contains the global descriptor table of the kernel and the
//! task state segment holding the stack the double fault handler runs on.

use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// The stack table index for the stack used for double fault
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

#[repr(C, align(16))]
struct Stack([u8; DOUBLE_FAULT_STACK_SIZE]);

lazy_static! {
  // Global descriptor table with one code segment and the TSS
  static ref GDT: (GlobalDescriptorTable, Selectors) = {
    let mut gdt = GlobalDescriptorTable::new();
    let code_selector = gdt.add_entry(Descriptor::kernel_code_segment());
    let tss_selector = gdt.add_entry(Descriptor::tss_segment(&TSS));
    (gdt, Selectors { code_selector, tss_selector })
  };

  // A double fault is usually a fault the current stack cannot take, so its
  // handler always switches to a stack of its own
  static ref TSS: TaskStateSegment = {
    let mut tss = TaskStateSegment::new();
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
      static mut STACK: Stack = Stack([0; DOUBLE_FAULT_STACK_SIZE]);
      let stack_start = VirtAddr::from_ptr(unsafe { core::ptr::addr_of!(STACK) });

      // stacks grow down
      stack_start + DOUBLE_FAULT_STACK_SIZE
    };
    tss
  };
}

struct Selectors {
  code_selector: SegmentSelector,
  tss_selector: SegmentSelector,
}

/// Load the GDT, reload CS and load the TSS.
pub fn init_gdt() {
  use x86_64::instructions::segmentation::{Segment, CS};
  use x86_64::instructions::tables::load_tss;

  GDT.0.load();

  unsafe {
    CS::set_reg(GDT.1.code_selector);
    load_tss(GDT.1.tss_selector);
  }
  log::info!("GDT loaded, code selector {:?}", GDT.1.code_selector);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_double_fault_stack_is_aligned_top() {
    let top = TSS.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize];
    assert!(!top.is_null());
    assert!(top.is_aligned(16u64));
  }

  #[test]
  fn test_selectors() {
    // entry 0 is the null descriptor
    assert_eq!(GDT.1.code_selector.index(), 1);
    // the TSS descriptor takes two slots
    assert_eq!(GDT.1.tss_selector.index(), 2);
  }
}
