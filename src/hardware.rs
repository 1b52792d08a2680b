//! The hardware control capability the trap engine is written against.
//!
//! [Hardware] covers exactly the privileged operations the engine needs:
//! reading the faulting address, flushing translations, linking the identity
//! directory and reaching the bytes of an identity-mapped page. [X86Hardware]
//! performs them on the real CPU; the tests plug in a software model.

use x86_64::structures::paging::{Page, PageTable, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::memory;
use crate::paging::{PageBuffer, IDENTITY_LIMIT};

/// Privileged operations used by the paging and trap code.
pub trait Hardware {
  /// Linear address of the most recent page fault (CR2).
  fn fault_address(&self) -> VirtAddr;

  /// Invalidate every cached translation.
  fn flush_tlb(&mut self);

  /// Physical address backing the kernel virtual address `addr`.
  fn physical_address(&self, addr: VirtAddr) -> Option<PhysAddr>;

  /// Start translating the identity window through `directory`, which lives
  /// at `directory_addr`, and make sure paging is enabled.
  ///
  /// # Safety
  /// `directory` must be a valid page directory that stays in place for as
  /// long as it is in use.
  unsafe fn install_directory(&mut self, directory: &mut PageTable, directory_addr: PhysAddr);

  /// The bytes of an identity-mapped page. The page has to be present in
  /// the identity table when this is called.
  fn page_mut(&mut self, page: Page<Size4KiB>) -> &mut PageBuffer;
}

/// The real CPU, as left to us by the bootloader.
#[derive(Debug)]
pub struct X86Hardware {
  physical_memory_offset: VirtAddr,
}

impl X86Hardware {
  /// `physical_memory_offset` is where the bootloader maps all of physical
  /// memory.
  pub fn new(physical_memory_offset: VirtAddr) -> Self {
    X86Hardware {
      physical_memory_offset,
    }
  }
}

impl Hardware for X86Hardware {
  fn fault_address(&self) -> VirtAddr {
    x86_64::registers::control::Cr2::read()
  }

  fn flush_tlb(&mut self) {
    // reloading CR3 drops every non-global translation
    x86_64::instructions::tlb::flush_all();
  }

  fn physical_address(&self, addr: VirtAddr) -> Option<PhysAddr> {
    unsafe { memory::translate_virt_address(addr, self.physical_memory_offset) }
  }

  unsafe fn install_directory(&mut self, directory: &mut PageTable, directory_addr: PhysAddr) {
    use x86_64::registers::control::{Cr0, Cr0Flags};

    unsafe {
      memory::link_identity_directory(directory, directory_addr, self.physical_memory_offset);
      // long mode already runs with paging on; this keeps the contract explicit
      Cr0::update(|flags| flags.insert(Cr0Flags::PAGING));
    }
    self.flush_tlb();
  }

  fn page_mut(&mut self, page: Page<Size4KiB>) -> &mut PageBuffer {
    let start = page.start_address();
    assert!(start.as_u64() < IDENTITY_LIMIT, "page {:?} outside the identity window", page);
    // identity mapped and present, so the virtual address is the frame
    unsafe { &mut *start.as_mut_ptr::<PageBuffer>() }
  }
}
