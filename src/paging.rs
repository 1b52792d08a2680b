//! The identity page table: one directory/table pair mapping the lowest
//! 2 MiB one-to-one. It is the only translation the trap engine ever
//! touches; hooking a page means clearing its Present bit here.

use x86_64::structures::paging::{
  Page, PageTable, PageTableFlags, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::hardware::Hardware;

/// Size of a page, and of every hooked device window.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages covered by the identity table.
pub const IDENTITY_PAGES: usize = 512;

/// First address past the identity window.
pub const IDENTITY_LIMIT: u64 = (IDENTITY_PAGES * PAGE_SIZE) as u64;

/// The bytes behind one page, as handed to device handlers.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageBuffer(pub [u8; PAGE_SIZE]);

impl PageBuffer {
  /// A zero-filled page.
  pub const fn zeroed() -> Self {
    PageBuffer([0; PAGE_SIZE])
  }

  /// Read a little-endian u32 at `offset`.
  pub fn read_u32(&self, offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&self.0[offset..offset + 4]);
    u32::from_le_bytes(bytes)
  }

  /// Write a little-endian u32 at `offset`.
  pub fn write_u32(&mut self, offset: usize, value: u32) {
    self.0[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
  }
}

/// Observable state of one identity table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
  /// Accesses fault; the trap is armed.
  NotPresent,
  /// Accesses go straight to memory.
  PresentWritable,
  /// Present but writes fault. The engine never produces this state.
  PresentReadOnly,
}

/// A page directory whose entry 0 points at a single page table.
pub struct IdentityPageTable {
  directory: PageTable,
  table: PageTable,
}

impl IdentityPageTable {
  /// Both tables empty; call [IdentityPageTable::build] before use.
  pub fn new() -> Self {
    IdentityPageTable {
      directory: PageTable::new(),
      table: PageTable::new(),
    }
  }

  /// Fill the table with `frame | PRESENT | WRITABLE` for every page of the
  /// window and point directory entry 0 at it. The rest of the directory is
  /// left unused.
  pub fn build(&mut self, hardware: &impl Hardware) {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    for (i, entry) in self.table.iter_mut().enumerate() {
      entry.set_addr(PhysAddr::new((i * PAGE_SIZE) as u64), flags);
    }

    self.directory.zero();
    let table_addr = hardware
      .physical_address(VirtAddr::from_ptr(&self.table))
      .expect("identity page table is not mapped");
    self.directory[0].set_addr(table_addr, flags);
  }

  /// Make the hardware translate through this directory.
  ///
  /// Directory entry 0 is pointed at the table again first, since the
  /// table may have moved since [IdentityPageTable::build].
  ///
  /// # Safety
  /// The table must have been built, and `self` must not move afterwards:
  /// the CPU keeps reading it by physical address.
  pub unsafe fn activate(&mut self, hardware: &mut impl Hardware) {
    let table_addr = hardware
      .physical_address(VirtAddr::from_ptr(&self.table))
      .expect("identity page table is not mapped");
    let flags = self.directory[0].flags();
    self.directory[0].set_addr(table_addr, flags);

    let directory_addr = hardware
      .physical_address(VirtAddr::from_ptr(&self.directory))
      .expect("identity page directory is not mapped");
    unsafe { hardware.install_directory(&mut self.directory, directory_addr) };
  }

  /// Map entry `index` present (and writable if asked), then flush.
  pub fn set_present(&mut self, index: usize, writable: bool, hardware: &mut impl Hardware) {
    let entry = &mut self.table[index];
    let mut flags = entry.flags() | PageTableFlags::PRESENT;
    flags.set(PageTableFlags::WRITABLE, writable);
    entry.set_flags(flags);
    hardware.flush_tlb();
  }

  /// Clear the Present bit of entry `index`, then flush.
  pub fn set_not_present(&mut self, index: usize, hardware: &mut impl Hardware) {
    let entry = &mut self.table[index];
    let mut flags = entry.flags();
    flags.remove(PageTableFlags::PRESENT);
    entry.set_flags(flags);
    hardware.flush_tlb();
  }

  /// Table index translating `address`, if it lies in the window.
  pub fn index_of(address: VirtAddr) -> Option<usize> {
    if address.as_u64() < IDENTITY_LIMIT {
      Some((address.as_u64() as usize) / PAGE_SIZE)
    } else {
      None
    }
  }

  /// The page starting at table entry `index`.
  pub fn page_at(index: usize) -> Page<Size4KiB> {
    Page::containing_address(VirtAddr::new((index * PAGE_SIZE) as u64))
  }

  /// State of entry `index`.
  pub fn entry_state(&self, index: usize) -> EntryState {
    let flags = self.table[index].flags();
    if !flags.contains(PageTableFlags::PRESENT) {
      EntryState::NotPresent
    } else if flags.contains(PageTableFlags::WRITABLE) {
      EntryState::PresentWritable
    } else {
      EntryState::PresentReadOnly
    }
  }

  /// Whether an access to `address` would go through without faulting.
  /// Addresses outside the window are reported as not present.
  pub fn is_present(&self, address: VirtAddr) -> bool {
    Self::index_of(address)
      .map(|index| self.entry_state(index) != EntryState::NotPresent)
      .unwrap_or(false)
  }

  /// Physical frame address held by entry `index`, present or not.
  pub fn frame_address(&self, index: usize) -> PhysAddr {
    self.table[index].addr()
  }

  /// Directory entry pointing at the table.
  pub fn directory(&self) -> &PageTable {
    &self.directory
  }
}
