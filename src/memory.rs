//! Access to the translation hierarchy the bootloader left active, used to
//! splice the identity directory into it.

use x86_64::structures::paging::page_table::FrameError;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

/// Returns a handle to the Level-4 PageTable of the current process.
///
/// This function is unsafe because the caller has to guarantee that
/// the provided offset is valid, i.e., the complete physical memory is
/// mapped to virtual memory at the passed offset. Also, the returned
/// reference must not be held while another one is alive.
pub unsafe fn active_level4_page_table(
  physical_memory_offset: VirtAddr,
) -> &'static mut PageTable {
  use x86_64::registers::control::Cr3;

  let (level_4_table_frame, _) = Cr3::read();
  unsafe { table_at(level_4_table_frame, physical_memory_offset) }
}

unsafe fn table_at(
  frame: PhysFrame,
  physical_memory_offset: VirtAddr,
) -> &'static mut PageTable {
  let virt = physical_memory_offset + frame.start_address().as_u64();
  let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

  unsafe { &mut *page_table_ptr }
}

// x86_64 virtual address format:
// [63 - 48]        [47 - 39]    [38 - 30]    [29 - 21]    [20 - 12] .  [11 - 0]
// [sign extention][page4 index][page3 index][page2 index][page1 index][offset in page]
const IDX_MASK: u64 = 0x1ff;
const OFFSET_MASK: u64 = 0xfff;

fn table_index(addr: VirtAddr, level: u8) -> usize {
  let shift = 12 + 9 * (u64::from(level) - 1);
  ((addr.as_u64() >> shift) & IDX_MASK) as usize
}

fn offset_in_page(addr: VirtAddr) -> u64 {
  addr.as_u64() & OFFSET_MASK
}

const HUGE_2MIB: u64 = 0x20_0000;
const HUGE_1GIB: u64 = 0x4000_0000;

/// Translate a given [VirtAddr] to the mapped [PhysAddr] by the active page table.
///
/// Huge pages are followed as well, since the bootloader maps physical memory
/// with them.
///
/// * 'addr' Virtual Address to translate
/// * 'physical_memory_offset' Physical memory offset
pub unsafe fn translate_virt_address(
  addr: VirtAddr,
  physical_memory_offset: VirtAddr,
) -> Option<PhysAddr> {
  use x86_64::registers::control::Cr3;

  let (level4_table_frame, _) = Cr3::read();
  let mut current_frame = level4_table_frame;

  for level in (1..=4).rev() {
    let table = unsafe { table_at(current_frame, physical_memory_offset) };
    let entry = &table[table_index(addr, level)];
    current_frame = match entry.frame() {
      Ok(frame) => frame,
      Err(FrameError::FrameNotPresent) => return None,
      Err(FrameError::HugeFrame) => {
        let size = if level == 3 { HUGE_1GIB } else { HUGE_2MIB };
        return Some(entry.addr() + (addr.as_u64() & (size - 1)));
      }
    }
  }

  Some(current_frame.start_address() + offset_in_page(addr))
}

/// Link `directory` as the level-2 table translating the lowest gigabyte.
///
/// The bootloader already maps that gigabyte (our kernel image lives in it),
/// so every directory entry besides entry 0 inherits the bootloader's
/// mapping before the switch. Entry 0, the identity table, is left alone.
///
/// # Safety
/// `directory` must stay at `directory_addr` for as long as it is linked.
pub unsafe fn link_identity_directory(
  directory: &mut PageTable,
  directory_addr: PhysAddr,
  physical_memory_offset: VirtAddr,
) {
  let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
  let level_4 = unsafe { active_level4_page_table(physical_memory_offset) };
  let level_3_frame = level_4[0]
    .frame()
    .expect("bootloader left the lowest 512 GiB unmapped");
  let level_3 = unsafe { table_at(level_3_frame, physical_memory_offset) };

  match level_3[0].frame() {
    Ok(frame) => {
      let live = unsafe { table_at(frame, physical_memory_offset) };
      for (ours, theirs) in directory.iter_mut().zip(live.iter()).skip(1) {
        *ours = theirs.clone();
      }
    }
    Err(FrameError::HugeFrame) => {
      let base = level_3[0].addr().as_u64();
      for (i, ours) in directory.iter_mut().enumerate().skip(1) {
        let frame = PhysAddr::new(base + i as u64 * HUGE_2MIB);
        ours.set_addr(frame, flags | PageTableFlags::HUGE_PAGE);
      }
    }
    Err(FrameError::FrameNotPresent) => {}
  }

  level_3[0].set_addr(directory_addr, flags);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_page_index() {
    let addr = VirtAddr::new(0xdeadbeaf);
    assert_eq!(usize::from(addr.p1_index()), table_index(addr, 1));
    assert_eq!(usize::from(addr.p2_index()), table_index(addr, 2));
    assert_eq!(usize::from(addr.p3_index()), table_index(addr, 3));
    assert_eq!(usize::from(addr.p4_index()), table_index(addr, 4));
    assert_eq!(u64::from(addr.page_offset()), offset_in_page(addr));
  }

  #[test]
  fn test_identity_window_is_first_directory_slot() {
    let addr = VirtAddr::new(0x1f_0000);
    assert_eq!(table_index(addr, 4), 0);
    assert_eq!(table_index(addr, 3), 0);
    assert_eq!(table_index(addr, 2), 0);
    assert_eq!(table_index(addr, 1), 0x1f0);
  }
}
