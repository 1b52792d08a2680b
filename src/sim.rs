//! A software model of the CPU facilities the trap engine uses, so the
//! engine runs under the host test harness.

use x86_64::registers::rflags::RFlags;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::structures::paging::{Page, PageTable, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::hardware::Hardware;
use crate::interrupts::frame::TrapFrame;
use crate::machine::Machine;
use crate::paging::{PageBuffer, IDENTITY_PAGES, PAGE_SIZE};
use crate::trap::TrapError;

/// Identity-mapped memory plus the CR2/CR3 state the engine touches.
pub struct SimulatedHardware {
  memory: Vec<PageBuffer>,
  fault_address: VirtAddr,
  flushes: usize,
  directory: Option<PhysAddr>,
}

impl SimulatedHardware {
  pub fn new() -> Self {
    SimulatedHardware {
      memory: vec![PageBuffer::zeroed(); IDENTITY_PAGES],
      fault_address: VirtAddr::zero(),
      flushes: 0,
      directory: None,
    }
  }

  /// What the CPU would latch into CR2 on the next fault.
  pub fn set_fault_address(&mut self, address: VirtAddr) {
    self.fault_address = address;
  }

  pub fn flushes(&self) -> usize {
    self.flushes
  }

  pub fn installed_directory(&self) -> Option<PhysAddr> {
    self.directory
  }

  fn word(&mut self, address: VirtAddr) -> (&mut PageBuffer, usize) {
    let page = address.as_u64() as usize / PAGE_SIZE;
    let offset = address.as_u64() as usize % PAGE_SIZE;
    (&mut self.memory[page], offset)
  }
}

impl Hardware for SimulatedHardware {
  fn fault_address(&self) -> VirtAddr {
    self.fault_address
  }

  fn flush_tlb(&mut self) {
    self.flushes += 1;
  }

  fn physical_address(&self, addr: VirtAddr) -> Option<PhysAddr> {
    Some(PhysAddr::new(addr.as_u64()))
  }

  unsafe fn install_directory(&mut self, _directory: &mut PageTable, directory_addr: PhysAddr) {
    self.directory = Some(directory_addr);
  }

  fn page_mut(&mut self, page: Page<Size4KiB>) -> &mut PageBuffer {
    let index = page.start_address().as_u64() as usize / PAGE_SIZE;
    &mut self.memory[index]
  }
}

/// Run one memory instruction the way the CPU would: fault if the page is
/// not present, retry, then take the single-step trap if it was requested.
fn execute<R>(
  machine: &mut Machine<SimulatedHardware>,
  address: VirtAddr,
  access: PageFaultErrorCode,
  instruction: impl FnOnce(&mut PageBuffer, usize) -> R,
) -> Result<R, TrapError> {
  let mut frame = TrapFrame {
    cpu_flags: RFlags::INTERRUPT_FLAG.bits(),
    ..TrapFrame::default()
  };

  if !machine.page_table().is_present(address) {
    frame.error_code = access.bits();
    machine.hardware_mut().set_fault_address(address);
    machine.page_fault(&mut frame)?;
    assert!(machine.page_table().is_present(address), "retry would fault again");
  }

  let (page, offset) = machine.hardware_mut().word(address);
  let result = instruction(page, offset);

  if frame.trap_flag() {
    machine.single_step(&mut frame)?;
    assert!(!frame.trap_flag(), "trap flag left set after the step");
  }
  Ok(result)
}

/// `mov eax, [address]`
pub fn load_u32(
  machine: &mut Machine<SimulatedHardware>,
  address: VirtAddr,
) -> Result<u32, TrapError> {
  execute(machine, address, PageFaultErrorCode::empty(), |page, offset| {
    page.read_u32(offset)
  })
}

/// `mov al, [address]`
pub fn load_u8(
  machine: &mut Machine<SimulatedHardware>,
  address: VirtAddr,
) -> Result<u8, TrapError> {
  execute(machine, address, PageFaultErrorCode::empty(), |page, offset| {
    page.0[offset]
  })
}

/// `mov [address], value`
pub fn store_u32(
  machine: &mut Machine<SimulatedHardware>,
  address: VirtAddr,
  value: u32,
) -> Result<(), TrapError> {
  execute(machine, address, PageFaultErrorCode::CAUSED_BY_WRITE, |page, offset| {
    page.write_u32(offset, value)
  })
}
