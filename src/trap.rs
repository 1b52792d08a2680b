//! The trap dispatcher: the two-phase protocol that emulates a hooked page.
//!
//! A hooked page is normally not present ([TrapState::Hidden]). An access
//! to it faults *before* the instruction completes; the dispatcher maps the
//! page, lets a read's device fill it in, remembers the hook as pending and
//! sets the trap flag ([TrapState::Armed]). The CPU then re-executes the
//! instruction, which now succeeds, and raises the single-step trap right
//! after it. There the device sees the page as the instruction left it, the
//! page is hidden again and the trap flag is cleared.
//!
//! Reads invoke the device twice: with [Access::Read] on the fault and with
//! [Access::Write] on the step that follows. The second call lets a device
//! observe read-modify-write instructions and is part of the contract.

use core::fmt;

use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

use crate::hardware::Hardware;
use crate::hook::Access;
use crate::interrupts::frame::TrapFrame;
use crate::machine::Machine;
use crate::paging::IdentityPageTable;

/// Where the engine is in a trap cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapState {
  /// Every hooked page is not present and nothing is in flight.
  Hidden,
  /// The hook in `slot` is mapped and waits for its single step.
  Armed {
    /// Registry slot of the pending hook.
    slot: usize,
  },
}

/// A page fault, as far as the engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
  /// Faulting linear address.
  pub address: VirtAddr,
  /// Whether the instruction was loading or storing.
  pub access: Access,
}

impl FaultEvent {
  /// Decode CR2 and the hardware error code.
  pub fn decode(address: VirtAddr, error_code: u64) -> Self {
    let code = PageFaultErrorCode::from_bits_truncate(error_code);
    let access = if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
      Access::Write
    } else {
      Access::Read
    };
    FaultEvent { address, access }
  }
}

/// The single-step trap fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEvent;

/// How the interrupted code resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
  /// Re-execute with the trap flag set.
  SingleStep,
  /// Continue normally, trap flag clear.
  Continue,
}

/// A trap the engine cannot service. All of these are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapError {
  /// Fault on a page nobody hooked: a real invalid access.
  Unhooked {
    /// Faulting address.
    address: VirtAddr,
    /// Direction of the access.
    access: Access,
  },
  /// Fault on a hooked page while another hook waits for its step, e.g. an
  /// instruction touching two hooked pages.
  TrapInFlight {
    /// Page of the pending hook.
    pending: VirtAddr,
    /// Faulting address.
    address: VirtAddr,
  },
  /// The device returned "not handled".
  Rejected {
    /// Accessed address.
    address: VirtAddr,
    /// Direction reported to the device.
    access: Access,
  },
}

impl fmt::Display for TrapError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TrapError::Unhooked { address, access } => {
        write!(f, "invalid {:?} access at {:#x}", access, address.as_u64())
      }
      TrapError::TrapInFlight { pending, address } => write!(
        f,
        "fault at {:#x} while page {:#x} is still being emulated",
        address.as_u64(),
        pending.as_u64()
      ),
      TrapError::Rejected { address, access } => write!(
        f,
        "device refused {:?} access at {:#x}",
        access,
        address.as_u64()
      ),
    }
  }
}

impl<H: Hardware> Machine<H> {
  /// Current phase of the trap cycle.
  pub fn trap_state(&self) -> TrapState {
    match self.hooks.pending() {
      Some(slot) => TrapState::Armed { slot },
      None => TrapState::Hidden,
    }
  }

  /// Hidden -> Armed: map the page, serve a read right away, request a
  /// single step.
  pub fn on_fault(&mut self, event: FaultEvent) -> Result<Resume, TrapError> {
    let FaultEvent { address, access } = event;
    let slot = self
      .hooks
      .find_slot(address)
      .ok_or(TrapError::Unhooked { address, access })?;
    if let Some(pending) = self.hooks.pending() {
      let pending = self.hooks.entry(pending).map_or(VirtAddr::zero(), |hook| hook.address());
      return Err(TrapError::TrapInFlight { pending, address });
    }
    let hook = *self.hooks.entry(slot).ok_or(TrapError::Unhooked { address, access })?;
    let index = IdentityPageTable::index_of(hook.address()).ok_or(TrapError::Unhooked { address, access })?;

    log::trace!("{:?} fault at {:#x}", access, address.as_u64());
    self.pages.set_present(index, true, &mut self.hardware);

    if access == Access::Read {
      let page = self.hardware.page_mut(hook.page());
      if !hook.device().access(address, page, Access::Read) {
        self.pages.set_not_present(index, &mut self.hardware);
        return Err(TrapError::Rejected { address, access });
      }
    }

    self.hooks.set_pending(slot);
    Ok(Resume::SingleStep)
  }

  /// Armed -> Hidden: show the device the page after the instruction, hide
  /// the page and drop the pending hook. A step with nothing pending just
  /// continues.
  pub fn on_step(&mut self, _event: StepEvent) -> Result<Resume, TrapError> {
    let hook = match self.hooks.take_pending().and_then(|slot| self.hooks.entry(slot)) {
      Some(hook) => *hook,
      None => return Ok(Resume::Continue),
    };
    let address = hook.address();

    let page = self.hardware.page_mut(hook.page());
    let handled = hook.device().access(address, page, Access::Write);

    if let Some(index) = IdentityPageTable::index_of(address) {
      self.pages.set_not_present(index, &mut self.hardware);
    }
    log::trace!("page {:#x} hidden again", address.as_u64());

    if handled {
      Ok(Resume::Continue)
    } else {
      Err(TrapError::Rejected {
        address,
        access: Access::Write,
      })
    }
  }

  /// Page-fault entry: decode the frame, run [Machine::on_fault] and set the
  /// trap flag in the saved RFLAGS.
  pub fn page_fault(&mut self, frame: &mut TrapFrame) -> Result<(), TrapError> {
    let event = FaultEvent::decode(self.hardware.fault_address(), frame.error_code);
    let resume = self.on_fault(event)?;
    frame.set_trap_flag(resume == Resume::SingleStep);
    Ok(())
  }

  /// Debug-trap entry: run [Machine::on_step] and clear the trap flag.
  pub fn single_step(&mut self, frame: &mut TrapFrame) -> Result<(), TrapError> {
    let result = self.on_step(StepEvent);
    frame.set_trap_flag(false);
    result.map(|_| ())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hook::DeviceHandler;
  use crate::paging::{EntryState, PageBuffer};
  use crate::sim::{self, SimulatedHardware};
  use rand::rngs::StdRng;
  use rand::{Rng, SeedableRng};
  use std::sync::Mutex;

  /// Records every call and answers reads with a fixed word.
  struct Recorder {
    calls: Mutex<Vec<(u64, Access, u32)>>,
    answer: u32,
  }

  impl Recorder {
    fn leak(answer: u32) -> &'static Recorder {
      Box::leak(Box::new(Recorder {
        calls: Mutex::new(Vec::new()),
        answer,
      }))
    }

    fn calls(&self) -> Vec<(u64, Access, u32)> {
      self.calls.lock().unwrap().clone()
    }
  }

  impl DeviceHandler for Recorder {
    fn access(&self, address: VirtAddr, page: &mut PageBuffer, access: Access) -> bool {
      if access == Access::Read {
        page.write_u32(0, self.answer);
      }
      self.calls.lock().unwrap().push((address.as_u64(), access, page.read_u32(0)));
      true
    }
  }

  const DEVICE: u64 = 0x1f_0000;

  fn machine_with(device: &'static dyn DeviceHandler) -> Box<Machine<SimulatedHardware>> {
    let mut machine = Box::new(Machine::new(SimulatedHardware::new()));
    machine.register_hook(VirtAddr::new(DEVICE), device).unwrap();
    machine
  }

  #[test]
  fn test_decode_error_code() {
    let addr = VirtAddr::new(DEVICE);
    assert_eq!(FaultEvent::decode(addr, 0).access, Access::Read);
    assert_eq!(FaultEvent::decode(addr, 0b10).access, Access::Write);
    // present + user + write
    assert_eq!(FaultEvent::decode(addr, 0b111).access, Access::Write);
  }

  #[test]
  fn test_write_round_trip() {
    let device = Recorder::leak(0);
    let mut machine = machine_with(device);

    sim::store_u32(&mut machine, VirtAddr::new(DEVICE + 4), 0x1234_5678).unwrap();

    let page = machine.hardware_mut().page_mut(IdentityPageTable::page_at(0x1f0)).clone();
    assert_eq!(page.read_u32(4), 0x1234_5678);
    let calls = device.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!((calls[0].0, calls[0].1), (DEVICE, Access::Write));
    assert_eq!(machine.trap_state(), TrapState::Hidden);
    assert_eq!(machine.page_table().entry_state(0x1f0), EntryState::NotPresent);
  }

  #[test]
  fn test_write_fault_defers_device_until_step() {
    let device = Recorder::leak(0);
    let mut machine = machine_with(device);
    let mut frame = TrapFrame::default();
    frame.error_code = PageFaultErrorCode::CAUSED_BY_WRITE.bits();
    machine.hardware_mut().set_fault_address(VirtAddr::new(DEVICE));

    machine.page_fault(&mut frame).unwrap();
    assert!(frame.trap_flag());
    assert!(device.calls().is_empty());
    assert_eq!(machine.trap_state(), TrapState::Armed { slot: 0 });
    assert_eq!(machine.page_table().entry_state(0x1f0), EntryState::PresentWritable);

    machine.single_step(&mut frame).unwrap();
    assert!(!frame.trap_flag());
    assert_eq!(device.calls().len(), 1);
    assert_eq!(machine.trap_state(), TrapState::Hidden);
  }

  #[test]
  fn test_read_injection_and_double_invocation() {
    let device = Recorder::leak(0xDEAD_BEEF);
    let mut machine = machine_with(device);

    let value = sim::load_u32(&mut machine, VirtAddr::new(DEVICE)).unwrap();

    assert_eq!(value, 0xDEAD_BEEF);
    assert_eq!(
      device.calls(),
      [(DEVICE, Access::Read, 0xDEAD_BEEF), (DEVICE, Access::Write, 0xDEAD_BEEF)]
    );
    assert_eq!(machine.page_table().entry_state(0x1f0), EntryState::NotPresent);
  }

  #[test]
  fn test_retrap_is_idempotent() {
    let device = Recorder::leak(7);
    let mut machine = machine_with(device);
    let flushes = machine.hardware().flushes();

    for i in 0..25 {
      if i % 2 == 0 {
        assert_eq!(sim::load_u32(&mut machine, VirtAddr::new(DEVICE)).unwrap(), 7);
      } else {
        sim::store_u32(&mut machine, VirtAddr::new(DEVICE), i).unwrap();
      }
      assert_eq!(machine.trap_state(), TrapState::Hidden);
      assert_eq!(machine.hooks().pending(), None);
    }
    // 13 reads call the device twice, 12 writes once
    assert_eq!(device.calls().len(), 13 * 2 + 12);
    // each cycle maps once and hides once
    assert_eq!(machine.hardware().flushes(), flushes + 2 * 25);
  }

  #[test]
  fn test_unhooked_fault_is_reported() {
    let device = Recorder::leak(0);
    let mut machine = machine_with(device);
    let err = sim::load_u32(&mut machine, VirtAddr::new(0x40_0000)).unwrap_err();
    assert_eq!(
      err,
      TrapError::Unhooked {
        address: VirtAddr::new(0x40_0000),
        access: Access::Read
      }
    );
    assert_eq!(machine.trap_state(), TrapState::Hidden);
  }

  #[test]
  fn test_second_fault_while_armed_is_refused() {
    let first = Recorder::leak(1);
    let second = Recorder::leak(2);
    let mut machine = machine_with(first);
    machine.register_hook(VirtAddr::new(0x1e_0000), second).unwrap();

    let armed = machine.on_fault(FaultEvent {
      address: VirtAddr::new(DEVICE),
      access: Access::Write,
    });
    assert_eq!(armed, Ok(Resume::SingleStep));

    let err = machine
      .on_fault(FaultEvent {
        address: VirtAddr::new(0x1e_0010),
        access: Access::Read,
      })
      .unwrap_err();
    assert_eq!(
      err,
      TrapError::TrapInFlight {
        pending: VirtAddr::new(DEVICE),
        address: VirtAddr::new(0x1e_0010)
      }
    );
    // the refused page was never mapped nor shown to its device
    assert_eq!(machine.page_table().entry_state(0x1e0), EntryState::NotPresent);
    assert!(second.calls().is_empty());
    assert_eq!(machine.trap_state(), TrapState::Armed { slot: 0 });
  }

  #[test]
  fn test_spurious_step_only_clears_trap_flag() {
    let device = Recorder::leak(0);
    let mut machine = machine_with(device);
    let mut frame = TrapFrame::default();
    frame.set_trap_flag(true);

    machine.single_step(&mut frame).unwrap();
    assert!(!frame.trap_flag());
    assert!(device.calls().is_empty());
    assert_eq!(machine.page_table().entry_state(0x1f0), EntryState::NotPresent);
  }

  #[test]
  fn test_rejected_read_is_fatal() {
    fn refuse(_: VirtAddr, _: &mut PageBuffer, _: Access) -> bool {
      false
    }
    static REFUSE: fn(VirtAddr, &mut PageBuffer, Access) -> bool = refuse;
    let mut machine = machine_with(&REFUSE);

    let err = sim::load_u32(&mut machine, VirtAddr::new(DEVICE + 8)).unwrap_err();
    assert_eq!(
      err,
      TrapError::Rejected {
        address: VirtAddr::new(DEVICE + 8),
        access: Access::Read
      }
    );
    assert_eq!(machine.trap_state(), TrapState::Hidden);
    assert_eq!(machine.page_table().entry_state(0x1f0), EntryState::NotPresent);
  }

  #[test]
  fn test_never_two_armed_hooks() {
    let devices: Vec<&'static Recorder> = (0..4).map(Recorder::leak).collect();
    let mut machine = Box::new(Machine::new(SimulatedHardware::new()));
    let pages = [0x10_0000u64, 0x11_0000, 0x12_0000, 0x13_0000];
    for (page, device) in pages.iter().zip(&devices) {
      machine.register_hook(VirtAddr::new(*page), *device).unwrap();
    }

    let mut rng = StdRng::seed_from_u64(0x2545_f491_4f6c_dd1d);

    for _ in 0..2000 {
      let page = pages[rng.gen_range(0..pages.len())] + rng.gen_range(0..4096);
      let before = machine.trap_state();
      let result = if rng.gen_bool(0.5) {
        let access = if rng.gen_bool(0.5) { Access::Read } else { Access::Write };
        machine.on_fault(FaultEvent {
          address: VirtAddr::new(page),
          access,
        })
      } else {
        machine.on_step(StepEvent)
      };

      let armed: Vec<usize> = (0..pages.len())
        .filter(|&i| machine.page_table().entry_state(0x100 + 0x10 * i) != EntryState::NotPresent)
        .collect();
      match machine.trap_state() {
        TrapState::Hidden => assert!(armed.is_empty()),
        TrapState::Armed { slot } => assert_eq!(armed, [slot]),
      }
      if let (TrapState::Armed { .. }, Ok(Resume::SingleStep)) = (before, result) {
        panic!("armed a second hook");
      }
    }
  }
}
