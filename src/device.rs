//! The vault: a reference device living behind one hooked page.
//!
//! Reads of the first word return `0xCAFEBABE` plus a counter that grows by
//! one per read. Writing `0xFFFF` is the reset command.

use core::sync::atomic::{AtomicU32, Ordering};

use x86_64::VirtAddr;

use crate::hook::{Access, DeviceHandler};
use crate::paging::PageBuffer;

/// Base of the values handed out on reads.
pub const VAULT_MAGIC: u32 = 0xCAFE_BABE;

/// Word that resets the device when written.
pub const VAULT_RESET: u32 = 0xFFFF;

/// Counters of what the vault has seen.
#[derive(Debug)]
pub struct VaultDevice {
  reads: AtomicU32,
  writes: AtomicU32,
  resets: AtomicU32,
}

impl VaultDevice {
  /// A vault that has served nothing yet.
  pub const fn new() -> Self {
    VaultDevice {
      reads: AtomicU32::new(0),
      writes: AtomicU32::new(0),
      resets: AtomicU32::new(0),
    }
  }

  /// Reads served.
  pub fn reads(&self) -> u32 {
    self.reads.load(Ordering::Relaxed)
  }

  /// Writes observed, including the ones following each read.
  pub fn writes(&self) -> u32 {
    self.writes.load(Ordering::Relaxed)
  }

  /// Reset commands received.
  pub fn resets(&self) -> u32 {
    self.resets.load(Ordering::Relaxed)
  }
}

impl DeviceHandler for VaultDevice {
  fn access(&self, address: VirtAddr, page: &mut PageBuffer, access: Access) -> bool {
    match access {
      Access::Read => {
        let counter = self.reads.fetch_add(1, Ordering::Relaxed) + 1;
        page.write_u32(0, VAULT_MAGIC.wrapping_add(counter));
        log::info!("vault read at {:#x}, injected {:#x}", address.as_u64(), page.read_u32(0));
      }
      Access::Write => {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let value = page.read_u32(0);
        log::info!("vault write at {:#x}, new value {:#x}", address.as_u64(), value);
        if value == VAULT_RESET {
          self.resets.fetch_add(1, Ordering::Relaxed);
          log::info!("vault reset command received");
        }
      }
    }
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::machine::Machine;
  use crate::sim::{self, SimulatedHardware};
  use crate::trap::TrapState;

  const VAULT: u64 = 0x1f_0000;

  #[test]
  fn test_vault_scenario() {
    let vault: &'static VaultDevice = Box::leak(Box::new(VaultDevice::new()));
    let mut machine = Box::new(Machine::new(SimulatedHardware::new()));
    machine.register_hook(VirtAddr::new(VAULT), vault).unwrap();

    // read: first injected value, and the step afterwards is seen as a
    // write of that same value, which is not a reset
    let first = sim::load_u32(&mut machine, VirtAddr::new(VAULT)).unwrap();
    assert_eq!(first, 0xCAFE_BABF);
    assert_eq!((vault.reads(), vault.writes(), vault.resets()), (1, 1, 0));

    // write of the reset word takes the reset branch
    sim::store_u32(&mut machine, VirtAddr::new(VAULT), VAULT_RESET).unwrap();
    assert_eq!((vault.reads(), vault.writes(), vault.resets()), (1, 2, 1));

    // next read moves the counter on
    let second = sim::load_u32(&mut machine, VirtAddr::new(VAULT)).unwrap();
    assert_eq!(second, 0xCAFE_BAC0);
    assert_eq!((vault.reads(), vault.writes(), vault.resets()), (2, 3, 1));

    assert_eq!(machine.trap_state(), TrapState::Hidden);
  }

  #[test]
  fn test_other_writes_do_not_reset() {
    let vault: &'static VaultDevice = Box::leak(Box::new(VaultDevice::new()));
    let mut machine = Box::new(Machine::new(SimulatedHardware::new()));
    machine.register_hook(VirtAddr::new(VAULT), vault).unwrap();

    sim::store_u32(&mut machine, VirtAddr::new(VAULT), 0xFFFE).unwrap();
    sim::store_u32(&mut machine, VirtAddr::new(VAULT), 0x1_FFFF).unwrap();
    assert_eq!(vault.resets(), 0);
    assert_eq!(vault.writes(), 2);
  }
}
