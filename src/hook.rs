//! The hook registry: which pages are emulated, by which device, and which
//! hook is in the middle of a trap cycle.

use core::fmt;

use x86_64::structures::paging::{Page, Size4KiB};
use x86_64::VirtAddr;

use crate::config::MAX_HOOKS;
use crate::paging::{IdentityPageTable, PageBuffer, PAGE_SIZE};

/// Direction of an emulated access, as told to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
  /// The CPU is about to load from the page; fill it in.
  Read,
  /// The CPU has stored to the page; the new bytes are in it.
  Write,
}

/// A software device backing one hooked page.
///
/// `access` receives the faulting address, the page contents and the
/// direction. Returning `false` means the access was not handled, which
/// the kernel treats like a fault on an unhooked page.
pub trait DeviceHandler: Sync {
  /// Service one access to the page.
  fn access(&self, address: VirtAddr, page: &mut PageBuffer, access: Access) -> bool;
}

impl<F> DeviceHandler for F
where
  F: Fn(VirtAddr, &mut PageBuffer, Access) -> bool + Sync,
{
  fn access(&self, address: VirtAddr, page: &mut PageBuffer, access: Access) -> bool {
    self(address, page, access)
  }
}

/// An active slot of the registry.
#[derive(Clone, Copy)]
pub struct HookEntry {
  page: Page<Size4KiB>,
  device: &'static dyn DeviceHandler,
}

impl HookEntry {
  /// The hooked page.
  pub fn page(&self) -> Page<Size4KiB> {
    self.page
  }

  /// Start address of the hooked page.
  pub fn address(&self) -> VirtAddr {
    self.page.start_address()
  }

  /// The device servicing the page.
  pub fn device(&self) -> &'static dyn DeviceHandler {
    self.device
  }
}

impl fmt::Debug for HookEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HookEntry")
      .field("page", &self.page)
      .finish()
  }
}

/// Reasons a hook cannot be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookError {
  /// The address is not the start of a page.
  Unaligned(VirtAddr),
  /// The page is not translated by the identity table.
  OutOfRange(VirtAddr),
  /// The page already has a device.
  AlreadyHooked(VirtAddr),
  /// All slots are taken.
  TableFull,
}

impl fmt::Display for HookError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      HookError::Unaligned(addr) => write!(f, "hook address {:#x} is not page aligned", addr.as_u64()),
      HookError::OutOfRange(addr) => write!(f, "hook address {:#x} is outside the identity window", addr.as_u64()),
      HookError::AlreadyHooked(addr) => write!(f, "page {:#x} is already hooked", addr.as_u64()),
      HookError::TableFull => write!(f, "hook table is full ({} slots)", MAX_HOOKS),
    }
  }
}

/// Fixed table of hooks plus the one pending slot.
#[derive(Debug)]
pub struct HookRegistry {
  slots: [Option<HookEntry>; MAX_HOOKS],
  pending: Option<usize>,
}

impl HookRegistry {
  /// An empty registry.
  pub const fn new() -> Self {
    HookRegistry {
      slots: [None; MAX_HOOKS],
      pending: None,
    }
  }

  /// Store `device` for the page starting at `address` in the first free
  /// slot and return the slot index. Arming the page is left to the caller.
  pub fn insert(
    &mut self,
    address: VirtAddr,
    device: &'static dyn DeviceHandler,
  ) -> Result<usize, HookError> {
    if !address.is_aligned(PAGE_SIZE as u64) {
      return Err(HookError::Unaligned(address));
    }
    if IdentityPageTable::index_of(address).is_none() {
      return Err(HookError::OutOfRange(address));
    }
    if self.find_slot(address).is_some() {
      return Err(HookError::AlreadyHooked(address));
    }

    let slot = self
      .slots
      .iter()
      .position(Option::is_none)
      .ok_or(HookError::TableFull)?;
    self.slots[slot] = Some(HookEntry {
      page: Page::containing_address(address),
      device,
    });
    Ok(slot)
  }

  /// Slot of the hook covering `address`, after masking to its page.
  pub fn find_slot(&self, address: VirtAddr) -> Option<usize> {
    let page = Page::<Size4KiB>::containing_address(address);
    self
      .slots
      .iter()
      .position(|slot| matches!(slot, Some(entry) if entry.page == page))
  }

  /// The hook covering `address`, if any.
  pub fn find(&self, address: VirtAddr) -> Option<&HookEntry> {
    self.find_slot(address).and_then(|slot| self.entry(slot))
  }

  /// The hook in `slot`, if the slot is active.
  pub fn entry(&self, slot: usize) -> Option<&HookEntry> {
    self.slots.get(slot).and_then(Option::as_ref)
  }

  /// Every active hook.
  pub fn iter(&self) -> impl Iterator<Item = &HookEntry> {
    self.slots.iter().flatten()
  }

  /// Slot waiting for its single-step completion.
  pub fn pending(&self) -> Option<usize> {
    self.pending
  }

  /// Record `slot` as mid-cycle. Callers check [HookRegistry::pending]
  /// first; overwriting an outstanding hook would leave its page exposed.
  pub fn set_pending(&mut self, slot: usize) {
    debug_assert!(self.pending.is_none(), "a hook is already pending");
    self.pending = Some(slot);
  }

  /// Clear and return the pending slot.
  pub fn take_pending(&mut self) -> Option<usize> {
    self.pending.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ignore(_: VirtAddr, _: &mut PageBuffer, _: Access) -> bool {
    true
  }

  static IGNORE: fn(VirtAddr, &mut PageBuffer, Access) -> bool = ignore;

  #[test]
  fn test_insert_and_find_by_any_offset() {
    let mut hooks = HookRegistry::new();
    let slot = hooks.insert(VirtAddr::new(0x1f_0000), &IGNORE).unwrap();
    assert_eq!(slot, 0);
    assert_eq!(hooks.find_slot(VirtAddr::new(0x1f_0000)), Some(0));
    assert_eq!(hooks.find_slot(VirtAddr::new(0x1f_0ffc)), Some(0));
    assert_eq!(hooks.find(VirtAddr::new(0x1f_1000)).map(HookEntry::address), None);
    assert_eq!(hooks.find(VirtAddr::new(0x1f_0123)).unwrap().address().as_u64(), 0x1f_0000);
  }

  #[test]
  fn test_rejects_unaligned_and_out_of_range() {
    let mut hooks = HookRegistry::new();
    assert_eq!(
      hooks.insert(VirtAddr::new(0x1f_0004), &IGNORE).unwrap_err(),
      HookError::Unaligned(VirtAddr::new(0x1f_0004))
    );
    assert_eq!(
      hooks.insert(VirtAddr::new(0x40_0000), &IGNORE).unwrap_err(),
      HookError::OutOfRange(VirtAddr::new(0x40_0000))
    );
    assert_eq!(hooks.iter().count(), 0);
  }

  #[test]
  fn test_addresses_stay_unique() {
    let mut hooks = HookRegistry::new();
    hooks.insert(VirtAddr::new(0x10_0000), &IGNORE).unwrap();
    assert_eq!(
      hooks.insert(VirtAddr::new(0x10_0000), &IGNORE).unwrap_err(),
      HookError::AlreadyHooked(VirtAddr::new(0x10_0000))
    );
    assert_eq!(hooks.iter().count(), 1);
  }

  #[test]
  fn test_overflow_leaves_table_and_pending_alone() {
    let mut hooks = HookRegistry::new();
    for i in 0..MAX_HOOKS {
      hooks.insert(VirtAddr::new(0x10_0000 + (i * PAGE_SIZE) as u64), &IGNORE).unwrap();
    }
    hooks.set_pending(3);
    let before: Vec<_> = hooks.iter().map(HookEntry::address).collect();

    let extra = VirtAddr::new(0x10_0000 + (MAX_HOOKS * PAGE_SIZE) as u64);
    assert_eq!(hooks.insert(extra, &IGNORE).unwrap_err(), HookError::TableFull);

    let after: Vec<_> = hooks.iter().map(HookEntry::address).collect();
    assert_eq!(before, after);
    assert_eq!(hooks.pending(), Some(3));
    assert!(hooks.find(extra).is_none());
  }

  #[test]
  fn test_take_pending_clears() {
    let mut hooks = HookRegistry::new();
    hooks.set_pending(1);
    assert_eq!(hooks.take_pending(), Some(1));
    assert_eq!(hooks.take_pending(), None);
  }
}
