//! The machine state: everything the trap and interrupt handlers mutate,
//! owned in one place and handed to them by reference.

use conquer_once::spin::OnceCell;
use spin::{Mutex, MutexGuard};
use x86_64::VirtAddr;

use crate::hardware::{Hardware, X86Hardware};
use crate::hook::{DeviceHandler, HookEntry, HookError, HookRegistry};
use crate::paging::IdentityPageTable;
use crate::timer::Timer;

/// Hardware capability, identity table, hooks and timer of one CPU.
pub struct Machine<H: Hardware> {
  pub(crate) hardware: H,
  pub(crate) pages: IdentityPageTable,
  pub(crate) hooks: HookRegistry,
  pub(crate) timer: Timer,
}

impl<H: Hardware> Machine<H> {
  /// A machine with a built (not yet active) identity table.
  pub fn new(hardware: H) -> Self {
    let mut machine = Machine {
      hardware,
      pages: IdentityPageTable::new(),
      hooks: HookRegistry::new(),
      timer: Timer::new(),
    };
    machine.pages.build(&machine.hardware);
    machine
  }

  /// Switch translation of the identity window over to our table.
  ///
  /// # Safety
  /// The machine must not move after this call.
  pub unsafe fn enable_paging(&mut self) {
    unsafe { self.pages.activate(&mut self.hardware) };
  }

  /// Arm emulation of the page at `address` through `device`. The page is
  /// not present from the moment this returns.
  pub fn register_hook(
    &mut self,
    address: VirtAddr,
    device: &'static dyn DeviceHandler,
  ) -> Result<(), HookError> {
    self.hooks.insert(address, device)?;
    let index = IdentityPageTable::index_of(address).ok_or(HookError::OutOfRange(address))?;
    self.pages.set_not_present(index, &mut self.hardware);
    log::info!("hooked page {:#x}", address.as_u64());
    Ok(())
  }

  /// The hook covering `address`, if any.
  pub fn find_hook(&self, address: VirtAddr) -> Option<&HookEntry> {
    self.hooks.find(address)
  }

  /// Replace the single timer callback.
  pub fn register_timer_handler(&mut self, callback: Option<fn()>) {
    self.timer.set_callback(callback);
  }

  /// The hook table.
  pub fn hooks(&self) -> &HookRegistry {
    &self.hooks
  }

  /// The identity table.
  pub fn page_table(&self) -> &IdentityPageTable {
    &self.pages
  }

  /// The timer state.
  pub fn timer(&self) -> &Timer {
    &self.timer
  }

  /// The hardware capability.
  pub fn hardware(&self) -> &H {
    &self.hardware
  }

  /// The hardware capability, mutably.
  pub fn hardware_mut(&mut self) -> &mut H {
    &mut self.hardware
  }
}

static MACHINE: OnceCell<Mutex<Machine<X86Hardware>>> = OnceCell::uninit();

/// Build the kernel's machine state and switch to the identity table.
pub fn init(hardware: X86Hardware) {
  MACHINE
    .try_init_once(|| Mutex::new(Machine::new(hardware)))
    .expect("trap_os::machine::init should only be called once");
  // the cell now owns the machine, so the tables are at their final address
  unsafe { lock().enable_paging() };
  log::info!("identity paging active");
}

/// Lock the machine. Interrupt handlers call this directly; everything else
/// goes through [with_machine] so that a handler never spins on a lock held
/// by the code it interrupted.
pub fn lock() -> MutexGuard<'static, Machine<X86Hardware>> {
  MACHINE
    .try_get()
    .expect("machine state used before trap_os::machine::init")
    .lock()
}

/// Lock the machine unless it is already held. Exception handlers use this:
/// an exception raised while the machine is locked can never be serviced.
pub fn try_lock() -> Option<MutexGuard<'static, Machine<X86Hardware>>> {
  MACHINE.try_get().ok()?.try_lock()
}

/// Run `f` on the machine with interrupts disabled.
pub fn with_machine<R>(f: impl FnOnce(&mut Machine<X86Hardware>) -> R) -> R {
  x86_64::instructions::interrupts::without_interrupts(|| f(&mut lock()))
}
