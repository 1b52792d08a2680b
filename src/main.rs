//! The trap_os kernel binary: boot, hook the vault device, run the
//! application from disk and idle.

#![cfg_attr(target_os = "none", no_std, no_main)]
#![warn(missing_docs)]

#[cfg(target_os = "none")]
mod kernel {
  use bootloader::{entry_point, BootInfo};
  use core::panic::PanicInfo;
  use x86_64::VirtAddr;

  use trap_os::ata::{self, SECTOR_SIZE};
  use trap_os::config::{
    APP_LOAD_ADDRESS, APP_NAME, FS_SECTORS, FS_START_LBA, SHUTDOWN_AFTER_APP, VAULT_DEVICE_ADDRESS,
  };
  use trap_os::device::VaultDevice;
  use trap_os::fs::{File, FileTable};
  use trap_os::{acpi, machine, println};

  const FS_IMAGE_LEN: usize = FS_SECTORS as usize * SECTOR_SIZE;

  static VAULT: VaultDevice = VaultDevice::new();

  // register [kernel_main] as the entry point called by bootloader.
  entry_point!(kernel_main);

  /// The bootloader maps all of physical memory at
  /// `boot_info.physical_memory_offset`; the kernel needs that to reach
  /// page tables and ACPI tables.
  fn kernel_main(boot_info: &'static BootInfo) -> ! {
    let physical_memory_offset = VirtAddr::new(boot_info.physical_memory_offset);
    trap_os::init(physical_memory_offset);
    if let Err(error) = acpi::init(physical_memory_offset) {
      log::warn!("ACPI unavailable: {}", error);
    }

    println!("Loading Filesystem...");
    let image = load_filesystem();
    let table = match FileTable::parse(image) {
      Ok(table) => table,
      Err(error) => {
        println!("ERR: {}", error);
        trap_os::halt()
      }
    };
    println!("Done. {} files", table.len());

    let hooked = machine::with_machine(|machine| {
      machine.register_hook(VirtAddr::new(VAULT_DEVICE_ADDRESS), &VAULT)
    });
    if let Err(error) = hooked {
      log::warn!("vault not hooked: {}", error);
    }

    x86_64::instructions::interrupts::enable();

    match table.find(APP_NAME) {
      Some(app) => run(app),
      None => println!("{} not found", APP_NAME),
    }

    if SHUTDOWN_AFTER_APP {
      acpi::shutdown();
      println!("Shutdown failed");
      trap_os::halt();
    }
    println!("HLT");
    trap_os::hlt_loop()
  }

  /// Read the file system image into memory. A disk error is fatal.
  fn load_filesystem() -> &'static [u8] {
    static mut FS_IMAGE: [u8; FS_IMAGE_LEN] = [0; FS_IMAGE_LEN];
    // only the boot path touches the image, and only once
    let image = unsafe { &mut *core::ptr::addr_of_mut!(FS_IMAGE) };
    if let Err(error) = ata::read_sectors(FS_START_LBA, FS_SECTORS, image) {
      println!("ERR: disk read failed: {}", error);
      trap_os::halt();
    }
    image
  }

  /// Copy the application to its load address and call its first byte.
  fn run(app: File<'_>) {
    let code = app.data();
    println!("Running App at {:#x}...", APP_LOAD_ADDRESS);
    let entry = APP_LOAD_ADDRESS as *mut u8;
    unsafe {
      core::ptr::copy_nonoverlapping(code.as_ptr(), entry, code.len());
      let entry: extern "C" fn() = core::mem::transmute(entry);
      entry();
    }
    log::info!("{} returned", APP_NAME);
  }

  /// Print the panic and stop.
  #[panic_handler]
  fn panic(info: &PanicInfo) -> ! {
    log::error!("{}", info);
    println!("{}", info);
    trap_os::halt()
  }
}

#[cfg(not(target_os = "none"))]
fn main() {
  eprintln!("trap_os only runs on bare metal; build it with `cargo bootimage`");
}
