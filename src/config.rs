//! Compile-time configuration of the kernel.
//!
//! Everything that the boot path or the trap engine treats as a fixed
//! value lives here so that the numbers are named once.

use log::LevelFilter;

/// Number of slots in the hook table.
pub const MAX_HOOKS: usize = 10;

/// Vector offset of the master PIC (IRQ0..IRQ7).
pub const PIC_1_OFFSET: u8 = 0x20;
/// Vector offset of the slave PIC (IRQ8..IRQ15).
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Target frequency of the periodic timer, one tick every 50us.
pub const TIMER_FREQUENCY_HZ: u32 = 20_000;

/// Page emulated by the reference vault device.
pub const VAULT_DEVICE_ADDRESS: u64 = 0x1F_0000;

/// First sector of the file system image on the primary ATA disk. The boot
/// image sits in front of it; `tools/mkdisk` pads it up to here.
pub const FS_START_LBA: u32 = 0x4000;
/// Number of sectors read from the disk for the file system image.
pub const FS_SECTORS: u32 = 2500;

/// Name of the application launched after boot.
pub const APP_NAME: &str = "app.bin";
/// Address the application is copied to and called at.
pub const APP_LOAD_ADDRESS: u64 = 0x2_0000;

/// Power the machine off through ACPI once the application returns.
pub const SHUTDOWN_AFTER_APP: bool = false;

/// Maximum level of records forwarded to the serial logger.
#[cfg(feature = "trace-traps")]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Trace;
/// Maximum level of records forwarded to the serial logger.
#[cfg(not(feature = "trace-traps"))]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;
