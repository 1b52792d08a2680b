//! Build the disk trap_os boots from: the boot image produced by
//! `cargo bootimage`, padded up to the file system sector, followed by a
//! file system image holding the application.
//!
//! ```text
//! mkdisk <bootimage> <app-elf> <output>
//! qemu-system-x86_64 -drive format=raw,file=<output> -serial stdio
//! ```

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use trap_os::ata::SECTOR_SIZE;
use trap_os::config::{APP_LOAD_ADDRESS, APP_NAME, FS_SECTORS, FS_START_LBA};

const FS_START: usize = FS_START_LBA as usize * SECTOR_SIZE;
const FS_LEN: usize = FS_SECTORS as usize * SECTOR_SIZE;

fn main() -> Result<()> {
  let args: Vec<String> = env::args().collect();
  if args.len() != 4 {
    eprintln!("Usage: {} <bootimage> <app-elf> <output>", args[0]);
    eprintln!(
      "Example: {} target/x86_64-trap_os/debug/bootimage-trap_os.bin app/target/x86_64-trap_os/release/trap_app disk.img",
      args[0]
    );
    std::process::exit(1);
  }

  let boot = read(&args[1])?;
  let app = flatten(&read(&args[2])?).with_context(|| format!("loading {}", args[2]))?;
  println!("{}: {} bytes at {:#x}", APP_NAME, app.len(), APP_LOAD_ADDRESS);

  let disk = assemble(&boot, &[(APP_NAME, &app[..])])?;
  fs::write(&args[3], &disk).with_context(|| format!("writing {}", args[3]))?;
  println!(
    "{}: boot image {} bytes, file system at sector {:#x}, {} sectors total",
    args[3],
    boot.len(),
    FS_START_LBA,
    disk.len() / SECTOR_SIZE
  );
  Ok(())
}

fn read(path: impl AsRef<Path>) -> Result<Vec<u8>> {
  let path = path.as_ref();
  fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// The memory image of an application ELF: every load segment placed
/// relative to [APP_LOAD_ADDRESS], with zeroes for `.bss` and the gaps.
/// The kernel calls the first byte, so that is where the entry must be.
fn flatten(elf: &[u8]) -> Result<Vec<u8>> {
  let elf = ElfFile::new(elf).map_err(|e| anyhow!("not an ELF file: {}", e))?;
  let entry = elf.header.pt2.entry_point();
  if entry != APP_LOAD_ADDRESS {
    bail!("entry point {:#x} is not the load address {:#x}", entry, APP_LOAD_ADDRESS);
  }

  let mut image = Vec::new();
  for segment in elf.program_iter() {
    if segment.get_type() != Ok(Type::Load) || segment.mem_size() == 0 {
      continue;
    }
    let start = segment
      .virtual_addr()
      .checked_sub(APP_LOAD_ADDRESS)
      .ok_or_else(|| anyhow!("segment at {:#x} below the load address", segment.virtual_addr()))?
      as usize;
    let end = start + segment.mem_size() as usize;
    if image.len() < end {
      image.resize(end, 0);
    }

    let offset = segment.offset() as usize;
    let file_size = segment.file_size() as usize;
    let bytes = elf
      .input
      .get(offset..offset + file_size)
      .ok_or_else(|| anyhow!("segment at {:#x} runs past the file", segment.virtual_addr()))?;
    image[start..start + file_size].copy_from_slice(bytes);
  }

  if image.is_empty() {
    bail!("no load segments");
  }
  Ok(image)
}

/// Pad `boot` to [FS_START] and append a file system image of exactly
/// [FS_LEN] bytes, which is what the kernel reads back.
fn assemble(boot: &[u8], files: &[(&str, &[u8])]) -> Result<Vec<u8>> {
  if boot.len() > FS_START {
    bail!(
      "boot image is {} bytes, the file system starts at byte {:#x}",
      boot.len(),
      FS_START
    );
  }
  let mut disk = boot.to_vec();
  disk.resize(FS_START + FS_LEN, 0);
  trap_os::fs::write_image(files, &mut disk[FS_START..]).map_err(|e| anyhow!("{}", e))?;
  Ok(disk)
}
