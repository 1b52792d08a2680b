//! PIO reads from the master drive on the primary ATA bus, 28-bit LBA.

use core::fmt;

use x86_64::instructions::port::{Port, PortReadOnly, PortWriteOnly};

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// Most sectors one READ SECTORS command transfers here. The count register
/// is 8 bits wide and 0 would mean 256.
pub const MAX_BATCH: u32 = 255;

/// Highest sector a 28-bit LBA reaches, plus one.
const LBA28_LIMIT: u32 = 1 << 28;

const ATA_DATA: u16 = 0x1F0;
const ATA_SECTOR_COUNT: u16 = 0x1F2;
const ATA_LBA_LOW: u16 = 0x1F3;
const ATA_LBA_MID: u16 = 0x1F4;
const ATA_LBA_HIGH: u16 = 0x1F5;
const ATA_DRIVE: u16 = 0x1F6;
const ATA_STATUS: u16 = 0x1F7;
const ATA_COMMAND: u16 = 0x1F7;

const ATA_CMD_READ_PIO: u8 = 0x20;
/// LBA mode, master drive. The low nibble carries LBA bits 24..27.
const ATA_DRIVE_LBA_MASTER: u8 = 0xE0;

const ATA_SR_BSY: u8 = 0x80;
const ATA_SR_DF: u8 = 0x20;
const ATA_SR_DRQ: u8 = 0x08;
const ATA_SR_ERR: u8 = 0x01;

/// Status polls before a wait gives up.
const ATA_TIMEOUT: u32 = 1_000_000;

/// Why a read did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaError {
  /// The buffer cannot hold the requested sectors.
  BufferTooSmall {
    /// Bytes the read needs.
    needed: usize,
    /// Bytes available.
    available: usize,
  },
  /// The range reaches past what a 28-bit LBA can address.
  OutOfRange(u32),
  /// The drive set ERR or DF; carries the status register.
  DriveError(u8),
  /// The drive stayed busy or never asked for the transfer.
  Timeout,
}

impl fmt::Display for AtaError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AtaError::BufferTooSmall { needed, available } => {
        write!(f, "read needs {} bytes, buffer has {}", needed, available)
      }
      AtaError::OutOfRange(lba) => write!(f, "sector {:#x} is beyond 28-bit LBA", lba),
      AtaError::DriveError(status) => write!(f, "drive error, status {:#04x}", status),
      AtaError::Timeout => write!(f, "drive timed out"),
    }
  }
}

/// Split `count` sectors starting at `lba` into `(lba, count)` commands of
/// at most [MAX_BATCH] sectors.
pub fn batches(lba: u32, count: u32) -> impl Iterator<Item = (u32, u8)> {
  (0..count).step_by(MAX_BATCH as usize).map(move |done| {
    let n = (count - done).min(MAX_BATCH);
    (lba + done, n as u8)
  })
}

/// Read `count` sectors starting at `lba` into the front of `buffer`.
pub fn read_sectors(lba: u32, count: u32, buffer: &mut [u8]) -> Result<(), AtaError> {
  let needed = count as usize * SECTOR_SIZE;
  if buffer.len() < needed {
    return Err(AtaError::BufferTooSmall {
      needed,
      available: buffer.len(),
    });
  }
  match lba.checked_add(count) {
    Some(end) if end <= LBA28_LIMIT => {}
    _ => return Err(AtaError::OutOfRange(lba)),
  }

  let mut sectors = buffer[..needed].chunks_exact_mut(SECTOR_SIZE);
  for (start, n) in batches(lba, count) {
    unsafe { issue_read(start, n) };
    for sector in sectors.by_ref().take(n as usize) {
      unsafe { read_sector(sector)? };
    }
  }
  log::debug!("read {} sectors from LBA {}", count, lba);
  Ok(())
}

/// Program the task file and send READ SECTORS.
unsafe fn issue_read(lba: u32, count: u8) {
  let mut drive: Port<u8> = Port::new(ATA_DRIVE);
  let mut sector_count: Port<u8> = Port::new(ATA_SECTOR_COUNT);
  let mut lba_low: Port<u8> = Port::new(ATA_LBA_LOW);
  let mut lba_mid: Port<u8> = Port::new(ATA_LBA_MID);
  let mut lba_high: Port<u8> = Port::new(ATA_LBA_HIGH);
  let mut command: PortWriteOnly<u8> = PortWriteOnly::new(ATA_COMMAND);

  unsafe {
    drive.write(ATA_DRIVE_LBA_MASTER | ((lba >> 24) & 0x0F) as u8);
    sector_count.write(count);
    lba_low.write(lba as u8);
    lba_mid.write((lba >> 8) as u8);
    lba_high.write((lba >> 16) as u8);
    command.write(ATA_CMD_READ_PIO);
  }
}

/// Wait for the next sector and copy it out of the data port.
unsafe fn read_sector(sector: &mut [u8]) -> Result<(), AtaError> {
  let mut data: PortReadOnly<u16> = PortReadOnly::new(ATA_DATA);
  unsafe { wait_for_data()? };
  for word in sector.chunks_exact_mut(2) {
    let value = unsafe { data.read() };
    word.copy_from_slice(&value.to_le_bytes());
  }
  Ok(())
}

/// Poll until BSY clears and DRQ is set.
unsafe fn wait_for_data() -> Result<(), AtaError> {
  let mut status: PortReadOnly<u8> = PortReadOnly::new(ATA_STATUS);
  for _ in 0..ATA_TIMEOUT {
    let value = unsafe { status.read() };
    if value & ATA_SR_BSY != 0 {
      continue;
    }
    if value & (ATA_SR_ERR | ATA_SR_DF) != 0 {
      return Err(AtaError::DriveError(value));
    }
    if value & ATA_SR_DRQ != 0 {
      return Ok(());
    }
  }
  Err(AtaError::Timeout)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_batches_cover_the_range() {
    let batches: Vec<_> = batches(64, 2500).collect();
    assert_eq!(batches.len(), 10);
    assert!(batches.iter().all(|&(_, n)| n > 0));
    assert_eq!(batches[0], (64, 255));
    assert_eq!(batches[9], (64 + 9 * 255, 205));
    let total: u32 = batches.iter().map(|&(_, n)| u32::from(n)).sum();
    assert_eq!(total, 2500);
  }

  #[test]
  fn test_batches_edges() {
    assert_eq!(batches(0, 0).count(), 0);
    assert_eq!(batches(7, 255).collect::<Vec<_>>(), vec![(7, 255)]);
    assert_eq!(batches(7, 256).collect::<Vec<_>>(), vec![(7, 255), (262, 1)]);
  }

  #[test]
  fn test_read_checks_before_touching_the_drive() {
    let mut small = [0u8; SECTOR_SIZE];
    assert_eq!(
      read_sectors(0, 2, &mut small),
      Err(AtaError::BufferTooSmall {
        needed: 1024,
        available: 512
      })
    );
    assert_eq!(
      read_sectors(LBA28_LIMIT - 1, 2, &mut [0u8; 1024]),
      Err(AtaError::OutOfRange(LBA28_LIMIT - 1))
    );
  }
}
