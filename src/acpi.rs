//! Just enough ACPI to power the machine off: find the RSDP in the BIOS
//! area, walk the RSDT to the FADT, switch to ACPI mode and pull the S5
//! sleep type out of the DSDT.

use core::fmt;

use conquer_once::spin::OnceCell;
use x86_64::instructions::port::Port;
use x86_64::VirtAddr;

/// Physical range searched for the RSDP.
const BIOS_AREA: core::ops::Range<u64> = 0xE_0000..0x10_0000;
const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
/// ACPI 1.0 RSDP: signature, checksum, OEM id, revision, RSDT address.
const RSDP_LEN: usize = 20;
const RSDP_RSDT_ADDRESS: usize = 16;

/// Common header of every system description table.
const SDT_HEADER_LEN: usize = 36;
const FADT_SIGNATURE: &[u8; 4] = b"FACP";

// FADT field offsets
const FADT_DSDT: usize = 40;
const FADT_SMI_COMMAND: usize = 48;
const FADT_ACPI_ENABLE: usize = 52;
const FADT_PM1A_CONTROL: usize = 64;
const FADT_PM1B_CONTROL: usize = 68;
const FADT_MIN_LEN: usize = 72;

const AML_PACKAGE_OP: u8 = 0x12;
const AML_BYTE_PREFIX: u8 = 0x0A;
/// Bit position of SLP_TYP in PM1 control.
const SLP_TYP_SHIFT: u16 = 10;
/// PM1 control bit that enters the selected sleep state.
const SLP_EN: u16 = 1 << 13;

/// Status polls after the ACPI enable command.
const ACPI_ENABLE_SPINS: u32 = 10_000;

/// Why ACPI discovery stopped. None of these stop the boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
  /// No RSDP in the BIOS area.
  RsdpNotFound,
  /// A table failed its checksum.
  BadChecksum([u8; 4]),
  /// The RSDT lists no FADT.
  FadtNotFound,
  /// A table is shorter than its fixed fields.
  Truncated([u8; 4]),
  /// The DSDT has no usable `_S5_` package.
  S5NotFound,
  /// [init] ran twice.
  AlreadyInitialized,
}

impl fmt::Display for AcpiError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fn name(signature: &[u8; 4]) -> &str { core::str::from_utf8(signature).unwrap_or("????") }
    match self {
      AcpiError::RsdpNotFound => write!(f, "RSDP not found"),
      AcpiError::BadChecksum(signature) => write!(f, "{} checksum failed", name(signature)),
      AcpiError::FadtNotFound => write!(f, "FADT not found"),
      AcpiError::Truncated(signature) => write!(f, "{} is truncated", name(signature)),
      AcpiError::S5NotFound => write!(f, "_S5_ not found in DSDT"),
      AcpiError::AlreadyInitialized => write!(f, "ACPI already initialized"),
    }
  }
}

/// What the FADT tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fadt {
  /// Physical address of the DSDT.
  pub dsdt: u32,
  /// Port taking the ACPI enable command, 0 if already in ACPI mode.
  pub smi_command: u32,
  /// Value to write to `smi_command`.
  pub acpi_enable: u8,
  /// PM1a control block port.
  pub pm1a_control: u32,
  /// PM1b control block port, 0 if absent.
  pub pm1b_control: u32,
}

impl Fadt {
  /// Read the fixed fields of a FADT, header included.
  pub fn parse(table: &[u8]) -> Result<Self, AcpiError> {
    if table.len() < FADT_MIN_LEN {
      return Err(AcpiError::Truncated(*FADT_SIGNATURE));
    }
    Ok(Fadt {
      dsdt: read_u32(table, FADT_DSDT),
      smi_command: read_u32(table, FADT_SMI_COMMAND),
      acpi_enable: table[FADT_ACPI_ENABLE],
      pm1a_control: read_u32(table, FADT_PM1A_CONTROL),
      pm1b_control: read_u32(table, FADT_PM1B_CONTROL),
    })
  }
}

/// Values written to PM1 control to enter S5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepType {
  /// SLP_TYPa, already shifted into place.
  pub a: u16,
  /// SLP_TYPb, already shifted into place.
  pub b: u16,
}

/// Everything [shutdown] needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerControl {
  /// PM1a control block port.
  pub pm1a_control: u16,
  /// PM1b control block port, 0 if absent.
  pub pm1b_control: u16,
  /// S5 sleep type.
  pub s5: SleepType,
}

static POWER: OnceCell<PowerControl> = OnceCell::uninit();

fn read_u32(bytes: &[u8], at: usize) -> u32 {
  u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Byte sum of the whole table is zero.
pub fn checksum_ok(table: &[u8]) -> bool {
  table.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)) == 0
}

/// Offset of a valid RSDP within `area`, which starts on a 16-byte boundary.
pub fn find_rsdp(area: &[u8]) -> Option<usize> {
  (0..area.len().saturating_sub(RSDP_LEN - 1))
    .step_by(16)
    .find(|&at| {
      let candidate = &area[at..at + RSDP_LEN];
      &candidate[..8] == RSDP_SIGNATURE && checksum_ok(candidate)
    })
}

/// Signature of the table starting with `header`.
pub fn signature(header: &[u8]) -> [u8; 4] {
  [header[0], header[1], header[2], header[3]]
}

/// Length field of the table starting with `header`.
pub fn table_length(header: &[u8]) -> usize {
  read_u32(header, 4) as usize
}

/// Physical addresses listed in an RSDT, header included in `rsdt`.
pub fn rsdt_entries(rsdt: &[u8]) -> impl Iterator<Item = u32> + '_ {
  rsdt
    .get(SDT_HEADER_LEN..)
    .unwrap_or(&[])
    .chunks_exact(4)
    .map(|entry| read_u32(entry, 0))
}

/// Find `_S5_` in AML bytecode and decode the first two package elements.
///
/// This is a pattern match, not an AML interpreter: `_S5_`, PackageOp, a
/// PkgLength of one to four bytes, NumElements, then two integers that are
/// either a raw byte or BytePrefix followed by a byte.
pub fn parse_s5(aml: &[u8]) -> Option<SleepType> {
  let start = aml.windows(4).position(|window| window == b"_S5_")?;
  let mut bytes = aml[start + 4..].iter().copied();

  if bytes.next()? != AML_PACKAGE_OP {
    return None;
  }
  let lead = bytes.next()?;
  // the top two bits count the PkgLength bytes that follow the lead byte
  for _ in 0..(lead >> 6) {
    bytes.next()?;
  }
  // NumElements
  bytes.next()?;

  let mut integer = || -> Option<u16> {
    let mut value = bytes.next()?;
    if value == AML_BYTE_PREFIX {
      value = bytes.next()?;
    }
    Some(u16::from(value) << SLP_TYP_SHIFT)
  };
  let a = integer()?;
  let b = integer()?;
  Some(SleepType { a, b })
}

/// A physical range as seen through the bootloader's mapping of all of
/// physical memory.
///
/// # Safety
/// The range must be physical memory that is not written concurrently.
unsafe fn physical(offset: VirtAddr, address: u64, len: usize) -> &'static [u8] {
  let ptr = (offset + address).as_ptr::<u8>();
  unsafe { core::slice::from_raw_parts(ptr, len) }
}

/// A whole table given its physical address, checksum verified.
///
/// # Safety
/// `address` must point to an ACPI table.
unsafe fn table(offset: VirtAddr, address: u64) -> Result<&'static [u8], AcpiError> {
  let header = unsafe { physical(offset, address, SDT_HEADER_LEN) };
  let len = table_length(header);
  if len < SDT_HEADER_LEN {
    return Err(AcpiError::Truncated(signature(header)));
  }
  let table = unsafe { physical(offset, address, len) };
  if !checksum_ok(table) {
    return Err(AcpiError::BadChecksum(signature(header)));
  }
  Ok(table)
}

/// Discover the power-off registers and switch the chipset into ACPI mode.
pub fn init(physical_memory_offset: VirtAddr) -> Result<(), AcpiError> {
  let area_len = (BIOS_AREA.end - BIOS_AREA.start) as usize;
  let area = unsafe { physical(physical_memory_offset, BIOS_AREA.start, area_len) };
  let rsdp_at = find_rsdp(area).ok_or(AcpiError::RsdpNotFound)?;
  let rsdt_address = read_u32(&area[rsdp_at..], RSDP_RSDT_ADDRESS);
  log::info!("RSDP at {:#x}, RSDT at {:#x}", BIOS_AREA.start + rsdp_at as u64, rsdt_address);

  let rsdt = unsafe { table(physical_memory_offset, u64::from(rsdt_address))? };
  let fadt = rsdt_entries(rsdt)
    .find_map(|address| {
      let header = unsafe { physical(physical_memory_offset, u64::from(address), SDT_HEADER_LEN) };
      (&signature(header) == FADT_SIGNATURE).then(|| address)
    })
    .ok_or(AcpiError::FadtNotFound)?;
  let fadt = Fadt::parse(unsafe { table(physical_memory_offset, u64::from(fadt))? })?;

  if fadt.smi_command != 0 && fadt.acpi_enable != 0 {
    let mut smi: Port<u8> = Port::new(fadt.smi_command as u16);
    unsafe { smi.write(fadt.acpi_enable) };
    for _ in 0..ACPI_ENABLE_SPINS {
      core::hint::spin_loop();
    }
    log::info!("ACPI mode enabled through port {:#x}", fadt.smi_command);
  }

  let dsdt = unsafe { table(physical_memory_offset, u64::from(fadt.dsdt))? };
  let s5 = parse_s5(&dsdt[SDT_HEADER_LEN..]).ok_or(AcpiError::S5NotFound)?;

  let power = PowerControl {
    pm1a_control: fadt.pm1a_control as u16,
    pm1b_control: fadt.pm1b_control as u16,
    s5,
  };
  POWER
    .try_init_once(|| power)
    .map_err(|_| AcpiError::AlreadyInitialized)?;
  log::info!("S5 ready: {:x?}", power);
  Ok(())
}

/// The power-off registers found by [init], if it succeeded.
pub fn power_control() -> Option<&'static PowerControl> {
  POWER.get()
}

/// Enter S5. Returns only if the machine is still running afterwards, or
/// if [init] never found the registers.
pub fn shutdown() {
  let power = match power_control() {
    Some(power) => power,
    None => {
      log::warn!("ACPI not initialized, cannot power off");
      return;
    }
  };
  log::info!("ACPI shutdown");
  unsafe {
    Port::<u16>::new(power.pm1a_control).write(power.s5.a | SLP_EN);
    if power.pm1b_control != 0 {
      Port::<u16>::new(power.pm1b_control).write(power.s5.b | SLP_EN);
    }
  }
}
