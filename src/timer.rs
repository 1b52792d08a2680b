//! The periodic timer: PIT channel 0 programming, the tick counter and the
//! one registrable tick callback.

use core::fmt;

use x86_64::instructions::port::Port;

/// Input clock of the 8253/8254 PIT, in Hz.
pub const PIT_BASE_FREQUENCY: u32 = 1_193_180;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary.
const PIT_SQUARE_WAVE: u8 = 0x36;

/// Callback run on every tick, inside the timer interrupt.
pub type TimerCallback = fn();

/// A frequency the PIT cannot produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
  /// Zero Hz or above the base clock.
  TooFast(u32),
  /// The divisor would not fit in 16 bits.
  TooSlow(u32),
}

impl fmt::Display for TimerError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TimerError::TooFast(hz) => write!(f, "{} Hz is not reachable from a {} Hz clock", hz, PIT_BASE_FREQUENCY),
      TimerError::TooSlow(hz) => write!(f, "{} Hz needs a divisor wider than 16 bits", hz),
    }
  }
}

/// Reload value for `frequency`: `floor(PIT_BASE_FREQUENCY / frequency)`.
pub fn divisor(frequency: u32) -> Result<u16, TimerError> {
  if frequency == 0 || frequency > PIT_BASE_FREQUENCY {
    return Err(TimerError::TooFast(frequency));
  }
  let divisor = PIT_BASE_FREQUENCY / frequency;
  if divisor > u32::from(u16::MAX) {
    return Err(TimerError::TooSlow(frequency));
  }
  Ok(divisor as u16)
}

/// Program PIT channel 0 to fire IRQ0 at `frequency`.
pub fn init_pit(frequency: u32) -> Result<(), TimerError> {
  let [low, high] = divisor(frequency)?.to_le_bytes();
  let mut command: Port<u8> = Port::new(PIT_COMMAND);
  let mut channel0: Port<u8> = Port::new(PIT_CHANNEL0);

  unsafe {
    command.write(PIT_SQUARE_WAVE);
    channel0.write(low);
    channel0.write(high);
  }
  log::info!("PIT at {} Hz (divisor {})", frequency, u16::from_le_bytes([low, high]));
  Ok(())
}

/// Tick counter and the registered callback.
#[derive(Debug, Default)]
pub struct Timer {
  ticks: u64,
  callback: Option<TimerCallback>,
}

impl Timer {
  /// No ticks, no callback.
  pub const fn new() -> Self {
    Timer {
      ticks: 0,
      callback: None,
    }
  }

  /// Count one tick and return the callback to run for it.
  ///
  /// The callback is returned rather than called so the interrupt handler
  /// can release the machine lock first.
  pub fn tick(&mut self) -> Option<TimerCallback> {
    self.ticks = self.ticks.wrapping_add(1);
    self.callback
  }

  /// Replace the callback; `None` removes it.
  pub fn set_callback(&mut self, callback: Option<TimerCallback>) {
    self.callback = callback;
    match callback {
      Some(callback) => log::info!("timer callback registered at {:#x}", callback as usize),
      None => log::info!("timer callback removed"),
    }
  }

  /// The registered callback.
  pub fn callback(&self) -> Option<TimerCallback> {
    self.callback
  }

  /// Ticks counted so far.
  pub fn ticks(&self) -> u64 {
    self.ticks
  }
}
