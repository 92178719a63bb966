//! GPIO backend. The `gpio` feature gates the real rppal driver; without it,
//! a mock implementation records writes and lets tests inject input levels.

use anyhow::Result;

/// BCM pin assignments for the controller board.
pub mod pin {
    /// Shift register clock.
    pub const SR_CLOCK: u8 = 4;
    /// Shift register output enable (active low).
    pub const SR_OE: u8 = 17;
    /// Shift register latch.
    pub const SR_LATCH: u8 = 22;
    /// Shift register data.
    pub const SR_DATA: u8 = 27;
    pub const SENSOR_1: u8 = 14;
    pub const SENSOR_2: u8 = 23;
    /// RF transmitter data pin.
    pub const RF_TX: u8 = 15;
}

// ---------------------------------------------------------------------------
// Real GPIO backend (production — requires rppal + compatible hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
mod backend {
    use super::pin;
    use anyhow::{Context, Result};
    use rppal::gpio::{Gpio, InputPin, OutputPin};
    use std::collections::HashMap;

    pub struct GpioBackend {
        gpio: Gpio,
        sr_clock: OutputPin,
        sr_latch: OutputPin,
        sr_data: OutputPin,
        _sr_oe: OutputPin,
        rf_tx: OutputPin,
        sensors: [InputPin; 2],
        /// Station-GPIO output pins, opened on first use.
        aux: HashMap<u8, OutputPin>,
    }

    impl GpioBackend {
        pub fn new() -> Result<Self> {
            let gpio = Gpio::new().context("failed to open GPIO chip")?;
            let sr_clock = gpio.get(pin::SR_CLOCK)?.into_output_high();
            let sr_latch = gpio.get(pin::SR_LATCH)?.into_output_high();
            let sr_data = gpio.get(pin::SR_DATA)?.into_output_high();
            // OE is active low; drive it low so outputs are enabled.
            let mut sr_oe = gpio.get(pin::SR_OE)?.into_output_high();
            sr_oe.set_low();
            let rf_tx = gpio.get(pin::RF_TX)?.into_output_low();
            let mut sensor_1 = gpio.get(pin::SENSOR_1)?.into_input_pullup();
            let mut sensor_2 = gpio.get(pin::SENSOR_2)?.into_input_pullup();
            sensor_1.set_reset_on_drop(false);
            sensor_2.set_reset_on_drop(false);
            Ok(Self {
                gpio,
                sr_clock,
                sr_latch,
                sr_data,
                _sr_oe: sr_oe,
                rf_tx,
                sensors: [sensor_1, sensor_2],
                aux: HashMap::new(),
            })
        }

        /// Commit one byte per board, highest board first, bit 7 first,
        /// bracketed by the latch.
        pub fn shift_out(&mut self, boards_high_first: &[u8]) {
            self.sr_latch.set_low();
            for &bits in boards_high_first {
                for s in 0..8 {
                    self.sr_clock.set_low();
                    if bits & (1 << (7 - s)) != 0 {
                        self.sr_data.set_high();
                    } else {
                        self.sr_data.set_low();
                    }
                    self.sr_clock.set_high();
                }
            }
            self.sr_latch.set_high();
        }

        pub fn read_sensor(&self, index: usize) -> bool {
            self.sensors[index].is_high()
        }

        pub fn write_rf(&mut self, high: bool) {
            if high {
                self.rf_tx.set_high();
            } else {
                self.rf_tx.set_low();
            }
        }

        pub fn write_aux_pin(&mut self, pin: u8, high: bool) -> Result<()> {
            if !self.aux.contains_key(&pin) {
                let out = self
                    .gpio
                    .get(pin)
                    .with_context(|| format!("failed to open GPIO pin {pin}"))?
                    .into_output();
                self.aux.insert(pin, out);
            }
            let out = self.aux.get_mut(&pin).expect("pin opened above");
            if high {
                out.set_high();
            } else {
                out.set_low();
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Mock backend (development and tests — no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
mod backend {
    use anyhow::Result;
    use std::collections::HashMap;
    use tracing::debug;

    pub struct GpioBackend {
        /// Last byte vector committed through the shift register.
        pub committed: Vec<u8>,
        pub commit_count: u64,
        /// Injected raw sensor levels; real lines idle high (pull-up).
        pub sensor_levels: [bool; 2],
        pub aux_pins: HashMap<u8, bool>,
        pub rf_level: bool,
        /// Number of RF pin writes, for asserting that nothing transmitted.
        pub rf_writes: u64,
    }

    impl GpioBackend {
        pub fn new() -> Result<Self> {
            debug!("gpio backend: mock (no hardware)");
            Ok(Self {
                committed: Vec::new(),
                commit_count: 0,
                sensor_levels: [true; 2],
                aux_pins: HashMap::new(),
                rf_level: false,
                rf_writes: 0,
            })
        }

        pub fn shift_out(&mut self, boards_high_first: &[u8]) {
            self.committed = boards_high_first.to_vec();
            self.commit_count += 1;
        }

        pub fn read_sensor(&self, index: usize) -> bool {
            self.sensor_levels[index]
        }

        pub fn write_rf(&mut self, high: bool) {
            self.rf_level = high;
            self.rf_writes += 1;
        }

        pub fn write_aux_pin(&mut self, pin: u8, high: bool) -> Result<()> {
            debug!(pin, high, "aux pin write");
            self.aux_pins.insert(pin, high);
            Ok(())
        }
    }
}

pub use backend::GpioBackend;

/// Open the backend; on failure the caller decides whether to run without
/// outputs.
pub fn open() -> Result<GpioBackend> {
    GpioBackend::new()
}

// ===========================================================================
// Tests
// ===========================================================================
