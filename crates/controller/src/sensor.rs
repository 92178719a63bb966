//! Sensor inputs: debounced rain/soil sensors, the program-switch pattern
//! trigger, and the pulse-counting flow sensor.

use serde::Serialize;

pub const MAX_SENSORS: usize = 2;

/// Floor applied to both debounce delays to suppress contact chatter.
const MINIMUM_DELAY_SECS: i64 = 5;

/// Pulses inside this window after the first pulse are ignored for rate
/// measurement; the line needs time to fill before the rate is meaningful.
const FLOW_MEASURE_SETTLE_MS: i64 = 90_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum SensorType {
    None = 0x00,
    Rain = 0x01,
    Flow = 0x02,
    Soil = 0x03,
    ProgramSwitch = 0xF0,
    Other = 0xFF,
}

impl SensorType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Self::Rain,
            0x02 => Self::Flow,
            0x03 => Self::Soil,
            0xF0 => Self::ProgramSwitch,
            0xFF => Self::Other,
            _ => Self::None,
        }
    }

    /// Rain and soil sensors gate running stations through dynamic events.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Rain | Self::Soil)
    }
}

// ---------------------------------------------------------------------------
// Binary sensor (rain / soil) with on/off delays
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct BinarySensor {
    on_timer: Option<i64>,
    off_timer: Option<i64>,
    /// Debounced state.
    pub active: bool,
    /// When the sensor last became active; used for log durations.
    pub active_last_time: Option<i64>,
    /// Raw state history for the program-switch pattern filter.
    history: u8,
}

impl BinarySensor {
    /// Feed one debounce tick. `detected` is the raw read already adjusted
    /// for the normally-open/closed wiring.
    pub fn update(&mut self, detected: bool, now: i64, on_delay_min: u8, off_delay_min: u8) {
        if detected {
            match self.on_timer {
                None => {
                    self.on_timer =
                        Some(now + (i64::from(on_delay_min) * 60).max(MINIMUM_DELAY_SECS));
                    self.off_timer = None;
                }
                Some(t) if now > t => self.active = true,
                Some(_) => {}
            }
        } else {
            match self.off_timer {
                None => {
                    self.off_timer =
                        Some(now + (i64::from(off_delay_min) * 60).max(MINIMUM_DELAY_SECS));
                    self.on_timer = None;
                }
                Some(t) if now > t => self.active = false,
                Some(_) => {}
            }
        }
    }

    /// Shift the raw state into the 4-bit history and report a one-shot
    /// trigger when the pattern is two lows followed by two highs.
    pub fn poll_switch(&mut self, detected: bool) -> bool {
        self.history = (self.history << 1) | u8::from(detected);
        self.history & 0b1111 == 0b0011
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Flow sensor
// ---------------------------------------------------------------------------

/// Pulse counter polled every millisecond; a pulse is recorded only on a raw
/// high→low transition.
#[derive(Debug)]
pub struct FlowSensor {
    /// Monotonic pulse count since boot.
    flow_count: u64,
    /// First pulse of the current measurement session (ms).
    flow_start: Option<i64>,
    /// Start of the measured span, set once the line has settled.
    flow_begin: Option<i64>,
    /// Most recent pulse (ms).
    flow_stop: i64,
    /// Pulses in the current session.
    flow_gallons: u64,
    prev_high: bool,
}

impl Default for FlowSensor {
    fn default() -> Self {
        Self {
            flow_count: 0,
            flow_start: None,
            flow_begin: None,
            flow_stop: 0,
            flow_gallons: 0,
            // sensor lines idle high (pull-up)
            prev_high: true,
        }
    }
}

impl FlowSensor {
    /// Poll the raw level; only a high→low transition registers a pulse.
    pub fn poll(&mut self, level_high: bool, now_ms: i64) {
        let falling = self.prev_high && !level_high;
        self.prev_high = level_high;
        if falling {
            self.pulse(now_ms);
        }
    }

    fn pulse(&mut self, now_ms: i64) {
        self.flow_count += 1;

        if self.flow_start.is_none() {
            self.flow_gallons = 0;
            self.flow_begin = None;
            self.flow_start = Some(now_ms);
        }
        let start = self.flow_start.unwrap_or(now_ms);
        if now_ms - start < FLOW_MEASURE_SETTLE_MS {
            self.flow_gallons = 0;
        } else if self.flow_gallons == 2 {
            self.flow_begin = Some(now_ms);
        }
        self.flow_stop = now_ms;
        self.flow_gallons += 1;
    }

    pub fn flow_count(&self) -> u64 {
        self.flow_count
    }

    pub fn gallons(&self) -> u64 {
        self.flow_gallons
    }

    pub fn begin_ms(&self) -> Option<i64> {
        self.flow_begin
    }

    pub fn stop_ms(&self) -> i64 {
        self.flow_stop
    }

    /// Start a fresh measurement session (valve just opened).
    pub fn reset(&mut self) {
        self.flow_start = None;
    }

    /// Average rate of the last session in gallons per minute, 0 when fewer
    /// than two measured pulses.
    pub fn measure_gpm(&self) -> f64 {
        if self.flow_gallons <= 1 {
            return 0.0;
        }
        let Some(begin) = self.flow_begin else {
            return 0.0;
        };
        let span = self.flow_stop - begin;
        if span <= 0 {
            return 0.0;
        }
        60_000.0 / (span as f64 / (self.flow_gallons - 1) as f64)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
