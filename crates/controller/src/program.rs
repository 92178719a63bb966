//! Watering programs: schedule match rules (weekday mask, day interval,
//! odd/even restriction), fixed and repeating start times with sun-relative
//! offsets, and the packed record codec for `prog.dat`.
//!
//! All schedule matching runs against localized timestamps; the caller
//! applies the timezone offset first.

use chrono::Datelike;

use crate::station::MAX_NUM_STATIONS;

pub const MAX_NUM_PROGRAMS: usize = 40;
pub const MAX_NUM_START_TIMES: usize = 4;
pub const PROGRAM_NAME_SIZE: usize = 32;

/// Queue id for manually started programs; dynamic events skip anything at or
/// above this id.
pub const MANUAL_PROGRAM_ID: u8 = 99;
/// Queue id for the run-once test program.
pub const TEST_PROGRAM_ID: u8 = 254;

/// Duration sentinel: water from sunrise to sunset.
pub const SUNRISE_TO_SUNSET: u16 = 65534;
/// Duration sentinel: water from sunset to next sunrise.
pub const SUNSET_TO_SUNRISE: u16 = 65535;

/// Start-time bit fields: bit 15 disables the slot, bit 14 selects a
/// sunrise-relative offset, bit 13 sunset-relative, bit 12 is the offset
/// sign, bits 0-10 the offset minutes.
const START_TIME_DISABLED_BIT: u16 = 15;
const START_TIME_SUNRISE_BIT: u16 = 14;
const START_TIME_SUNSET_BIT: u16 = 13;
const START_TIME_SIGN_BIT: u16 = 12;

pub const SPECIAL_CMD_REBOOT: &str = ":>reboot";
pub const SPECIAL_CMD_REBOOT_NOW: &str = ":>reboot_now";

const SECS_PER_DAY: i64 = 86_400;

// ---------------------------------------------------------------------------
// Water time codecs
// ---------------------------------------------------------------------------

/// Encode a signed water time (−600..=600 s) into a byte (0..=240), 5-second
/// steps. Used for the station delay and master on/off adjustments.
pub fn water_time_encode_signed(signed: i16) -> u8 {
    ((signed.clamp(-600, 600) + 600) / 5) as u8
}

/// Decode a byte (0..=240) back to signed seconds (−600..=600).
pub fn water_time_decode_signed(encoded: u8) -> i16 {
    (i16::from(encoded).min(240) - 120) * 5
}

/// Resolve a program duration code to seconds. The two sentinels map to the
/// daylight and night spans derived from the cached sunrise/sunset minutes.
pub fn water_time_resolve(code: u16, sunrise_min: u16, sunset_min: u16) -> i64 {
    match code {
        SUNRISE_TO_SUNSET => i64::from(sunset_min - sunrise_min) * 60,
        SUNSET_TO_SUNRISE => i64::from(sunrise_min + 1440 - sunset_min) * 60,
        _ => i64::from(code),
    }
}

// ---------------------------------------------------------------------------
// Program record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OddEven {
    None = 0,
    Odd = 1,
    Even = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScheduleType {
    /// `days[0]` is a weekday bitmask, bit 0 = Monday.
    Weekly = 0,
    /// `days[0] & 0x1F` is a day of month.
    Monthly = 2,
    /// Every `days[1]` days, with remainder `days[0]` against the epoch day.
    Interval = 3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub enabled: bool,
    pub use_weather: bool,
    pub odd_even: OddEven,
    pub schedule: ScheduleType,
    /// `true`: up to four fixed start times. `false`: repeating — slot 0 is
    /// the first start, slot 1 the repeat count, slot 2 the interval minutes.
    pub fixed_starts: bool,
    pub days: [u8; 2],
    pub start_times: [i16; MAX_NUM_START_TIMES],
    /// Per-station duration codes (seconds, or a sun-span sentinel).
    pub durations: Vec<u16>,
    pub name: String,
}

impl Default for Program {
    fn default() -> Self {
        Self {
            enabled: false,
            use_weather: false,
            odd_even: OddEven::None,
            schedule: ScheduleType::Weekly,
            fixed_starts: true,
            days: [0, 0],
            start_times: [-1, -1, -1, -1],
            durations: vec![0; MAX_NUM_STATIONS],
            name: String::new(),
        }
    }
}

impl Program {
    /// Uniform run-once program used for test starts.
    pub fn test_program(duration: u16) -> Self {
        Self {
            durations: vec![duration; MAX_NUM_STATIONS],
            ..Default::default()
        }
    }

    /// Program names beginning with `':'` are commands, not watering
    /// schedules.
    pub fn is_command(&self) -> bool {
        self.name.starts_with(':')
    }

    /// Decode one start-time slot to minutes past midnight, resolving
    /// sun-relative offsets against the cached sunrise/sunset. Returns −1 for
    /// a disabled slot.
    pub fn start_time_decode(&self, slot: i16, sunrise_min: u16, sunset_min: u16) -> i16 {
        let t = slot as u16;
        if t >> START_TIME_DISABLED_BIT & 1 != 0 {
            return -1;
        }
        let mut offset = (t & 0x7FF) as i16;
        if t >> START_TIME_SIGN_BIT & 1 != 0 {
            offset = -offset;
        }
        if t >> START_TIME_SUNRISE_BIT & 1 != 0 {
            (sunrise_min as i16 + offset).max(0)
        } else if t >> START_TIME_SUNSET_BIT & 1 != 0 {
            (sunset_min as i16 + offset).min(1439)
        } else {
            slot
        }
    }

    /// `true` iff the program should fire at the given localized timestamp.
    /// Checks the day rule and then whether the current minute hits one of
    /// the derived start times, including repeats that carry over from a
    /// start the previous day.
    pub fn check_match(&self, now_local: i64, sunrise_min: u16, sunset_min: u16) -> bool {
        if !self.enabled {
            return false;
        }

        let start = self.start_time_decode(self.start_times[0], sunrise_min, sunset_min);
        let repeat = self.start_times[1];
        let interval = self.start_times[2];
        let current_minute = ((now_local % SECS_PER_DAY) / 60) as i16;

        // first, assume the program starts today
        if self.check_day_match(now_local) {
            if self.fixed_starts {
                return self.start_times.iter().any(|&slot| {
                    current_minute == self.start_time_decode(slot, sunrise_min, sunset_min)
                });
            }
            if current_minute == start {
                return true;
            }
            if current_minute > start && interval != 0 {
                let c = (current_minute - start) / interval;
                if c * interval == current_minute - start && c <= repeat {
                    return true;
                }
            }
        }

        // repeats can carry over midnight from a start the previous day
        if self.fixed_starts || interval == 0 {
            return false;
        }
        if self.check_day_match(now_local - SECS_PER_DAY) {
            let c = (current_minute - start + 1440) / interval;
            if c * interval == current_minute - start + 1440 && c <= repeat {
                return true;
            }
        }
        false
    }

    fn check_day_match(&self, t: i64) -> bool {
        let Some(dt) = chrono::DateTime::from_timestamp(t, 0) else {
            return false;
        };
        let weekday = dt.weekday().num_days_from_monday() as u8;
        let day = dt.day();
        let month = dt.month();

        let day_ok = match self.schedule {
            ScheduleType::Weekly => self.days[0] & (1 << weekday) != 0,
            ScheduleType::Monthly => day == u32::from(self.days[0] & 0x1F),
            ScheduleType::Interval => {
                self.days[1] != 0
                    && ((t / SECS_PER_DAY) % i64::from(self.days[1])) == i64::from(self.days[0])
            }
        };
        if !day_ok {
            return false;
        }

        match self.odd_even {
            OddEven::None => true,
            // odd-day schedules skip the 31st and Feb 29 so consecutive-day
            // watering cannot happen across month boundaries
            OddEven::Odd => day != 31 && !(day == 29 && month == 2) && day % 2 == 1,
            OddEven::Even => day % 2 == 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Disk codec
// ---------------------------------------------------------------------------

/// One packed record: flags, days, start times, durations, name.
pub const PROGRAM_RECORD_SIZE: usize =
    1 + 2 + MAX_NUM_START_TIMES * 2 + MAX_NUM_STATIONS * 2 + PROGRAM_NAME_SIZE;

fn encode_record(p: &Program) -> Vec<u8> {
    let mut out = Vec::with_capacity(PROGRAM_RECORD_SIZE);
    let mut flags = 0u8;
    flags |= u8::from(p.enabled);
    flags |= u8::from(p.use_weather) << 1;
    flags |= (p.odd_even as u8) << 2;
    flags |= (p.schedule as u8) << 4;
    flags |= u8::from(p.fixed_starts) << 6;
    out.push(flags);
    out.extend_from_slice(&p.days);
    for st in p.start_times {
        out.extend_from_slice(&st.to_le_bytes());
    }
    for sid in 0..MAX_NUM_STATIONS {
        let d = p.durations.get(sid).copied().unwrap_or(0);
        out.extend_from_slice(&d.to_le_bytes());
    }
    let mut name = [0u8; PROGRAM_NAME_SIZE];
    let bytes = p.name.as_bytes();
    let n = bytes.len().min(PROGRAM_NAME_SIZE);
    name[..n].copy_from_slice(&bytes[..n]);
    out.extend_from_slice(&name);
    out
}

fn decode_record(rec: &[u8]) -> Program {
    let flags = rec[0];
    let odd_even = match (flags >> 2) & 0x03 {
        1 => OddEven::Odd,
        2 => OddEven::Even,
        _ => OddEven::None,
    };
    let schedule = match (flags >> 4) & 0x03 {
        2 => ScheduleType::Monthly,
        3 => ScheduleType::Interval,
        _ => ScheduleType::Weekly,
    };
    let mut start_times = [0i16; MAX_NUM_START_TIMES];
    for (i, st) in start_times.iter_mut().enumerate() {
        *st = i16::from_le_bytes([rec[3 + i * 2], rec[4 + i * 2]]);
    }
    let dur_base = 3 + MAX_NUM_START_TIMES * 2;
    let durations = (0..MAX_NUM_STATIONS)
        .map(|i| u16::from_le_bytes([rec[dur_base + i * 2], rec[dur_base + i * 2 + 1]]))
        .collect();
    let name_base = dur_base + MAX_NUM_STATIONS * 2;
    let name_bytes = &rec[name_base..name_base + PROGRAM_NAME_SIZE];
    let end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(PROGRAM_NAME_SIZE);
    Program {
        enabled: flags & 1 != 0,
        use_weather: flags & 2 != 0,
        odd_even,
        schedule,
        fixed_starts: flags & (1 << 6) != 0,
        days: [rec[1], rec[2]],
        start_times,
        durations,
        name: String::from_utf8_lossy(&name_bytes[..end]).into_owned(),
    }
}

/// Encode the program table for `prog.dat`: a count byte then packed records.
pub fn encode_programs(programs: &[Program]) -> Vec<u8> {
    let n = programs.len().min(MAX_NUM_PROGRAMS);
    let mut out = Vec::with_capacity(1 + n * PROGRAM_RECORD_SIZE);
    out.push(n as u8);
    for p in &programs[..n] {
        out.extend_from_slice(&encode_record(p));
    }
    out
}

/// Decode `prog.dat`; a missing or truncated file yields an empty table.
pub fn decode_programs(bytes: &[u8]) -> Vec<Program> {
    let Some(&n) = bytes.first() else {
        return Vec::new();
    };
    let n = (n as usize).min(MAX_NUM_PROGRAMS);
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let start = 1 + i * PROGRAM_RECORD_SIZE;
        let end = start + PROGRAM_RECORD_SIZE;
        if end > bytes.len() {
            break;
        }
        out.push(decode_record(&bytes[start..end]));
    }
    out
}

// ===========================================================================
// Tests
// ===========================================================================
