//! Persistent configuration: integer options, string options, station
//! records, programs, and non-volatile controller status, stored as flat
//! binary files in the data directory. Factory reset rewrites everything to
//! defaults and drops the `done.dat` marker.
//!
//! Files absent or short on read are treated as all-zero and recreated on the
//! next save.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::program::{self, Program};
use crate::station::{self, Station, MAX_EXT_BOARDS, MAX_NUM_STATIONS, STATION_RECORD_SIZE};

/// Byte-sized firmware version written into the options table; a mismatch on
/// boot triggers a factory reset.
pub const FIRMWARE_VERSION: u8 = 30;
pub const FIRMWARE_MINOR: u8 = 0;

/// Fixed slot size for string options.
pub const SOPT_SIZE: usize = 160;

const IOPTS_FILE: &str = "iopts.dat";
const SOPTS_FILE: &str = "sopts.dat";
const STATIONS_FILE: &str = "stns.dat";
const NVCON_FILE: &str = "nvcon.dat";
const PROGRAMS_FILE: &str = "prog.dat";
const DONE_FILE: &str = "done.dat";

// ---------------------------------------------------------------------------
// Integer options
// ---------------------------------------------------------------------------

/// Closed enumeration of byte-sized options, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum IntOpt {
    FwVersion = 0,
    Timezone,
    HttpPort0,
    HttpPort1,
    ExtBoards,
    StationDelay,
    MasterStation,
    MasterOnAdj,
    MasterOffAdj,
    WaterPercentage,
    DeviceEnable,
    WeatherAlgorithm,
    EnableLogging,
    MasterStation2,
    MasterOnAdj2,
    MasterOffAdj2,
    FwMinor,
    PulseRate0,
    PulseRate1,
    RemoteExtMode,
    SpeAutoRefresh,
    IftttEnable,
    Sensor1Type,
    Sensor1Option,
    Sensor2Type,
    Sensor2Option,
    Sensor1OnDelay,
    Sensor1OffDelay,
    Sensor2OnDelay,
    Sensor2OffDelay,
    Reset,
}

/// Total number of integer options.
pub const NUM_IOPTS: usize = IntOpt::Reset as usize + 1;

impl IntOpt {
    /// Declared maximum, enforced on write.
    pub fn max(self) -> u8 {
        match self {
            IntOpt::Timezone => 108,
            IntOpt::ExtBoards => MAX_EXT_BOARDS as u8,
            IntOpt::StationDelay
            | IntOpt::MasterOnAdj
            | IntOpt::MasterOffAdj
            | IntOpt::MasterOnAdj2
            | IntOpt::MasterOffAdj2
            | IntOpt::Sensor1OnDelay
            | IntOpt::Sensor1OffDelay
            | IntOpt::Sensor2OnDelay
            | IntOpt::Sensor2OffDelay => 240,
            IntOpt::MasterStation | IntOpt::MasterStation2 => MAX_NUM_STATIONS as u8,
            IntOpt::WaterPercentage => 250,
            IntOpt::DeviceEnable
            | IntOpt::EnableLogging
            | IntOpt::RemoteExtMode
            | IntOpt::SpeAutoRefresh
            | IntOpt::Sensor1Option
            | IntOpt::Sensor2Option
            | IntOpt::Reset => 1,
            _ => 255,
        }
    }

    pub fn default_value(self) -> u8 {
        match self {
            IntOpt::FwVersion => FIRMWARE_VERSION,
            IntOpt::FwMinor => FIRMWARE_MINOR,
            IntOpt::Timezone => 48, // UTC
            IntOpt::HttpPort0 => 80,
            IntOpt::StationDelay
            | IntOpt::MasterOnAdj
            | IntOpt::MasterOffAdj
            | IntOpt::MasterOnAdj2
            | IntOpt::MasterOffAdj2 => 120, // encoded zero seconds
            IntOpt::WaterPercentage => 100,
            IntOpt::DeviceEnable | IntOpt::EnableLogging => 1,
            IntOpt::PulseRate0 => 100,
            IntOpt::Sensor1Option | IntOpt::Sensor2Option => 1, // normally open
            _ => 0,
        }
    }

    /// All options in on-disk order.
    pub const ALL: [IntOpt; NUM_IOPTS] = [
        IntOpt::FwVersion,
        IntOpt::Timezone,
        IntOpt::HttpPort0,
        IntOpt::HttpPort1,
        IntOpt::ExtBoards,
        IntOpt::StationDelay,
        IntOpt::MasterStation,
        IntOpt::MasterOnAdj,
        IntOpt::MasterOffAdj,
        IntOpt::WaterPercentage,
        IntOpt::DeviceEnable,
        IntOpt::WeatherAlgorithm,
        IntOpt::EnableLogging,
        IntOpt::MasterStation2,
        IntOpt::MasterOnAdj2,
        IntOpt::MasterOffAdj2,
        IntOpt::FwMinor,
        IntOpt::PulseRate0,
        IntOpt::PulseRate1,
        IntOpt::RemoteExtMode,
        IntOpt::SpeAutoRefresh,
        IntOpt::IftttEnable,
        IntOpt::Sensor1Type,
        IntOpt::Sensor1Option,
        IntOpt::Sensor2Type,
        IntOpt::Sensor2Option,
        IntOpt::Sensor1OnDelay,
        IntOpt::Sensor1OffDelay,
        IntOpt::Sensor2OnDelay,
        IntOpt::Sensor2OffDelay,
        IntOpt::Reset,
    ];
}

/// The integer option table. Cheap to clone and re-read every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegerOptions {
    values: [u8; NUM_IOPTS],
}

impl Default for IntegerOptions {
    fn default() -> Self {
        let mut values = [0u8; NUM_IOPTS];
        for opt in IntOpt::ALL {
            values[opt as usize] = opt.default_value();
        }
        Self { values }
    }
}

impl IntegerOptions {
    pub fn get(&self, opt: IntOpt) -> u8 {
        self.values[opt as usize]
    }

    /// Write an option, capping at its declared maximum.
    pub fn set(&mut self, opt: IntOpt, value: u8) {
        self.values[opt as usize] = value.min(opt.max());
    }

    pub fn as_bytes(&self) -> &[u8; NUM_IOPTS] {
        &self.values
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut values = [0u8; NUM_IOPTS];
        let n = bytes.len().min(NUM_IOPTS);
        values[..n].copy_from_slice(&bytes[..n]);
        Self { values }
    }

    // -- Derived views ------------------------------------------------------

    /// Number of boards including the base unit.
    pub fn board_count(&self) -> usize {
        self.get(IntOpt::ExtBoards) as usize + 1
    }

    pub fn station_count(&self) -> usize {
        self.board_count() * station::SHIFT_REGISTER_LINES
    }

    pub fn http_port(&self) -> u16 {
        u16::from(self.get(IntOpt::HttpPort1)) << 8 | u16::from(self.get(IntOpt::HttpPort0))
    }

    pub fn flow_pulse_rate(&self) -> u16 {
        u16::from(self.get(IntOpt::PulseRate1)) << 8 | u16::from(self.get(IntOpt::PulseRate0))
    }

    /// Station index of a master valve. The stored byte is 1-biased with 0
    /// meaning "none"; that bias is preserved on disk and unwrapped here.
    pub fn master_station(&self, master: usize) -> Option<usize> {
        let raw = match master {
            0 => self.get(IntOpt::MasterStation),
            _ => self.get(IntOpt::MasterStation2),
        };
        match raw {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    pub fn is_master(&self, sid: usize) -> bool {
        self.master_station(0) == Some(sid) || self.master_station(1) == Some(sid)
    }

    /// Master on/off adjustments, decoded to signed seconds.
    pub fn master_adjustments(&self, master: usize) -> (i64, i64) {
        let (on, off) = match master {
            0 => (self.get(IntOpt::MasterOnAdj), self.get(IntOpt::MasterOffAdj)),
            _ => (
                self.get(IntOpt::MasterOnAdj2),
                self.get(IntOpt::MasterOffAdj2),
            ),
        };
        (
            i64::from(program::water_time_decode_signed(on)),
            i64::from(program::water_time_decode_signed(off)),
        )
    }

    /// Station-delay spacing between chained sequential runs, in seconds.
    pub fn station_delay(&self) -> i64 {
        i64::from(program::water_time_decode_signed(self.get(IntOpt::StationDelay)))
    }

    pub fn device_enabled(&self) -> bool {
        self.get(IntOpt::DeviceEnable) != 0
    }

    pub fn logging_enabled(&self) -> bool {
        self.get(IntOpt::EnableLogging) != 0
    }

    pub fn remote_ext_mode(&self) -> bool {
        self.get(IntOpt::RemoteExtMode) != 0
    }

    pub fn special_auto_refresh(&self) -> bool {
        self.get(IntOpt::SpeAutoRefresh) != 0
    }
}

// ---------------------------------------------------------------------------
// String options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StrOpt {
    Password = 0,
    Location,
    JavascriptUrl,
    WeatherUrl,
    WeatherOpts,
    IftttKey,
    MqttOpts,
}

pub const NUM_SOPTS: usize = StrOpt::MqttOpts as usize + 1;

/// MD5 of the default password.
const DEFAULT_PASSWORD_HASH: &str = "a6d82bced638de3def1e9bbb4983225c";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringOptions {
    values: Vec<String>,
}

impl Default for StringOptions {
    fn default() -> Self {
        let mut values = vec![String::new(); NUM_SOPTS];
        values[StrOpt::Password as usize] = DEFAULT_PASSWORD_HASH.to_string();
        values[StrOpt::Location as usize] = "0,0".to_string();
        Self { values }
    }
}

impl StringOptions {
    pub fn get(&self, opt: StrOpt) -> &str {
        &self.values[opt as usize]
    }

    /// Write an option, truncating to the fixed slot size (a NUL terminator
    /// must fit).
    pub fn set(&mut self, opt: StrOpt, value: &str) {
        let mut v = value.to_string();
        v.truncate(SOPT_SIZE - 1);
        self.values[opt as usize] = v;
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; NUM_SOPTS * SOPT_SIZE];
        for (i, v) in self.values.iter().enumerate() {
            let bytes = v.as_bytes();
            let n = bytes.len().min(SOPT_SIZE - 1);
            out[i * SOPT_SIZE..i * SOPT_SIZE + n].copy_from_slice(&bytes[..n]);
        }
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut values = vec![String::new(); NUM_SOPTS];
        for (i, value) in values.iter_mut().enumerate() {
            let start = i * SOPT_SIZE;
            if start >= bytes.len() {
                break;
            }
            let slot = &bytes[start..(start + SOPT_SIZE).min(bytes.len())];
            let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
            *value = String::from_utf8_lossy(&slot[..end]).into_owned();
        }
        Self { values }
    }
}

// ---------------------------------------------------------------------------
// Non-volatile controller status
// ---------------------------------------------------------------------------

/// Reboot cause codes, persisted in `nvcon.dat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RebootCause {
    None = 0,
    Reset = 1,
    Button = 2,
    Timer = 4,
    Web = 5,
    FirmwareUpdate = 7,
    WeatherFail = 8,
    NetworkFail = 9,
    Program = 11,
    PowerOn = 99,
}

impl RebootCause {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::Reset,
            2 => Self::Button,
            4 => Self::Timer,
            5 => Self::Web,
            7 => Self::FirmwareUpdate,
            8 => Self::WeatherFail,
            9 => Self::NetworkFail,
            11 => Self::Program,
            99 => Self::PowerOn,
            _ => Self::None,
        }
    }
}

/// Persisted after every state transition that touches any field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvData {
    /// Sunrise, minutes past local midnight.
    pub sunrise_min: u16,
    /// Sunset, minutes past local midnight.
    pub sunset_min: u16,
    /// Rain delay stop time, epoch seconds; 0 = no pending delay.
    pub rd_stop_time: i64,
    /// External IP as reported by the weather service.
    pub external_ip: u32,
    pub reboot_cause: RebootCause,
}

impl Default for NvData {
    fn default() -> Self {
        Self {
            sunrise_min: 360,  // 06:00
            sunset_min: 1080, // 18:00
            rd_stop_time: 0,
            external_ip: 0,
            reboot_cause: RebootCause::None,
        }
    }
}

const NVCON_SIZE: usize = 13;

impl NvData {
    fn encode(&self) -> [u8; NVCON_SIZE] {
        let mut out = [0u8; NVCON_SIZE];
        out[0..2].copy_from_slice(&self.sunrise_min.to_le_bytes());
        out[2..4].copy_from_slice(&self.sunset_min.to_le_bytes());
        out[4..8].copy_from_slice(&(self.rd_stop_time.max(0) as u32).to_le_bytes());
        out[8..12].copy_from_slice(&self.external_ip.to_le_bytes());
        out[12] = self.reboot_cause as u8;
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        if bytes.len() < NVCON_SIZE {
            return Self {
                sunrise_min: 0,
                sunset_min: 0,
                rd_stop_time: 0,
                external_ip: 0,
                reboot_cause: RebootCause::None,
            };
        }
        Self {
            sunrise_min: u16::from_le_bytes([bytes[0], bytes[1]]),
            sunset_min: u16::from_le_bytes([bytes[2], bytes[3]]),
            rd_stop_time: i64::from(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])),
            external_ip: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            reboot_cause: RebootCause::from_byte(bytes[12]),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Flat-file store rooted at the data directory. Callers serialize writes;
/// the engine and the external request handler share one task.
pub struct ConfigStore {
    data_dir: PathBuf,
}

impl ConfigStore {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    fn read_file(&self, name: &str) -> Vec<u8> {
        fs::read(self.path(name)).unwrap_or_default()
    }

    fn write_file(&self, name: &str, bytes: &[u8]) -> Result<()> {
        fs::write(self.path(name), bytes)
            .with_context(|| format!("failed to write {}", self.path(name).display()))
    }

    /// `true` when the last factory reset ran to completion and the stored
    /// firmware version matches this build.
    pub fn is_initialized(&self) -> bool {
        let done = self.read_file(DONE_FILE);
        if done.first() != Some(&1) {
            return false;
        }
        let iopts = IntegerOptions::from_bytes(&self.read_file(IOPTS_FILE));
        iopts.get(IntOpt::FwVersion) == FIRMWARE_VERSION
    }

    pub fn read_iopts(&self) -> IntegerOptions {
        IntegerOptions::from_bytes(&self.read_file(IOPTS_FILE))
    }

    pub fn write_iopts(&self, iopts: &IntegerOptions) -> Result<()> {
        self.write_file(IOPTS_FILE, iopts.as_bytes())
    }

    pub fn read_sopts(&self) -> StringOptions {
        StringOptions::decode(&self.read_file(SOPTS_FILE))
    }

    pub fn write_sopts(&self, sopts: &StringOptions) -> Result<()> {
        self.write_file(SOPTS_FILE, &sopts.encode())
    }

    pub fn read_stations(&self) -> Vec<Station> {
        let bytes = self.read_file(STATIONS_FILE);
        if bytes.len() < MAX_NUM_STATIONS * STATION_RECORD_SIZE {
            return station::default_stations();
        }
        bytes
            .chunks_exact(STATION_RECORD_SIZE)
            .take(MAX_NUM_STATIONS)
            .map(Station::decode_record)
            .collect()
    }

    pub fn write_stations(&self, stations: &[Station]) -> Result<()> {
        let mut out = Vec::with_capacity(MAX_NUM_STATIONS * STATION_RECORD_SIZE);
        for i in 0..MAX_NUM_STATIONS {
            let rec = stations
                .get(i)
                .cloned()
                .unwrap_or_default()
                .encode_record();
            out.extend_from_slice(&rec);
        }
        self.write_file(STATIONS_FILE, &out)
    }

    pub fn read_nv(&self) -> NvData {
        NvData::decode(&self.read_file(NVCON_FILE))
    }

    pub fn write_nv(&self, nv: &NvData) -> Result<()> {
        self.write_file(NVCON_FILE, &nv.encode())
    }

    pub fn read_programs(&self) -> Vec<Program> {
        program::decode_programs(&self.read_file(PROGRAMS_FILE))
    }

    pub fn write_programs(&self, programs: &[Program]) -> Result<()> {
        self.write_file(PROGRAMS_FILE, &program::encode_programs(programs))
    }

    /// Rewrite every file to defaults. The `done.dat` marker is removed
    /// first and recreated last, so an interrupted reset re-triggers on the
    /// next boot.
    pub fn factory_reset(&self) -> Result<()> {
        warn!("factory reset: rewriting configuration to defaults");
        let _ = fs::remove_file(self.path(DONE_FILE));

        self.write_iopts(&IntegerOptions::default())?;
        self.write_sopts(&StringOptions::default())?;
        self.write_stations(&station::default_stations())?;
        self.write_programs(&[])?;
        self.write_nv(&NvData {
            reboot_cause: RebootCause::Reset,
            ..Default::default()
        })?;

        self.write_file(DONE_FILE, &[1])?;
        info!("factory reset complete");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
