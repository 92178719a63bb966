//! Station records: attributes, type-specific payloads for RF/remote/GPIO/
//! HTTP stations, and the fixed-layout disk codec.
//!
//! Special-station payloads are parsed once at load time into typed data;
//! the legacy ASCII encodings only exist on disk.

use std::net::Ipv4Addr;

use serde::Serialize;

/// Extension boards supported beyond the base unit.
pub const MAX_EXT_BOARDS: usize = 24;

/// Maximum number of 8-zone boards, base unit included.
pub const MAX_NUM_BOARDS: usize = 1 + MAX_EXT_BOARDS;

/// Stations per board (one shift-register byte).
pub const SHIFT_REGISTER_LINES: usize = 8;

/// Maximum number of stations.
pub const MAX_NUM_STATIONS: usize = MAX_NUM_BOARDS * SHIFT_REGISTER_LINES;

/// Maximum characters in a station name.
pub const STATION_NAME_SIZE: usize = 32;

/// Bytes of type-specific payload in a station record.
pub const SPECIAL_DATA_SIZE: usize = 211;

/// On-disk size of one station record: name, attribute dword, type byte,
/// payload.
pub const STATION_RECORD_SIZE: usize = STATION_NAME_SIZE + 4 + 1 + SPECIAL_DATA_SIZE;

/// Maximum water time (seconds) a peer controller accepts: 18 hours.
pub const MAX_WATER_TIME: i64 = 64_800;

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Per-station attribute flags. The packed dword layout below is an on-disk
/// concern only; in memory the flags are independent booleans.
///
/// Bit layout: 0 mas, 1 igs, 2 mas2, 3 dis, 4 seq, 5 igs2, 6 igrd, 7 unused,
/// 8-11 gid, rest reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StationAttrib {
    /// Activate master station 1 while this station runs.
    pub use_master_1: bool,
    /// Ignore sensor 1.
    pub ignore_sensor_1: bool,
    /// Activate master station 2 while this station runs.
    pub use_master_2: bool,
    /// Station disabled.
    pub disabled: bool,
    /// Sequential scheduling (chained, non-overlapping runs).
    pub sequential: bool,
    /// Ignore sensor 2.
    pub ignore_sensor_2: bool,
    /// Ignore rain delay.
    pub ignore_rain_delay: bool,
    /// Group id, reserved.
    pub group_id: u8,
}

impl Default for StationAttrib {
    fn default() -> Self {
        Self {
            use_master_1: false,
            ignore_sensor_1: false,
            use_master_2: false,
            disabled: false,
            sequential: true,
            ignore_sensor_2: false,
            ignore_rain_delay: false,
            group_id: 0,
        }
    }
}

impl StationAttrib {
    pub fn pack(&self) -> u32 {
        let mut v = 0u32;
        v |= u32::from(self.use_master_1);
        v |= u32::from(self.ignore_sensor_1) << 1;
        v |= u32::from(self.use_master_2) << 2;
        v |= u32::from(self.disabled) << 3;
        v |= u32::from(self.sequential) << 4;
        v |= u32::from(self.ignore_sensor_2) << 5;
        v |= u32::from(self.ignore_rain_delay) << 6;
        v |= u32::from(self.group_id & 0x0F) << 8;
        v
    }

    pub fn unpack(v: u32) -> Self {
        Self {
            use_master_1: v & 1 != 0,
            ignore_sensor_1: v & (1 << 1) != 0,
            use_master_2: v & (1 << 2) != 0,
            disabled: v & (1 << 3) != 0,
            sequential: v & (1 << 4) != 0,
            ignore_sensor_2: v & (1 << 5) != 0,
            ignore_rain_delay: v & (1 << 6) != 0,
            group_id: ((v >> 8) & 0x0F) as u8,
        }
    }

    pub fn uses_master(&self, master: usize) -> bool {
        match master {
            0 => self.use_master_1,
            _ => self.use_master_2,
        }
    }

    pub fn ignores_sensor(&self, sensor: usize) -> bool {
        match sensor {
            0 => self.ignore_sensor_1,
            _ => self.ignore_sensor_2,
        }
    }
}

// ---------------------------------------------------------------------------
// Special-station payloads
// ---------------------------------------------------------------------------

/// RF payload: 16 hex chars on disk, `on[6] off[6] timing[4]`.
/// `timing == 0` marks the record invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RfData {
    pub on: u32,
    pub off: u32,
    pub timing: u16,
}

impl RfData {
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() < 16 {
            return None;
        }
        Some(Self {
            on: u32::from_str_radix(&s[0..6], 16).ok()?,
            off: u32::from_str_radix(&s[6..12], 16).ok()?,
            timing: u16::from_str_radix(&s[12..16], 16).ok()?,
        })
    }

    pub fn encode(&self) -> String {
        format!("{:06x}{:06x}{:04x}", self.on, self.off, self.timing)
    }
}

/// Remote payload: 14 hex chars on disk, `ip[8] port[4] sid[2]` — a peer
/// controller's address and station index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoteData {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub station: usize,
}

impl RemoteData {
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() < 14 {
            return None;
        }
        Some(Self {
            ip: Ipv4Addr::from(u32::from_str_radix(&s[0..8], 16).ok()?),
            port: u16::from_str_radix(&s[8..12], 16).ok()?,
            station: usize::from_str_radix(&s[12..14], 16).ok()?,
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{:08x}{:04x}{:02x}",
            u32::from(self.ip),
            self.port,
            self.station
        )
    }
}

/// GPIO payload: three ASCII decimal chars on disk, zero-padded pin number
/// then active level (`0` or `1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GpioData {
    pub pin: u8,
    pub active_high: bool,
}

impl GpioData {
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() < 3 {
            return None;
        }
        let pin = s[0..2].parse::<u8>().ok()?;
        let active_high = match &s[2..3] {
            "0" => false,
            "1" => true,
            _ => return None,
        };
        Some(Self { pin, active_high })
    }

    pub fn encode(&self) -> String {
        format!("{:02}{}", self.pin, u8::from(self.active_high))
    }
}

/// HTTP payload: CSV `server,port,on_cmd,off_cmd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpData {
    pub server: String,
    pub port: u16,
    pub cmd_on: String,
    pub cmd_off: String,
}

impl HttpData {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(4, ',');
        let server = parts.next()?.to_string();
        let port = parts.next()?.parse::<u16>().ok()?;
        let cmd_on = parts.next()?.to_string();
        let cmd_off = parts.next()?.to_string();
        if server.is_empty() {
            return None;
        }
        Some(Self {
            server,
            port,
            cmd_on,
            cmd_off,
        })
    }

    pub fn encode(&self) -> String {
        format!("{},{},{},{}", self.server, self.port, self.cmd_on, self.cmd_off)
    }
}

/// Type tag plus parsed payload. Standard and Other stations carry no data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SpecialData {
    Standard,
    Rf(RfData),
    Remote(RemoteData),
    Gpio(GpioData),
    Http(HttpData),
    Other,
}

/// Station type codes as stored in the record's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum StationType {
    Standard = 0x00,
    Rf = 0x01,
    Remote = 0x02,
    Gpio = 0x03,
    Http = 0x04,
    Other = 0xFF,
}

impl StationType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Self::Rf,
            0x02 => Self::Remote,
            0x03 => Self::Gpio,
            0x04 => Self::Http,
            0xFF => Self::Other,
            _ => Self::Standard,
        }
    }
}

impl SpecialData {
    pub fn station_type(&self) -> StationType {
        match self {
            Self::Standard => StationType::Standard,
            Self::Rf(_) => StationType::Rf,
            Self::Remote(_) => StationType::Remote,
            Self::Gpio(_) => StationType::Gpio,
            Self::Http(_) => StationType::Http,
            Self::Other => StationType::Other,
        }
    }

    /// Parse a payload for the given type byte. Malformed payloads degrade to
    /// `Standard`; the station still tracks bits in memory, the side effect is
    /// a no-op.
    pub fn parse(station_type: StationType, sped: &str) -> Self {
        match station_type {
            StationType::Standard => Self::Standard,
            StationType::Other => Self::Other,
            StationType::Rf => RfData::parse(sped).map(Self::Rf).unwrap_or(Self::Standard),
            StationType::Remote => RemoteData::parse(sped)
                .map(Self::Remote)
                .unwrap_or(Self::Standard),
            StationType::Gpio => GpioData::parse(sped)
                .map(Self::Gpio)
                .unwrap_or(Self::Standard),
            StationType::Http => HttpData::parse(sped)
                .map(Self::Http)
                .unwrap_or(Self::Standard),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Standard | Self::Other => String::new(),
            Self::Rf(d) => d.encode(),
            Self::Remote(d) => d.encode(),
            Self::Gpio(d) => d.encode(),
            Self::Http(d) => d.encode(),
        }
    }
}

// ---------------------------------------------------------------------------
// Station record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    pub name: String,
    pub attrib: StationAttrib,
    pub data: SpecialData,
}

impl Default for Station {
    fn default() -> Self {
        Self {
            name: String::new(),
            attrib: StationAttrib::default(),
            data: SpecialData::Standard,
        }
    }
}

impl Station {
    pub fn station_type(&self) -> StationType {
        self.data.station_type()
    }

    /// Serialize one record into its fixed disk layout.
    pub fn encode_record(&self) -> [u8; STATION_RECORD_SIZE] {
        let mut rec = [0u8; STATION_RECORD_SIZE];
        let name = self.name.as_bytes();
        let n = name.len().min(STATION_NAME_SIZE);
        rec[..n].copy_from_slice(&name[..n]);
        rec[STATION_NAME_SIZE..STATION_NAME_SIZE + 4]
            .copy_from_slice(&self.attrib.pack().to_le_bytes());
        rec[STATION_NAME_SIZE + 4] = self.station_type() as u8;
        let sped = self.data.encode();
        let sped = sped.as_bytes();
        let m = sped.len().min(SPECIAL_DATA_SIZE);
        rec[STATION_NAME_SIZE + 5..STATION_NAME_SIZE + 5 + m].copy_from_slice(&sped[..m]);
        rec
    }

    /// Decode one record from its fixed disk layout.
    pub fn decode_record(rec: &[u8]) -> Self {
        let name_end = rec[..STATION_NAME_SIZE]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(STATION_NAME_SIZE);
        let name = String::from_utf8_lossy(&rec[..name_end]).into_owned();
        let attrib = StationAttrib::unpack(u32::from_le_bytes([
            rec[STATION_NAME_SIZE],
            rec[STATION_NAME_SIZE + 1],
            rec[STATION_NAME_SIZE + 2],
            rec[STATION_NAME_SIZE + 3],
        ]));
        let station_type = StationType::from_byte(rec[STATION_NAME_SIZE + 4]);
        let sped = &rec[STATION_NAME_SIZE + 5..STATION_NAME_SIZE + 5 + SPECIAL_DATA_SIZE];
        let sped_end = sped.iter().position(|&b| b == 0).unwrap_or(sped.len());
        let sped = String::from_utf8_lossy(&sped[..sped_end]).into_owned();
        Self {
            name,
            attrib,
            data: SpecialData::parse(station_type, &sped),
        }
    }
}

/// Default station table: `S001`..`S200`, standard, sequential.
pub fn default_stations() -> Vec<Station> {
    (0..MAX_NUM_STATIONS)
        .map(|i| Station {
            name: format!("S{:03}", i + 1),
            ..Default::default()
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
