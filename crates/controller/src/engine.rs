//! The irrigation control engine: one value holding options, station records,
//! programs, volatile status, the runtime queue, and the output drivers. The
//! main loop calls [`Engine::tick`] once per wall-clock second and
//! [`Engine::flow_poll`] once per millisecond; everything else happens inside.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, IntOpt, IntegerOptions, NvData, RebootCause, StrOpt, StringOptions};
use crate::datalog::{DataLog, LogTag};
use crate::events::{Event, EventKind, EventSink};
use crate::gpio::GpioBackend;
use crate::http::HttpSender;
use crate::outputs::{BitChange, StationBits};
use crate::program::{Program, MANUAL_PROGRAM_ID};
use crate::queue::RuntimeQueue;
use crate::scheduler;
use crate::sensor::{BinarySensor, FlowSensor, SensorType, MAX_SENSORS};
use crate::special;
use crate::station::{Station, StationType, MAX_NUM_STATIONS};
use crate::weather::{WeatherAction, WeatherFetch, WeatherStatus};

/// Delay before a `:>reboot` program command takes effect; long enough that a
/// boot-time re-match of the same program cannot retrigger it.
pub const REBOOT_DELAY: i64 = 65;

/// Window for the real-time flow rate counter (seconds).
const FLOW_COUNT_RT_WINDOW: i64 = 30;

// ---------------------------------------------------------------------------
// Volatile status
// ---------------------------------------------------------------------------

/// In-RAM controller status. A snapshot from the previous tick is kept so
/// edge transitions can be detected.
#[derive(Debug, Clone, Copy)]
pub struct ConStatus {
    pub enabled: bool,
    pub rain_delayed: bool,
    pub program_busy: bool,
    pub safe_reboot: bool,
    /// Consecutive network failures reported by the service layer; non-zero
    /// suppresses weather calls.
    pub network_fails: u8,
    pub sensor_active: [bool; MAX_SENSORS],
    pub reboot_timer: i64,
}

impl Default for ConStatus {
    fn default() -> Self {
        Self {
            enabled: true,
            rain_delayed: false,
            program_busy: false,
            safe_reboot: false,
            network_fails: 0,
            sensor_active: [false; MAX_SENSORS],
            reboot_timer: 0,
        }
    }
}

/// Most recent completed station run, kept for external readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastRun {
    pub station: usize,
    pub program: u8,
    pub duration: i64,
    pub end_time: i64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    pub(crate) store: ConfigStore,
    pub(crate) iopts: IntegerOptions,
    pub(crate) sopts: StringOptions,
    pub(crate) stations: Vec<Station>,
    pub(crate) programs: Vec<Program>,
    pub(crate) nv: NvData,

    pub(crate) status: ConStatus,
    pub(crate) old_status: ConStatus,

    pub(crate) bits: StationBits,
    pub(crate) queue: RuntimeQueue,
    pub(crate) sensors: [BinarySensor; MAX_SENSORS],
    pub(crate) flow: FlowSensor,
    pub(crate) weather: WeatherStatus,

    pub(crate) gpio: GpioBackend,
    pub(crate) http: HttpSender,
    pub(crate) events: Box<dyn EventSink>,
    pub(crate) fetcher: Box<dyn WeatherFetch>,
    pub(crate) datalog: DataLog,

    /// Master station indices, re-read from options every tick.
    pub(crate) masters: [Option<usize>; 2],

    pub(crate) last_run: Option<LastRun>,
    pub(crate) last_gpm: f64,
    pub(crate) last_reboot_cause: RebootCause,
    reboot_request: Option<RebootCause>,
    reboot_notified: bool,

    /// When the current rain delay started.
    raindelay_on_last_time: Option<i64>,

    // flow accounting
    pub(crate) flow_count_log_start: u64,
    pub(crate) flow_count_rt: u64,
    flow_count_rt_start: u64,

    // special-station auto-refresh cursor; starts halfway up the table so
    // low-numbered stations are not all refreshed right after boot
    sar_next_sid: usize,
    sar_last_second: i64,

    last_minute: i64,
}

impl Engine {
    /// Boot the engine: factory-reset when the store is missing or from
    /// another firmware version, then load every table and republish the
    /// reboot cause as power-on.
    pub fn new(
        store: ConfigStore,
        gpio: GpioBackend,
        http: HttpSender,
        events: Box<dyn EventSink>,
        fetcher: Box<dyn WeatherFetch>,
    ) -> Result<Self> {
        if !store.is_initialized() {
            store.factory_reset()?;
        }

        let iopts = store.read_iopts();
        let sopts = store.read_sopts();
        let stations = store.read_stations();
        let programs = store.read_programs();
        let mut nv = store.read_nv();

        let last_reboot_cause = nv.reboot_cause;
        nv.reboot_cause = RebootCause::PowerOn;
        store.write_nv(&nv)?;

        let datalog = DataLog::new(store.data_dir());
        let status = ConStatus {
            enabled: iopts.device_enabled(),
            ..Default::default()
        };

        info!(
            stations = iopts.station_count(),
            programs = programs.len(),
            cause = ?last_reboot_cause,
            "engine ready"
        );

        Ok(Self {
            store,
            iopts,
            sopts,
            stations,
            programs,
            nv,
            status,
            old_status: status,
            bits: StationBits::new(),
            queue: RuntimeQueue::new(),
            sensors: [BinarySensor::default(); MAX_SENSORS],
            flow: FlowSensor::default(),
            weather: WeatherStatus::default(),
            gpio,
            http,
            events,
            fetcher,
            datalog,
            masters: [None; 2],
            last_run: None,
            last_gpm: 0.0,
            last_reboot_cause,
            reboot_request: None,
            reboot_notified: false,
            raindelay_on_last_time: None,
            flow_count_log_start: 0,
            flow_count_rt: 0,
            flow_count_rt_start: 0,
            sar_next_sid: MAX_NUM_STATIONS / 2,
            sar_last_second: 0,
            last_minute: 0,
        })
    }

    // -- Small views ---------------------------------------------------------

    pub fn station_count(&self) -> usize {
        self.iopts.station_count().min(MAX_NUM_STATIONS)
    }

    pub fn timezone_index(&self) -> u8 {
        self.iopts.get(IntOpt::Timezone)
    }

    pub fn is_master(&self, sid: usize) -> bool {
        self.masters[0] == Some(sid) || self.masters[1] == Some(sid)
    }

    pub fn sensor_type(&self, i: usize) -> SensorType {
        let raw = match i {
            0 => self.iopts.get(IntOpt::Sensor1Type),
            _ => self.iopts.get(IntOpt::Sensor2Type),
        };
        SensorType::from_byte(raw)
    }

    pub fn flow_sensor_enabled(&self) -> bool {
        self.sensor_type(0) == SensorType::Flow
    }

    fn sensor_delays(&self, i: usize) -> (u8, u8) {
        match i {
            0 => (
                self.iopts.get(IntOpt::Sensor1OnDelay),
                self.iopts.get(IntOpt::Sensor1OffDelay),
            ),
            _ => (
                self.iopts.get(IntOpt::Sensor2OnDelay),
                self.iopts.get(IntOpt::Sensor2OffDelay),
            ),
        }
    }

    /// Raw sensor state adjusted for the normally-open/closed wiring.
    fn sensor_detected(&self, i: usize) -> bool {
        let normally_open = match i {
            0 => self.iopts.get(IntOpt::Sensor1Option) != 0,
            _ => self.iopts.get(IntOpt::Sensor2Option) != 0,
        };
        let level_high = self.gpio.read_sensor(i);
        level_high != normally_open
    }

    pub fn reboot_requested(&self) -> Option<RebootCause> {
        self.reboot_request
    }

    pub fn last_run(&self) -> Option<LastRun> {
        self.last_run
    }

    // -- External operations (called by the request handler between ticks) ---

    pub fn enable(&mut self) {
        self.status.enabled = true;
        self.iopts.set(IntOpt::DeviceEnable, 1);
        let _ = self.store.write_iopts(&self.iopts);
    }

    pub fn disable(&mut self) {
        self.status.enabled = false;
        self.iopts.set(IntOpt::DeviceEnable, 0);
        let _ = self.store.write_iopts(&self.iopts);
    }

    /// Arm or clear a rain-delay window; the tick picks up the edge.
    pub fn set_rain_delay_stop_time(&mut self, stop_time: i64) {
        self.nv.rd_stop_time = stop_time;
        self.save_nv();
    }

    /// Gracefully stop every queued run: durations go to zero and the next
    /// time-keeping pass turns stations off through the logging path.
    pub fn reset_all_stations(&mut self) {
        self.queue.mark_all_for_removal();
    }

    /// Immediately stop everything; nothing is logged.
    pub fn reset_all_stations_immediate(&mut self, now: i64) {
        self.clear_all_station_bits();
        self.apply_all_station_bits(now);
        self.queue.reset_runtime();
    }

    pub(crate) fn save_nv(&mut self) {
        if let Err(e) = self.store.write_nv(&self.nv) {
            warn!("failed to persist nv status: {e:#}");
        }
    }

    // -- Station bits and special stations -----------------------------------

    /// Flip one station bit; a transition also fires the special-station side
    /// effect for that station.
    pub fn set_station_bit(&mut self, sid: usize, on: bool) -> BitChange {
        let change = self.bits.set_bit(sid, on);
        if change != BitChange::Unchanged {
            self.switch_special_station(sid, on);
        }
        change
    }

    /// Clear every station bit, firing special-station off commands.
    pub fn clear_all_station_bits(&mut self) {
        for sid in 0..MAX_NUM_STATIONS {
            self.set_station_bit(sid, false);
        }
    }

    fn switch_special_station(&mut self, sid: usize, on: bool) {
        let Some(station) = self.stations.get(sid) else {
            return;
        };
        if station.station_type() == StationType::Standard {
            return;
        }
        let mut ctx = special::SwitchContext {
            gpio: &mut self.gpio,
            http: &self.http,
            password: self.sopts.get(StrOpt::Password),
            auto_refresh: self.iopts.special_auto_refresh(),
        };
        special::switch(&mut ctx, &self.stations[sid], on);
    }

    /// Commit the bit vector to hardware, then run the optional round-robin
    /// refresh of one special station per wall-clock second.
    pub fn apply_all_station_bits(&mut self, now: i64) {
        self.bits.commit(&mut self.gpio, self.status.enabled);
        if self.iopts.special_auto_refresh() {
            self.refresh_next_special_station(now);
        }
    }

    fn refresh_next_special_station(&mut self, now: i64) {
        if now <= self.sar_last_second {
            return;
        }
        self.sar_last_second = now;
        self.sar_next_sid = (self.sar_next_sid + 1) % MAX_NUM_STATIONS;
        let sid = self.sar_next_sid;
        let on = self.bits.is_set(sid);
        self.switch_special_station(sid, on);
    }

    // -- Turn on / turn off --------------------------------------------------

    pub(crate) fn turn_on_station(&mut self, sid: usize) {
        self.flow.reset();
        if self.set_station_bit(sid, true) == BitChange::Set {
            let name = self.stations[sid].name.clone();
            debug!(station = sid, "station on");
            self.events.push(Event::station_on(sid, &name));
        }
    }

    /// Turn a station off, record its completed run, and release its queue
    /// entry.
    pub(crate) fn turn_off_station(&mut self, sid: usize, now: i64) {
        self.set_station_bit(sid, false);

        let Some(qid) = self.queue.station_qid[sid] else {
            return;
        };
        let Some(q) = self.queue.get(qid).copied() else {
            return;
        };

        self.last_gpm = self.flow.measure_gpm();

        // the station may be turned off before its scheduled start
        if now > q.start_time && !self.is_master(sid) {
            let duration = now - q.start_time;
            self.last_run = Some(LastRun {
                station: sid,
                program: q.program_id,
                duration,
                end_time: now,
            });
            let gpm = self.flow_sensor_enabled().then_some(self.last_gpm);
            if self.iopts.logging_enabled() {
                if let Err(e) = self.datalog.station(q.program_id, sid, duration, now, gpm) {
                    warn!("failed to write station log: {e:#}");
                }
            }
            let name = self.stations[sid].name.clone();
            debug!(station = sid, duration, "station off");
            self.events.push(Event::station_off(sid, &name, duration, gpm));
        }

        self.queue.dequeue(qid);
        self.queue.station_qid[sid] = None;
        // the dequeue moved the tail entry into the vacated slot; rebuild the
        // owner map so stations later in this pass see fresh indices
        self.queue.assign_owners();
    }

    // -- Tick phases ---------------------------------------------------------

    /// One control-loop pass. `now` is the localized wall-clock second; the
    /// phases run in a fixed order and station bits are consistent at return.
    pub fn tick(&mut self, now: i64) {
        // options may have been edited between ticks
        self.masters = [self.iopts.master_station(0), self.iopts.master_station(1)];

        self.check_rain_delay(now);
        self.check_binary_sensors(now);
        self.check_program_switch(now);

        // program matching has minute resolution
        let minute = now / 60;
        if minute != self.last_minute {
            self.last_minute = minute;
            scheduler::check_program_schedule(self, now);
        }

        if self.status.program_busy {
            self.do_time_keeping(now);
        }

        self.activate_master_station(0, now);
        self.activate_master_station(1, now);

        self.process_dynamic_events(now);
        self.apply_all_station_bits(now);

        self.check_reboot_request(now);
        self.update_realtime_flow_count(now);
        self.check_weather(now);

        if !self.reboot_notified {
            self.reboot_notified = true;
            self.events.push(Event::reboot(true));
        }
    }

    /// Millisecond sub-tick: one GPIO read and integer arithmetic.
    pub fn flow_poll(&mut self, now_ms: i64) {
        if !self.flow_sensor_enabled() {
            return;
        }
        let level_high = self.gpio.read_sensor(0);
        self.flow.poll(level_high, now_ms);
    }

    fn check_rain_delay(&mut self, now: i64) {
        if self.status.rain_delayed {
            if now >= self.nv.rd_stop_time {
                self.status.rain_delayed = false;
                self.nv.rd_stop_time = 0;
                self.save_nv();
            }
        } else if self.nv.rd_stop_time > now {
            self.status.rain_delayed = true;
            self.save_nv();
        }

        if self.old_status.rain_delayed != self.status.rain_delayed {
            if self.status.rain_delayed {
                self.raindelay_on_last_time = Some(now);
            } else if self.iopts.logging_enabled() {
                let since = self.raindelay_on_last_time.unwrap_or(now);
                let _ = self
                    .datalog
                    .tagged(LogTag::RainDelay, 0, (now - since).max(0), now);
            }
            self.events.push(Event::rain_delay(self.status.rain_delayed));
            self.old_status.rain_delayed = self.status.rain_delayed;
        }
    }

    fn check_binary_sensors(&mut self, now: i64) {
        for i in 0..MAX_SENSORS {
            if !self.sensor_type(i).is_binary() {
                continue;
            }
            let detected = self.sensor_detected(i);
            let (on_delay, off_delay) = self.sensor_delays(i);
            self.sensors[i].update(detected, now, on_delay, off_delay);
            self.status.sensor_active[i] = self.sensors[i].active;

            if self.old_status.sensor_active[i] != self.status.sensor_active[i] {
                if self.status.sensor_active[i] {
                    self.sensors[i].active_last_time = Some(now);
                } else if self.iopts.logging_enabled() {
                    let since = self.sensors[i].active_last_time.unwrap_or(now);
                    let tag = if i == 0 { LogTag::Sensor1 } else { LogTag::Sensor2 };
                    let _ = self.datalog.tagged(tag, 0, (now - since).max(0), now);
                }
                self.events.push(Event::sensor(i, self.status.sensor_active[i]));
                self.old_status.sensor_active[i] = self.status.sensor_active[i];
            }
        }
    }

    fn check_program_switch(&mut self, now: i64) {
        let mut fired = [false; MAX_SENSORS];
        for i in 0..MAX_SENSORS {
            if self.sensor_type(i) == SensorType::ProgramSwitch {
                let detected = self.sensor_detected(i);
                fired[i] = self.sensors[i].poll_switch(detected);
            }
        }
        if fired.iter().any(|&f| f) {
            info!("program switch fired, stopping all stations");
            self.reset_all_stations_immediate(now);
        }
        if fired[0] && !self.programs.is_empty() {
            scheduler::manual_start_program(self, scheduler::ManualStart::User(0), false, now);
        }
        if fired[1] && self.programs.len() > 1 {
            scheduler::manual_start_program(self, scheduler::ManualStart::User(1), false, now);
        }
    }

    /// Step 6 of the tick: assign queue entries to stations, drive on/off
    /// transitions, prune the queue, and wind down when it drains.
    fn do_time_keeping(&mut self, now: i64) {
        self.queue.assign_owners();

        for sid in 0..self.station_count() {
            if self.is_master(sid) {
                continue;
            }
            let Some(qid) = self.queue.station_qid[sid] else {
                continue;
            };
            let Some(q) = self.queue.get(qid).copied() else {
                continue;
            };
            if q.start_time > 0 && now >= q.stop_time() {
                self.turn_off_station(sid, now);
            }
            if !self.bits.is_set(sid) && q.start_time <= now && now < q.stop_time() {
                self.turn_on_station(sid);
            }
        }

        self.queue.clean(now);
        self.queue.assign_owners();
        self.process_dynamic_events(now);
        self.apply_all_station_bits(now);

        // chain point for the next sequential assignment
        let remote_ext = self.iopts.remote_ext_mode();
        self.queue.last_seq_stop_time = 0;
        let mut last_stop = 0;
        for q in self.queue.iter() {
            let stop = q.stop_time();
            if stop > now && self.stations[q.sid].attrib.sequential && !remote_ext {
                last_stop = last_stop.max(stop);
            }
        }
        self.queue.last_seq_stop_time = last_stop;

        if self.queue.is_empty() {
            self.clear_all_station_bits();
            self.apply_all_station_bits(now);
            self.queue.reset_runtime();
            self.status.program_busy = false;

            if self.flow_sensor_enabled() {
                let count = self.flow.flow_count().saturating_sub(self.flow_count_log_start);
                let since = self.sensors[0].active_last_time.unwrap_or(now);
                if self.iopts.logging_enabled() {
                    let _ = self
                        .datalog
                        .tagged(LogTag::FlowSense, count, (now - since).max(0), now);
                }
                self.events
                    .push(Event::flow(count, self.iopts.flow_pulse_rate()));
            }

            // options may have changed while the program ran
            self.masters = [self.iopts.master_station(0), self.iopts.master_station(1)];
        }
    }

    /// Step 7: co-activate a master valve while any of its stations runs
    /// inside the adjusted window.
    fn activate_master_station(&mut self, master: usize, now: i64) {
        let Some(master_sid) = self.masters[master] else {
            return;
        };
        let (on_adj, off_adj) = self.iopts.master_adjustments(master);

        let mut value = false;
        for sid in 0..self.station_count() {
            if sid == master_sid {
                continue;
            }
            if !self.bits.is_set(sid) || !self.stations[sid].attrib.uses_master(master) {
                continue;
            }
            let Some(q) = self.queue.owner(sid) else {
                continue;
            };
            if now >= q.start_time + on_adj && now <= q.stop_time() + off_adj {
                value = true;
                break;
            }
        }
        self.set_station_bit(master_sid, value);
    }

    /// Step 4.10: prune running stations cut off by the device disable, rain
    /// delay, or an active binary sensor. Manual and test runs are exempt.
    fn process_dynamic_events(&mut self, now: i64) {
        let sensor_cut: [bool; MAX_SENSORS] = [
            self.sensor_type(0).is_binary() && self.status.sensor_active[0],
            self.sensor_type(1).is_binary() && self.status.sensor_active[1],
        ];

        for sid in 0..self.station_count() {
            if self.is_master(sid) {
                continue;
            }
            let Some(qid) = self.queue.station_qid[sid] else {
                continue;
            };
            let Some(q) = self.queue.get(qid) else {
                continue;
            };
            if q.program_id >= MANUAL_PROGRAM_ID {
                continue;
            }
            let attrib = self.stations[sid].attrib;

            let cut = !self.status.enabled
                || (self.status.rain_delayed && !attrib.ignore_rain_delay)
                || (sensor_cut[0] && !attrib.ignore_sensor_1)
                || (sensor_cut[1] && !attrib.ignore_sensor_2);
            if cut {
                self.turn_off_station(sid, now);
            }
        }
    }

    /// Step 9: honor a pending reboot request.
    fn check_reboot_request(&mut self, now: i64) {
        if self.status.safe_reboot && now > self.status.reboot_timer {
            if !self.status.program_busy && !self.program_pending_soon(now + 60) {
                self.reboot_dev(self.nv.reboot_cause);
            }
        } else if self.status.reboot_timer != 0 && now > self.status.reboot_timer {
            self.reboot_dev(RebootCause::Timer);
        }
    }

    fn program_pending_soon(&self, at: i64) -> bool {
        self.programs
            .iter()
            .any(|p| p.check_match(at, self.nv.sunrise_min, self.nv.sunset_min))
    }

    /// Persist the cause and hand the actual reboot to the supervisor.
    pub fn reboot_dev(&mut self, cause: RebootCause) {
        self.nv.reboot_cause = cause;
        self.save_nv();
        self.reboot_request = Some(cause);
        warn!(?cause, "reboot requested");
    }

    /// Step 10: roll the 30-second real-time flow window.
    fn update_realtime_flow_count(&mut self, now: i64) {
        if self.flow_sensor_enabled() && now % FLOW_COUNT_RT_WINDOW == 0 {
            let count = self.flow.flow_count();
            self.flow_count_rt = count.saturating_sub(self.flow_count_rt_start);
            self.flow_count_rt_start = count;
        }
    }

    /// Step 11: trigger a weather refresh when one is due. Suppressed while a
    /// program runs, while the network is down, and in remote-extension mode.
    fn check_weather(&mut self, now: i64) {
        if self.status.program_busy
            || self.status.network_fails > 0
            || self.iopts.remote_ext_mode()
        {
            return;
        }
        let algorithm = self.iopts.get(IntOpt::WeatherAlgorithm);
        match self.weather.evaluate(now, algorithm) {
            WeatherAction::None => {}
            WeatherAction::ResetScale => {
                info!("weather data stale, resetting watering percentage to 100%");
                self.iopts.set(IntOpt::WaterPercentage, 100);
                let _ = self.store.write_iopts(&self.iopts);
                if self.iopts.logging_enabled() {
                    let _ = self.datalog.tagged(LogTag::WaterLevel, 0, 100, now);
                }
                self.events
                    .push(Event::new(EventKind::WeatherUpdate).value(100));
            }
            WeatherAction::Fetch => {
                let url = self.sopts.get(StrOpt::WeatherUrl).to_string();
                let opts = self.sopts.get(StrOpt::WeatherOpts).to_string();
                self.fetcher.fetch(&url, &opts);
            }
        }
    }

    pub fn sensor_reset_all(&mut self) {
        for s in &mut self.sensors {
            s.reset();
        }
        for i in 0..MAX_SENSORS {
            self.status.sensor_active[i] = false;
            self.old_status.sensor_active[i] = false;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
pub(crate) mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::events::BufferSink;
    use crate::gpio;
    use crate::program::{Program, ScheduleType, TEST_PROGRAM_ID};
    use crate::queue::QueueEntry;
    use crate::weather::LoggingWeatherFetch;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    pub(crate) struct Harness {
        pub engine: Engine,
        pub events: Arc<Mutex<Vec<Event>>>,
        pub http_rx: mpsc::UnboundedReceiver<crate::http::HttpRequest>,
        _dir: TempDir,
    }

    /// Engine on a fresh factory-reset store with the mock GPIO backend.
    pub(crate) fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path()).unwrap();
        let (tx, http_rx) = mpsc::unbounded_channel();
        let sink = BufferSink::default();
        let events = sink.handle();
        let engine = Engine::new(
            store,
            gpio::open().unwrap(),
            tx,
            Box::new(sink),
            Box::new(LoggingWeatherFetch),
        )
        .unwrap();
        Harness {
            engine,
            events,
            http_rx,
            _dir: dir,
        }
    }

    /// Weekly program watering `sid` for `duration` seconds at `minute`.
    pub(crate) fn program_for(sid: usize, minute: i16, duration: u16) -> Program {
        let mut p = Program {
            enabled: true,
            schedule: ScheduleType::Weekly,
            days: [0b0111_1111, 0],
            start_times: [minute, -1, -1, -1],
            name: "P".into(),
            ..Default::default()
        };
        p.durations[sid] = duration;
        p
    }

    /// A Monday 08:00 localized timestamp with second resolution.
    pub(crate) fn monday_8am() -> i64 {
        chrono::NaiveDate::from_ymd_opt(2026, 8, 3)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    fn kinds(events: &Arc<Mutex<Vec<Event>>>) -> Vec<EventKind> {
        events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    // -- Boot ----------------------------------------------------------------

    #[test]
    fn boot_factory_resets_fresh_store_once() {
        let h = harness();
        assert!(h.engine.store.is_initialized());
        assert_eq!(h.engine.last_reboot_cause, RebootCause::Reset);
        // the running cause is republished as power-on
        assert_eq!(h.engine.store.read_nv().reboot_cause, RebootCause::PowerOn);
    }

    #[test]
    fn first_tick_emits_reboot_notification_once() {
        let mut h = harness();
        let t = monday_8am();
        h.engine.tick(t);
        h.engine.tick(t + 1);
        let reboots = kinds(&h.events)
            .iter()
            .filter(|k| **k == EventKind::Reboot)
            .count();
        assert_eq!(reboots, 1);
    }

    // -- clear_all_station_bits ----------------------------------------------

    #[test]
    fn clear_all_bits_covers_exactly_the_station_range() {
        let mut h = harness();
        for sid in [0, 7, 100, MAX_NUM_STATIONS - 1] {
            h.engine.bits.set_bit(sid, true);
        }
        h.engine.clear_all_station_bits();
        for sid in 0..MAX_NUM_STATIONS {
            assert!(!h.engine.bits.is_set(sid));
        }
    }

    // -- S3: master co-activation with adjustments --------------------------

    #[test]
    fn master_follows_adjusted_window() {
        let mut h = harness();
        let e = &mut h.engine;
        // station 1 (index) is master 1; station 0 uses it, concurrent
        e.iopts.set(IntOpt::MasterStation, 2);
        e.iopts.set(IntOpt::MasterOnAdj, 121); // +5 s
        e.iopts.set(IntOpt::MasterOffAdj, 119); // -5 s
        e.stations[0].attrib.use_master_1 = true;
        e.stations[0].attrib.sequential = false;

        let t = monday_8am();
        e.programs = vec![program_for(0, 8 * 60, 60)];

        e.tick(t); // match pass schedules start at t+1
        assert!(e.status.program_busy);

        e.tick(t + 1);
        assert!(e.bits.is_set(0));
        assert!(!e.bits.is_set(1), "master waits for the on adjustment");

        for now in t + 2..=t + 5 {
            e.tick(now);
            assert!(!e.bits.is_set(1));
        }
        e.tick(t + 6);
        assert!(e.bits.is_set(1), "master on at start+5");

        e.tick(t + 56);
        assert!(e.bits.is_set(1), "master still on at stop-5");
        e.tick(t + 57);
        assert!(!e.bits.is_set(1), "master off past stop-5");

        e.tick(t + 61);
        assert!(!e.bits.is_set(0));
        assert!(!e.status.program_busy);
    }

    // -- S4: rain sensor cuts a run ------------------------------------------

    #[test]
    fn rain_sensor_cuts_running_station() {
        let mut h = harness();
        let e = &mut h.engine;
        e.iopts.set(IntOpt::Sensor1Type, SensorType::Rain as u8);
        e.iopts.set(IntOpt::Sensor1Option, 1); // normally open

        let t = monday_8am();
        e.programs = vec![program_for(0, 8 * 60, 120)];

        e.tick(t);
        e.tick(t + 1);
        assert!(e.bits.is_set(0));

        // sensor raises at t+30: normally-open line pulled low
        e.gpio.sensor_levels[0] = false;
        for now in t + 30..=t + 36 {
            e.tick(now);
        }
        // 5 s debounce floor then the dynamic-events pass cuts the station
        assert!(e.status.sensor_active[0]);
        assert!(!e.bits.is_set(0));
        let run = e.last_run.unwrap();
        assert_eq!(run.station, 0);
        assert!((30..=36).contains(&run.duration), "duration {}", run.duration);
    }

    #[test]
    fn ignore_sensor_attribute_keeps_station_running() {
        let mut h = harness();
        let e = &mut h.engine;
        e.iopts.set(IntOpt::Sensor1Type, SensorType::Rain as u8);
        e.iopts.set(IntOpt::Sensor1Option, 1);
        e.stations[0].attrib.ignore_sensor_1 = true;

        let t = monday_8am();
        e.programs = vec![program_for(0, 8 * 60, 120)];
        e.tick(t);
        e.tick(t + 1);
        e.gpio.sensor_levels[0] = false;
        for now in t + 2..=t + 20 {
            e.tick(now);
        }
        assert!(e.status.sensor_active[0]);
        assert!(e.bits.is_set(0), "ignoring station keeps running");
    }

    // -- Dynamic events ------------------------------------------------------

    #[test]
    fn disable_cuts_programs_but_not_manual_runs() {
        let mut h = harness();
        let e = &mut h.engine;
        let t = monday_8am();

        // a scheduled run on station 0 and a manual run on station 1
        e.queue
            .enqueue(QueueEntry {
                sid: 0,
                program_id: 1,
                start_time: t,
                duration: 100,
            })
            .unwrap();
        e.queue
            .enqueue(QueueEntry {
                sid: 1,
                program_id: TEST_PROGRAM_ID,
                start_time: t,
                duration: 100,
            })
            .unwrap();
        e.status.program_busy = true;
        e.tick(t + 1);
        assert!(e.bits.is_set(0));
        assert!(e.bits.is_set(1));

        e.disable();
        e.tick(t + 2);
        assert!(!e.bits.is_set(0), "program run cut by disable");
        assert!(e.bits.is_set(1), "manual run survives disable in memory");
        // but nothing reaches hardware while disabled
        assert!(e.gpio.committed.iter().all(|&b| b == 0));
    }

    // -- Rain delay ----------------------------------------------------------

    #[test]
    fn rain_delay_edges_emit_events_and_persist() {
        let mut h = harness();
        let t = monday_8am();
        h.engine.set_rain_delay_stop_time(t + 3600);
        h.engine.tick(t);
        assert!(h.engine.status.rain_delayed);
        assert_eq!(h.engine.store.read_nv().rd_stop_time, t + 3600);

        // expire it
        h.engine.tick(t + 3600);
        assert!(!h.engine.status.rain_delayed);
        assert_eq!(h.engine.store.read_nv().rd_stop_time, 0);

        let kinds = kinds(&h.events);
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::RainDelay).count(),
            2
        );
    }

    #[test]
    fn rain_delay_cuts_station_unless_ignored() {
        let mut h = harness();
        let e = &mut h.engine;
        let t = monday_8am();
        e.stations[1].attrib.ignore_rain_delay = true;
        e.programs = vec![{
            let mut p = program_for(0, 8 * 60, 120);
            p.durations[1] = 120;
            p
        }];
        e.stations[0].attrib.sequential = false;
        e.stations[1].attrib.sequential = false;

        e.tick(t);
        e.tick(t + 2);
        assert!(e.bits.is_set(0));
        assert!(e.bits.is_set(1));

        e.set_rain_delay_stop_time(t + 3600);
        e.tick(t + 10);
        assert!(!e.bits.is_set(0));
        assert!(e.bits.is_set(1));
    }

    // -- S6: special command reboot ------------------------------------------

    #[test]
    fn safe_reboot_waits_for_idle() {
        let mut h = harness();
        let e = &mut h.engine;
        let t = monday_8am();
        let mut cmd = program_for(0, 8 * 60, 0);
        cmd.name = crate::program::SPECIAL_CMD_REBOOT.into();
        e.programs = vec![cmd];

        e.tick(t);
        assert!(e.status.safe_reboot);
        assert_eq!(e.status.reboot_timer, t + REBOOT_DELAY);
        assert!(e.reboot_requested().is_none());

        // a manual run is in progress at t+66: no reboot
        e.queue
            .enqueue(QueueEntry {
                sid: 1,
                program_id: MANUAL_PROGRAM_ID,
                start_time: t + 2,
                duration: 200,
            })
            .unwrap();
        e.status.program_busy = true;
        e.tick(t + 66);
        assert!(e.reboot_requested().is_none());

        // queue drains; nothing matches in the next minute (minute 08:00 has
        // passed), so the reboot fires
        e.tick(t + 202);
        assert!(!e.status.program_busy);
        e.tick(t + 203);
        assert!(e.reboot_requested().is_some());
        assert_eq!(e.store.read_nv().reboot_cause, RebootCause::PowerOn);
    }

    #[test]
    fn reboot_now_fires_even_when_busy() {
        let mut h = harness();
        let e = &mut h.engine;
        let t = monday_8am();
        let mut cmd = program_for(0, 8 * 60, 0);
        cmd.name = crate::program::SPECIAL_CMD_REBOOT_NOW.into();
        e.programs = vec![cmd];

        e.tick(t);
        assert!(!e.status.safe_reboot);
        e.status.program_busy = true;
        e.tick(t + REBOOT_DELAY + 1);
        assert_eq!(e.reboot_requested(), Some(RebootCause::Timer));
    }

    // -- Special-station auto refresh ----------------------------------------

    #[test]
    fn auto_refresh_walks_one_station_per_second() {
        let mut h = harness();
        let e = &mut h.engine;
        e.iopts.set(IntOpt::SpeAutoRefresh, 1);
        // a remote station right after the cursor's starting point
        let target = MAX_NUM_STATIONS / 2 + 1;
        e.stations[target].data = crate::station::SpecialData::Remote(crate::station::RemoteData {
            ip: std::net::Ipv4Addr::new(10, 0, 0, 5),
            port: 80,
            station: 0,
        });

        let t = monday_8am();
        e.tick(t);
        let req = h.http_rx.try_recv().expect("refresh re-issues the off command");
        assert!(req.path.contains("en=0"));

        // same second: no second refresh
        e.apply_all_station_bits(t);
        assert!(h.http_rx.try_recv().is_err());
    }

    // -- Bit/queue consistency over random gate sequences --------------------

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

        /// After any tick, a station bit is set iff its owning queue entry is
        /// inside its run window and no gate (here: rain delay) cuts it.
        #[test]
        fn station_bits_follow_queue_and_gates(
            durations in proptest::collection::vec(5u16..40, 1..4),
            rd_start in 5i64..30,
            rd_len in 5i64..40,
            ignore_rd in proptest::collection::vec(proptest::prelude::any::<bool>(), 4),
        ) {
            use proptest::prelude::prop_assert_eq;

            let mut h = harness();
            let e = &mut h.engine;
            let t = monday_8am();
            let mut p = program_for(0, 8 * 60, durations[0]);
            for (sid, d) in durations.iter().enumerate() {
                p.durations[sid] = *d;
                e.stations[sid].attrib.ignore_rain_delay = ignore_rd[sid];
            }
            e.programs = vec![p];

            for now in t..t + 200 {
                if now == t + rd_start {
                    e.set_rain_delay_stop_time(now + rd_len);
                }
                e.tick(now);

                // owners may be stale right after a dequeue; normalize the
                // view the same way the next tick would
                e.queue.assign_owners();
                for sid in 0..e.station_count() {
                    let cut = e.status.rain_delayed
                        && !e.stations[sid].attrib.ignore_rain_delay;
                    let running = e
                        .queue
                        .owner(sid)
                        .map_or(false, |q| {
                            q.start_time > 0 && q.start_time <= now && now < q.stop_time()
                        });
                    prop_assert_eq!(
                        e.bits.is_set(sid),
                        running && !cut,
                        "sid {} at +{}", sid, now - t
                    );
                }
            }
        }
    }

    // -- Weather trigger -----------------------------------------------------

    #[test]
    fn weather_suppressed_while_busy_or_remote() {
        let mut h = harness();
        let e = &mut h.engine;
        let t = monday_8am();
        e.queue
            .enqueue(QueueEntry {
                sid: 0,
                program_id: 1,
                start_time: t,
                duration: 600,
            })
            .unwrap();
        e.status.program_busy = true;
        e.tick(t);
        assert!(e.weather.checkwt_lasttime.is_none());

        e.reset_all_stations_immediate(t);
        e.status.program_busy = false;
        e.iopts.set(IntOpt::RemoteExtMode, 1);
        e.tick(t + 1);
        assert!(e.weather.checkwt_lasttime.is_none());

        e.iopts.set(IntOpt::RemoteExtMode, 0);
        e.tick(t + 2);
        assert_eq!(e.weather.checkwt_lasttime, Some(t + 2));
    }

    #[test]
    fn stale_weather_resets_water_percentage() {
        let mut h = harness();
        let e = &mut h.engine;
        let t = monday_8am();
        e.iopts.set(IntOpt::WeatherAlgorithm, 1);
        e.iopts.set(IntOpt::WaterPercentage, 40);
        e.weather.record_success(t - crate::weather::CHECK_WEATHER_SUCCESS_TIMEOUT - 10);

        e.tick(t);
        assert_eq!(e.iopts.get(IntOpt::WaterPercentage), 100);
        assert!(kinds(&h.events).contains(&EventKind::WeatherUpdate));
    }

    // -- Flow accounting -----------------------------------------------------

    #[test]
    fn realtime_flow_window_rolls_every_30s() {
        let mut h = harness();
        let e = &mut h.engine;
        e.iopts.set(IntOpt::Sensor1Type, SensorType::Flow as u8);

        // pulses while the window runs
        for t_ms in [10i64, 20, 30] {
            e.gpio.sensor_levels[0] = false;
            e.flow_poll(t_ms);
            e.gpio.sensor_levels[0] = true;
            e.flow_poll(t_ms + 1);
        }
        let t = (monday_8am() / 30) * 30; // a 30 s boundary
        e.tick(t);
        assert_eq!(e.flow_count_rt, 3);
        e.tick(t + 30);
        assert_eq!(e.flow_count_rt, 0);
    }
}
