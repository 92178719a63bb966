//! Program matching and start-time assignment. The match pass runs once per
//! wall-clock minute; `schedule_all_stations` assigns start times to every
//! unscheduled queue entry under the sequential/concurrent policies.

use tracing::{debug, info, warn};

use crate::config::IntOpt;
use crate::engine::{Engine, REBOOT_DELAY};
use crate::events::Event;
use crate::program::{
    water_time_resolve, Program, MANUAL_PROGRAM_ID, SPECIAL_CMD_REBOOT, SPECIAL_CMD_REBOOT_NOW,
    TEST_PROGRAM_ID,
};
use crate::queue::QueueEntry;

/// How a manual start was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualStart {
    /// One minute per station.
    Test,
    /// Two seconds per station.
    TestShort,
    /// A stored program by index.
    User(usize),
}

/// The once-per-minute match pass: enqueue a run interval for every station
/// selected by a matching program, then assign start times.
pub fn check_program_schedule(engine: &mut Engine, now: i64) {
    let mut match_found = false;
    let sunrise = engine.nv.sunrise_min;
    let sunset = engine.nv.sunset_min;

    let programs = engine.programs.clone();
    for (pid, program) in programs.iter().enumerate() {
        if !program.check_match(now, sunrise, sunset) {
            continue;
        }
        if program.is_command() {
            process_special_program_command(engine, now, &program.name);
            continue;
        }

        let water_pct = engine.iopts.get(IntOpt::WaterPercentage);
        let mut scheduled_any = false;

        for sid in 0..engine.station_count() {
            // masters cannot be scheduled independently
            if engine.is_master(sid) {
                continue;
            }
            let code = program.durations.get(sid).copied().unwrap_or(0);
            if code == 0 || engine.stations[sid].attrib.disabled {
                continue;
            }

            let mut water_time = water_time_resolve(code, sunrise, sunset);
            if program.use_weather {
                water_time = water_time * i64::from(water_pct) / 100;
                if water_pct < 20 && water_time < 10 {
                    // scaling this low produces runs too short to matter
                    water_time = 0;
                }
            }
            if water_time == 0 {
                continue;
            }

            let entry = QueueEntry {
                sid,
                program_id: pid as u8 + 1,
                start_time: 0,
                duration: water_time,
            };
            if engine.queue.enqueue(entry).is_ok() {
                scheduled_any = true;
            } else {
                warn!(program = pid, station = sid, "runtime queue full, run dropped");
            }
        }

        if scheduled_any {
            match_found = true;
            debug!(program = pid, name = %program.name, "program matched");
            engine.events.push(Event::program_sched(
                pid,
                &program.name,
                if program.use_weather { water_pct } else { 100 },
            ));
        }
    }

    if match_found {
        schedule_all_stations(engine, now);
    }
}

/// Assign a start time to every queue entry that has none. Sequential
/// stations chain behind the latest sequential stop plus the station delay;
/// everything else starts concurrently, staggered by one second.
pub fn schedule_all_stations(engine: &mut Engine, now: i64) {
    let mut con_start = now + 1;
    let station_delay = engine.iopts.station_delay();
    // chain behind whatever sequential work is still queued, but never
    // before the concurrent start
    let mut seq_start = con_start.max(engine.queue.last_seq_stop_time + station_delay);
    let remote_ext = engine.iopts.remote_ext_mode();

    for qid in 0..engine.queue.len() {
        let Some(&q) = engine.queue.get(qid) else {
            continue;
        };
        if q.start_time > 0 || q.duration == 0 {
            continue;
        }

        let sequential = engine.stations[q.sid].attrib.sequential;
        let entry = engine.queue.get_mut(qid).expect("index in range");
        if sequential && !remote_ext {
            entry.start_time = seq_start;
            seq_start += q.duration + station_delay;
        } else {
            entry.start_time = con_start;
            con_start += 1;
        }

        if !engine.status.program_busy {
            engine.status.program_busy = true;
            if engine.flow_sensor_enabled() {
                engine.flow_count_log_start = engine.flow.flow_count();
                engine.sensors[0].active_last_time = Some(now);
            }
        }
    }
}

/// Immediately stop everything, then enqueue a program outside the normal
/// schedule. Manual runs are queued under the manual/test ids so dynamic
/// events leave them alone.
pub fn manual_start_program(
    engine: &mut Engine,
    start: ManualStart,
    use_water_scale: bool,
    now: i64,
) {
    engine.reset_all_stations_immediate(now);

    let program = match start {
        ManualStart::Test => Program::test_program(60),
        ManualStart::TestShort => Program::test_program(2),
        ManualStart::User(index) => match engine.programs.get(index) {
            Some(p) => p.clone(),
            None => return,
        },
    };

    let water_pct = engine.iopts.get(IntOpt::WaterPercentage);
    if let ManualStart::User(index) = start {
        info!(program = index, name = %program.name, "manual program start");
        engine.events.push(Event::program_sched(
            index,
            &program.name,
            if use_water_scale { water_pct } else { 100 },
        ));
    }

    let program_id = match start {
        ManualStart::User(_) => MANUAL_PROGRAM_ID,
        _ => TEST_PROGRAM_ID,
    };

    let mut match_found = false;
    for sid in 0..engine.station_count() {
        if engine.is_master(sid) {
            continue;
        }
        let mut water_time = match start {
            ManualStart::Test => 60,
            ManualStart::TestShort => 2,
            ManualStart::User(_) => water_time_resolve(
                program.durations.get(sid).copied().unwrap_or(0),
                engine.nv.sunrise_min,
                engine.nv.sunset_min,
            ),
        };
        if use_water_scale {
            water_time = water_time * i64::from(water_pct) / 100;
        }
        if water_time > 0 && !engine.stations[sid].attrib.disabled {
            let entry = QueueEntry {
                sid,
                program_id,
                start_time: 0,
                duration: water_time,
            };
            if engine.queue.enqueue(entry).is_ok() {
                match_found = true;
            }
        }
    }
    if match_found {
        schedule_all_stations(engine, now);
    }
}

/// `':'`-prefixed program names carry commands instead of schedules. The
/// 65-second timer keeps a freshly booted controller from re-running the
/// same command when its minute matches again.
pub fn process_special_program_command(engine: &mut Engine, now: i64, name: &str) -> bool {
    if !name.starts_with(':') {
        return false;
    }
    match name {
        SPECIAL_CMD_REBOOT | SPECIAL_CMD_REBOOT_NOW => {
            engine.status.safe_reboot = name == SPECIAL_CMD_REBOOT;
            engine.status.reboot_timer = now + REBOOT_DELAY;
            info!(command = name, "special program command armed");
            true
        }
        _ => {
            warn!(command = name, "unknown special program command");
            false
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
