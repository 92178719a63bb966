//! Special-station switcher: translates an on/off command for RF, remote,
//! GPIO and HTTP stations into the matching side effect. Malformed payloads
//! and transport failures are no-ops; the in-memory station bit has already
//! been flipped.

use tracing::warn;

use crate::clock::busy_wait_us;
use crate::gpio::{pin, GpioBackend};
use crate::http::{HttpRequest, HttpSender};
use crate::station::{GpioData, HttpData, RemoteData, RfData, SpecialData, Station, MAX_NUM_STATIONS, MAX_WATER_TIME};

/// Times each RF code is repeated per command.
const RF_REPEATS: usize = 15;

/// Everything a switch needs besides the station record itself.
pub struct SwitchContext<'a> {
    pub gpio: &'a mut GpioBackend,
    pub http: &'a HttpSender,
    /// Controller password, forwarded to peer controllers.
    pub password: &'a str,
    /// Whether special-station auto-refresh is enabled; shortens the water
    /// time requested from peers so a lost OFF command self-heals.
    pub auto_refresh: bool,
}

/// Dispatch the side effect for one station transition. Standard and Other
/// stations need none.
pub fn switch(ctx: &mut SwitchContext<'_>, station: &Station, on: bool) {
    match &station.data {
        SpecialData::Standard | SpecialData::Other => {}
        SpecialData::Rf(data) => switch_rf(ctx.gpio, data, on),
        SpecialData::Remote(data) => switch_remote(ctx, data, on),
        SpecialData::Gpio(data) => switch_gpio(ctx.gpio, data, on),
        SpecialData::Http(data) => switch_http(ctx, data, on),
    }
}

// ---------------------------------------------------------------------------
// RF
// ---------------------------------------------------------------------------

/// Bit-bang one 24-bit code through the RF transmitter. A 1-bit is high for
/// 3T then low for T; a 0-bit the inverse; each repeat ends with a sync pulse
/// of high T, low 31T. T is the station's timing value in microseconds.
///
/// A record with any zero field is incomplete; no transmission happens in
/// either direction.
fn switch_rf(gpio: &mut GpioBackend, data: &RfData, on: bool) {
    if data.on == 0 || data.off == 0 || data.timing == 0 {
        return;
    }
    let code = if on { data.on } else { data.off };
    let t = u64::from(data.timing);

    for _ in 0..RF_REPEATS {
        for bit in (0..24).rev() {
            if code >> bit & 1 != 0 {
                transmit_rf_bit(gpio, 3 * t, t);
            } else {
                transmit_rf_bit(gpio, t, 3 * t);
            }
        }
        // sync
        transmit_rf_bit(gpio, t, 31 * t);
    }
}

fn transmit_rf_bit(gpio: &mut GpioBackend, high_us: u64, low_us: u64) {
    gpio.write_rf(true);
    busy_wait_us(high_us);
    gpio.write_rf(false);
    busy_wait_us(low_us);
}

// ---------------------------------------------------------------------------
// Remote peer controller
// ---------------------------------------------------------------------------

fn switch_remote(ctx: &mut SwitchContext<'_>, data: &RemoteData, on: bool) {
    // With auto-refresh the command is re-issued periodically, so ask the
    // peer for a short run; otherwise request the longest run it accepts.
    let timer = if ctx.auto_refresh {
        4 * MAX_NUM_STATIONS as i64
    } else {
        MAX_WATER_TIME
    };
    let req = HttpRequest {
        host: data.ip.to_string(),
        port: data.port,
        path: format!(
            "/cm?pw={}&sid={}&en={}&t={}",
            ctx.password,
            data.station,
            u8::from(on),
            timer
        ),
    };
    if ctx.http.send(req).is_err() {
        warn!(peer = %data.ip, "remote station dispatcher unavailable");
    }
}

// ---------------------------------------------------------------------------
// Direct GPIO
// ---------------------------------------------------------------------------

fn switch_gpio(gpio: &mut GpioBackend, data: &GpioData, on: bool) {
    if data.pin == pin::SR_CLOCK
        || data.pin == pin::SR_OE
        || data.pin == pin::SR_LATCH
        || data.pin == pin::SR_DATA
    {
        warn!(pin = data.pin, "gpio station overlaps shift register pins");
        return;
    }
    let level = if on {
        data.active_high
    } else {
        !data.active_high
    };
    if let Err(e) = gpio.write_aux_pin(data.pin, level) {
        warn!(pin = data.pin, "gpio station write failed: {e:#}");
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

fn switch_http(ctx: &mut SwitchContext<'_>, data: &HttpData, on: bool) {
    let cmd = if on { &data.cmd_on } else { &data.cmd_off };
    let req = HttpRequest {
        host: data.server.clone(),
        port: data.port,
        path: format!("/{cmd}"),
    };
    if ctx.http.send(req).is_err() {
        warn!(host = %data.server, "http station dispatcher unavailable");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::gpio;
    use crate::station::{SpecialData, Station};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn ctx_parts() -> (GpioBackend, HttpSender, mpsc::UnboundedReceiver<HttpRequest>) {
        let gpio = gpio::open().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (gpio, tx, rx)
    }

    fn station(data: SpecialData) -> Station {
        Station {
            name: "X".into(),
            data,
            ..Default::default()
        }
    }

    #[test]
    fn gpio_station_drives_active_level() {
        let (mut gpio, tx, _rx) = ctx_parts();
        let mut ctx = SwitchContext {
            gpio: &mut gpio,
            http: &tx,
            password: "pw",
            auto_refresh: false,
        };
        let s = station(SpecialData::Gpio(GpioData {
            pin: 24,
            active_high: false,
        }));
        switch(&mut ctx, &s, true);
        assert_eq!(ctx.gpio.aux_pins.get(&24), Some(&false)); // active low
        switch(&mut ctx, &s, false);
        assert_eq!(ctx.gpio.aux_pins.get(&24), Some(&true));
    }

    #[test]
    fn gpio_station_refuses_shift_register_pins() {
        let (mut gpio, tx, _rx) = ctx_parts();
        let mut ctx = SwitchContext {
            gpio: &mut gpio,
            http: &tx,
            password: "pw",
            auto_refresh: false,
        };
        let s = station(SpecialData::Gpio(GpioData {
            pin: pin::SR_LATCH,
            active_high: true,
        }));
        switch(&mut ctx, &s, true);
        assert!(ctx.gpio.aux_pins.is_empty());
    }

    #[test]
    fn remote_station_builds_peer_command() {
        let (mut gpio, tx, mut rx) = ctx_parts();
        let mut ctx = SwitchContext {
            gpio: &mut gpio,
            http: &tx,
            password: "secret",
            auto_refresh: false,
        };
        let s = station(SpecialData::Remote(RemoteData {
            ip: Ipv4Addr::new(10, 0, 0, 7),
            port: 8080,
            station: 3,
        }));
        switch(&mut ctx, &s, true);
        let req = rx.try_recv().unwrap();
        assert_eq!(req.host, "10.0.0.7");
        assert_eq!(req.port, 8080);
        assert_eq!(req.path, "/cm?pw=secret&sid=3&en=1&t=64800");
    }

    #[test]
    fn remote_station_short_timer_under_auto_refresh() {
        let (mut gpio, tx, mut rx) = ctx_parts();
        let mut ctx = SwitchContext {
            gpio: &mut gpio,
            http: &tx,
            password: "pw",
            auto_refresh: true,
        };
        let s = station(SpecialData::Remote(RemoteData {
            ip: Ipv4Addr::new(10, 0, 0, 7),
            port: 80,
            station: 0,
        }));
        switch(&mut ctx, &s, false);
        let req = rx.try_recv().unwrap();
        assert_eq!(req.path, format!("/cm?pw=pw&sid=0&en=0&t={}", 4 * MAX_NUM_STATIONS));
    }

    #[test]
    fn http_station_selects_command() {
        let (mut gpio, tx, mut rx) = ctx_parts();
        let mut ctx = SwitchContext {
            gpio: &mut gpio,
            http: &tx,
            password: "pw",
            auto_refresh: false,
        };
        let s = station(SpecialData::Http(HttpData {
            server: "relay.local".into(),
            port: 8080,
            cmd_on: "switch=on".into(),
            cmd_off: "switch=off".into(),
        }));
        switch(&mut ctx, &s, true);
        assert_eq!(rx.try_recv().unwrap().path, "/switch=on");
        switch(&mut ctx, &s, false);
        assert_eq!(rx.try_recv().unwrap().path, "/switch=off");
    }

    #[test]
    fn rf_station_with_any_zero_field_is_noop() {
        let incomplete = [
            RfData {
                on: 0x123456,
                off: 0x654321,
                timing: 0,
            },
            // a zero off code blocks transmission even when switching on
            RfData {
                on: 0x123456,
                off: 0,
                timing: 100,
            },
            RfData {
                on: 0,
                off: 0x654321,
                timing: 100,
            },
        ];
        for data in incomplete {
            let (mut gpio, tx, _rx) = ctx_parts();
            let mut ctx = SwitchContext {
                gpio: &mut gpio,
                http: &tx,
                password: "pw",
                auto_refresh: false,
            };
            let s = station(SpecialData::Rf(data));
            switch(&mut ctx, &s, true);
            switch(&mut ctx, &s, false);
            assert_eq!(ctx.gpio.rf_writes, 0, "transmitted with {data:?}");
        }
    }

    #[test]
    fn standard_station_has_no_side_effect() {
        let (mut gpio, tx, mut rx) = ctx_parts();
        let mut ctx = SwitchContext {
            gpio: &mut gpio,
            http: &tx,
            password: "pw",
            auto_refresh: false,
        };
        switch(&mut ctx, &station(SpecialData::Standard), true);
        assert!(rx.try_recv().is_err());
        assert!(ctx.gpio.aux_pins.is_empty());
    }
}
