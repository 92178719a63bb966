//! Outbound notifications. The engine reports state transitions through an
//! abstract sink; formatting and transport (MQTT topics, webhook bodies) live
//! outside the core.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProgramSched,
    Sensor1,
    FlowSensor,
    WeatherUpdate,
    Reboot,
    StationOff,
    Sensor2,
    RainDelay,
    StationOn,
}

/// One notification: a kind plus optional numeric, float, and text payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fvalue: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            value: None,
            fvalue: None,
            text: None,
        }
    }

    pub fn value(mut self, v: u32) -> Self {
        self.value = Some(v);
        self
    }

    pub fn fvalue(mut self, v: f64) -> Self {
        self.fvalue = Some(v);
        self
    }

    pub fn text<S: Into<String>>(mut self, t: S) -> Self {
        self.text = Some(t.into());
        self
    }

    pub fn station_on(sid: usize, name: &str) -> Self {
        Self::new(EventKind::StationOn).value(sid as u32).text(name)
    }

    pub fn station_off(sid: usize, name: &str, duration: i64, gpm: Option<f64>) -> Self {
        let mut e = Self::new(EventKind::StationOff)
            .value(sid as u32)
            .text(format!("{name} ran {duration}s"));
        if let Some(gpm) = gpm {
            e = e.fvalue(gpm);
        }
        e
    }

    pub fn program_sched(pid: usize, name: &str, water_scale: u8) -> Self {
        Self::new(EventKind::ProgramSched)
            .value(pid as u32)
            .fvalue(f64::from(water_scale) / 100.0)
            .text(name)
    }

    pub fn sensor(index: usize, active: bool) -> Self {
        let kind = if index == 0 {
            EventKind::Sensor1
        } else {
            EventKind::Sensor2
        };
        Self::new(kind).value(u32::from(active))
    }

    pub fn rain_delay(active: bool) -> Self {
        Self::new(EventKind::RainDelay).value(u32::from(active))
    }

    pub fn flow(count: u64, pulse_rate: u16) -> Self {
        Self::new(EventKind::FlowSensor)
            .value(count as u32)
            .fvalue(f64::from(pulse_rate))
    }

    pub fn reboot(complete: bool) -> Self {
        Self::new(EventKind::Reboot).value(u32::from(complete))
    }
}

/// Abstract notification sink. Implementations must not block the tick.
pub trait EventSink: Send {
    fn push(&mut self, event: Event);
}

/// Default sink: structured log lines only.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn push(&mut self, event: Event) {
        tracing::info!(
            kind = ?event.kind,
            value = event.value,
            fvalue = event.fvalue,
            text = event.text.as_deref().unwrap_or(""),
            "event"
        );
    }
}

/// Capturing sink; the shared handle lets the owner read events pushed after
/// the sink itself has been moved into the engine.
#[derive(Default)]
pub struct BufferSink {
    events: std::sync::Arc<std::sync::Mutex<Vec<Event>>>,
}

impl BufferSink {
    pub fn handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<Event>>> {
        self.events.clone()
    }
}

impl EventSink for BufferSink {
    fn push(&mut self, event: Event) {
        self.events.lock().expect("event buffer poisoned").push(event);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
