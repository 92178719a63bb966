//! Irrigation controller engine for shift-register valve chains on small
//! Linux boards: second-resolution scheduling of watering programs, gated by
//! rain/soil/flow sensors, rain-delay windows, and a weather-derived watering
//! percentage.
//!
//! The binary drives [`engine::Engine::tick`] once per wall-clock second; the
//! HTTP request surface, push transports, and the weather client are external
//! collaborators built on top of this crate.

pub mod clock;
pub mod config;
pub mod datalog;
pub mod engine;
pub mod events;
pub mod gpio;
pub mod http;
pub mod outputs;
pub mod program;
pub mod queue;
pub mod scheduler;
pub mod sensor;
pub mod special;
pub mod station;
pub mod weather;
