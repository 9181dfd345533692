//! Live telemetry viewer for UAV sensor devices on an MQTT bus, with
//! chunked history retrieval over the same bus.

pub mod bus;
pub mod config;
pub mod decode;
pub mod errors;
pub mod event_loop;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod prefs;
pub mod protocol;
pub mod registry;
pub mod rest;
pub mod retrieval;
pub mod series;
pub mod session;
