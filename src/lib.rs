//! Bridge between an Akai pad controller on USB and an MQTT broker.
//!
//! Reports from the controller's input endpoint are decoded into
//! [`controller::ControllerEvent`]s, buffered in a bounded queue and
//! published as one text line per event.

pub mod config;
pub mod controller;
pub mod mqtt;
pub mod pipeline;
