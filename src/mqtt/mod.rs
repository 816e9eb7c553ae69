//! # MQTT Integration Module
//!
//! Delivers decoded controller events to an MQTT broker.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings and address parsing
//! ├── message_manager.rs  - Outgoing messages, the Sink trait and publish errors
//! ├── mqtt_handler.rs     - rumqttc-backed sink and its event loop driver
//! └── tls.rs              - TLS transport for ssl:// brokers
//! ```
//!
//! ## Failure Handling
//!
//! The event loop driver classifies connection errors. Network trouble
//! (I/O errors, timeouts) puts the link into a reconnecting state and the
//! driver keeps polling with backoff; publishes during that window fail as
//! transient so the publisher retries them. A refused connection or protocol
//! violation marks the link as failed and every later publish fails fatally.
//!
//! A publish resolves only when the broker has acknowledged it at the
//! requested QoS. If the link drops while a message is unacknowledged the
//! publish fails as transient, since a clean session discards it on
//! reconnect, and the publisher sends it again.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod tls;

pub use message_manager::{OutgoingMessage, PublishError, Sink};
pub use mqtt_handler::{ConnectionState, MqttSink, SinkError};
