//! # MQTT Broker Session
//!
//! Everything that talks to the broker lives here. The rest of the bridge
//! only sees a [`SessionHandle`](mqtt_handler::SessionHandle) for publishing
//! and subscribing and a stream of [`SessionEvent`](message_manager::SessionEvent)s.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── backoff.rs          - Reconnect delays with jitter
//! ├── config.rs           - Broker settings and rumqttc options
//! ├── message_manager.rs  - Received messages and session events
//! └── mqtt_handler.rs     - Connection state machine and protocol handling
//! ```
//!
//! ## Connection Lifecycle
//!
//! The session connects, waits for the controller to issue its standing
//! subscriptions and only reports `Ready` once the broker acknowledged all of
//! them. Any failure after that point drops back to `Reconnecting` and retries
//! with a growing delay until the connection is back or the configured number
//! of attempts is used up.

pub mod backoff;
pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
