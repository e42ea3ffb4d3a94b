//! Bridge controller subsystem
//!
//! Turns broker lifecycle events into fleet-wide behaviour:
//!
//! 1. [`announcement`] - Topic layout and Home Assistant discovery documents
//! 2. [`command`] - Decoding of inbound `OPEN` / `CLOSE` payloads
//! 3. [`timers`] - Recurring poll and one-off settle polls
//! 4. [`bridge`] - The controller task itself
//! 5. [`controller_handle`] - Spawning and shutdown
//!
//! # Architecture
//!
//! ```text
//! BrokerSession ──[SessionEvent]──► BridgeController ──► DeviceProxy ──► driver
//!       ▲                              │      ▲
//!       └────── publish / subscribe ───┘      └──[TimerEvent]── TimerSet
//! ```
//!
//! On `SubscribePending` the controller subscribes to every command topic; on
//! `Ready` it announces all blinds and starts polling; on `Disconnected` it
//! stops every timer until the next `Ready`.

pub mod announcement;
pub mod bridge;
pub mod command;
pub mod controller_handle;
pub mod timers;

pub use announcement::{Announcement, AnnouncementSet};
pub use bridge::{BridgeController, BrokerLink, ControllerSettings, PollReport};
pub use controller_handle::{ControllerError, ControllerHandle};
