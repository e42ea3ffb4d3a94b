//! Controller Handle - lifecycle of the bridge controller task
//!
//! Wires the controller to a running broker session and the device proxy,
//! spawns it onto the runtime and gives the application a way to stop it
//! and wait for it to wind down.
//!

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::announcement::AnnouncementSet;
use super::bridge::{BridgeController, ControllerSettings};
use crate::config::BridgeConfig;
use crate::devices::{DeviceProxy, DeviceRegistry};
use crate::mqtt::message_manager::SessionEvents;
use crate::mqtt::mqtt_handler::SessionHandle;

impl From<&BridgeConfig> for ControllerSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            settle_delay: config.settle_delay(),
        }
    }
}

/// Errors that can occur while starting or stopping the controller
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Settings the controller cannot run with
    ///
    /// Configuration validation rejects these earlier; this guards callers
    /// that build [`ControllerSettings`] by hand.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// The controller task panicked or was aborted
    #[error("Controller task failed: {0}")]
    TaskFailed(String),
}

/// Handle for the running controller task
///
/// The controller consumes the session's event stream, so there is exactly
/// one controller per session. Dropping the handle leaves the task running;
/// call [`ControllerHandle::shutdown`] for an orderly stop.
pub struct ControllerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Spawns the controller for an existing broker session
    ///
    /// # Arguments
    ///
    /// * `session` - Handle of the broker session the controller publishes through
    /// * `events` - The session's event stream; the controller becomes its only reader
    /// * `registry` / `announcements` - Fleet and topic layout, built once at startup
    /// * `proxy` - Access to the physical blinds
    /// * `settings` - Poll interval and settle delay
    ///
    /// # Errors
    ///
    /// * [`ControllerError::InvalidSettings`] - A zero poll interval
    pub fn spawn(
        session: SessionHandle,
        events: SessionEvents,
        registry: Arc<DeviceRegistry>,
        announcements: Arc<AnnouncementSet>,
        proxy: DeviceProxy,
        settings: ControllerSettings,
    ) -> Result<Self, ControllerError> {
        info!("Initializing bridge controller with settings: {:?}", settings);

        if settings.poll_interval == Duration::ZERO {
            return Err(ControllerError::InvalidSettings(
                "poll interval must be greater than zero".to_string(),
            ));
        }

        let controller = BridgeController::new(session, registry, announcements, proxy, settings);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(controller.run(events, cancel.clone()));
        debug!("Bridge controller task spawned");

        Ok(Self { cancel, task })
    }

    /// Stops the controller and waits for it, cancelling all pending timers
    pub async fn shutdown(self) -> Result<(), ControllerError> {
        info!("Shutting down bridge controller");
        self.cancel.cancel();
        self.task.await.map_err(|e| {
            error!("Bridge controller task failed: {}", e);
            ControllerError::TaskFailed(e.to_string())
        })
    }
}
