use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rumqttc::QoS;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::announcement::{AnnouncementSet, TopicRole};
use super::command::{BlindCommand, CommandError};
use super::timers::{TimerEvent, TimerSet};
use crate::devices::{Device, DeviceError, DeviceProxy, DeviceRegistry};
use crate::mqtt::message_manager::{MQTTMessage, SessionEvent, SessionEvents};
use crate::mqtt::mqtt_handler::{SessionError, SessionHandle};

/// Broker operations the controller needs
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), SessionError>;
    async fn subscribe(&self, topic: &str) -> Result<(), SessionError>;
    async fn subscriptions_issued(&self) -> Result<(), SessionError>;
}

#[async_trait]
impl BrokerLink for SessionHandle {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), SessionError> {
        SessionHandle::publish(self, topic, payload, QoS::ExactlyOnce, retain).await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
        SessionHandle::subscribe(self, topic, QoS::ExactlyOnce).await
    }

    async fn subscriptions_issued(&self) -> Result<(), SessionError> {
        SessionHandle::subscriptions_issued(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
}

/// What happened to each device during one poll
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub published: usize,
    pub unreachable: usize,
    pub publish_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    Published,
    Unreachable,
    PublishFailed,
}

impl PollReport {
    fn record(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Published => self.published += 1,
            PollOutcome::Unreachable => self.unreachable += 1,
            PollOutcome::PublishFailed => self.publish_failed += 1,
        }
    }
}

/// Why an inbound message led to no device action
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("no device owns topic {0}")]
    UnknownTopic(String),

    #[error("not a command topic")]
    NotACommand,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Single owner of the bridge's runtime state
///
/// Session events, timer events and inbound messages are handled one at a
/// time on the controller task, so polls and commands never interleave.
pub struct BridgeController<L> {
    link: L,
    registry: Arc<DeviceRegistry>,
    announcements: Arc<AnnouncementSet>,
    proxy: DeviceProxy,
    settings: ControllerSettings,
    timers: TimerSet,
    ready: bool,
}

impl<L: BrokerLink> BridgeController<L> {
    pub fn new(
        link: L,
        registry: Arc<DeviceRegistry>,
        announcements: Arc<AnnouncementSet>,
        proxy: DeviceProxy,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            link,
            registry,
            announcements,
            proxy,
            settings,
            timers: TimerSet::new(),
            ready: false,
        }
    }

    /// Runs until `cancel` fires or the session event stream ends
    pub async fn run(mut self, mut events: SessionEvents, cancel: CancellationToken) {
        info!(
            devices = self.registry.len(),
            poll_interval = ?self.settings.poll_interval,
            "Bridge controller running"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.on_session_event(event).await,
                    None => {
                        debug!("Session event stream closed");
                        break;
                    }
                },
                Some(event) = self.timers.recv() => {
                    self.on_timer(event).await;
                }
            }
        }
        self.timers.cancel_all();
        info!("Bridge controller stopped");
    }

    pub async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SubscribePending => {
                self.on_subscribe_pending().await;
            }
            SessionEvent::Ready => {
                self.on_ready().await;
            }
            SessionEvent::Message(message) => {
                trace!(%message, "Inbound message");
                self.report_message(&message).await
            }
            SessionEvent::Disconnected { reason } => self.on_disconnected(&reason),
        }
    }

    async fn report_message(&mut self, message: &MQTTMessage) {
        match self.on_message(message).await {
            Ok(command) => debug!(topic = message.topic(), %command, "Command executed"),
            Err(MessageError::NotACommand) => {
                trace!(topic = message.topic(), "Ignoring echo of our own topic")
            }
            Err(MessageError::UnknownTopic(topic)) => {
                debug!(%topic, "Ignoring message on unknown topic")
            }
            Err(error) => warn!(
                topic = message.topic(),
                received = %message.timestamp(),
                %error,
                "Command not executed"
            ),
        }
    }

    /// Subscribes to every command topic, then lets the session go `Ready`.
    /// Returns the number of subscriptions issued.
    pub async fn on_subscribe_pending(&mut self) -> usize {
        let mut issued = 0;
        for announcement in self.announcements.iter() {
            let Some(topic) = &announcement.command_topic else {
                continue;
            };
            match self.link.subscribe(topic).await {
                Ok(()) => issued += 1,
                Err(error) => warn!(device = %announcement.device_id, %topic, %error, "Subscribe failed"),
            }
        }
        if let Err(error) = self.link.subscriptions_issued().await {
            warn!(%error, "Could not complete the subscribe phase");
        }
        debug!(issued, "Command subscriptions issued");
        issued
    }

    /// Publishes discovery for every device and restarts polling.
    /// Returns the number of discovery documents published.
    pub async fn on_ready(&mut self) -> usize {
        self.ready = true;
        let mut published = 0;
        for announcement in self.announcements.iter() {
            let payload = match announcement.discovery_json() {
                Ok(json) => json.into_bytes(),
                Err(error) => {
                    warn!(device = %announcement.device_id, %error, "Could not encode discovery");
                    continue;
                }
            };
            match self
                .link
                .publish(&announcement.config_topic, payload, true)
                .await
            {
                Ok(()) => published += 1,
                Err(error) => {
                    warn!(device = %announcement.device_id, %error, "Discovery publish failed")
                }
            }
        }
        info!(published, "Announced blinds to Home Assistant");
        self.timers.restart_poll(self.settings.poll_interval);
        published
    }

    pub fn on_disconnected(&mut self, reason: &str) {
        info!(%reason, "Broker connection lost, pausing polls");
        self.ready = false;
        self.timers.cancel_all();
    }

    /// Returns `None` when the event was stale or arrived while not ready
    pub async fn on_timer(&mut self, event: TimerEvent) -> Option<PollReport> {
        if !self.ready || !self.timers.is_current(&event) {
            trace!(?event, "Dropping stale timer event");
            return None;
        }
        match event {
            TimerEvent::PollTick { .. } => Some(self.poll_all().await),
            TimerEvent::SettlePoll { device_id, .. } => {
                let device = self.registry.lookup(&device_id).ok()?;
                let mut report = PollReport::default();
                report.record(self.poll_device(device).await);
                Some(report)
            }
        }
    }

    /// Reads every blind concurrently and publishes what could be read
    pub async fn poll_all(&self) -> PollReport {
        let outcomes = join_all(self.registry.all().iter().map(|d| self.poll_device(d))).await;
        let report = outcomes
            .into_iter()
            .fold(PollReport::default(), |mut report, outcome| {
                report.record(outcome);
                report
            });
        info!(
            published = report.published,
            unreachable = report.unreachable,
            publish_failed = report.publish_failed,
            "Poll finished"
        );
        report
    }

    async fn poll_device(&self, device: &Device) -> PollOutcome {
        let state = match self.proxy.read_state(&device.address).await {
            Ok(state) => state,
            Err(error) => {
                warn!(device = %device.id, %error, "Could not read blind");
                return PollOutcome::Unreachable;
            }
        };
        let Some(announcement) = self.announcements.get(&device.id) else {
            return PollOutcome::PublishFailed;
        };
        let payload = state.position.to_string().into_bytes();
        match self
            .link
            .publish(&announcement.position_topic, payload, false)
            .await
        {
            Ok(()) => {
                debug!(device = %device.id, position = state.position, "Published position");
                PollOutcome::Published
            }
            Err(error) => {
                warn!(device = %device.id, %error, "Position publish failed");
                PollOutcome::PublishFailed
            }
        }
    }

    /// Executes a command received on a blind's `set` topic and schedules
    /// a settle poll for it
    pub async fn on_message(&mut self, message: &MQTTMessage) -> Result<BlindCommand, MessageError> {
        let route = self
            .announcements
            .route(message.topic())
            .ok_or_else(|| MessageError::UnknownTopic(message.topic().to_string()))?;
        if route.role != TopicRole::Command {
            return Err(MessageError::NotACommand);
        }

        let device = self.registry.lookup(route.device_id)?;
        let command = BlindCommand::decode(message.payload())?;
        info!(device = %device.id, %command, "Moving blind");

        self.proxy
            .set_position(&device.address, command.target_position())
            .await?;
        self.timers
            .schedule_settle(&device.id, self.settings.settle_delay);
        Ok(command)
    }
}
