//! Broker session - connection state machine over rumqttc
//!
//! One [`BrokerSession`] task owns the rumqttc client and event loop. Everyone
//! else talks to it through a cloneable [`SessionHandle`] and learns about
//! lifecycle changes from the [`SessionEvent`] stream.
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► SubscribePending ─► Ready
//!                    ▲   │                       │                │
//!                    │   └───────► Reconnecting ◄┴────────────────┘
//!                    └──(backoff)──────┘
//! ```
//!
//! A fresh client and event loop are created for every connection attempt,
//! so nothing from a dead connection (queued requests, packet ids) leaks into
//! the next one.

use std::future;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::backoff::Backoff;
use super::config::MqttConfig;
use super::message_manager::{MQTTMessage, SessionEvent, SessionEvents};

/// Capacity of rumqttc's request queue. Requests are enqueued with `try_*`
/// from inside the task that polls the event loop, so they must never wait.
const REQUEST_CAPACITY: usize = 128;
const COMMAND_CAPACITY: usize = 64;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

macro_rules! reply {
    ($reply_tx:expr, $result:expr) => {
        if $reply_tx.send($result).is_err() {
            debug!("Requester went away before the reply was sent");
        }
    };
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    SubscribePending,
    Ready,
    Reconnecting,
}

impl ConnectionState {
    /// The broker has accepted us on the current connection
    pub fn is_established(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::SubscribePending | ConnectionState::Ready
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("subscriptions were not acknowledged within {0:?}")]
    SubscriptionTimeout(Duration),

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("broker rejected the connection: {0}")]
    HandshakeRejected(String),

    #[error("client request failed: {0}")]
    Client(String),

    #[error("giving up after {attempts} failed connection attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("broker session has stopped")]
    Stopped,
}

#[derive(Debug)]
enum SessionCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        reply_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        reply_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    SubscriptionsIssued {
        reply_tx: oneshot::Sender<Result<(), SessionError>>,
    },
}

impl SessionCommand {
    fn reject(self, error: SessionError) {
        match self {
            SessionCommand::Publish { reply_tx, .. }
            | SessionCommand::Subscribe { reply_tx, .. }
            | SessionCommand::SubscriptionsIssued { reply_tx } => reply!(reply_tx, Err(error)),
        }
    }
}

/// Cloneable front of a running [`BrokerSession`]
#[derive(Clone, Debug)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queues a publish. Fails with [`SessionError::NotConnected`] unless the
    /// session is `Ready`; the caller decides whether to retry after the next
    /// `Ready` event.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        let topic = topic.into();
        let payload = payload.into();
        self.request(|reply_tx| SessionCommand::Publish {
            topic,
            payload,
            qos,
            retain,
            reply_tx,
        })
        .await
    }

    /// Queues a subscription. Accepted while `SubscribePending` or `Ready`.
    pub async fn subscribe(&self, topic: impl Into<String>, qos: QoS) -> Result<(), SessionError> {
        let topic = topic.into();
        self.request(|reply_tx| SessionCommand::Subscribe {
            topic,
            qos,
            reply_tx,
        })
        .await
    }

    /// Tells the session that every standing subscription has been issued.
    /// The session turns `Ready` once all of them are acknowledged.
    pub async fn subscriptions_issued(&self) -> Result<(), SessionError> {
        self.request(|reply_tx| SessionCommand::SubscriptionsIssued { reply_tx })
            .await
    }

    /// Disconnects gracefully and ends the session task, cancelling any
    /// pending reconnect
    pub fn stop(&self) {
        info!("Stop requested for broker session");
        self.cancel.cancel();
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> SessionCommand,
    ) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        reply_rx.await.map_err(|_| SessionError::Stopped)?
    }
}

/// Outcome of driving one connection attempt
enum ConnectionOutcome {
    Stopped,
    Lost {
        error: SessionError,
        reached_ready: bool,
    },
}

/// Bookkeeping for the `SubscribePending` phase of one connection
#[derive(Debug, Default)]
struct SubscribePhase {
    deadline: Option<Instant>,
    awaiting_acks: usize,
    issued: bool,
}

pub struct BrokerSession {
    config: MqttConfig,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
}

impl BrokerSession {
    pub fn new(config: MqttConfig) -> (Self, SessionHandle, SessionEvents) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
            cancel: cancel.clone(),
        };
        let session = Self {
            backoff: Backoff::new(config.backoff.clone()),
            config,
            state: state_tx,
            commands: command_rx,
            events: event_tx,
            cancel,
        };
        (session, handle, event_rx)
    }

    /// Starts the session on the current runtime
    pub fn spawn(
        config: MqttConfig,
    ) -> (
        SessionHandle,
        SessionEvents,
        JoinHandle<Result<(), SessionError>>,
    ) {
        let (session, handle, events) = Self::new(config);
        let task = tokio::spawn(session.run());
        (handle, events, task)
    }

    /// Runs until [`SessionHandle::stop`] or until `max_attempts` consecutive
    /// connection attempts failed
    pub async fn run(mut self) -> Result<(), SessionError> {
        info!(
            "Starting broker session to {}:{} as {}",
            self.config.host, self.config.port, self.config.client_id
        );
        let mut failed_attempts: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                self.transition(ConnectionState::Disconnected);
                return Ok(());
            }
            self.transition(ConnectionState::Connecting);
            let (client, mut eventloop) =
                AsyncClient::new(self.config.mqtt_options(), REQUEST_CAPACITY);

            match self.drive_connection(&client, &mut eventloop).await {
                ConnectionOutcome::Stopped => {
                    self.disconnect_gracefully(&client, &mut eventloop).await;
                    self.transition(ConnectionState::Disconnected);
                    info!("Broker session stopped");
                    return Ok(());
                }
                ConnectionOutcome::Lost {
                    error,
                    reached_ready,
                } => {
                    if self.current().is_established() {
                        self.emit(SessionEvent::Disconnected {
                            reason: error.to_string(),
                        });
                    }

                    if reached_ready {
                        failed_attempts = 0;
                    } else {
                        failed_attempts += 1;
                        if let Some(max) = self.backoff.max_attempts() {
                            if failed_attempts >= max {
                                error!(
                                    attempts = failed_attempts,
                                    %error,
                                    "Broker unreachable, giving up"
                                );
                                self.transition(ConnectionState::Disconnected);
                                return Err(SessionError::RetriesExhausted {
                                    attempts: failed_attempts,
                                    last: error.to_string(),
                                });
                            }
                        }
                    }

                    self.transition(ConnectionState::Reconnecting);
                    let delay = self.backoff.next_delay();
                    warn!(
                        %error,
                        attempt = failed_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "Broker connection lost, reconnecting"
                    );
                    if !self.wait_backoff(delay).await {
                        self.transition(ConnectionState::Disconnected);
                        info!("Broker session stopped while waiting to reconnect");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn drive_connection(
        &mut self,
        client: &AsyncClient,
        eventloop: &mut EventLoop,
    ) -> ConnectionOutcome {
        let mut phase = SubscribePhase::default();
        let mut reached_ready = false;

        loop {
            let lost = tokio::select! {
                _ = self.cancel.cancelled() => return ConnectionOutcome::Stopped,
                _ = deadline_elapsed(phase.deadline) => {
                    Some(SessionError::SubscriptionTimeout(self.config.subscribe_timeout()))
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command, client, &mut phase);
                    None
                }
                event = eventloop.poll() => match event {
                    Ok(event) => self.handle_event(event, &mut phase),
                    Err(e) => Some(self.classify(e)),
                },
            };

            if let Some(error) = lost {
                return ConnectionOutcome::Lost {
                    error,
                    reached_ready,
                };
            }

            if self.current() == ConnectionState::SubscribePending
                && phase.issued
                && phase.awaiting_acks == 0
            {
                phase.deadline = None;
                self.transition(ConnectionState::Ready);
                self.backoff.reset();
                reached_ready = true;
                self.emit(SessionEvent::Ready);
            }
        }
    }

    fn handle_event(&mut self, event: Event, phase: &mut SubscribePhase) -> Option<SessionError> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    return Some(SessionError::HandshakeRejected(format!("{:?}", ack.code)));
                }
                self.transition(ConnectionState::Connected);
                info!(
                    session_present = ack.session_present,
                    "Connected to broker {}:{}", self.config.host, self.config.port
                );
                self.transition(ConnectionState::SubscribePending);
                phase.deadline = Some(Instant::now() + self.config.subscribe_timeout());
                self.emit(SessionEvent::SubscribePending);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                for code in &ack.return_codes {
                    match code {
                        SubscribeReasonCode::Success(qos) => {
                            debug!(pkid = ack.pkid, granted = ?qos, "Subscription acknowledged")
                        }
                        SubscribeReasonCode::Failure => {
                            warn!(pkid = ack.pkid, "Broker refused a subscription")
                        }
                    }
                }
                phase.awaiting_acks = phase.awaiting_acks.saturating_sub(1);
            }
            Event::Incoming(Packet::Publish(publish)) => match self.current() {
                ConnectionState::SubscribePending | ConnectionState::Ready => {
                    debug!(topic = %publish.topic, bytes = publish.payload.len(), "Message received");
                    self.emit(SessionEvent::Message(MQTTMessage::from_topic(
                        publish.topic,
                        publish.payload.to_vec(),
                    )));
                }
                state => debug!(?state, topic = %publish.topic, "Dropping message outside of a session"),
            },
            Event::Incoming(Packet::Disconnect) => {
                return Some(SessionError::TransportLost(
                    "broker sent DISCONNECT".to_string(),
                ));
            }
            Event::Incoming(packet) => trace!(?packet, "Incoming packet"),
            Event::Outgoing(outgoing) => trace!(?outgoing, "Outgoing packet"),
        }
        None
    }

    fn handle_command(
        &mut self,
        command: SessionCommand,
        client: &AsyncClient,
        phase: &mut SubscribePhase,
    ) {
        let state = self.current();
        match command {
            SessionCommand::Publish {
                topic,
                payload,
                qos,
                retain,
                reply_tx,
            } => {
                let result = if state == ConnectionState::Ready {
                    client
                        .try_publish(topic, qos, retain, payload)
                        .map_err(|e| SessionError::Client(e.to_string()))
                } else {
                    Err(SessionError::NotConnected)
                };
                reply!(reply_tx, result);
            }
            SessionCommand::Subscribe {
                topic,
                qos,
                reply_tx,
            } => {
                let result = match state {
                    ConnectionState::SubscribePending | ConnectionState::Ready => {
                        debug!(%topic, ?qos, "Subscribing");
                        client
                            .try_subscribe(topic, qos)
                            .map(|()| {
                                if state == ConnectionState::SubscribePending {
                                    phase.awaiting_acks += 1;
                                }
                            })
                            .map_err(|e| SessionError::Client(e.to_string()))
                    }
                    _ => Err(SessionError::NotConnected),
                };
                reply!(reply_tx, result);
            }
            SessionCommand::SubscriptionsIssued { reply_tx } => {
                let result = match state {
                    ConnectionState::SubscribePending => {
                        debug!(awaiting = phase.awaiting_acks, "All subscriptions issued");
                        phase.issued = true;
                        Ok(())
                    }
                    ConnectionState::Ready => Ok(()),
                    _ => Err(SessionError::NotConnected),
                };
                reply!(reply_tx, result);
            }
        }
    }

    fn classify(&self, error: ConnectionError) -> SessionError {
        match (&error, self.current()) {
            (ConnectionError::ConnectionRefused(code), _) => {
                SessionError::HandshakeRejected(format!("{code:?}"))
            }
            (_, ConnectionState::Connecting) => SessionError::ConnectFailed(error.to_string()),
            _ => SessionError::TransportLost(error.to_string()),
        }
    }

    /// Sleeps out a reconnect delay while still answering requests.
    /// Returns `false` when the session was stopped in the meantime.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.cancel.cancelled() => return false,
                Some(command) = self.commands.recv() => command.reject(SessionError::NotConnected),
            }
        }
    }

    async fn disconnect_gracefully(&mut self, client: &AsyncClient, eventloop: &mut EventLoop) {
        if !self.current().is_established() {
            return;
        }
        if let Err(e) = client.try_disconnect() {
            warn!("Failed to queue DISCONNECT: {}", e);
            return;
        }
        let flushed = time::timeout(DISCONNECT_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("Broker did not take DISCONNECT within {:?}", DISCONNECT_GRACE);
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Connection state changed");
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Nobody is listening to session events");
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
