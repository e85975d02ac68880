use std::{future::Future, time::Duration};

use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Request,
    SubscribeReasonCode,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::config::MqttConfig;
use crate::connectivity::LinkReporter;
use crate::db::RecordStore;
use crate::dispatch::{CommandPublisher, TransmitError};
use crate::ingest::{IngestListener, IngestOutcome};

const REQUEST_CAPACITY: usize = 10;

type Confirmation = oneshot::Sender<Result<(), TransmitError>>;

/// A publish waiting for the worker to hand it to the connection.
#[derive(Debug)]
pub struct OutboundCommand {
    topic: String,
    payload: Vec<u8>,
    done: Confirmation,
}

pub type CommandQueue = mpsc::Receiver<OutboundCommand>;

/// Cloneable handle for publishing commands.
///
/// Commands are queued here rather than in rumqttc, so the worker decides
/// when each one reaches the connection and can report its fate exactly.
#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
    commands: mpsc::Sender<OutboundCommand>,
}

impl CommandPublisher for MqttLink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransmitError> {
        let (done, confirmation) = oneshot::channel();
        self.commands
            .try_send(OutboundCommand {
                topic: topic.to_string(),
                payload: payload.as_bytes().to_vec(),
                done,
            })
            .map_err(|err| TransmitError(format!("command queue: {err}")))?;

        confirmation.await.unwrap_or_else(|_| {
            Err(TransmitError(
                "transport stopped before writing the message".to_string(),
            ))
        })
    }
}

pub fn connect(config: &MqttConfig) -> (MqttLink, CommandQueue, EventLoop) {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let (commands, queue) = mpsc::channel(REQUEST_CAPACITY);
    (MqttLink { client, commands }, queue, eventloop)
}

/// Drops publishes rumqttc would replay after reconnecting, and write reports
/// for packets that never left the buffer. A command reported as failed must
/// not reach the device later.
fn withdraw_unsent(eventloop: &mut EventLoop) -> usize {
    let queued = eventloop.pending.len();
    eventloop
        .pending
        .retain(|request| !matches!(request, Request::Publish(_)));
    eventloop
        .state
        .events
        .retain(|event| !matches!(event, Event::Outgoing(Outgoing::Publish(_))));
    queued - eventloop.pending.len()
}

/// Drives the event loop: lifecycle events feed the connectivity monitor and
/// the listener, telemetry messages become append tasks, and queued commands
/// go out one at a time while the link is up.
pub struct MqttWorker<S> {
    client: AsyncClient,
    commands: CommandQueue,
    in_flight: Option<Confirmation>,
    online: bool,
    listener: IngestListener<S>,
    reporter: LinkReporter,
    reconnect_delay: Duration,
}

impl<S: RecordStore> MqttWorker<S> {
    pub fn new(
        link: &MqttLink,
        commands: CommandQueue,
        listener: IngestListener<S>,
        reporter: LinkReporter,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            client: link.client.clone(),
            commands,
            in_flight: None,
            online: false,
            listener,
            reporter,
            reconnect_delay,
        }
    }

    pub async fn run(mut self, mut eventloop: EventLoop, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!("[MQTT] Connecting...");
        self.listener.connecting();

        loop {
            let ready = self.online && self.in_flight.is_none();
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(event) => {
                        self.handle_event(event);
                    }
                    Err(err) => {
                        error!("[MQTT] Connection error: {err}");
                        self.connection_failed(&mut eventloop, &err.to_string());
                        // rumqttc reconnects on the next poll
                        tokio::select! {
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                            _ = &mut shutdown => break,
                        }
                    }
                },
                Some(command) = self.commands.recv(), if ready => self.forward(command),
                _ = &mut shutdown => break,
            }
        }

        info!("[MQTT] Shutting down (listener {})", self.listener.state());
        self.reporter.disconnected();
        self.fail_in_flight("shutting down");
    }

    /// Returns the append task spawned for a telemetry message, if any.
    pub fn handle_event(&mut self, event: Event) -> Option<JoinHandle<IngestOutcome>> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("[MQTT] Client connected successfully.");
                    self.online = true;
                    self.reporter.connected();
                    self.listener.connected();
                    self.subscribe();
                } else {
                    warn!("[MQTT] Connection refused: {:?}", ack.code);
                    self.connection_lost();
                }
                None
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                self.listener.subscribed(granted);
                None
            }
            Event::Incoming(Packet::Publish(publish)) => self
                .listener
                .accept(&publish.topic, &publish.payload)
                .map(|reading| self.listener.spawn_append(reading)),
            Event::Incoming(Packet::Disconnect) => {
                // the in-flight command is settled when the poll fails
                warn!("[MQTT] Broker closed the session");
                self.connection_lost();
                None
            }
            Event::Outgoing(Outgoing::Publish(_)) => {
                match self.in_flight.take() {
                    Some(done) => {
                        let _ = done.send(Ok(()));
                    }
                    None => debug!("[MQTT] Publish written with no caller waiting"),
                }
                None
            }
            other => {
                debug!("[MQTT] {other:?}");
                None
            }
        }
    }

    /// Hands a command to the connection unless its caller already gave up.
    fn forward(&mut self, command: OutboundCommand) {
        if command.done.is_closed() {
            debug!("[MQTT] Caller gave up, not sending to {}", command.topic);
            return;
        }

        match self
            .client
            .try_publish(command.topic, QoS::AtMostOnce, false, command.payload)
        {
            Ok(()) => self.in_flight = Some(command.done),
            Err(err) => {
                let _ = command.done.send(Err(TransmitError(err.to_string())));
            }
        }
    }

    fn subscribe(&self) {
        if let Err(err) = self
            .client
            .try_subscribe(self.listener.topic(), QoS::AtMostOnce)
        {
            error!("[MQTT] Subscription error: {err}");
        }
    }

    fn connection_lost(&mut self) {
        self.online = false;
        self.reporter.error();
        self.listener.dropped();
    }

    /// The poll failed: whatever was not written is withdrawn and reported.
    fn connection_failed(&mut self, eventloop: &mut EventLoop, reason: &str) {
        self.connection_lost();
        let withdrawn = withdraw_unsent(eventloop);
        if withdrawn > 0 {
            warn!("[MQTT] Withdrew {withdrawn} unsent publish(es)");
        }
        self.fail_in_flight(&format!(
            "connection lost before the command was written: {reason}"
        ));
    }

    fn fail_in_flight(&mut self, reason: &str) {
        if let Some(done) = self.in_flight.take() {
            let _ = done.send(Err(TransmitError(reason.to_string())));
        }
    }
}
