use std::{future::Future, time::Duration};

use common::req::DoorAction;
use log::{error, info, warn};

use crate::connectivity::Connectivity;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransmitError(pub String);

/// Outbound half of the broker connection.
///
/// `publish` resolves once the transport has written the message to the
/// broker, or fails if it could not.
pub trait CommandPublisher: Send + Sync + 'static {
    fn publish(
        &self,
        topic: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), TransmitError>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct CommandIntent {
    pub action: Option<String>,
}

/// The command left this process. Says nothing about the door itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub action: DoorAction,
}

impl Ack {
    pub fn message(&self) -> String {
        format!(
            "Door command {} sent to broker; execution by the device is not confirmed.",
            self.action
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid action. Must be OPEN or CLOSE.")]
    InvalidAction(Option<String>),
    #[error("MQTT Client not connected to Broker.")]
    NotConnected,
    #[error("Failed to publish MQTT command.")]
    TransmitFailed(String),
}

impl DispatchError {
    /// Internal cause, kept out of the user-facing message.
    pub fn detail(&self) -> Option<&str> {
        match self {
            DispatchError::InvalidAction(action) => action.as_deref(),
            DispatchError::NotConnected => None,
            DispatchError::TransmitFailed(why) => Some(why.as_str()),
        }
    }
}

pub struct Dispatcher<P> {
    publisher: P,
    connectivity: Connectivity,
    topic: String,
    timeout: Duration,
}

impl<P: CommandPublisher> Dispatcher<P> {
    pub fn new(
        publisher: P,
        connectivity: Connectivity,
        topic: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            publisher,
            connectivity,
            topic: topic.into(),
            timeout,
        }
    }

    pub async fn dispatch(&self, intent: CommandIntent) -> Result<Ack, DispatchError> {
        let action = match intent.action.as_deref().map(str::parse::<DoorAction>) {
            Some(Ok(action)) => action,
            _ => {
                warn!("[COMMAND] Rejecting action {:?}", intent.action);
                return Err(DispatchError::InvalidAction(intent.action));
            }
        };

        if !self.connectivity.is_live() {
            warn!("[COMMAND] Not connected, {action} not sent");
            return Err(DispatchError::NotConnected);
        }

        let command = action.as_command();
        match tokio::time::timeout(self.timeout, self.publisher.publish(&self.topic, command)).await
        {
            Ok(Ok(())) => {
                info!("[COMMAND] Command published to MQTT: {command}");
                Ok(Ack { action })
            }
            Ok(Err(err)) => {
                error!("[COMMAND] Error publishing command: {err}");
                Err(DispatchError::TransmitFailed(err.0))
            }
            Err(_) => {
                error!(
                    "[COMMAND] No transmit confirmation for {command} within {:?}",
                    self.timeout
                );
                Err(DispatchError::TransmitFailed(format!(
                    "timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}
