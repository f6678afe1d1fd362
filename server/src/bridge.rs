//! Per-connection bridge coupling a framed duplex stream to the broadcast hub
//!
//! A bridge runs a reader flow (client frames to `publish`) and a writer flow
//! (outbox to client frames) side by side until the first of them finishes or
//! the connection is cancelled. Whatever ends the connection, the outbox taken
//! at startup is handed back to the hub exactly once.

use crate::error::{BridgeError, HubError};
use crate::hub::{BroadcastHub, Outbox};
use log::{debug, info, warn};
use shared::{read_packet, write_packet, Message, Metadata, Packet, USER_METADATA_KEY};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Extracts the single user name carried in the connection metadata
pub fn resolve_identity(metadata: &Metadata) -> Result<String, BridgeError> {
    let values = metadata.get_all(USER_METADATA_KEY);
    match values.as_slice() {
        [user] => Ok(user.to_string()),
        [] => Err(BridgeError::Unauthenticated(format!(
            "missing {} metadata",
            USER_METADATA_KEY
        ))),
        _ => Err(BridgeError::Unauthenticated(format!(
            "expected one {} value, got {}",
            USER_METADATA_KEY,
            values.len()
        ))),
    }
}

/// Owns an outbox for the lifetime of one connection
///
/// `close` returns the outbox to the hub. If the guard is dropped without
/// being closed (the owning task was aborted), the unsubscribe is spawned on
/// the current runtime instead.
struct Subscription {
    hub: BroadcastHub,
    outbox: Option<Outbox>,
}

impl Subscription {
    async fn open(hub: &BroadcastHub) -> Result<Self, HubError> {
        let outbox = hub.subscribe().await?;
        Ok(Self {
            hub: hub.clone(),
            outbox: Some(outbox),
        })
    }

    async fn recv(&mut self) -> Option<Message> {
        match self.outbox.as_mut() {
            Some(outbox) => outbox.recv().await,
            None => None,
        }
    }

    async fn close(mut self) -> Result<(), HubError> {
        match self.outbox.take() {
            Some(outbox) => self.hub.unsubscribe(outbox).await,
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(outbox) = self.outbox.take() else {
            return;
        };

        let id = outbox.id();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let hub = self.hub.clone();
                runtime.spawn(async move {
                    if let Err(e) = hub.unsubscribe(outbox).await {
                        debug!("Deferred unsubscribe of {} skipped: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("No runtime available to unsubscribe {}", id),
        }
    }
}

/// Bridges one client connection to the hub
pub struct ConnectionBridge {
    hub: BroadcastHub,
    cancel: CancellationToken,
}

impl ConnectionBridge {
    /// `cancel` is the connection-scoped token, normally a child of the root
    pub fn new(hub: BroadcastHub, cancel: CancellationToken) -> Self {
        Self { hub, cancel }
    }

    /// Serves the connection until the client finishes, a transport error
    /// occurs, or the connection is cancelled
    ///
    /// Authentication failures are answered with a `Rejected` frame and
    /// never reach the hub.
    pub async fn run<R, W>(
        self,
        metadata: &Metadata,
        mut reader: R,
        mut writer: W,
    ) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let user = match resolve_identity(metadata) {
            Ok(user) => user,
            Err(err) => {
                let rejected = Packet::Rejected {
                    reason: err.to_string(),
                };
                if let Err(e) = write_packet(&mut writer, &rejected).await {
                    debug!("Could not deliver rejection: {}", e);
                }
                return Err(err);
            }
        };

        let mut subscription = match Subscription::open(&self.hub).await {
            Ok(subscription) => subscription,
            Err(e) => {
                info!("Closing connection for {}: {}", user, e);
                return Ok(());
            }
        };
        info!("User connected: {}", user);

        let outcome = tokio::select! {
            result = read_flow(&self.hub, &user, &mut reader) => result,
            result = write_flow(&mut subscription, &user, &mut writer, &self.cancel) => result,
            _ = self.cancel.cancelled() => {
                debug!("Connection for {} cancelled", user);
                Ok(())
            }
        };
        self.cancel.cancel();

        if let Err(e) = subscription.close().await {
            debug!("Unsubscribe for {} skipped: {}", user, e);
        }
        info!("User disconnected: {}", user);

        outcome
    }
}

async fn read_flow<R>(hub: &BroadcastHub, user: &str, reader: &mut R) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_packet(reader).await.map_err(BridgeError::Receive)? {
            Some(Packet::Request { text }) => {
                if hub.publish(Message::new(user, text)).await.is_err() {
                    debug!("Hub stopped while {} was publishing", user);
                    return Ok(());
                }
            }
            Some(other) => {
                return Err(BridgeError::Receive(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected packet from client: {:?}", other),
                )));
            }
            None => {
                debug!("{} closed the input stream", user);
                return Ok(());
            }
        }
    }
}

async fn write_flow<W>(
    subscription: &mut Subscription,
    user: &str,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            message = subscription.recv() => match message {
                Some(message) => {
                    debug!("Sending message to {}: {:?}", user, message);
                    write_packet(writer, &message.into())
                        .await
                        .map_err(BridgeError::Send)?;
                }
                None => {
                    debug!("Outbox for {} closed", user);
                    return Ok(());
                }
            },
            _ = cancel.cancelled() => {
                debug!("Stopped sending to {}", user);
                return Ok(());
            }
        }
    }
}
