//! Node wrapper shared by the shell and the event loop.

use console::style;
use kadlink_core::{AuthEvent, ConnectionId, Metadata, NetworkEvent, Node, PeerId, Stream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Poll interval of the event loop
const EVENT_POLL: Duration = Duration::from_millis(250);

/// A message received on an inbound stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Sender
    pub peer_id: PeerId,
    /// Message text
    pub text: String,
}

/// Running node plus CLI state
#[derive(Clone)]
pub struct App {
    pub node: Node,
    pub auto_accept: bool,
    pub read_timeout: Duration,
    received: Arc<Mutex<Vec<ReceivedMessage>>>,
    /// PoR requests awaiting a manual decision
    pending: Arc<Mutex<HashMap<ConnectionId, PeerId>>>,
}

impl App {
    pub fn new(node: Node, auto_accept: bool, read_timeout: Duration) -> Self {
        Self {
            node,
            auto_accept,
            read_timeout,
            received: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn received_messages(&self) -> Vec<ReceivedMessage> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pending_requests(&self) -> Vec<(ConnectionId, PeerId)> {
        let mut pending: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(c, p)| (*c, *p))
            .collect();
        pending.sort();
        pending
    }

    /// Answer a PoR request held for a manual decision
    pub async fn decide(
        &self,
        connection: ConnectionId,
        accepted: bool,
        metadata: Metadata,
    ) -> anyhow::Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection);
        self.node
            .submit_por_verification(connection, accepted, metadata)
            .await?;
        Ok(())
    }

    /// Print and react to events until the node stops
    pub async fn run_events(self) {
        while self.node.is_running() {
            if let Some(event) = self.node.get_next_event(EVENT_POLL).await {
                self.handle_event(event).await;
            }
        }
        tracing::debug!("Event loop finished");
    }

    async fn handle_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::AuthEvent(AuthEvent::VerifyPorRequest {
                connection_id,
                peer_id,
                proof,
                ..
            }) => {
                if self.auto_accept {
                    if let Err(e) = self
                        .node
                        .submit_por_verification(connection_id, true, Metadata::new())
                        .await
                    {
                        tracing::warn!("Auto-accept on {} failed: {}", connection_id, e);
                    }
                } else {
                    self.pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(connection_id, peer_id);
                    println!(
                        "{} {} on {} (owner {}), answer with 'accept {}' or 'reject {}'",
                        style("PoR request").yellow(),
                        peer_id,
                        connection_id,
                        hex::encode(&proof.owner_public_key[..8]),
                        connection_id.as_u64(),
                        connection_id.as_u64()
                    );
                }
            }
            NetworkEvent::AuthEvent(AuthEvent::MutualAuthSuccess { peer_id, .. }) => {
                println!("{} {}", style("Authenticated").green(), peer_id);
            }
            NetworkEvent::AuthEvent(AuthEvent::AuthFailed {
                peer_id,
                connection_id,
                reason,
            }) => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&connection_id);
                println!("{} {}: {}", style("Auth failed").red(), peer_id, reason);
            }
            NetworkEvent::IncomingStream { stream } => {
                let app = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = app.answer_stream(&stream).await {
                        tracing::warn!(
                            "Stream {} from {} failed: {}",
                            stream.id(),
                            stream.peer_id().short(),
                            e
                        );
                    }
                });
            }
            NetworkEvent::PeerConnected { peer_id } => {
                println!("{} {}", style("Connected").cyan(), peer_id);
            }
            NetworkEvent::PeerDisconnected { peer_id } => {
                println!("{} {}", style("Disconnected").cyan(), peer_id);
            }
            NetworkEvent::KadAddressAdded { peer_id, address } => {
                tracing::info!("Learned address {} for {}", address, peer_id.short());
            }
            NetworkEvent::KadRoutingUpdated { peer_id, addresses } => {
                tracing::info!(
                    "Routing table updated: {} ({} addresses)",
                    peer_id.short(),
                    addresses.len()
                );
            }
            NetworkEvent::ListeningOn { address } => {
                println!("{} {}", style("Listening on").bold(), address);
            }
            NetworkEvent::ConnectionError { peer_id, error } => match peer_id {
                Some(peer) => println!("{} {}: {}", style("Connection error").red(), peer, error),
                None => println!("{} {}", style("Connection error").red(), error),
            },
        }
    }

    /// Read an inbound message, record it, and acknowledge it
    async fn answer_stream(&self, stream: &Stream) -> anyhow::Result<()> {
        let data = stream.read_to_end(self.read_timeout).await?;
        let text = String::from_utf8_lossy(&data).into_owned();
        println!("{} {}: {}", style("Message from").magenta(), stream.peer_id(), text);
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ReceivedMessage {
                peer_id: stream.peer_id(),
                text: text.clone(),
            });

        stream.write(format!("ACK: {text}").as_bytes()).await?;
        stream.flush().await?;
        stream.write_eof().await?;
        stream.close().await?;
        Ok(())
    }

    /// Deliver `message` to `peer`, connecting through the DHT if needed.
    /// Returns the peer's reply.
    pub async fn send_message(&self, peer: &PeerId, message: &str) -> anyhow::Result<String> {
        if !self.node.is_peer_authenticated(peer) {
            self.reach(peer).await?;
        }
        let stream = self.node.open_stream(peer).await?;
        stream.write(message.as_bytes()).await?;
        stream.write_eof().await?;
        let reply = stream.read_to_end(self.read_timeout).await;
        if stream.has_error_data() {
            if let Some(payload) = stream.error_read() {
                tracing::warn!("Peer reported error: {}", String::from_utf8_lossy(&payload));
            }
        }
        stream.close().await?;
        Ok(String::from_utf8_lossy(&reply?).into_owned())
    }

    async fn reach(&self, peer: &PeerId) -> anyhow::Result<()> {
        if !self.node.is_connected(peer) {
            if !self.node.find(peer).await {
                anyhow::bail!("peer {} not found", peer.short());
            }
            let mut connected = false;
            for address in self.node.search_peer_addresses(peer) {
                if self.node.connect(&address.to_string()).await {
                    connected = true;
                    break;
                }
            }
            if !connected && !self.node.is_connected(peer) {
                anyhow::bail!("no reachable address for {}", peer.short());
            }
        }
        let wait = self.node.config().auth.timeout;
        if !self.node.wait_for_authentication(peer, wait).await {
            anyhow::bail!("peer {} did not authenticate", peer.short());
        }
        Ok(())
    }
}
