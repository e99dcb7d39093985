//! Single-node fixture

use crate::test_helpers::wait_for;
use kadlink_core::auth::REJECT_REASON_KEY;
use kadlink_core::{
    Address, AuthEvent, AuthFailureReason, Keypair, Metadata, NetworkEvent, Node, NodeConfig,
    PeerId, Result, Stream,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How the fixture answers `VerifyPorRequest`
#[derive(Debug, Clone)]
pub enum AcceptPolicy {
    /// Accept every proof
    Accept,
    /// Reject every proof with the given reason
    Reject(String),
    /// Never answer
    Ignore,
}

/// Fixture options
#[derive(Debug, Clone)]
pub struct TestNodeOptions {
    pub config: NodeConfig,
    pub policy: AcceptPolicy,
    /// Read inbound streams to end and reply `ACK: <text>`. When false,
    /// inbound streams are only recorded as events.
    pub answer_streams: bool,
    /// Fixed identity; a fresh one is generated when `None`
    pub keypair: Option<Keypair>,
}

impl Default for TestNodeOptions {
    fn default() -> Self {
        Self {
            config: NodeConfig::default(),
            policy: AcceptPolicy::Accept,
            answer_streams: true,
            keypair: None,
        }
    }
}

/// A message received on an inbound stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub peer_id: PeerId,
    pub text: String,
}

/// A running node listening on loopback
pub struct TestNode {
    pub node: Node,
    pub address: Address,
    events: Arc<Mutex<Vec<NetworkEvent>>>,
    received: Arc<Mutex<Vec<ReceivedMessage>>>,
    event_loop: JoinHandle<()>,
}

impl TestNode {
    /// Node with default options
    pub async fn spawn() -> Result<Self> {
        Self::with_options(TestNodeOptions::default()).await
    }

    /// Node answering PoR requests with `policy`
    pub async fn with_policy(policy: AcceptPolicy) -> Result<Self> {
        Self::with_options(TestNodeOptions {
            policy,
            ..TestNodeOptions::default()
        })
        .await
    }

    /// Start, listen on an ephemeral loopback port, and run the event loop
    pub async fn with_options(options: TestNodeOptions) -> Result<Self> {
        let node = match options.keypair {
            Some(keypair) => Node::with_keypair(keypair, options.config)?,
            None => Node::new(options.config)?,
        };
        node.start().await?;
        let address = node.listen("/ip4/127.0.0.1/tcp/0").await?;

        let events = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let event_loop = tokio::spawn(run_events(
            node.clone(),
            options.policy,
            options.answer_streams,
            Arc::clone(&events),
            Arc::clone(&received),
        ));

        Ok(Self {
            node,
            address,
            events,
            received,
            event_loop,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.node.peer_id()
    }

    /// Events seen so far
    pub fn events(&self) -> Vec<NetworkEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Messages received on inbound streams
    pub fn received_messages(&self) -> Vec<ReceivedMessage> {
        self.received.lock().unwrap().clone()
    }

    /// First recorded event matching `predicate`
    pub fn find_event<F>(&self, predicate: F) -> Option<NetworkEvent>
    where
        F: Fn(&NetworkEvent) -> bool,
    {
        self.events.lock().unwrap().iter().find(|e| predicate(e)).cloned()
    }

    /// Wait for an event matching `predicate`
    pub async fn wait_for_event<F>(&self, timeout: Duration, predicate: F) -> Option<NetworkEvent>
    where
        F: Fn(&NetworkEvent) -> bool,
    {
        wait_for(timeout, || self.find_event(&predicate).is_some()).await;
        self.find_event(&predicate)
    }

    /// Recorded events matching `predicate`
    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&NetworkEvent) -> bool,
    {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    /// Wait for `MutualAuthSuccess` with `peer`
    pub async fn wait_for_auth_success(&self, peer: &PeerId, timeout: Duration) -> bool {
        let peer = *peer;
        self.wait_for_event(timeout, |e| {
            matches!(
                e,
                NetworkEvent::AuthEvent(AuthEvent::MutualAuthSuccess { peer_id, .. })
                    if *peer_id == peer
            )
        })
        .await
        .is_some()
    }

    /// Wait for `AuthFailed` with `peer` and return its reason
    pub async fn wait_for_auth_failure(
        &self,
        peer: &PeerId,
        timeout: Duration,
    ) -> Option<AuthFailureReason> {
        let peer = *peer;
        match self
            .wait_for_event(timeout, |e| {
                matches!(
                    e,
                    NetworkEvent::AuthEvent(AuthEvent::AuthFailed { peer_id, .. })
                        if *peer_id == peer
                )
            })
            .await
        {
            Some(NetworkEvent::AuthEvent(AuthEvent::AuthFailed { reason, .. })) => Some(reason),
            _ => None,
        }
    }

    /// Wait for an inbound stream from `peer`
    pub async fn wait_for_incoming_stream(
        &self,
        peer: &PeerId,
        timeout: Duration,
    ) -> Option<Stream> {
        let peer = *peer;
        match self
            .wait_for_event(timeout, |e| {
                matches!(e, NetworkEvent::IncomingStream { stream } if stream.peer_id() == peer)
            })
            .await
        {
            Some(NetworkEvent::IncomingStream { stream }) => Some(stream),
            _ => None,
        }
    }

    /// Connect to `other` and wait until both sides are authenticated
    pub async fn connect_and_authenticate(&self, other: &TestNode, timeout: Duration) -> bool {
        if !self.node.connect(&other.address.to_string()).await {
            return false;
        }
        self.wait_for_auth_success(&other.peer_id(), timeout).await
            && other.wait_for_auth_success(&self.peer_id(), timeout).await
    }

    /// Stop the node and its event loop
    pub async fn shutdown(self) {
        if self.node.is_running() {
            let _ = self.node.stop().await;
        }
        let _ = self.event_loop.await;
    }
}

async fn run_events(
    node: Node,
    policy: AcceptPolicy,
    answer_streams: bool,
    events: Arc<Mutex<Vec<NetworkEvent>>>,
    received: Arc<Mutex<Vec<ReceivedMessage>>>,
) {
    while node.is_running() {
        let Some(event) = node.get_next_event(Duration::from_millis(50)).await else {
            continue;
        };
        events.lock().unwrap().push(event.clone());

        match event {
            NetworkEvent::AuthEvent(AuthEvent::VerifyPorRequest { connection_id, .. }) => {
                let decision = match &policy {
                    AcceptPolicy::Accept => Some((true, Metadata::new())),
                    AcceptPolicy::Reject(reason) => {
                        let mut metadata = Metadata::new();
                        metadata.insert(REJECT_REASON_KEY.to_string(), reason.clone());
                        Some((false, metadata))
                    }
                    AcceptPolicy::Ignore => None,
                };
                if let Some((accepted, metadata)) = decision {
                    if let Err(e) = node
                        .submit_por_verification(connection_id, accepted, metadata)
                        .await
                    {
                        tracing::debug!("Decision on {} not applied: {}", connection_id, e);
                    }
                }
            }
            NetworkEvent::IncomingStream { stream } if answer_streams => {
                let received = Arc::clone(&received);
                tokio::spawn(async move {
                    let Ok(data) = stream.read_to_end(Duration::from_secs(10)).await else {
                        return;
                    };
                    let text = String::from_utf8_lossy(&data).into_owned();
                    received.lock().unwrap().push(ReceivedMessage {
                        peer_id: stream.peer_id(),
                        text: text.clone(),
                    });
                    let _ = stream.write(format!("ACK: {text}").as_bytes()).await;
                    let _ = stream.flush().await;
                    let _ = stream.write_eof().await;
                    let _ = stream.close().await;
                });
            }
            _ => {}
        }
    }
}
