//! Auth frame handling
//!
//! [`AuthProtocol`] owns one [`AuthState`] per connection. It never touches
//! connection state directly; status changes go through
//! [`ConnectionManager::set_auth_status`]. Teardown and event publication on
//! failure are left to the node.

use super::state::{AuthState, CombinedAuthState, Decision};
use super::{AuthFailureReason, Metadata, ProofOfRepresentation, REJECT_REASON_KEY};
use crate::connection::{AuthStatus, Connection, ConnectionId, ConnectionManager};
use crate::error::{NetworkError, Result};
use crate::event::AuthEvent;
use crate::wire::{AuthFrame, AuthVerdict, Frame};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// What the node must do after an auth transition
#[derive(Debug)]
pub(crate) enum AuthStep {
    /// Nothing to report
    Idle,
    /// Ask the application to verify the remote's proof
    Verify(AuthEvent),
    /// Both sides accepted; carries the remote's metadata
    Authenticated(Metadata),
    /// Authentication failed; the connection must be torn down
    Failed(AuthFailureReason),
}

/// Mutual authentication driver
pub struct AuthProtocol {
    states: DashMap<ConnectionId, AuthState>,
    proof: ProofOfRepresentation,
    metadata: Metadata,
    timeout: Duration,
}

impl AuthProtocol {
    /// Create a driver presenting `proof` on every connection
    #[must_use]
    pub fn new(proof: ProofOfRepresentation, metadata: Metadata, timeout: Duration) -> Self {
        Self {
            states: DashMap::new(),
            proof,
            metadata,
            timeout,
        }
    }

    /// Proof presented to remotes
    #[must_use]
    pub fn proof(&self) -> &ProofOfRepresentation {
        &self.proof
    }

    /// Connections with unresolved authentication
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| *s.combined() == CombinedAuthState::Pending)
            .count()
    }

    /// Start authentication on a freshly registered connection.
    ///
    /// Sends our request and returns the deadline for both decisions.
    pub(crate) fn begin(
        &self,
        conn: &Connection,
        connections: &ConnectionManager,
    ) -> Result<Instant> {
        let deadline = Instant::now() + self.timeout;
        self.states.insert(conn.id(), AuthState::new(deadline));
        connections.set_auth_status(conn.id(), AuthStatus::Authenticating)?;
        conn.send(Frame::Auth(AuthFrame::Request {
            proof: self.proof.clone(),
            metadata: self.metadata.clone(),
        }))?;
        tracing::debug!(
            "Sent auth request on {} to {}",
            conn.id(),
            conn.peer_id().short()
        );
        Ok(deadline)
    }

    /// Handle the remote's auth request
    pub(crate) fn on_request(
        &self,
        conn: &Connection,
        connections: &ConnectionManager,
        proof: ProofOfRepresentation,
        metadata: Metadata,
    ) -> AuthStep {
        let Some(mut state) = self.states.get_mut(&conn.id()) else {
            tracing::warn!("Auth request on untracked connection {}", conn.id());
            return AuthStep::Idle;
        };
        if let Err(e) = state.record_request() {
            tracing::warn!("Ignoring auth request from {}: {}", conn.peer_id().short(), e);
            return AuthStep::Idle;
        }

        if let Err(e) = proof.validate_for(&conn.peer_id()) {
            let reason = e.to_string();
            tracing::warn!(
                "Invalid proof from {} on {}: {}",
                conn.peer_id().short(),
                conn.id(),
                reason
            );
            let changed = state.set_local(Decision::Rejected(reason.clone()));
            drop(state);
            let _ = conn.send(Frame::Auth(AuthFrame::Response(AuthVerdict::Rejected(
                reason.clone(),
            ))));
            return match changed {
                Ok(Some(CombinedAuthState::Failed(_))) => {
                    let _ = connections.set_auth_status(conn.id(), AuthStatus::Failed);
                    AuthStep::Failed(AuthFailureReason::InvalidProof(reason))
                }
                _ => AuthStep::Idle,
            };
        }

        AuthStep::Verify(AuthEvent::VerifyPorRequest {
            connection_id: conn.id(),
            peer_id: conn.peer_id(),
            proof,
            metadata,
        })
    }

    /// Record the application's decision and answer the remote
    pub(crate) fn submit(
        &self,
        conn: &Connection,
        connections: &ConnectionManager,
        accepted: bool,
        metadata: Metadata,
    ) -> Result<AuthStep> {
        let mut state = self
            .states
            .get_mut(&conn.id())
            .ok_or(NetworkError::ConnectionNotFound(conn.id()))?;

        let verdict = if accepted {
            AuthVerdict::Accepted(metadata)
        } else {
            let reason = metadata
                .get(REJECT_REASON_KEY)
                .cloned()
                .unwrap_or_else(|| "proof not accepted".to_string());
            AuthVerdict::Rejected(reason)
        };
        let changed = state.set_local(verdict.clone().into_decision())?;
        let remote_metadata = accepted_metadata(state.remote());
        drop(state);

        conn.send(Frame::Auth(AuthFrame::Response(verdict)))?;
        Ok(self.resolve(conn, connections, changed, remote_metadata))
    }

    /// Handle the remote's decision on our proof
    pub(crate) fn on_response(
        &self,
        conn: &Connection,
        connections: &ConnectionManager,
        verdict: AuthVerdict,
    ) -> AuthStep {
        let Some(mut state) = self.states.get_mut(&conn.id()) else {
            tracing::warn!("Auth response on untracked connection {}", conn.id());
            return AuthStep::Idle;
        };
        let remote_metadata = match &verdict {
            AuthVerdict::Accepted(m) => m.clone(),
            AuthVerdict::Rejected(_) => Metadata::new(),
        };
        let changed = match state.set_remote(verdict.into_decision()) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!("Ignoring auth response from {}: {}", conn.peer_id().short(), e);
                return AuthStep::Idle;
            }
        };
        drop(state);
        self.resolve(conn, connections, changed, remote_metadata)
    }

    /// Fail the connection's auth if its deadline passed
    pub(crate) fn expire(
        &self,
        id: ConnectionId,
        connections: &ConnectionManager,
    ) -> Option<AuthFailureReason> {
        let changed = self.states.get_mut(&id)?.expire(Instant::now());
        match changed {
            Some(CombinedAuthState::Failed(reason)) => {
                let _ = connections.set_auth_status(id, AuthStatus::Failed);
                Some(reason)
            }
            _ => None,
        }
    }

    /// Drop state for a torn-down connection
    pub(crate) fn forget(&self, id: ConnectionId) {
        self.states.remove(&id);
    }

    /// Drop all state
    pub(crate) fn clear(&self) {
        self.states.clear();
    }

    fn resolve(
        &self,
        conn: &Connection,
        connections: &ConnectionManager,
        changed: Option<CombinedAuthState>,
        remote_metadata: Metadata,
    ) -> AuthStep {
        match changed {
            None | Some(CombinedAuthState::Pending) => AuthStep::Idle,
            Some(CombinedAuthState::Authenticated) => {
                if let Err(e) = connections.set_auth_status(conn.id(), AuthStatus::Authenticated) {
                    tracing::debug!("Connection {} gone before auth completed: {}", conn.id(), e);
                    return AuthStep::Idle;
                }
                tracing::info!(
                    "Mutual authentication with {} on {} complete",
                    conn.peer_id().short(),
                    conn.id()
                );
                AuthStep::Authenticated(remote_metadata)
            }
            Some(CombinedAuthState::Failed(reason)) => {
                let _ = connections.set_auth_status(conn.id(), AuthStatus::Failed);
                tracing::info!(
                    "Authentication with {} on {} failed: {}",
                    conn.peer_id().short(),
                    conn.id(),
                    reason
                );
                AuthStep::Failed(reason)
            }
        }
    }
}

impl AuthVerdict {
    fn into_decision(self) -> Decision {
        match self {
            AuthVerdict::Accepted(metadata) => Decision::Accepted(metadata),
            AuthVerdict::Rejected(reason) => Decision::Rejected(reason),
        }
    }
}

fn accepted_metadata(decision: &Decision) -> Metadata {
    match decision {
        Decision::Accepted(m) => m.clone(),
        _ => Metadata::new(),
    }
}
