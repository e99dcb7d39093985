//! Per-connection mutual authentication state
//!
//! Each side of a connection makes an independent decision on the other's
//! proof. The combined state only becomes [`CombinedAuthState::Authenticated`]
//! once both decisions are accepted, and it only ever leaves `Pending` once.

use super::{AuthFailureReason, Metadata};
use crate::error::{NetworkError, Result};
use tokio::time::Instant;

/// One side's verdict on a proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No verdict yet
    Pending,
    /// Proof accepted, with metadata from the deciding side
    Accepted(Metadata),
    /// Proof rejected with a reason
    Rejected(String),
}

impl Decision {
    /// Verdict has been made
    #[must_use]
    pub fn is_decided(&self) -> bool {
        !matches!(self, Decision::Pending)
    }
}

/// Outcome of both decisions together
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CombinedAuthState {
    /// Waiting for at least one decision
    Pending,
    /// Both sides accepted
    Authenticated,
    /// Either side rejected, or the deadline passed
    Failed(AuthFailureReason),
}

/// Authentication state of one connection
#[derive(Debug, Clone)]
pub struct AuthState {
    local: Decision,
    remote: Decision,
    combined: CombinedAuthState,
    request_received: bool,
    deadline: Instant,
}

impl AuthState {
    /// Fresh state with both decisions pending
    #[must_use]
    pub fn new(deadline: Instant) -> Self {
        Self {
            local: Decision::Pending,
            remote: Decision::Pending,
            combined: CombinedAuthState::Pending,
            request_received: false,
            deadline,
        }
    }

    /// Our verdict on the remote's proof
    #[must_use]
    pub fn local(&self) -> &Decision {
        &self.local
    }

    /// The remote's verdict on our proof
    #[must_use]
    pub fn remote(&self) -> &Decision {
        &self.remote
    }

    /// Combined state
    #[must_use]
    pub fn combined(&self) -> &CombinedAuthState {
        &self.combined
    }

    /// Deadline for both decisions
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The remote's request has arrived and awaits a local decision
    #[must_use]
    pub fn awaiting_local_decision(&self) -> bool {
        self.request_received && !self.local.is_decided()
    }

    /// Record that the remote's request arrived
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] on a duplicate request.
    pub fn record_request(&mut self) -> Result<()> {
        if self.request_received {
            return Err(NetworkError::invalid_state("duplicate auth request"));
        }
        self.request_received = true;
        Ok(())
    }

    /// Record the local decision
    ///
    /// Returns the new combined state if this call changed it.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] if no request is pending, a
    /// decision was already made, or the state already resolved.
    pub fn set_local(&mut self, decision: Decision) -> Result<Option<CombinedAuthState>> {
        if !self.request_received {
            return Err(NetworkError::invalid_state("no auth request pending"));
        }
        if self.local.is_decided() {
            return Err(NetworkError::invalid_state("local decision already made"));
        }
        if self.combined != CombinedAuthState::Pending {
            return Err(NetworkError::invalid_state("authentication already resolved"));
        }
        self.local = decision;
        Ok(self.recompute())
    }

    /// Record the remote decision
    ///
    /// Returns the new combined state if this call changed it.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] if the remote already decided.
    pub fn set_remote(&mut self, decision: Decision) -> Result<Option<CombinedAuthState>> {
        if self.remote.is_decided() {
            return Err(NetworkError::invalid_state("remote decision already made"));
        }
        self.remote = decision;
        Ok(self.recompute())
    }

    /// Fail the state if `now` is past the deadline and it is still pending
    pub fn expire(&mut self, now: Instant) -> Option<CombinedAuthState> {
        if self.combined == CombinedAuthState::Pending && now >= self.deadline {
            self.combined = CombinedAuthState::Failed(AuthFailureReason::Timeout);
            return Some(self.combined.clone());
        }
        None
    }

    fn recompute(&mut self) -> Option<CombinedAuthState> {
        if self.combined != CombinedAuthState::Pending {
            return None;
        }
        let next = match (&self.local, &self.remote) {
            (Decision::Rejected(reason), _) => {
                CombinedAuthState::Failed(AuthFailureReason::Rejected {
                    by_remote: false,
                    reason: reason.clone(),
                })
            }
            (_, Decision::Rejected(reason)) => {
                CombinedAuthState::Failed(AuthFailureReason::Rejected {
                    by_remote: true,
                    reason: reason.clone(),
                })
            }
            (Decision::Accepted(_), Decision::Accepted(_)) => CombinedAuthState::Authenticated,
            _ => return None,
        };
        tracing::debug!("Auth state transition: Pending -> {:?}", next);
        self.combined = next.clone();
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn state() -> AuthState {
        AuthState::new(Instant::now() + Duration::from_secs(5))
    }

    fn accepted() -> Decision {
        Decision::Accepted(Metadata::new())
    }

    #[test]
    fn test_both_accept_authenticates_once() {
        let mut s = state();
        s.record_request().unwrap();
        assert_eq!(s.set_remote(accepted()).unwrap(), None);
        assert_eq!(
            s.set_local(accepted()).unwrap(),
            Some(CombinedAuthState::Authenticated)
        );
        assert_eq!(s.combined(), &CombinedAuthState::Authenticated);
    }

    #[test]
    fn test_local_decision_requires_request() {
        let mut s = state();
        assert!(s.set_local(accepted()).is_err());
        s.record_request().unwrap();
        assert!(s.awaiting_local_decision());
        s.set_local(accepted()).unwrap();
        assert!(!s.awaiting_local_decision());
        assert!(s.set_local(accepted()).is_err());
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut s = state();
        s.record_request().unwrap();
        assert!(s.record_request().is_err());
    }

    #[test]
    fn test_remote_rejection_wins_over_pending_local() {
        let mut s = state();
        let result = s.set_remote(Decision::Rejected("nope".into())).unwrap();
        assert_eq!(
            result,
            Some(CombinedAuthState::Failed(AuthFailureReason::Rejected {
                by_remote: true,
                reason: "nope".into()
            }))
        );
        s.record_request().unwrap();
        assert!(s.set_local(accepted()).is_err());
    }

    #[test]
    fn test_local_rejection() {
        let mut s = state();
        s.record_request().unwrap();
        let result = s.set_local(Decision::Rejected("bad owner".into())).unwrap();
        assert!(matches!(
            result,
            Some(CombinedAuthState::Failed(AuthFailureReason::Rejected { by_remote: false, .. }))
        ));
    }

    #[test]
    fn test_expire_only_when_pending_and_late() {
        let start = Instant::now();
        let mut s = AuthState::new(start + Duration::from_secs(5));
        assert!(s.expire(start).is_none());
        assert_eq!(
            s.expire(start + Duration::from_secs(6)),
            Some(CombinedAuthState::Failed(AuthFailureReason::Timeout))
        );
        assert!(s.expire(start + Duration::from_secs(7)).is_none());

        let mut done = AuthState::new(start);
        done.record_request().unwrap();
        done.set_local(accepted()).unwrap();
        done.set_remote(accepted()).unwrap();
        assert!(done.expire(start + Duration::from_secs(1)).is_none());
    }
}
