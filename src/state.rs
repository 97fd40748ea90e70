//! Endpoint finite-state machine (FSM) types.
//!
//! This module defines every state an [`crate::endpoint::EndpointWorker`] can
//! occupy.  Transitions are driven only by the worker's own control flow (in
//! [`crate::endpoint`]); observers read the current state through a watch
//! channel.
//!
//! ```text
//!  INIT ──start()──▶ CONNECTING ──device up + connect──▶ CONNECTED
//!    ▲                                                      │
//!    │ deinit()                                  login_req  │
//!    │                                                      ▼
//!  DISCONNECTED ◀── stop() / error ── READY ◀── login_resp ── AUTHENTICATING
//! ```
//!
//! Any failure between `CONNECTING` and `READY` also lands in
//! `DISCONNECTED`.

/// All possible states of the endpoint FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointState {
    /// Freshly constructed or re-initialised; nothing is open.
    #[default]
    Init,
    /// Opening the local device and the transport.
    Connecting,
    /// Transport is open; login not yet sent.
    Connected,
    /// `login_req` sent; waiting for `login_resp`.
    Authenticating,
    /// Logged in; both forwarding loops are running.
    Ready,
    /// Stopped or failed.  Terminal until re-initialised.
    Disconnected,
}

impl EndpointState {
    /// States in which a connection attempt or session is in progress.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Authenticating | Self::Ready
        )
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_init() {
        assert_eq!(EndpointState::default(), EndpointState::Init);
    }

    #[test]
    fn active_states() {
        assert!(!EndpointState::Init.is_active());
        assert!(EndpointState::Authenticating.is_active());
        assert!(EndpointState::Ready.is_active());
        assert!(!EndpointState::Disconnected.is_active());
        assert_eq!(EndpointState::Ready.to_string(), "ready");
    }
}
