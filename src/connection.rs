//! Connection lifecycle of the receiver link.
//!
//! [`ConnectionMachine`] is a plain value: user intents and transport events
//! go in, a [`Transition`] listing the side effects to perform comes out. The
//! session task owns the machine and carries out the actions in order.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use strum::{AsRefStr, Display};
use thiserror::Error;
use url::Url;

static ENDPOINT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(wss?)://([A-Za-z0-9_]+|[0-9]{1,3}(\.[0-9]{1,3}){3})(:[0-9]+)?$")
        .expect("endpoint pattern is a valid regex")
});

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    #[error("Cannot {action} while {state}")]
    NotAllowed {
        state: ConnectionState,
        action: &'static str,
    },

    #[error("Not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Unknown,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Events reported by the transport for one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransportEvent {
    Open,
    Error,
    Close,
}

/// Identifies one connect attempt. Transport events carry it so that events
/// from a superseded transport cannot move the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A validated `ws://` or `wss://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    raw: String,
    url: Url,
}

impl Endpoint {
    /// Accepts `scheme://host[:port]` where scheme is `ws` or `wss` and host
    /// is a bare name or a dotted-quad IPv4 address. Nothing else: no path,
    /// no credentials, no trailing slash.
    pub fn parse(input: &str) -> Result<Self, ConnectionError> {
        if !is_valid_endpoint(input) {
            return Err(ConnectionError::InvalidEndpoint(input.to_string()));
        }
        // The pattern admits octets above 255; the URL parser does not
        let url = Url::parse(input)
            .map_err(|e| ConnectionError::InvalidEndpoint(format!("{}: {}", input, e)))?;
        Ok(Self {
            raw: input.to_string(),
            url,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }
}

impl FromStr for Endpoint {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub fn is_valid_endpoint(input: &str) -> bool {
    ENDPOINT_PATTERN.is_match(input)
}

/// Side effects requested by a transition, in the order they must happen.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenTransport {
        attempt: AttemptId,
        endpoint: Endpoint,
    },
    CloseTransport,
    ResetQueue,
    SendInitialTuning,
    EnablePipeline,
    DisablePipeline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub actions: Vec<Action>,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempt: AttemptId,
    // Armed by a transport error, consumed by the close that follows it.
    // Scoped to `attempt`; a new attempt starts disarmed.
    suppress_close: bool,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Unknown,
            attempt: AttemptId(0),
            suppress_close: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn can_connect(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Unknown | ConnectionState::Disconnected | ConnectionState::Error
        )
    }

    /// Commands may only go out and audio may only flow while connected.
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// User asked to connect. An invalid endpoint is rejected without any
    /// state change.
    pub fn connect(&mut self, endpoint: &str) -> Result<Transition, ConnectionError> {
        let endpoint = Endpoint::parse(endpoint)?;
        if !self.can_connect() {
            return Err(ConnectionError::NotAllowed {
                state: self.state,
                action: "connect",
            });
        }

        self.attempt = AttemptId(self.attempt.0 + 1);
        self.suppress_close = false;
        Ok(self.move_to(
            ConnectionState::Connecting,
            vec![
                Action::ResetQueue,
                Action::OpenTransport {
                    attempt: self.attempt,
                    endpoint,
                },
            ],
        ))
    }

    /// User asked to disconnect an established connection.
    pub fn disconnect(&mut self) -> Result<Transition, ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::NotAllowed {
                state: self.state,
                action: "disconnect",
            });
        }

        Ok(self.move_to(
            ConnectionState::Disconnected,
            vec![
                Action::CloseTransport,
                Action::DisablePipeline,
                Action::ResetQueue,
            ],
        ))
    }

    /// Feed a transport event. Returns `None` when the event causes no
    /// transition: stale attempts, the close that follows an error, and
    /// events that make no sense in the current state.
    pub fn on_transport_event(
        &mut self,
        attempt: AttemptId,
        event: TransportEvent,
    ) -> Option<Transition> {
        if attempt != self.attempt {
            log::debug!(
                "Connection: Ignoring {} from stale attempt {} (current {})",
                event,
                attempt,
                self.attempt
            );
            return None;
        }

        match (self.state, event) {
            (ConnectionState::Connecting, TransportEvent::Open) => Some(self.move_to(
                ConnectionState::Connected,
                vec![
                    Action::ResetQueue,
                    Action::SendInitialTuning,
                    Action::EnablePipeline,
                ],
            )),
            (ConnectionState::Connecting | ConnectionState::Connected, TransportEvent::Error) => {
                self.suppress_close = true;
                Some(self.move_to(
                    ConnectionState::Error,
                    vec![
                        Action::DisablePipeline,
                        Action::ResetQueue,
                        Action::CloseTransport,
                    ],
                ))
            }
            (_, TransportEvent::Close) if self.suppress_close => {
                self.suppress_close = false;
                log::debug!(
                    "Connection: Suppressed close following error on attempt {}",
                    attempt
                );
                None
            }
            (ConnectionState::Connected, TransportEvent::Close) => Some(self.move_to(
                ConnectionState::Disconnected,
                vec![Action::DisablePipeline, Action::ResetQueue],
            )),
            (ConnectionState::Connecting, TransportEvent::Close) => {
                Some(self.move_to(ConnectionState::Disconnected, vec![Action::ResetQueue]))
            }
            (state, event) => {
                log::debug!("Connection: Ignoring {} while {}", event, state);
                None
            }
        }
    }

    fn move_to(&mut self, to: ConnectionState, actions: Vec<Action>) -> Transition {
        let from = self.state;
        self.state = to;
        log::info!("Connection: {} -> {}", from, to);
        Transition { from, to, actions }
    }
}
