//! Connection lifecycle and reconnect policy.
//!
//! The engine does not own a socket; the host opens it and reports what
//! happened. [`ConnectionManager`] keeps track of where the connection stands
//! and decides, whenever it is lost, whether the host should dial again.
//!
//! ```text
//! Disconnected --connect--> Connecting --on_connected--> Connected
//!                               ^                            |
//!                               |                     error / forced
//!                            connect                         v
//!                               +------------------- Reconnecting
//! ```
//!
//! A loss with the policy exhausted lands in `Disconnected` instead.

use std::net::SocketAddr;

use tracing::{info, warn};

use super::error::RpcError;
use crate::config::ReconnectPolicy;

/// Socket flavor the engine frames for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Byte stream with record marking
    Tcp,
    /// One message per datagram
    Udp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What the host should do after the connection was lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Dial this address again and report the outcome.
    Retry(SocketAddr),
    /// The policy is exhausted; every pending call has been failed.
    GiveUp,
}

#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    transport: Transport,
    peer: Option<SocketAddr>,
    policy: ReconnectPolicy,
    /// Reconnect attempts since the last successful connect.
    attempts: u32,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transport: Transport::Tcp,
            peer: None,
            policy,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ReconnectPolicy) {
        self.policy = policy;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Starts a connection attempt. From `Disconnected` this is a fresh
    /// connection; from `Reconnecting` it continues the current reconnect
    /// cycle and keeps its attempt count.
    pub fn begin_connect(&mut self, peer: SocketAddr, transport: Transport) -> Result<(), RpcError> {
        match self.state {
            ConnectionState::Disconnected => self.attempts = 0,
            ConnectionState::Reconnecting => {}
            state => return Err(RpcError::InvalidState { state }),
        }
        info!("connecting to {} over {:?}", peer, transport);
        self.peer = Some(peer);
        self.transport = transport;
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    pub fn on_connected(&mut self) -> Result<(), RpcError> {
        if self.state != ConnectionState::Connecting {
            return Err(RpcError::InvalidState { state: self.state });
        }
        if let Some(peer) = self.peer {
            info!("connected to {}", peer);
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        Ok(())
    }

    /// Records the loss of the connection (or a failed attempt at one) and
    /// consults the policy.
    pub fn on_lost(&mut self) -> ReconnectStep {
        let Some(peer) = self.peer else {
            self.state = ConnectionState::Disconnected;
            return ReconnectStep::GiveUp;
        };
        if matches!(self.state, ConnectionState::Disconnected) {
            return ReconnectStep::GiveUp;
        }

        let retry = match self.policy {
            ReconnectPolicy::Never => false,
            ReconnectPolicy::Infinite => true,
            ReconnectPolicy::Limited(max) => self.attempts < max,
        };
        if retry {
            self.attempts = self.attempts.saturating_add(1);
            info!("reconnecting to {} (attempt {})", peer, self.attempts);
            self.state = ConnectionState::Reconnecting;
            ReconnectStep::Retry(peer)
        } else {
            warn!("giving up on {} after {} reconnect attempts", peer, self.attempts);
            self.state = ConnectionState::Disconnected;
            self.attempts = 0;
            ReconnectStep::GiveUp
        }
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
    }
}
