//! Per-connection link session state.
//!
//! A [`LinkSession`] exists from the moment a connection is attempted or
//! accepted until the connection dies. Only the negotiation handshake
//! mutates it before establishment; once established it carries a
//! back-reference to the topology node it represents.
use std::collections::HashSet;
use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::message::Message;

/// Session identity, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Negotiation state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound socket not yet connected.
    Connecting,
    /// Inbound: waiting for the peer's capability announcement.
    WaitAuth1,
    /// Capabilities exchanged, waiting for credential confirmation.
    WaitAuth2,
    /// Trusted peer; a topology node is attached.
    Established,
    /// Terminal; the connection is being torn down.
    Dead,
}

/// One server-to-server connection.
#[derive(Debug)]
pub struct LinkSession {
    pub id: SessionId,
    /// Remote endpoint, for notices (`host:port` or `inbound from <ip>`).
    pub endpoint: String,
    /// Configured target name for outbound attempts; `None` for inbound.
    pub target: Option<String>,
    /// Unix time the connection started.
    pub age: u64,
    pub state: LinkState,
    /// Peer's protocol version, from `CAPAB START`.
    pub proto_version: u16,
    /// Password we will present (recorded at connect-complete, outbound).
    pub outbound_pass: String,
    /// Nonce we issued; the peer's credential must answer it.
    pub our_challenge: String,
    /// Nonce the peer issued; our credential answers it.
    pub their_challenge: String,
    /// Capability keys advertised by the peer.
    pub capabilities: HashSet<String>,
    /// Module names advertised by the peer.
    pub modules: Vec<String>,
    /// Transport hook key this session was opened with, if any.
    pub hook: Option<String>,
    /// Name of the topology node this session represents, once trusted.
    pub server_name: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl LinkSession {
    /// Session for an outbound connection attempt. Starts in
    /// [`LinkState::Connecting`]; the handshake takes over when the
    /// socket connect completes.
    pub fn outbound(
        id: SessionId,
        target: &str,
        host: &str,
        port: u16,
        hook: Option<String>,
        now: u64,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            id,
            endpoint: format!("{host}:{port}"),
            target: Some(target.to_owned()),
            age: now,
            state: LinkState::Connecting,
            proto_version: 0,
            outbound_pass: String::new(),
            our_challenge: String::new(),
            their_challenge: String::new(),
            capabilities: HashSet::new(),
            modules: Vec::new(),
            hook,
            server_name: None,
            tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Session for an accepted inbound connection. Starts in
    /// [`LinkState::WaitAuth1`]; the caller sends the local capability
    /// announcement immediately after.
    pub fn inbound(id: SessionId, remote_ip: &str, now: u64, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            endpoint: format!("inbound from {remote_ip}"),
            target: None,
            age: now,
            state: LinkState::WaitAuth1,
            proto_version: 0,
            outbound_pass: String::new(),
            our_challenge: String::new(),
            their_challenge: String::new(),
            capabilities: HashSet::new(),
            modules: Vec::new(),
            hook: None,
            server_name: None,
            tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Queue a line for the write task. A closed queue means the peer is
    /// already gone; that is the peer's failure, not the sender's.
    pub fn send(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }

    /// Drop all negotiation-only material so no secrets outlive the
    /// handshake.
    pub fn clean_negotiation_info(&mut self) {
        self.outbound_pass.clear();
        self.our_challenge.clear();
        self.their_challenge.clear();
        self.capabilities.clear();
        self.modules.clear();
    }

    /// Handle the connection glue selects on alongside the socket read.
    pub fn closer(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sever the session locally. Wakes the read task even when the peer
    /// never sends another byte, so the session is unregistered without
    /// peer cooperation.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Name used in notices: the server name once known, else the endpoint.
    pub fn describe(&self) -> &str {
        self.server_name
            .as_deref()
            .or(self.target.as_deref())
            .unwrap_or(&self.endpoint)
    }
}
