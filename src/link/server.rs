//! Linking core state and the async connection glue.
//!
//! All shared mutable state — the topology tree, the session table, the
//! link configuration — lives in one [`NetworkState`] behind a single
//! `RwLock`. Every mutation happens under one write guard, so the split
//! walk always observes a consistent tree. Suspension points are only
//! at the I/O boundary: the per-session read/write tasks and the
//! timeout sweep.
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::codec::LineCodec;
use super::config::{find_link, LinkBlock};
use super::handshake;
use super::message::Message;
use super::registry::LinkTable;
use super::session::{LinkSession, LinkState, SessionId};
use super::squit;
use super::tree::ServerTree;

/// Seconds a session may spend negotiating before the sweep closes it.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// How often the timeout sweep runs.
const SWEEP_INTERVAL_SECS: u64 = 10;

/// Local server identity — `SPANLINK_NAME` env var, or the system
/// hostname when it looks like a fqdn.
pub static SERVER_NAME: LazyLock<String> = LazyLock::new(|| {
    std::env::var("SPANLINK_NAME")
        .ok()
        .filter(|s| s.contains('.'))
        .or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .filter(|h| h.contains('.'))
        })
        .unwrap_or_else(|| "spanlink.localdomain".into())
});

/// Local server description for the announcement line.
pub static SERVER_DESC: LazyLock<String> = LazyLock::new(|| {
    std::env::var("SPANLINK_DESC").unwrap_or_else(|_| "spanlink server".into())
});

/// Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Errors surfaced by the linking layer.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no link block configured for {0}")]
    NoSuchLink(String),
    #[error("no transport hook registered under {0:?}")]
    UnknownHook(String),
    #[error("connection failed: {0}")]
    Transport(#[from] io::Error),
}

/// Status events for external collaborators (command dispatcher, notice
/// sinks). Emitted on an unbounded channel; the linking core never
/// blocks on a slow listener.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A new server joined the tree (locally linked or announced by a peer).
    ServerLinked { name: String, via: SessionId },
    /// A server (and implicitly its subtree) is about to leave the tree.
    /// Emitted before any state is mutated.
    ServerLost { name: String },
    /// A split finished; aggregate counts, reported once per split.
    SplitComplete {
        name: String,
        servers_lost: u32,
        users_lost: u32,
    },
    /// A line from an established peer that the linking core does not
    /// handle itself — fed to the external command dispatcher.
    Dispatch { from: SessionId, message: Message },
}

/// Combined read+write bound for type-erased link transports.
pub trait LinkTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkTransport for T {}

/// A connected byte stream ready for line framing.
pub type LinkStream = Box<dyn LinkTransport>;

/// A named transport wrapper (e.g. a TLS layer) applied to outbound
/// connections whose link block names it.
pub trait TransportHook: Send + Sync {
    fn wrap(&self, stream: LinkStream) -> LinkStream;
}

/// Transport hooks registered under stable string keys and looked up
/// directly by that key.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn TransportHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &str, hook: Arc<dyn TransportHook>) {
        self.hooks.insert(key.to_owned(), hook);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn TransportHook>> {
        self.hooks.get(key).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.hooks.keys().cloned().collect();
        names.sort();
        names
    }
}

/// All linking state, owned by one logical writer.
pub struct NetworkState {
    pub tree: ServerTree,
    pub links: LinkTable,
    pub blocks: Vec<LinkBlock>,
    pub hooks: HookRegistry,
    pub event_tx: mpsc::UnboundedSender<NetworkEvent>,
    next_id: u64,
}

pub type SharedState = Arc<RwLock<NetworkState>>;

impl NetworkState {
    pub fn new(
        name: &str,
        description: &str,
        blocks: Vec<LinkBlock>,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
        now: u64,
    ) -> Self {
        Self {
            tree: ServerTree::new(name, description, now),
            links: LinkTable::new(),
            blocks,
            hooks: HookRegistry::new(),
            event_tx,
            next_id: 0,
        }
    }

    pub fn alloc_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    pub fn local_name(&self) -> String {
        self.tree.root_name().to_owned()
    }

    /// Fire an event; nobody listening is fine.
    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// One-to-all-but-sender: queue `msg` on every established session except
/// the one it came from. A session dying mid-iteration only loses its own
/// copy — the snapshot keeps the loop intact.
pub fn broadcast_except(links: &LinkTable, except: Option<SessionId>, msg: &Message) {
    for id in links.established_except(except) {
        if let Some(session) = links.get(id) {
            session.send(msg.clone());
        }
    }
}

/// Open an outbound link to a configured peer.
///
/// The session exists (in `Connecting`, with its handshake deadline)
/// before the socket connect resolves, so a stalled connect is swept
/// like any stalled handshake.
pub async fn connect(state: &SharedState, target: &str) -> Result<SessionId, LinkError> {
    let (block, hook) = {
        let st = state.read().await;
        let block = find_link(&st.blocks, target)
            .cloned()
            .ok_or_else(|| LinkError::NoSuchLink(target.to_owned()))?;
        let hook = match &block.hook {
            Some(key) => Some(
                st.hooks
                    .get(key)
                    .ok_or_else(|| LinkError::UnknownHook(key.clone()))?,
            ),
            None => None,
        };
        (block, hook)
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let (sid, closer) = {
        let mut st = state.write().await;
        let now = unix_now();
        let sid = st.alloc_id();
        let session = LinkSession::outbound(
            sid,
            &block.name,
            &block.host,
            block.port,
            block.hook.clone(),
            now,
            tx,
        );
        let closer = session.closer();
        st.links.register(session, HANDSHAKE_TIMEOUT_SECS, now);
        (sid, closer)
    };

    let socket = match TcpStream::connect((block.host.as_str(), block.port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(target, error = %e, "outbound link connect failed");
            let mut st = state.write().await;
            st.links.unregister(sid);
            return Err(e.into());
        }
    };

    let stream: LinkStream = match hook {
        Some(h) => h.wrap(Box::new(socket)),
        None => Box::new(socket),
    };

    {
        let mut st = state.write().await;
        handshake::on_connected(&mut st, sid);
    }
    spawn_session(state.clone(), stream, sid, rx, closer);
    Ok(sid)
}

/// Take ownership of an accepted inbound connection and start its
/// handshake: the local capability announcement goes out immediately.
pub async fn accept(state: &SharedState, socket: TcpStream, remote_ip: &str) -> SessionId {
    let (tx, rx) = mpsc::unbounded_channel();
    let (sid, closer) = {
        let mut st = state.write().await;
        let now = unix_now();
        let sid = st.alloc_id();
        let session = LinkSession::inbound(sid, remote_ip, now, tx);
        let closer = session.closer();
        st.links.register(session, HANDSHAKE_TIMEOUT_SECS, now);
        handshake::send_capabilities(&mut st, sid);
        (sid, closer)
    };
    spawn_session(state.clone(), Box::new(socket), sid, rx, closer);
    sid
}

/// Close a session. Safe at any negotiation state; called at most once
/// per session thanks to `unregister`'s idempotence. An established
/// session's death triggers exactly one split for its node.
pub async fn shutdown(state: &SharedState, sid: SessionId, reason: &str) {
    let mut st = state.write().await;
    let Some(session) = st.links.unregister(sid) else {
        return;
    };
    info!(%sid, peer = session.describe(), reason, "link closed");
    // Wake the read task if it is still parked on the socket, so a close
    // initiated elsewhere (the sweep, a split) also drops the connection.
    session.close();
    if session.state == LinkState::Established {
        if let Some(name) = session.server_name.clone() {
            squit::split(&mut st, &name, reason, None);
        }
    }
}

/// Spawn the read and write tasks for one session.
fn spawn_session(
    state: SharedState,
    stream: LinkStream,
    sid: SessionId,
    mut outq: mpsc::UnboundedReceiver<Message>,
    closer: CancellationToken,
) {
    let (read_half, write_half) = tokio::io::split(stream);

    tokio::spawn(async move {
        let mut writer = FramedWrite::new(write_half, LineCodec);
        while let Some(msg) = outq.recv().await {
            if writer.send(msg).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut reader = FramedRead::new(read_half, LineCodec);
        let mut reason = "connection closed";
        loop {
            let item = tokio::select! {
                _ = closer.cancelled() => {
                    reason = "link severed";
                    break;
                }
                item = reader.next() => item,
            };
            let Some(item) = item else { break };
            match item {
                Ok(line) => {
                    let mut st = state.write().await;
                    handshake::on_line(&mut st, sid, &line);
                    let dead = st
                        .links
                        .get(sid)
                        .map(|s| s.state == LinkState::Dead)
                        .unwrap_or(true);
                    if dead {
                        reason = "link error";
                        break;
                    }
                }
                Err(e) => {
                    warn!(%sid, error = %e, "read error on link");
                    reason = "read error";
                    break;
                }
            }
        }
        shutdown(&state, sid, reason).await;
    });
}

/// Periodic sweep that force-closes sessions whose handshake deadline
/// passed. The only mechanism that unsticks a stalled negotiation.
pub fn spawn_timeout_sweep(state: SharedState) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            tick.tick().await;
            let expired = {
                let st = state.read().await;
                let now = unix_now();
                let ids = st.links.sweep_expired(now);
                for id in &ids {
                    if let Some(t) = st.links.timeout(*id) {
                        warn!(sid = %id, peer = %t.description, "handshake timed out");
                    }
                }
                ids
            };
            for id in expired {
                shutdown(&state, id, "handshake timed out").await;
            }
        }
    });
}

/// One pass over autoconnect link blocks: dial every peer that is not
/// already linked or mid-handshake. Retry scheduling is the embedding
/// daemon's concern.
pub async fn autoconnect_pass(state: &SharedState) {
    let targets: Vec<String> = {
        let st = state.read().await;
        st.blocks
            .iter()
            .filter(|b| b.autoconnect)
            .filter(|b| st.tree.find(&b.name).is_none())
            .filter(|b| st.links.session_for_server(&b.name).is_none())
            .map(|b| b.name.clone())
            .collect()
    };
    for target in targets {
        if let Err(e) = connect(state, &target).await {
            warn!(target, error = %e, "autoconnect attempt failed");
        }
    }
}

/// Bind the listen addresses and run the accept loop.
pub async fn run(state: SharedState, addrs: &[&str]) -> Result<(), LinkError> {
    spawn_timeout_sweep(state.clone());

    let mut listeners = Vec::new();
    for addr in addrs {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "listening for server links");
        listeners.push(listener);
    }

    for listener in listeners.into_iter() {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        info!(%peer, "inbound server connection");
                        accept(&state, socket, &peer.ip().to_string()).await;
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        });
    }

    // Park forever; the accept loops and session tasks do the work.
    futures::future::pending::<()>().await;
    Ok(())
}
