//! End-to-end linking scenarios, driven over in-memory sessions: two
//! state machines wired back to back exchange real protocol lines, with
//! no sockets involved.
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use spanlink::link::config::LinkBlock;
use spanlink::link::handshake;
use spanlink::link::message::Message;
use spanlink::link::server::{self, NetworkEvent, NetworkState};
use spanlink::link::session::{LinkSession, LinkState, SessionId};
use spanlink::link::squit;

fn block(name: &str, pass: &str) -> LinkBlock {
    LinkBlock {
        name: name.into(),
        host: "10.0.0.2".into(),
        port: 7000,
        send_pass: pass.into(),
        recv_pass: pass.into(),
        autoconnect: false,
        hidden: false,
        hook: None,
    }
}

/// One simulated server: its state machine plus the event stream.
struct Peer {
    st: NetworkState,
    _events: mpsc::UnboundedReceiver<NetworkEvent>,
}

impl Peer {
    fn new(name: &str, desc: &str, blocks: Vec<LinkBlock>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            st: NetworkState::new(name, desc, blocks, tx, 100),
            _events: rx,
        }
    }
}

/// Relay queued lines between two peers until both sides go quiet.
fn pump(
    a: &mut Peer,
    a_sid: SessionId,
    a_rx: &mut mpsc::UnboundedReceiver<Message>,
    b: &mut Peer,
    b_sid: SessionId,
    b_rx: &mut mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let mut moved = false;
        while let Ok(msg) = a_rx.try_recv() {
            handshake::on_line(&mut b.st, b_sid, &msg.to_wire());
            moved = true;
        }
        while let Ok(msg) = b_rx.try_recv() {
            handshake::on_line(&mut a.st, a_sid, &msg.to_wire());
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

/// Scenario: an outbound dialer and an accepting peer negotiate
/// capabilities and credentials and both end up established, each with
/// the other in its tree.
#[test]
fn two_peers_link_end_to_end() {
    // rook dials hub; each side's link block names the other.
    let mut rook = Peer::new("rook.example", "Rook server", vec![block("hub.example", "s3cret")]);
    let mut hub = Peer::new("hub.example", "Hub server", vec![block("rook.example", "s3cret")]);

    let (rook_tx, mut rook_rx) = mpsc::unbounded_channel();
    let rook_sid = rook.st.alloc_id();
    rook.st.links.register(
        LinkSession::outbound(rook_sid, "hub.example", "10.0.0.2", 7000, None, 100, rook_tx),
        30,
        100,
    );

    let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();
    let hub_sid = hub.st.alloc_id();
    hub.st
        .links
        .register(LinkSession::inbound(hub_sid, "10.0.0.1", 100, hub_tx), 30, 100);

    // The accept path announces immediately; the dial path announces
    // when the socket connect completes.
    handshake::send_capabilities(&mut hub.st, hub_sid);
    handshake::on_connected(&mut rook.st, rook_sid);

    pump(&mut rook, rook_sid, &mut rook_rx, &mut hub, hub_sid, &mut hub_rx);

    for (peer, sid, other) in [
        (&rook, rook_sid, "hub.example"),
        (&hub, hub_sid, "rook.example"),
    ] {
        let session = peer.st.links.get(sid).unwrap();
        assert_eq!(session.state, LinkState::Established, "{other} side");
        assert_eq!(session.server_name.as_deref(), Some(other));
        assert!(session.outbound_pass.is_empty());
        assert!(session.our_challenge.is_empty());
        assert!(session.their_challenge.is_empty());
        assert!(peer.st.links.timeout(sid).is_none());

        let node = peer.st.tree.find(other).unwrap();
        assert_eq!(node.parent.as_deref(), Some(peer.st.tree.root_name()));
    }
    assert_eq!(rook.st.tree.len(), 2);
    assert_eq!(hub.st.tree.len(), 2);
}

/// Both sides advertised challenges, so the plaintext password never
/// crossed the wire in either direction.
#[test]
fn linked_peers_never_exchange_plaintext() {
    let mut rook = Peer::new("rook.example", "Rook server", vec![block("hub.example", "s3cret")]);
    let mut hub = Peer::new("hub.example", "Hub server", vec![block("rook.example", "s3cret")]);

    let (rook_tx, mut rook_rx) = mpsc::unbounded_channel();
    let rook_sid = rook.st.alloc_id();
    rook.st.links.register(
        LinkSession::outbound(rook_sid, "hub.example", "10.0.0.2", 7000, None, 100, rook_tx),
        30,
        100,
    );
    let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();
    let hub_sid = hub.st.alloc_id();
    hub.st
        .links
        .register(LinkSession::inbound(hub_sid, "10.0.0.1", 100, hub_tx), 30, 100);

    handshake::send_capabilities(&mut hub.st, hub_sid);
    handshake::on_connected(&mut rook.st, rook_sid);

    // Same relay as `pump`, but capture every line on the wire.
    let mut wire = Vec::new();
    loop {
        let mut moved = false;
        while let Ok(msg) = rook_rx.try_recv() {
            wire.push(msg.to_wire());
            handshake::on_line(&mut hub.st, hub_sid, &msg.to_wire());
            moved = true;
        }
        while let Ok(msg) = hub_rx.try_recv() {
            wire.push(msg.to_wire());
            handshake::on_line(&mut rook.st, rook_sid, &msg.to_wire());
            moved = true;
        }
        if !moved {
            break;
        }
    }

    assert_eq!(rook.st.links.get(rook_sid).unwrap().state, LinkState::Established);
    assert_eq!(hub.st.links.get(hub_sid).unwrap().state, LinkState::Established);
    assert!(
        !wire.iter().any(|l| l.contains("s3cret")),
        "plaintext password on the wire: {wire:?}"
    );
}

/// Scenario: an established leaf with one attached user dies
/// unexpectedly. Exactly one split removes one server and one user and
/// notifies every other established link once.
#[tokio::test]
async fn closing_an_established_link_splits_exactly_once() {
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut st = NetworkState::new("root.example", "Root server", Vec::new(), event_tx, 100);

    st.tree.attach("leaf.example", "Leaf", "root.example", 101).unwrap();
    st.tree.find_mut("leaf.example").unwrap().users = 1;

    let (leaf_tx, _leaf_rx) = mpsc::unbounded_channel();
    let leaf_sid = st.alloc_id();
    let mut leaf = LinkSession::inbound(leaf_sid, "203.0.113.9", 100, leaf_tx);
    leaf.state = LinkState::Established;
    leaf.server_name = Some("leaf.example".into());
    st.links.register(leaf, 30, 100);
    st.links.clear_timeout(leaf_sid);

    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    let peer_sid = st.alloc_id();
    let mut peer = LinkSession::inbound(peer_sid, "203.0.113.10", 100, peer_tx);
    peer.state = LinkState::Established;
    peer.server_name = Some("peer.example".into());
    st.links.register(peer, 30, 100);
    st.links.clear_timeout(peer_sid);

    let state = Arc::new(RwLock::new(st));
    server::shutdown(&state, leaf_sid, "Remote host closed").await;
    // A second close of the same session must not split again.
    server::shutdown(&state, leaf_sid, "Remote host closed").await;

    let st = state.read().await;
    assert!(st.tree.find("leaf.example").is_none());
    assert_eq!(st.tree.len(), 1);
    assert!(st.links.get(leaf_sid).is_none());

    let mut notices = Vec::new();
    while let Ok(msg) = peer_rx.try_recv() {
        notices.push(msg.to_wire());
    }
    assert_eq!(
        notices,
        vec![":root.example SQUIT leaf.example :Remote host closed".to_owned()]
    );

    assert!(matches!(
        events.try_recv().unwrap(),
        NetworkEvent::ServerLost { name } if name == "leaf.example"
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        NetworkEvent::SplitComplete { servers_lost: 1, users_lost: 1, .. }
    ));
    assert!(events.try_recv().is_err(), "split reported once only");
}

/// Scenario: a three-level chain root->a->b->c split at a loses all
/// three servers in one split with one broadcast addressed from root.
#[test]
fn chain_split_at_the_top_takes_the_whole_branch() {
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut st = NetworkState::new("root.example", "Root server", Vec::new(), event_tx, 100);
    st.tree.attach("a.example", "A", "root.example", 101).unwrap();
    st.tree.attach("b.example", "B", "a.example", 102).unwrap();
    st.tree.attach("c.example", "C", "b.example", 103).unwrap();

    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    let peer_sid = st.alloc_id();
    let mut peer = LinkSession::inbound(peer_sid, "203.0.113.10", 100, peer_tx);
    peer.state = LinkState::Established;
    peer.server_name = Some("peer.example".into());
    st.links.register(peer, 30, 100);

    let summary = squit::split(&mut st, "a.example", "Ping timeout", None).unwrap();

    assert_eq!(summary.servers_lost, 3);
    assert_eq!(st.tree.len(), 1);
    for gone in ["a.example", "b.example", "c.example"] {
        assert!(st.tree.find(gone).is_none(), "{gone} should be gone");
    }

    let mut notices = Vec::new();
    while let Ok(msg) = peer_rx.try_recv() {
        notices.push(msg.to_wire());
    }
    assert_eq!(
        notices,
        vec![":root.example SQUIT a.example :Ping timeout".to_owned()]
    );

    assert!(matches!(
        events.try_recv().unwrap(),
        NetworkEvent::ServerLost { name } if name == "a.example"
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        NetworkEvent::SplitComplete { servers_lost: 3, .. }
    ));
}
