//! The link negotiation state machine.
//!
//! Capability lists are exchanged first and credentials second, so
//! either side can abort before any secret crosses the wire. When both
//! sides advertise `CHALLENGE`, the credential field of the `SERVER`
//! line carries a keyed-hash answer to the peer's nonce instead of the
//! plaintext password.
//!
//! Wire verbs recognized before establishment:
//!
//! ```text
//! CAPAB START <version>
//! CAPAB CAPABILITIES :KEY=VALUE ...     (repeatable, chunked)
//! CAPAB MODULES :name,name              (repeatable, chunked)
//! CAPAB END
//! SERVER <name> <credential> :<description>
//! ERROR :<diagnostic>
//! ```
use tracing::{debug, info, warn};

use super::config::find_link;
use super::message::Message;
use super::server::{broadcast_except, unix_now, NetworkEvent, NetworkState};
use super::session::{LinkState, SessionId};

/// Protocol version this build speaks. Peers announcing an older version
/// are refused during `CAPAB START`.
pub const PROTOCOL_VERSION: u16 = 3;

/// Answer to a peer's challenge nonce: a keyed hash of the nonce under a
/// key derived from the shared link password. The password itself never
/// crosses the wire when both sides support challenges.
pub fn challenge_response(password: &str, challenge: &str) -> String {
    let key = blake3::hash(password.as_bytes());
    blake3::keyed_hash(key.as_bytes(), challenge.as_bytes())
        .to_hex()
        .to_string()
}

fn new_challenge() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Send the local capability announcement on a session, issuing our
/// challenge nonce as part of it.
pub fn send_capabilities(st: &mut NetworkState, sid: SessionId) {
    let modules = st.hooks.names().join(",");
    let Some(session) = st.links.get_mut(sid) else {
        return;
    };
    if session.our_challenge.is_empty() {
        session.our_challenge = new_challenge();
    }
    let challenge = session.our_challenge.clone();

    session.send(Message::new(
        "CAPAB",
        vec!["START".into(), PROTOCOL_VERSION.to_string()],
    ));
    session.send(Message::new(
        "CAPAB",
        vec![
            "CAPABILITIES".into(),
            format!("PROTOCOL={PROTOCOL_VERSION} CHALLENGE={challenge}"),
        ],
    ));
    if !modules.is_empty() {
        session.send(Message::new("CAPAB", vec!["MODULES".into(), modules]));
    }
    session.send(Message::new("CAPAB", vec!["END".into()]));
}

/// Outbound socket connect completed: look up the link block we dialed
/// for, remember the password to present, announce capabilities, and
/// wait for the peer's credential.
///
/// A missing block means the configuration changed between the dial and
/// the connect completing. Tolerated: the session is left as-is and the
/// timeout sweep will reap it.
pub fn on_connected(st: &mut NetworkState, sid: SessionId) {
    let Some(session) = st.links.get(sid) else {
        return;
    };
    if session.state != LinkState::Connecting {
        return;
    }
    let Some(target) = session.target.clone() else {
        return;
    };

    let Some(block) = find_link(&st.blocks, &target).cloned() else {
        warn!(target, "link block vanished before connect completed; leaving session to expire");
        return;
    };

    info!(peer = %block.name, addr = %block.display_addr(), "connection started");
    if let Some(session) = st.links.get_mut(sid) {
        session.outbound_pass = block.send_pass.clone();
        session.state = LinkState::WaitAuth2;
    }
    send_capabilities(st, sid);
}

/// Feed one framed line into a session's state machine. Empty lines are
/// no-ops. Any failure is terminal for the session only: it is marked
/// [`LinkState::Dead`] and the connection glue tears it down.
pub fn on_line(st: &mut NetworkState, sid: SessionId, line: &str) {
    if line.is_empty() {
        return;
    }
    let msg = match Message::parse(line) {
        Ok(msg) => msg,
        Err(e) => {
            error_and_close(st, sid, &format!("malformed line: {e}"));
            return;
        }
    };

    let Some(state) = st.links.get(sid).map(|s| s.state) else {
        return;
    };
    match state {
        LinkState::Dead => {}
        LinkState::Connecting => {
            // The link block raced away between the dial and the connect
            // completing: nothing was announced and nothing will be. The
            // peer's lines are dropped and the sweep reaps the session.
            debug!(%sid, command = %msg.command, "dropping line on unnegotiated session");
        }
        LinkState::WaitAuth1 | LinkState::WaitAuth2 => handle_negotiation(st, sid, msg, state),
        LinkState::Established => handle_established(st, sid, msg),
    }
}

fn handle_negotiation(st: &mut NetworkState, sid: SessionId, msg: Message, state: LinkState) {
    match msg.command.as_str() {
        "CAPAB" => handle_capab(st, sid, &msg, state),
        "SERVER" => handle_server_auth(st, sid, &msg),
        "ERROR" => {
            let peer = st.links.get(sid).map(|s| s.describe().to_owned()).unwrap_or_default();
            let text = msg.params.first().cloned().unwrap_or_default();
            warn!(%sid, peer, text, "peer sent ERROR during negotiation");
            mark_dead(st, sid);
        }
        other => {
            error_and_close(st, sid, &format!("unexpected {other} during negotiation"));
        }
    }
}

fn handle_capab(st: &mut NetworkState, sid: SessionId, msg: &Message, state: LinkState) {
    let Some(sub) = msg.params.first().map(|s| s.as_str()) else {
        error_and_close(st, sid, "CAPAB with no subcommand");
        return;
    };
    match sub {
        "START" => {
            let version = msg.params.get(1).and_then(|v| v.parse::<u16>().ok());
            match version {
                Some(v) if v >= PROTOCOL_VERSION => {
                    if let Some(session) = st.links.get_mut(sid) {
                        session.proto_version = v;
                    }
                }
                Some(v) => {
                    error_and_close(
                        st,
                        sid,
                        &format!("unsupported protocol version {v} (need {PROTOCOL_VERSION})"),
                    );
                }
                None => error_and_close(st, sid, "CAPAB START with no version"),
            }
        }
        "CAPABILITIES" => {
            let Some(session) = st.links.get_mut(sid) else {
                return;
            };
            for token in msg.params.get(1).map(|s| s.as_str()).unwrap_or_default().split_whitespace()
            {
                let (key, value) = token.split_once('=').unwrap_or((token, ""));
                if key == "CHALLENGE" && !value.is_empty() {
                    session.their_challenge = value.to_owned();
                }
                session.capabilities.insert(key.to_owned());
            }
        }
        "MODULES" => {
            if let Some(session) = st.links.get_mut(sid) {
                session.modules.extend(
                    msg.params
                        .get(1)
                        .map(|s| s.as_str())
                        .unwrap_or_default()
                        .split(',')
                        .filter(|m| !m.is_empty())
                        .map(str::to_owned),
                );
            }
        }
        "END" => {
            // The dialing side announces itself first; an accepting side
            // answers only after validating the peer's credential.
            if state == LinkState::WaitAuth2 {
                let pass = st
                    .links
                    .get(sid)
                    .map(|s| s.outbound_pass.clone())
                    .unwrap_or_default();
                send_credential(st, sid, &pass);
            }
        }
        other => {
            debug!(%sid, subcommand = other, "ignoring unknown CAPAB subcommand");
        }
    }
}

/// Send our `SERVER` announcement with the credential the peer expects:
/// an answer to its challenge when it issued one, the plaintext link
/// password otherwise.
fn send_credential(st: &mut NetworkState, sid: SessionId, send_pass: &str) {
    let local = st.local_name();
    let desc = st
        .tree
        .find(&local)
        .map(|n| n.description.clone())
        .unwrap_or_default();
    let Some(session) = st.links.get(sid) else {
        return;
    };
    let credential = if session.their_challenge.is_empty() {
        send_pass.to_owned()
    } else {
        challenge_response(send_pass, &session.their_challenge)
    };
    session.send(Message::new("SERVER", vec![local, credential, desc]));
}

/// Validate a peer's `SERVER <name> <credential> :<desc>` announcement
/// and, on success, promote the session to established.
fn handle_server_auth(st: &mut NetworkState, sid: SessionId, msg: &Message) {
    if msg.params.len() < 2 {
        error_and_close(st, sid, "SERVER with missing parameters");
        return;
    }
    let name = msg.params[0].clone();
    let credential = &msg.params[1];
    let desc = msg.params.get(2).cloned().unwrap_or_default();

    let Some(block) = find_link(&st.blocks, &name).cloned() else {
        error_and_close(st, sid, &format!("no link configuration for {name}"));
        return;
    };
    if st.tree.find(&name).is_some() {
        // Existing link wins; this session is the offender.
        error_and_close(st, sid, &format!("server {name} already exists on the network"));
        return;
    }

    let Some(session) = st.links.get(sid) else {
        return;
    };
    let accepted = credential == &block.recv_pass
        || (!session.our_challenge.is_empty()
            && credential == &challenge_response(&block.recv_pass, &session.our_challenge));
    let inbound = session.target.is_none();
    if !accepted {
        error_and_close(st, sid, "invalid credentials");
        return;
    }

    // The accepting side answers with its own announcement before the
    // negotiation material (and with it the peer's challenge) is cleared.
    if inbound {
        send_credential(st, sid, &block.send_pass);
    }

    let local = st.local_name();
    if let Err(e) = st.tree.attach(&name, &desc, &local, unix_now()) {
        error_and_close(st, sid, &format!("cannot attach {name}: {e}"));
        return;
    }

    if let Some(session) = st.links.get_mut(sid) {
        session.server_name = Some(name.clone());
        session.state = LinkState::Established;
        session.clean_negotiation_info();
    }
    st.links.clear_timeout(sid);

    info!(peer = %name, %sid, "link established");
    st.emit(NetworkEvent::ServerLinked {
        name: name.clone(),
        via: sid,
    });

    // Tell the rest of the network about the new link.
    let announce = Message::with_prefix(local, "SERVER", vec![name, desc]);
    broadcast_except(&st.links, Some(sid), &announce);
}

/// Routing for lines on a trusted link: topology mutations are handled
/// here, everything else goes to the external command dispatcher.
fn handle_established(st: &mut NetworkState, sid: SessionId, msg: Message) {
    match msg.command.as_str() {
        "PING" => {
            let token = msg.params.first().cloned().unwrap_or_default();
            let local = st.local_name();
            if let Some(session) = st.links.get(sid) {
                session.send(Message::with_prefix(local, "PONG", vec![token]));
            }
        }
        "SQUIT" => {
            let Some(name) = msg.params.first().cloned() else {
                warn!(%sid, "SQUIT with no server name");
                return;
            };
            let reason = msg.params.get(1).cloned().unwrap_or_default();
            super::squit::split(st, &name, &reason, Some(sid));
        }
        "SERVER" => handle_remote_link(st, sid, &msg),
        "ERROR" => {
            let text = msg.params.first().cloned().unwrap_or_default();
            warn!(%sid, text, "peer sent ERROR; closing link");
            mark_dead(st, sid);
        }
        _ => st.emit(NetworkEvent::Dispatch { from: sid, message: msg }),
    }
}

/// A peer announced a server newly linked somewhere behind it. Attach it
/// under the announcing hop and pass the announcement on.
fn handle_remote_link(st: &mut NetworkState, sid: SessionId, msg: &Message) {
    let Some(name) = msg.params.first().cloned() else {
        error_and_close(st, sid, "SERVER announcement with no name");
        return;
    };
    let desc = msg.params.get(1).cloned().unwrap_or_default();

    let via = st.links.get(sid).and_then(|s| s.server_name.clone());
    let parent = msg
        .prefix
        .clone()
        .filter(|p| st.tree.find(p).is_some())
        .or(via);
    let Some(parent) = parent else {
        warn!(%sid, server = %name, "SERVER announcement from unknown parent; dropping");
        return;
    };

    if let Err(e) = st.tree.attach(&name, &desc, &parent, unix_now()) {
        // Existing link wins; the announcing session is the offender.
        error_and_close(st, sid, &format!("cannot attach {name}: {e}"));
        return;
    }

    info!(server = %name, %parent, "new remote link announced");
    st.emit(NetworkEvent::ServerLinked {
        name: name.clone(),
        via: sid,
    });

    let announce = Message::with_prefix(parent, "SERVER", vec![name, desc]);
    broadcast_except(&st.links, Some(sid), &announce);
}

/// Send a diagnostic to the peer and mark the session terminal. The
/// connection glue closes it once it observes the state.
fn error_and_close(st: &mut NetworkState, sid: SessionId, diagnostic: &str) {
    let Some(session) = st.links.get_mut(sid) else {
        return;
    };
    warn!(%sid, peer = session.describe(), diagnostic, "closing link");
    session.send(Message::new("ERROR", vec![diagnostic.to_owned()]));
    session.state = LinkState::Dead;
}

fn mark_dead(st: &mut NetworkState, sid: SessionId) {
    if let Some(session) = st.links.get_mut(sid) {
        session.state = LinkState::Dead;
    }
}
