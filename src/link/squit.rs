//! The netsplit algorithm.
//!
//! Removing a server means removing its whole subtree: descendants are
//! torn down depth-first before their ancestors, so no step ever sees a
//! user whose server is already gone. The split notice is broadcast
//! exactly once per split, addressed as coming from the severed node's
//! parent, to every established link except the one that reported it.
use tracing::{info, warn};

use super::message::Message;
use super::server::{broadcast_except, NetworkEvent, NetworkState};
use super::session::{LinkState, SessionId};
use super::tree::{fold_name, ServerTree};

/// Aggregate outcome of one split, reported once at the top level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSummary {
    pub servers_lost: u32,
    pub users_lost: u32,
}

/// Detach `name` and its entire subtree from the topology.
///
/// `from` is the session the split notice arrived on, excluded from the
/// re-broadcast. Returns `None` without mutating anything when the
/// server is unknown (a stale or repeated split) or is the local root.
pub fn split(
    st: &mut NetworkState,
    name: &str,
    reason: &str,
    from: Option<SessionId>,
) -> Option<SplitSummary> {
    let Some(node) = st.tree.find(name) else {
        warn!(server = name, "split requested for unknown server");
        return None;
    };
    if st.tree.is_root(name) {
        warn!(server = name, "refusing to split the local server");
        return None;
    }
    let server = node.name.clone();
    let Some(parent_key) = node.parent.clone() else {
        warn!(server = name, "split target has no parent; tree inconsistent");
        return None;
    };
    let parent = st
        .tree
        .find(&parent_key)
        .map(|p| p.name.clone())
        .unwrap_or(parent_key);

    // Listeners see the pre-split view: the event goes out before any
    // state changes.
    st.emit(NetworkEvent::ServerLost {
        name: server.clone(),
    });

    // One-to-all-but-sender, addressed as from the parent. Exactly once
    // per split, regardless of how deep the subtree goes.
    let notice = Message::with_prefix(
        parent.clone(),
        "SQUIT",
        vec![server.clone(), reason.to_owned()],
    );
    broadcast_except(&st.links, from, &notice);

    if st.tree.is_root(&parent) {
        info!(server = %server, reason, "server split");
    } else {
        info!(server = %server, %parent, reason, "remote server split");
    }

    // A directly-linked peer being severed gets told, marked terminal,
    // and actively closed: the read task is woken so the session is
    // unregistered even if the peer never sends or hangs up.
    if let Some(sid) = st.links.session_for_server(&server) {
        if Some(sid) != from {
            if let Some(session) = st.links.get_mut(sid) {
                session.send(Message::new(
                    "ERROR",
                    vec![format!("link to {server} severed: {reason}")],
                ));
                session.state = LinkState::Dead;
                session.close();
            }
        }
    }

    let (servers_lost, users_lost) = remove_subtree(&mut st.tree, &fold_name(&server));

    info!(
        server = %server,
        servers_lost,
        users_lost,
        "netsplit complete"
    );
    st.emit(NetworkEvent::SplitComplete {
        name: server,
        servers_lost,
        users_lost,
    });
    Some(SplitSummary {
        servers_lost,
        users_lost,
    })
}

/// Depth-first removal, children before self, returning the accumulated
/// `(servers, users)` counts for this subtree.
fn remove_subtree(tree: &mut ServerTree, key: &str) -> (u32, u32) {
    let mut servers = 0;
    let mut users = 0;
    for child in tree.child_keys(key) {
        let (s, u) = remove_subtree(tree, &child);
        servers += s;
        users += u;
    }
    match tree.detach(key) {
        Some(node) => (servers + 1, users + node.users),
        None => {
            // Should not happen given the tree invariant; logged, never
            // propagated, so one inconsistency cannot abort the split.
            warn!(server = key, "subtree node vanished mid-split");
            (servers, users)
        }
    }
}
