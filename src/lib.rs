//! spanlink — spanning-tree server-to-server linking.
//!
//! Maintains a tree of chat servers (one root: the local server),
//! negotiates capability and credential exchange with directly-linked
//! peers over persistent line-framed connections, and propagates
//! topology changes (new links, netsplits) to every other peer.

pub mod link;
