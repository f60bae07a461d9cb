//! Server topology tree.
//!
//! One node per known server, rooted at the local server. Nodes are kept
//! in a name-indexed map (names are case-insensitive); the tree shape is
//! carried by each node's parent key plus the parent's ordered child
//! list, and every mutation keeps the two in agreement.
use std::collections::HashMap;

use serde_json::json;

/// Normalize a server name for case-insensitive comparison.
pub fn fold_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("server {0} already exists")]
    DuplicateName(String),
    #[error("unknown parent server {0}")]
    UnknownParent(String),
}

/// One server in the topology.
#[derive(Debug, Clone)]
pub struct ServerNode {
    /// Display-case name as announced by the server.
    pub name: String,
    pub description: String,
    /// Folded key of the parent; `None` only for the root.
    pub parent: Option<String>,
    /// Folded keys of direct children, in link order.
    pub children: Vec<String>,
    /// Unix time the server joined the tree.
    pub linked_at: u64,
    /// Local users attached below this server. User storage itself lives
    /// outside this layer; the tree only carries the count.
    pub users: u32,
}

/// The spanning tree, indexed by folded server name.
#[derive(Debug)]
pub struct ServerTree {
    nodes: HashMap<String, ServerNode>,
    root: String,
}

impl ServerTree {
    pub fn new(root_name: &str, description: &str, now: u64) -> Self {
        let key = fold_name(root_name);
        let mut nodes = HashMap::new();
        nodes.insert(
            key.clone(),
            ServerNode {
                name: root_name.to_owned(),
                description: description.to_owned(),
                parent: None,
                children: Vec::new(),
                linked_at: now,
                users: 0,
            },
        );
        Self { nodes, root: key }
    }

    pub fn root_name(&self) -> &str {
        &self.nodes[&self.root].name
    }

    pub fn is_root(&self, name: &str) -> bool {
        fold_name(name) == self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&ServerNode> {
        self.nodes.get(&fold_name(name))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut ServerNode> {
        self.nodes.get_mut(&fold_name(name))
    }

    /// Add a server under `parent`. The name must be unused anywhere in
    /// the tree and the parent must exist.
    pub fn attach(
        &mut self,
        name: &str,
        description: &str,
        parent: &str,
        now: u64,
    ) -> Result<(), TreeError> {
        let key = fold_name(name);
        let parent_key = fold_name(parent);
        if self.nodes.contains_key(&key) {
            return Err(TreeError::DuplicateName(name.to_owned()));
        }
        let parent_node = self
            .nodes
            .get_mut(&parent_key)
            .ok_or_else(|| TreeError::UnknownParent(parent.to_owned()))?;
        parent_node.children.push(key.clone());
        self.nodes.insert(
            key,
            ServerNode {
                name: name.to_owned(),
                description: description.to_owned(),
                parent: Some(parent_key),
                children: Vec::new(),
                linked_at: now,
                users: 0,
            },
        );
        Ok(())
    }

    /// Unlink a server from its parent and drop it from the index.
    ///
    /// Non-recursive: the split walk removes descendants first. The root
    /// cannot be detached. Returns the removed node.
    pub fn detach(&mut self, name: &str) -> Option<ServerNode> {
        let key = fold_name(name);
        if key == self.root {
            return None;
        }
        let node = self.nodes.remove(&key)?;
        if let Some(parent) = node.parent.as_ref().and_then(|p| self.nodes.get_mut(p)) {
            parent.children.retain(|c| c != &key);
        }
        Some(node)
    }

    /// Display names of a server's direct children, in link order.
    pub fn children(&self, name: &str) -> Vec<String> {
        self.find(name)
            .map(|n| {
                n.children
                    .iter()
                    .filter_map(|c| self.nodes.get(c))
                    .map(|c| c.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Folded child keys (internal walk order for the split recursion).
    pub(crate) fn child_keys(&self, key: &str) -> Vec<String> {
        self.nodes
            .get(key)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn child_count(&self, name: &str) -> usize {
        self.find(name).map(|n| n.children.len()).unwrap_or(0)
    }

    /// JSON topology snapshot for status reporting.
    pub fn snapshot(&self) -> serde_json::Value {
        self.node_json(&self.root)
    }

    fn node_json(&self, key: &str) -> serde_json::Value {
        let Some(node) = self.nodes.get(key) else {
            return json!(null);
        };
        json!({
            "name": node.name,
            "description": node.description,
            "linked_at": node.linked_at,
            "users": node.users,
            "children": node.children.iter().map(|c| self.node_json(c)).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerTree {
        let mut tree = ServerTree::new("root.example", "Root", 100);
        tree.attach("hub.example", "Hub", "root.example", 101).unwrap();
        tree.attach("leaf.example", "Leaf", "hub.example", 102).unwrap();
        tree
    }

    /// Every node reachable from the root, parent/child links agreeing,
    /// exactly one root.
    fn assert_consistent(tree: &ServerTree) {
        let mut seen = 0usize;
        let mut stack = vec![fold_name(tree.root_name())];
        while let Some(key) = stack.pop() {
            seen += 1;
            let node = tree.nodes.get(&key).expect("child key resolves");
            if node.parent.is_none() {
                assert!(tree.is_root(&node.name));
            }
            for child in &node.children {
                let child_node = tree.nodes.get(child).expect("child exists");
                assert_eq!(child_node.parent.as_deref(), Some(key.as_str()));
                stack.push(child.clone());
            }
        }
        assert_eq!(seen, tree.len(), "all nodes reachable from root");
    }

    #[test]
    fn attach_builds_chain() {
        let tree = sample();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.children("root.example"), vec!["hub.example"]);
        assert_eq!(tree.children("hub.example"), vec!["leaf.example"]);
        assert_eq!(tree.child_count("leaf.example"), 0);
        assert_consistent(&tree);
    }

    #[test]
    fn attach_rejects_duplicate_case_insensitive() {
        let mut tree = sample();
        assert_eq!(
            tree.attach("HUB.Example", "again", "root.example", 103),
            Err(TreeError::DuplicateName("HUB.Example".into()))
        );
        assert_eq!(tree.len(), 3);
        assert_consistent(&tree);
    }

    #[test]
    fn attach_rejects_unknown_parent() {
        let mut tree = sample();
        assert_eq!(
            tree.attach("new.example", "n", "missing.example", 103),
            Err(TreeError::UnknownParent("missing.example".into()))
        );
        assert_consistent(&tree);
    }

    #[test]
    fn detach_unlinks_single_node() {
        let mut tree = sample();
        let node = tree.detach("leaf.example").unwrap();
        assert_eq!(node.name, "leaf.example");
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.child_count("hub.example"), 0);
        assert_consistent(&tree);
    }

    #[test]
    fn detach_root_refused() {
        let mut tree = sample();
        assert!(tree.detach("root.example").is_none());
        assert_eq!(tree.len(), 3);
        assert_consistent(&tree);
    }

    #[test]
    fn detach_missing_is_noop() {
        let mut tree = sample();
        assert!(tree.detach("ghost.example").is_none());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let tree = sample();
        assert_eq!(tree.find("HUB.EXAMPLE").unwrap().name, "hub.example");
    }

    #[test]
    fn user_counts_tracked_per_node() {
        let mut tree = sample();
        tree.find_mut("leaf.example").unwrap().users = 4;
        assert_eq!(tree.find("leaf.example").unwrap().users, 4);
        assert_eq!(tree.find("hub.example").unwrap().users, 0);
    }

    #[test]
    fn snapshot_nests_children() {
        let tree = sample();
        let snap = tree.snapshot();
        assert_eq!(snap["name"], "root.example");
        assert_eq!(snap["children"][0]["name"], "hub.example");
        assert_eq!(snap["children"][0]["children"][0]["name"], "leaf.example");
    }
}
