// Node directory
// Source of truth for which nodes exist and how they are connected; the engine only reads it

use dashmap::DashMap;
use tracing::info;

use crate::model::{NodeConnectionState, NodeIdentifier};

/// Read access to cluster membership and node connectivity
pub trait NodeDirectory: Send + Sync {
    /// Every known node with its current state
    fn nodes(&self) -> Vec<(NodeIdentifier, NodeConnectionState)>;

    /// Current state of one node, `None` if the node is unknown
    fn connection_state(&self, node_id: &NodeIdentifier) -> Option<NodeConnectionState>;

    /// Nodes currently in the CONNECTED state, ordered by identifier
    fn connected_nodes(&self) -> Vec<NodeIdentifier> {
        let mut nodes: Vec<NodeIdentifier> = self
            .nodes()
            .into_iter()
            .filter(|(_, state)| *state == NodeConnectionState::Connected)
            .map(|(node, _)| node)
            .collect();
        nodes.sort();
        nodes
    }
}

/// In-memory node directory
///
/// Used where membership is configured statically and by tests that need to
/// move nodes between states.
#[derive(Debug, Default)]
pub struct StaticNodeDirectory {
    nodes: DashMap<NodeIdentifier, NodeConnectionState>,
}

impl StaticNodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory in which every node is connected
    pub fn connected(nodes: impl IntoIterator<Item = NodeIdentifier>) -> Self {
        let directory = Self::new();
        for node in nodes {
            directory.add_node(node, NodeConnectionState::Connected);
        }
        directory
    }

    pub fn add_node(&self, node_id: NodeIdentifier, state: NodeConnectionState) {
        info!("Adding node {} to directory as {}", node_id, state);
        self.nodes.insert(node_id, state);
    }

    pub fn remove_node(&self, node_id: &NodeIdentifier) -> Option<NodeConnectionState> {
        self.nodes.remove(node_id).map(|(_, state)| state)
    }

    /// Update a node's state, returning the previous one
    pub fn set_state(
        &self,
        node_id: &NodeIdentifier,
        state: NodeConnectionState,
    ) -> Option<NodeConnectionState> {
        let mut entry = self.nodes.get_mut(node_id)?;
        let previous = *entry;
        *entry = state;
        if previous != state {
            info!("Node {} state changed ({} -> {})", node_id, previous, state);
        }
        Some(previous)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeDirectory for StaticNodeDirectory {
    fn nodes(&self) -> Vec<(NodeIdentifier, NodeConnectionState)> {
        self.nodes
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    fn connection_state(&self, node_id: &NodeIdentifier) -> Option<NodeConnectionState> {
        self.nodes.get(node_id).map(|e| *e.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeIdentifier {
        NodeIdentifier::new(id, "127.0.0.1", 8080)
    }

    #[test]
    fn test_connected_nodes_filters_and_sorts() {
        let directory = StaticNodeDirectory::new();
        directory.add_node(node("n3"), NodeConnectionState::Connected);
        directory.add_node(node("n1"), NodeConnectionState::Connected);
        directory.add_node(node("n2"), NodeConnectionState::Connecting);

        assert_eq!(directory.connected_nodes(), vec![node("n1"), node("n3")]);
        assert_eq!(directory.len(), 3);
    }

    #[test]
    fn test_set_state() {
        let directory = StaticNodeDirectory::connected([node("n1")]);

        let previous = directory.set_state(&node("n1"), NodeConnectionState::Disconnected);
        assert_eq!(previous, Some(NodeConnectionState::Connected));
        assert_eq!(
            directory.connection_state(&node("n1")),
            Some(NodeConnectionState::Disconnected)
        );

        assert_eq!(directory.set_state(&node("n9"), NodeConnectionState::Connected), None);
    }

    #[test]
    fn test_remove_node() {
        let directory = StaticNodeDirectory::connected([node("n1"), node("n2")]);
        assert_eq!(
            directory.remove_node(&node("n1")),
            Some(NodeConnectionState::Connected)
        );
        assert_eq!(directory.connection_state(&node("n1")), None);
        assert!(!directory.is_empty());
    }
}
