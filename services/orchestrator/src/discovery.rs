//! Worker node discovery.

use std::sync::Arc;

use fleetboot_id::NodeId;
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlane;
use crate::model::WorkerNode;

/// Discovers worker nodes, falling back to a static list.
pub struct NodeDiscovery {
    control_plane: Arc<dyn ControlPlane>,
    fallback: Vec<WorkerNode>,
    default_capacity: u32,
}

impl NodeDiscovery {
    /// `default_capacity` replaces a reported capacity of zero. An empty
    /// fallback list is replaced by [`default_fallback_nodes`].
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        fallback: Vec<WorkerNode>,
        default_capacity: u32,
    ) -> Self {
        let default_capacity = default_capacity.max(1);
        let fallback = if fallback.is_empty() {
            default_fallback_nodes(default_capacity)
        } else {
            fallback
        };
        Self {
            control_plane,
            fallback,
            default_capacity,
        }
    }

    /// Current worker nodes. Never empty.
    pub async fn discover_nodes(&self) -> Vec<WorkerNode> {
        let nodes = match self.control_plane.list_nodes().await {
            Ok(nodes) if !nodes.is_empty() => nodes,
            Ok(_) => {
                warn!(fallback = self.fallback.len(), "Control plane reported no nodes, using fallback");
                self.fallback.clone()
            }
            Err(e) => {
                warn!(error = %e, fallback = self.fallback.len(), "Node discovery failed, using fallback");
                self.fallback.clone()
            }
        };

        let nodes: Vec<WorkerNode> = nodes
            .into_iter()
            .map(|mut node| {
                if node.capacity == 0 {
                    debug!(node_id = %node.id, capacity = self.default_capacity, "Node reported no capacity, using default");
                    node.capacity = self.default_capacity;
                }
                node
            })
            .collect();

        info!(count = nodes.len(), "Discovered worker nodes");
        nodes
    }
}

/// The built-in fallback: `node-1` and `node-2`.
pub fn default_fallback_nodes(capacity: u32) -> Vec<WorkerNode> {
    ["node-1", "node-2"]
        .into_iter()
        .filter_map(|id| NodeId::parse(id).ok())
        .map(|id| WorkerNode {
            name: id.to_string(),
            id,
            capacity,
            metrics: None,
        })
        .collect()
}
