use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Graph persistence port.
///
/// Every multi-record mutation (node creation with its edges and aggregate
/// update, terminal-status cascade) must execute atomically inside the
/// implementation; two nodes completing concurrently must not lose updates
/// to the same graph's aggregate metadata.
pub trait GraphStore: Send + Sync + 'static {
    /// Create an empty ACTIVE graph with zeroed metadata.
    fn create_graph(&self) -> BoxFuture<'_, Result<Graph>>;

    /// Create a node in an ACTIVE graph, wiring one DEPENDS_ON edge per
    /// dependency and bumping the graph's node total, all atomically.
    /// Initial status is BLOCKED when dependencies are named, PENDING
    /// otherwise.
    fn create_node(&self, graph_id: &GraphId, spec: NodeSpec) -> BoxFuture<'_, Result<Node>>;

    /// Create an edge between two existing nodes of an ACTIVE graph.
    /// A DEPENDS_ON edge that would close a dependency cycle is rejected.
    fn create_edge(
        &self,
        graph_id: &GraphId,
        edge_type: &str,
        source_id: &NodeId,
        target_id: &NodeId,
        metadata: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<Edge>>;

    /// Update a node's status, stamping result metadata. On a terminal
    /// status this also unblocks dependents whose dependencies are all
    /// COMPLETED and recomputes the graph's aggregates and status, in the
    /// same transaction.
    fn update_node_status(
        &self,
        node_id: &NodeId,
        status: NodeStatus,
        result: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<Node>>;

    /// Read-consistent aggregate snapshot. Self-healing: persisted metadata
    /// that disagrees with a fresh count is recomputed and written back
    /// before returning.
    fn graph_status(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<GraphSnapshot>>;

    /// All PENDING nodes whose incoming dependency edges point only at
    /// COMPLETED sources.
    fn executable_nodes(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<Vec<Node>>>;

    /// The full graph with decoded nodes and edges.
    fn get_graph(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<GraphDetail>>;
}

/// Task persistence port. Composite operations (cancel, delete, retry) are
/// atomic across the task and its graph.
pub trait TaskStore: Send + Sync + 'static {
    /// Persist a task in PLANNING. Fails `UserNotFound` when `created_by`
    /// does not reference a known user.
    fn create_task(&self, new: NewTask) -> BoxFuture<'_, Result<Task>>;

    /// Merge the patch into the task; metadata is a shallow overlay.
    fn update_task(&self, task_id: &TaskId, patch: TaskPatch) -> BoxFuture<'_, Result<Task>>;

    fn get_task(&self, task_id: &TaskId) -> BoxFuture<'_, Result<Task>>;

    /// All tasks owned by a user, ordered by status ascending, then
    /// priority descending, then creation time descending.
    fn list_tasks(&self, user_id: &str) -> BoxFuture<'_, Result<Vec<Task>>>;

    /// Mark the task and its graph (if any) CANCELLED in one transaction.
    /// Fails `InvalidTransition` on a terminal task.
    fn cancel_task(&self, task_id: &TaskId) -> BoxFuture<'_, Result<Task>>;

    /// Cascading delete: edges, nodes, graph, then the task.
    fn delete_task(&self, task_id: &TaskId) -> BoxFuture<'_, Result<()>>;

    /// Discard a FAILED task's graph and reset the task to PLANNING,
    /// incrementing its failure counter. Fails `InvalidTransition` unless
    /// the task is FAILED.
    fn retry_task(&self, task_id: &TaskId) -> BoxFuture<'_, Result<Task>>;

    /// Register a user id the store will accept as a task owner.
    fn register_user(&self, user_id: &str) -> BoxFuture<'_, Result<()>>;
}

/// A handler for one node type. Implementations must return an error on
/// failure, never a sentinel value.
pub trait NodeHandler: Send + Sync + 'static {
    /// The node type tag this handler executes.
    fn node_type(&self) -> &str;

    /// Run the node's work. The payload is handler-defined; the context
    /// carries task identity for downstream services.
    fn execute(&self, node: Node, ctx: TaskContext) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Codec applied to payloads and metadata at the persistence boundary.
///
/// The scheduler treats stored blobs as opaque; a host that encrypts at
/// rest plugs its cipher in here.
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode(&self, plaintext: &str) -> Result<String>;
    fn decode(&self, stored: &str) -> Result<String>;
}

/// Identity codec that stores payloads as-is.
pub struct NoopCodec;

impl PayloadCodec for NoopCodec {
    fn encode(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decode(&self, stored: &str) -> Result<String> {
        Ok(stored.to_string())
    }
}
