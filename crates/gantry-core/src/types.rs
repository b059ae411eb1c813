use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GantryError, Result};

/// Dependency edge type tag. Readiness only considers edges of this type;
/// other edge types are carried but never block execution.
pub const DEPENDS_ON: &str = "DEPENDS_ON";

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Unique graph identifier.
    GraphId
);
id_type!(
    /// Unique node identifier.
    NodeId
);
id_type!(
    /// Unique edge identifier.
    EdgeId
);
id_type!(
    /// Unique task identifier.
    TaskId
);

/// Node lifecycle status.
///
/// PENDING/BLOCKED -> IN_PROGRESS -> COMPLETED | FAILED. A node with
/// unresolved dependencies is BLOCKED; the cascade flips it to PENDING when
/// every dependency source reaches COMPLETED. Terminal statuses never
/// transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Blocked,
    InProgress,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Blocked => "BLOCKED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a stored status tag. This is the validation boundary for
    /// status strings: anything unrecognized fails `InvalidStatus`.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "BLOCKED" => Ok(Self::Blocked),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(GantryError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graph lifecycle status. Monotonic toward a terminal state: once
/// COMPLETED, FAILED, or CANCELLED the graph never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl GraphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(GantryError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle status. PLANNING until a graph is attached, then ACTIVE,
/// then one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Planning,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "PLANNING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PLANNING" => Ok(Self::Planning),
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(GantryError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters persisted on a graph record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMeta {
    pub progress: u8,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub total_nodes: usize,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl GraphMeta {
    pub fn empty(created_at: DateTime<Utc>) -> Self {
        Self {
            progress: 0,
            completed_nodes: 0,
            failed_nodes: 0,
            total_nodes: 0,
            created_at,
            last_updated: created_at,
        }
    }
}

/// `round(100 * (completed + failed) / total)`, 0 for an empty graph.
pub fn progress_pct(completed: usize, failed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (((completed + failed) as f64 / total as f64) * 100.0).round() as u8
}

/// Task metadata. Known fields are typed; hosts may overlay arbitrary keys
/// through `update_task`, kept in `extra` (shallow merge, new keys win).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    pub progress: u8,
    #[serde(default)]
    pub previous_failures: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskMeta {
    pub fn empty(created_at: DateTime<Utc>) -> Self {
        Self {
            progress: 0,
            previous_failures: 0,
            created_at,
            last_updated: created_at,
            extra: serde_json::Map::new(),
        }
    }

    /// Shallow overlay: typed fields are updated when the patch names them,
    /// everything else lands in `extra`. Always bumps `last_updated`.
    pub fn merge(&mut self, patch: serde_json::Map<String, serde_json::Value>) {
        for (key, value) in patch {
            match key.as_str() {
                "progress" => {
                    if let Some(p) = value.as_u64() {
                        self.progress = p.min(100) as u8;
                    }
                }
                "previous_failures" => {
                    if let Some(n) = value.as_u64() {
                        self.previous_failures = n as u32;
                    }
                }
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
        self.last_updated = Utc::now();
    }
}

/// A graph record: one task's execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub id: GraphId,
    pub status: GraphStatus,
    pub metadata: GraphMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of work. `payload` is opaque to the scheduler and interpreted by
/// the handler registered for `node_type`. `metadata` holds the handler
/// result (or terminal error) once the node finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub graph_id: GraphId,
    pub node_type: String,
    pub payload: String,
    pub status: NodeStatus,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A directed relation between two nodes of the same graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub graph_id: GraphId,
    pub edge_type: String,
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// The user-facing unit of work, owning at most one graph at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub created_by: String,
    pub chat_id: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub deadline: Option<DateTime<Utc>>,
    pub graph_id: Option<GraphId>,
    pub metadata: TaskMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-consistent aggregate view of a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub graph_id: GraphId,
    pub status: GraphStatus,
    pub progress: u8,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub blocked: usize,
    pub last_updated: DateTime<Utc>,
}

/// A graph with its nodes and edges, payloads decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDetail {
    pub graph: Graph,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Progress summary for a task. Zeroed when no graph is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub progress: u8,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskProgress {
    pub fn zeroed(task_id: TaskId) -> Self {
        Self {
            task_id,
            progress: 0,
            total: 0,
            completed: 0,
            failed: 0,
        }
    }
}

/// Specification for a node to create. Dependencies become DEPENDS_ON edges
/// from each named node to the new one; a node with any dependency starts
/// BLOCKED, otherwise PENDING.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub node_type: String,
    pub payload: String,
    pub metadata: Option<serde_json::Value>,
    pub dependencies: Vec<NodeId>,
}

impl NodeSpec {
    pub fn new(node_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            payload: payload.into(),
            metadata: None,
            dependencies: vec![],
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn depends_on(mut self, dependency: NodeId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn initial_status(&self) -> NodeStatus {
        if self.dependencies.is_empty() {
            NodeStatus::Pending
        } else {
            NodeStatus::Blocked
        }
    }
}

/// Fields for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub created_by: String,
    pub chat_id: String,
    pub priority: i64,
}

/// Partial update for a task. `None` fields are left untouched; `metadata`
/// is a shallow overlay merged into the existing metadata.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<i64>,
    pub deadline: Option<DateTime<Utc>>,
    pub graph_id: Option<GraphId>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.deadline.is_none()
            && self.graph_id.is_none()
            && self.metadata.is_none()
    }
}

/// Task identity passed through to node handlers. The scheduler has no
/// dependency on what handlers do with it.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub created_by: String,
    pub chat_id: String,
    pub title: String,
    pub description: String,
}

impl TaskContext {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            created_by: task.created_by.clone(),
            chat_id: task.chat_id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in ["PENDING", "BLOCKED", "IN_PROGRESS", "COMPLETED", "FAILED"] {
            assert_eq!(NodeStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(NodeStatus::parse("DONE").is_err());
        assert!(GraphStatus::parse("PAUSED").is_err());
        assert!(TaskStatus::parse("").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(NodeStatus::Completed.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(!NodeStatus::InProgress.is_terminal());
        assert!(GraphStatus::Cancelled.is_terminal());
        assert!(!GraphStatus::Active.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Planning.is_terminal());
    }

    #[test]
    fn test_progress_pct() {
        assert_eq!(progress_pct(0, 0, 0), 0);
        assert_eq!(progress_pct(1, 0, 3), 33);
        assert_eq!(progress_pct(2, 1, 3), 100);
        assert_eq!(progress_pct(1, 1, 4), 50);
    }

    #[test]
    fn test_node_spec_initial_status() {
        let spec = NodeSpec::new("research", "find prior art");
        assert_eq!(spec.initial_status(), NodeStatus::Pending);

        let spec = spec.depends_on(NodeId::new());
        assert_eq!(spec.initial_status(), NodeStatus::Blocked);
    }

    #[test]
    fn test_task_meta_merge() {
        let mut meta = TaskMeta::empty(Utc::now());
        let before = meta.last_updated;

        let mut patch = serde_json::Map::new();
        patch.insert("progress".into(), serde_json::json!(40));
        patch.insert("note".into(), serde_json::json!("halfway"));
        meta.merge(patch);

        assert_eq!(meta.progress, 40);
        assert_eq!(meta.extra["note"], "halfway");
        assert!(meta.last_updated >= before);

        // New keys overwrite old ones
        let mut patch = serde_json::Map::new();
        patch.insert("note".into(), serde_json::json!("done"));
        meta.merge(patch);
        assert_eq!(meta.extra["note"], "done");
        assert_eq!(meta.progress, 40);
    }

    #[test]
    fn test_task_meta_serde_flatten() {
        let mut meta = TaskMeta::empty(Utc::now());
        meta.extra
            .insert("cancelled_at".into(), serde_json::json!("2026-01-01"));

        let json = serde_json::to_string(&meta).unwrap();
        let parsed: TaskMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.extra["cancelled_at"], "2026-01-01");
        assert_eq!(parsed.previous_failures, 0);
    }
}
