use thiserror::Error;

#[derive(Debug, Error)]
pub enum GantryError {
    // Not-found errors: the caller referenced a record that does not exist.
    // These are programming errors, never retried.
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    // Invalid-state errors: the operation is illegal for the current status.
    #[error("Cannot add to {status} graph: {graph_id}")]
    GraphNotActive { graph_id: String, status: String },

    #[error("Invalid transition for {entity} {id}: {detail}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        detail: String,
    },

    // Validation errors
    #[error("Invalid node status: {0}")]
    InvalidStatus(String),

    #[error("Dependency edge {origin} -> {target} would create a cycle")]
    DependencyCycle { origin: String, target: String },

    // Execution errors
    #[error("No handler registered for node type: {0}")]
    UnknownNodeType(String),

    #[error("Node handler failed: {node_type}: {message}")]
    Handler { node_type: String, message: String },

    #[error("Node timed out after {timeout_secs}s: {node_id}")]
    NodeTimeout { node_id: String, timeout_secs: u64 },

    #[error("No executable nodes in graph: {0}")]
    NoExecutableNodes(String),

    #[error("Graph initialization failed: {0}")]
    GraphInitFailed(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GantryError {
    /// Whether the node executor may retry after this error.
    ///
    /// Only handler failures and timeouts are transient; everything else
    /// propagates to the caller unwrapped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GantryError::Handler { .. } | GantryError::NodeTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GantryError>;
