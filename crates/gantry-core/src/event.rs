use crate::types::{GraphId, GraphStatus, NodeId, TaskId, TaskStatus};

/// Engine event broadcast to all subscribers.
///
/// Replaces the ambient mutable run-state of the original system: anything
/// that wants to observe execution subscribes here instead of sharing a map.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A task's graph was created and attached.
    TaskStarted { task_id: TaskId, graph_id: GraphId },
    /// A node handler attempt began.
    NodeStarted {
        node_id: NodeId,
        node_type: String,
        attempt: u32,
    },
    /// A node attempt failed and a retry is scheduled.
    NodeRetrying {
        node_id: NodeId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// A node reached COMPLETED.
    NodeCompleted { node_id: NodeId, elapsed_ms: u64 },
    /// A node exhausted its retries and reached FAILED.
    NodeFailed {
        node_id: NodeId,
        attempts: u32,
        error: String,
    },
    /// A graph reached a terminal status.
    GraphFinished {
        graph_id: GraphId,
        status: GraphStatus,
    },
    /// A task reached a terminal status.
    TaskFinished {
        task_id: TaskId,
        status: TaskStatus,
    },
    /// A task (and its graph, if any) was cancelled.
    TaskCancelled { task_id: TaskId },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
