use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use gantry_core::config::ExecutorConfig;
use gantry_core::error::{GantryError, Result};
use gantry_core::event::{EngineEvent, EventBus};
use gantry_core::traits::GraphStore;
use gantry_core::types::{Node, NodeStatus, TaskContext};

use crate::registry::HandlerRegistry;

/// Runs a single node through its handler with timeout and retry policy.
///
/// Per-node state machine: PENDING/BLOCKED -> IN_PROGRESS ->
/// COMPLETED | FAILED. Every status write goes through the graph store, so
/// terminal transitions cascade to dependents inside the store transaction.
pub struct NodeExecutor {
    store: Arc<dyn GraphStore>,
    registry: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    events: Arc<EventBus>,
}

impl NodeExecutor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        registry: Arc<HandlerRegistry>,
        config: ExecutorConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            events,
        }
    }

    /// Execute one node to a terminal status.
    ///
    /// Handler failures and timeouts are retried with exponential backoff
    /// (`base * 2^(attempt-1)`) up to `max_retries` attempts, then the node
    /// is marked FAILED and the last error propagates. An unknown node type
    /// fails immediately with no retry.
    pub async fn execute(&self, node: &Node, ctx: &TaskContext) -> Result<serde_json::Value> {
        let handler = match self.registry.get(&node.node_type) {
            Some(h) => h,
            None => {
                let err = GantryError::UnknownNodeType(node.node_type.clone());
                // Terminal failure so the graph does not keep offering the
                // node for execution.
                self.store
                    .update_node_status(
                        &node.id,
                        NodeStatus::Failed,
                        Some(serde_json::json!({"error": err.to_string(), "attempts": 0})),
                    )
                    .await?;
                self.events.publish(EngineEvent::NodeFailed {
                    node_id: node.id.clone(),
                    attempts: 0,
                    error: err.to_string(),
                });
                return Err(err);
            }
        };

        let timeout = Duration::from_secs(self.config.node_timeout_secs);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.store
                .update_node_status(&node.id, NodeStatus::InProgress, None)
                .await?;
            self.events.publish(EngineEvent::NodeStarted {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                attempt,
            });
            info!(node_id = %node.id, node_type = %node.node_type, attempt, "Executing node");

            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(timeout, handler.execute(node.clone(), ctx.clone()))
                    .await
                {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(GantryError::Handler {
                        node_type: node.node_type.clone(),
                        message: e.to_string(),
                    }),
                    Err(_) => Err(GantryError::NodeTimeout {
                        node_id: node.id.to_string(),
                        timeout_secs: self.config.node_timeout_secs,
                    }),
                };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    let mut metadata = match &value {
                        serde_json::Value::Object(map) => map.clone(),
                        other => {
                            let mut map = serde_json::Map::new();
                            map.insert("output".to_string(), other.clone());
                            map
                        }
                    };
                    metadata.insert("attempts".to_string(), serde_json::json!(attempt));

                    self.store
                        .update_node_status(
                            &node.id,
                            NodeStatus::Completed,
                            Some(serde_json::Value::Object(metadata)),
                        )
                        .await?;
                    self.events.publish(EngineEvent::NodeCompleted {
                        node_id: node.id.clone(),
                        elapsed_ms,
                    });
                    info!(node_id = %node.id, elapsed_ms, attempt, "Node completed");
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= self.config.max_retries {
                        self.store
                            .update_node_status(
                                &node.id,
                                NodeStatus::Failed,
                                Some(serde_json::json!({
                                    "error": err.to_string(),
                                    "attempts": attempt,
                                })),
                            )
                            .await?;
                        self.events.publish(EngineEvent::NodeFailed {
                            node_id: node.id.clone(),
                            attempts: attempt,
                            error: err.to_string(),
                        });
                        error!(node_id = %node.id, attempts = attempt, error = %err, "Node failed");
                        return Err(err);
                    }

                    let delay_ms = self.config.retry_base_delay_ms * (1u64 << (attempt - 1));
                    self.events.publish(EngineEvent::NodeRetrying {
                        node_id: node.id.clone(),
                        attempt,
                        delay_ms,
                        error: err.to_string(),
                    });
                    warn!(
                        node_id = %node.id,
                        attempt,
                        delay_ms,
                        error = %err,
                        "Node attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use gantry_core::types::{NodeSpec, TaskId};
    use gantry_store::SqliteStore;

    use crate::registry::FnHandler;

    fn test_ctx() -> TaskContext {
        TaskContext {
            task_id: TaskId::new(),
            created_by: "user-1".into(),
            chat_id: "chat-1".into(),
            title: "t".into(),
            description: "d".into(),
        }
    }

    fn fast_config(max_retries: u32) -> ExecutorConfig {
        ExecutorConfig {
            max_retries,
            retry_base_delay_ms: 1,
            node_timeout_secs: 1,
        }
    }

    async fn setup(
        registry: HandlerRegistry,
        config: ExecutorConfig,
    ) -> (Arc<SqliteStore>, NodeExecutor, gantry_core::types::GraphId) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let graph = store.create_graph().await.unwrap();
        let executor = NodeExecutor::new(
            store.clone(),
            Arc::new(registry),
            config,
            Arc::new(EventBus::default()),
        );
        (store, executor, graph.id)
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let mut registry = HandlerRegistry::new();
        registry.register(FnHandler::new("research", |_n, _c| async {
            Ok(serde_json::json!({"output": "done"}))
        }));
        let (store, executor, graph_id) = setup(registry, fast_config(3)).await;

        let node = store
            .create_node(&graph_id, NodeSpec::new("research", "r"))
            .await
            .unwrap();
        let result = executor.execute(&node, &test_ctx()).await.unwrap();
        assert_eq!(result["output"], "done");

        let detail = store.get_graph(&graph_id).await.unwrap();
        let row = &detail.nodes[0];
        assert_eq!(row.status, NodeStatus::Completed);
        let meta = row.metadata.as_ref().unwrap();
        assert_eq!(meta["attempts"], 1);
        assert!(meta.get("completed_at").is_some());
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let mut registry = HandlerRegistry::new();
        registry.register(FnHandler::new("flaky", |_n, _c| async {
            if CALLS.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GantryError::Handler {
                    node_type: "flaky".into(),
                    message: "transient".into(),
                })
            } else {
                Ok(serde_json::json!({"output": "third time lucky"}))
            }
        }));
        let (store, executor, graph_id) = setup(registry, fast_config(3)).await;

        let node = store
            .create_node(&graph_id, NodeSpec::new("flaky", "f"))
            .await
            .unwrap();
        let result = executor.execute(&node, &test_ctx()).await.unwrap();
        assert_eq!(result["output"], "third time lucky");
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);

        let detail = store.get_graph(&graph_id).await.unwrap();
        assert_eq!(detail.nodes[0].metadata.as_ref().unwrap()["attempts"], 3);
    }

    #[tokio::test]
    async fn test_exhausts_retries_and_fails() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let mut registry = HandlerRegistry::new();
        registry.register(FnHandler::new("doomed", |_n, _c| async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Err::<serde_json::Value, _>(GantryError::Handler {
                node_type: "doomed".into(),
                message: "always broken".into(),
            })
        }));
        let (store, executor, graph_id) = setup(registry, fast_config(3)).await;

        let node = store
            .create_node(&graph_id, NodeSpec::new("doomed", "d"))
            .await
            .unwrap();
        let err = executor.execute(&node, &test_ctx()).await.unwrap_err();
        assert!(matches!(err, GantryError::Handler { .. }));
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);

        let detail = store.get_graph(&graph_id).await.unwrap();
        let row = &detail.nodes[0];
        assert_eq!(row.status, NodeStatus::Failed);
        let meta = row.metadata.as_ref().unwrap();
        assert_eq!(meta["attempts"], 3);
        assert!(meta["error"].as_str().unwrap().contains("always broken"));

        let snapshot = store.graph_status(&graph_id).await.unwrap();
        assert_eq!(snapshot.status, gantry_core::types::GraphStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_is_retried() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let mut registry = HandlerRegistry::new();
        registry.register(FnHandler::new("slow", |_n, _c| async {
            if CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
                // First attempt hangs past the 1s timeout.
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(serde_json::json!({"output": "eventually"}))
        }));
        let (store, executor, graph_id) = setup(registry, fast_config(2)).await;

        let node = store
            .create_node(&graph_id, NodeSpec::new("slow", "s"))
            .await
            .unwrap();
        let result = executor.execute(&node, &test_ctx()).await.unwrap();
        assert_eq!(result["output"], "eventually");
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_type_fails_without_retry() {
        let (store, executor, graph_id) = setup(HandlerRegistry::new(), fast_config(3)).await;

        let node = store
            .create_node(&graph_id, NodeSpec::new("mystery", "m"))
            .await
            .unwrap();
        let err = executor.execute(&node, &test_ctx()).await.unwrap_err();
        assert!(matches!(err, GantryError::UnknownNodeType(_)));

        let detail = store.get_graph(&graph_id).await.unwrap();
        assert_eq!(detail.nodes[0].status, NodeStatus::Failed);
    }
}
