use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use gantry_core::config::OrchestratorConfig;
use gantry_core::error::{GantryError, Result};
use gantry_core::event::{EngineEvent, EventBus};
use gantry_core::traits::{GraphStore, TaskStore};
use gantry_core::types::{
    GraphId, GraphSnapshot, GraphStatus, Node, NodeId, NodeSpec, Task, TaskContext, TaskId,
    TaskPatch, TaskStatus,
};

use crate::executor::NodeExecutor;

/// One step of an execution plan. `key` is a plan-local name other steps
/// use in `depends_on`; it never leaves the orchestrator.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub key: String,
    pub node_type: String,
    pub payload: String,
    pub metadata: Option<serde_json::Value>,
    pub depends_on: Vec<String>,
}

impl PlanStep {
    pub fn new(
        key: impl Into<String>,
        node_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            node_type: node_type.into(),
            payload: payload.into(),
            metadata: None,
            depends_on: vec![],
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.depends_on.push(key.into());
        self
    }
}

/// Composition root: builds a graph for a task, drives execution rounds
/// over the currently-executable nodes, and reports the aggregate status
/// back to the task.
///
/// In-flight task state is an explicit keyed map with create-on-start /
/// remove-on-terminal lifecycle, never ambient global state.
pub struct Orchestrator {
    graphs: Arc<dyn GraphStore>,
    tasks: Arc<dyn TaskStore>,
    executor: Arc<NodeExecutor>,
    config: OrchestratorConfig,
    events: Arc<EventBus>,
    active: Mutex<HashMap<TaskId, GraphId>>,
}

impl Orchestrator {
    pub fn new(
        graphs: Arc<dyn GraphStore>,
        tasks: Arc<dyn TaskStore>,
        executor: Arc<NodeExecutor>,
        config: OrchestratorConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            graphs,
            tasks,
            executor,
            config,
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The graph currently executing for a task, if any.
    pub fn active_graph(&self, task_id: &TaskId) -> Option<GraphId> {
        self.active
            .lock()
            .ok()
            .and_then(|map| map.get(task_id).cloned())
    }

    /// Build a graph from `plan`, attach it to the task (moving it to
    /// ACTIVE), and drain execution rounds until the graph reaches a
    /// terminal status or nothing further is executable. The final graph
    /// status is written back to the task before returning.
    ///
    /// Fails `NoExecutableNodes` when the plan yields no runnable first
    /// batch, and `GraphInitFailed` when the graph has failed nodes before
    /// the first round.
    pub async fn execute_task(&self, task: &Task, plan: Vec<PlanStep>) -> Result<GraphSnapshot> {
        let graph = self.graphs.create_graph().await?;
        let graph_id = graph.id.clone();

        self.tasks
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Active),
                    graph_id: Some(graph_id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        if let Ok(mut map) = self.active.lock() {
            map.insert(task.id.clone(), graph_id.clone());
        }
        self.events.publish(EngineEvent::TaskStarted {
            task_id: task.id.clone(),
            graph_id: graph_id.clone(),
        });
        info!(task_id = %task.id, graph_id = %graph_id, steps = plan.len(), "Task execution started");

        let result = self.drive(task, &graph_id, plan).await;

        // Remove from the in-flight map unless the graph is still ACTIVE
        // (a host may resume it with run_round).
        let keep = matches!(
            &result,
            Ok(snapshot) if snapshot.status == GraphStatus::Active
        );
        if !keep {
            if let Ok(mut map) = self.active.lock() {
                map.remove(&task.id);
            }
        }

        result
    }

    async fn drive(
        &self,
        task: &Task,
        graph_id: &GraphId,
        plan: Vec<PlanStep>,
    ) -> Result<GraphSnapshot> {
        let mut ids: HashMap<String, NodeId> = HashMap::new();
        for step in plan {
            let mut spec = NodeSpec::new(step.node_type, step.payload);
            if let Some(metadata) = step.metadata {
                spec = spec.with_metadata(metadata);
            }
            for dep in &step.depends_on {
                let dep_id = ids.get(dep).ok_or_else(|| {
                    GantryError::GraphInitFailed(format!(
                        "plan step '{}' depends on unknown step '{}'",
                        step.key, dep
                    ))
                })?;
                spec = spec.depends_on(dep_id.clone());
            }
            let node = self.graphs.create_node(graph_id, spec).await?;
            ids.insert(step.key, node.id);
        }

        let snapshot = self.graphs.graph_status(graph_id).await?;
        if snapshot.failed > 0 {
            return Err(GantryError::GraphInitFailed(graph_id.to_string()));
        }

        let ctx = TaskContext::from_task(task);
        let mut rounds = 0usize;

        loop {
            let batch = self.graphs.executable_nodes(graph_id).await?;
            if batch.is_empty() {
                if rounds == 0 {
                    return Err(GantryError::NoExecutableNodes(graph_id.to_string()));
                }
                break;
            }

            rounds += 1;
            if rounds > self.config.max_rounds {
                warn!(
                    graph_id = %graph_id,
                    max_rounds = self.config.max_rounds,
                    "Round bound reached, leaving graph for resume"
                );
                break;
            }

            info!(graph_id = %graph_id, round = rounds, batch = batch.len(), "Executing round");
            self.run_batch(&batch, &ctx).await?;

            let snapshot = self.graphs.graph_status(graph_id).await?;
            if snapshot.status != GraphStatus::Active {
                break;
            }
        }

        let snapshot = self.graphs.graph_status(graph_id).await?;
        self.report(task, &snapshot).await?;
        Ok(snapshot)
    }

    /// Execute exactly one round over the currently-executable nodes and
    /// return the resulting snapshot. Fails `NoExecutableNodes` when the
    /// batch is empty.
    pub async fn run_round(&self, task: &Task, graph_id: &GraphId) -> Result<GraphSnapshot> {
        let batch = self.graphs.executable_nodes(graph_id).await?;
        if batch.is_empty() {
            return Err(GantryError::NoExecutableNodes(graph_id.to_string()));
        }

        let ctx = TaskContext::from_task(task);
        self.run_batch(&batch, &ctx).await?;

        let snapshot = self.graphs.graph_status(graph_id).await?;
        self.report(task, &snapshot).await?;
        Ok(snapshot)
    }

    /// Run a batch concurrently, bounded by `max_concurrent_nodes` when
    /// configured. Node-level failures are already recorded as terminal
    /// node statuses; only infrastructure errors propagate.
    async fn run_batch(&self, batch: &[Node], ctx: &TaskContext) -> Result<()> {
        let work = batch.iter().map(|node| self.executor.execute(node, ctx));

        let results: Vec<Result<serde_json::Value>> = if self.config.max_concurrent_nodes > 0 {
            stream::iter(work)
                .buffer_unordered(self.config.max_concurrent_nodes)
                .collect()
                .await
        } else {
            futures::future::join_all(work).await
        };

        for result in results {
            match result {
                Ok(_) => {}
                Err(
                    GantryError::Handler { .. }
                    | GantryError::NodeTimeout { .. }
                    | GantryError::UnknownNodeType(_),
                ) => {
                    // Recorded on the node and reflected in graph status;
                    // the round keeps its other results.
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Write the aggregate status back to the task.
    async fn report(&self, task: &Task, snapshot: &GraphSnapshot) -> Result<()> {
        let status = match snapshot.status {
            GraphStatus::Active => TaskStatus::Active,
            GraphStatus::Completed => TaskStatus::Completed,
            GraphStatus::Failed => TaskStatus::Failed,
            GraphStatus::Cancelled => TaskStatus::Cancelled,
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("progress".to_string(), serde_json::json!(snapshot.progress));
        metadata.insert(
            "completed_nodes".to_string(),
            serde_json::json!(snapshot.completed),
        );
        metadata.insert(
            "failed_nodes".to_string(),
            serde_json::json!(snapshot.failed),
        );

        self.tasks
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(status),
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;

        if snapshot.status != GraphStatus::Active {
            self.events.publish(EngineEvent::GraphFinished {
                graph_id: snapshot.graph_id.clone(),
                status: snapshot.status,
            });
            self.events.publish(EngineEvent::TaskFinished {
                task_id: task.id.clone(),
                status,
            });
            info!(task_id = %task.id, status = %status, "Task finished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use gantry_core::config::ExecutorConfig;
    use gantry_core::types::NewTask;
    use gantry_store::SqliteStore;

    use crate::registry::{FnHandler, HandlerRegistry};

    fn fast_executor_config() -> ExecutorConfig {
        ExecutorConfig {
            max_retries: 2,
            retry_base_delay_ms: 1,
            node_timeout_secs: 5,
        }
    }

    async fn setup(registry: HandlerRegistry) -> (Arc<SqliteStore>, Orchestrator, Task) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.register_user("user-1").await.unwrap();
        let task = store
            .create_task(NewTask {
                title: "t".into(),
                description: "d".into(),
                created_by: "user-1".into(),
                chat_id: "chat-1".into(),
                priority: 1,
            })
            .await
            .unwrap();

        let events = Arc::new(EventBus::default());
        let executor = Arc::new(NodeExecutor::new(
            store.clone(),
            Arc::new(registry),
            fast_executor_config(),
            events.clone(),
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            store.clone(),
            executor,
            OrchestratorConfig::default(),
            events,
        );
        (store, orchestrator, task)
    }

    fn ok_handler(node_type: &str) -> FnHandler {
        let tag = node_type.to_string();
        FnHandler::new(node_type, move |_n, _c| {
            let tag = tag.clone();
            async move { Ok(serde_json::json!({"output": tag})) }
        })
    }

    #[tokio::test]
    async fn test_drains_dependency_chain() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        for tag in ["research", "analysis", "decision"] {
            let order = order.clone();
            registry.register(FnHandler::new(tag, move |node: Node, _c| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(node.node_type.clone());
                    Ok(serde_json::json!({"output": node.payload}))
                }
            }));
        }
        let (store, orchestrator, task) = setup(registry).await;

        let plan = vec![
            PlanStep::new("r", "research", "gather"),
            PlanStep::new("a", "analysis", "analyze").depends_on("r"),
            PlanStep::new("d", "decision", "decide").depends_on("a"),
        ];
        let snapshot = orchestrator.execute_task(&task, plan).await.unwrap();

        assert_eq!(snapshot.status, GraphStatus::Completed);
        assert_eq!(snapshot.completed, 3);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["research", "analysis", "decision"]
        );

        // Status and progress reported back to the task.
        let task = store.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.metadata.progress, 100);
        assert!(task.graph_id.is_some());

        // Terminal run is removed from the in-flight map.
        assert!(orchestrator.active_graph(&task.id).is_none());
    }

    #[tokio::test]
    async fn test_failure_aggregation() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let mut registry = HandlerRegistry::new();
        registry.register(ok_handler("research"));
        registry.register(FnHandler::new("doomed", |_n, _c| async {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Err::<serde_json::Value, _>(GantryError::Handler {
                node_type: "doomed".into(),
                message: "broken".into(),
            })
        }));
        let (store, orchestrator, task) = setup(registry).await;

        let plan = vec![
            PlanStep::new("a", "research", "one"),
            PlanStep::new("b", "research", "two"),
            PlanStep::new("c", "doomed", "three"),
        ];
        let snapshot = orchestrator.execute_task(&task, plan).await.unwrap();

        assert_eq!(snapshot.status, GraphStatus::Failed);
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.progress, 100);
        // Retries exhausted before the node failed.
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);

        let task = store.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_plan_fails() {
        let (_store, orchestrator, task) = setup(HandlerRegistry::new()).await;
        let err = orchestrator.execute_task(&task, vec![]).await.unwrap_err();
        assert!(matches!(err, GantryError::NoExecutableNodes(_)));
    }

    #[tokio::test]
    async fn test_unknown_dependency_key() {
        let (_store, orchestrator, task) = setup(HandlerRegistry::new()).await;
        let plan = vec![PlanStep::new("a", "research", "x").depends_on("missing")];
        let err = orchestrator.execute_task(&task, plan).await.unwrap_err();
        assert!(matches!(err, GantryError::GraphInitFailed(_)));
    }

    #[tokio::test]
    async fn test_failed_dependency_stops_downstream() {
        let mut registry = HandlerRegistry::new();
        registry.register(FnHandler::new("doomed", |_n, _c| async {
            Err::<serde_json::Value, _>(GantryError::Handler {
                node_type: "doomed".into(),
                message: "broken".into(),
            })
        }));
        let downstream_ran = Arc::new(AtomicUsize::new(0));
        {
            let downstream_ran = downstream_ran.clone();
            registry.register(FnHandler::new("analysis", move |_n, _c| {
                let downstream_ran = downstream_ran.clone();
                async move {
                    downstream_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({}))
                }
            }));
        }
        let (_store, orchestrator, task) = setup(registry).await;

        let plan = vec![
            PlanStep::new("a", "doomed", "will fail"),
            PlanStep::new("b", "analysis", "never runs").depends_on("a"),
        ];
        let snapshot = orchestrator.execute_task(&task, plan).await.unwrap();

        assert_eq!(snapshot.status, GraphStatus::Failed);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.blocked, 1);
        assert_eq!(downstream_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_round_executes_single_batch() {
        let mut registry = HandlerRegistry::new();
        registry.register(ok_handler("research"));
        registry.register(ok_handler("analysis"));
        let (store, orchestrator, task) = setup(registry).await;

        let graph = store.create_graph().await.unwrap();
        let a = store
            .create_node(&graph.id, NodeSpec::new("research", "a"))
            .await
            .unwrap();
        store
            .create_node(
                &graph.id,
                NodeSpec::new("analysis", "b").depends_on(a.id),
            )
            .await
            .unwrap();
        store
            .update_task(
                &task.id,
                TaskPatch {
                    graph_id: Some(graph.id.clone()),
                    status: Some(TaskStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // First round runs only the root; the dependent is unblocked but
        // not executed.
        let snapshot = orchestrator.run_round(&task, &graph.id).await.unwrap();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.status, GraphStatus::Active);

        let snapshot = orchestrator.run_round(&task, &graph.id).await.unwrap();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.status, GraphStatus::Completed);

        let err = orchestrator.run_round(&task, &graph.id).await.unwrap_err();
        assert!(matches!(err, GantryError::NoExecutableNodes(_)));
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            registry.register(FnHandler::new("research", move |_n, _c| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(serde_json::json!({}))
                }
            }));
        }

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.register_user("user-1").await.unwrap();
        let task = store
            .create_task(NewTask {
                title: "t".into(),
                description: "d".into(),
                created_by: "user-1".into(),
                chat_id: "chat-1".into(),
                priority: 1,
            })
            .await
            .unwrap();
        let events = Arc::new(EventBus::default());
        let executor = Arc::new(NodeExecutor::new(
            store.clone(),
            Arc::new(registry),
            fast_executor_config(),
            events.clone(),
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            store.clone(),
            executor,
            OrchestratorConfig {
                max_concurrent_nodes: 2,
                max_rounds: 64,
            },
            events,
        );

        let plan = (0..6)
            .map(|i| PlanStep::new(format!("n{}", i), "research", "x"))
            .collect();
        let snapshot = orchestrator.execute_task(&task, plan).await.unwrap();

        assert_eq!(snapshot.completed, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
