use std::sync::Arc;

use tracing::info;

use gantry_core::error::Result;
use gantry_core::event::{EngineEvent, EventBus};
use gantry_core::traits::{GraphStore, TaskStore};
use gantry_core::types::{NewTask, Task, TaskId, TaskPatch, TaskProgress};

/// Task lifecycle service over the persistence ports.
///
/// Validation and atomicity live in the store (status checks happen inside
/// the same transaction as the writes); this layer adds logging, events,
/// and the progress write-back.
pub struct TaskManager {
    tasks: Arc<dyn TaskStore>,
    graphs: Arc<dyn GraphStore>,
    events: Arc<EventBus>,
}

impl TaskManager {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        graphs: Arc<dyn GraphStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            tasks,
            graphs,
            events,
        }
    }

    /// Create a task in PLANNING. Fails `UserNotFound` for an unknown owner.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let task = self.tasks.create_task(new).await?;
        info!(task_id = %task.id, priority = task.priority, "Task created");
        Ok(task)
    }

    /// Merge a partial update; metadata is a shallow overlay.
    pub async fn update_task(&self, task_id: &TaskId, patch: TaskPatch) -> Result<Task> {
        self.tasks.update_task(task_id, patch).await
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        self.tasks.get_task(task_id).await
    }

    /// All tasks owned by a user: status ascending, priority descending,
    /// newest first.
    pub async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>> {
        self.tasks.list_tasks(user_id).await
    }

    /// Cancel a non-terminal task and its graph atomically.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.tasks.cancel_task(task_id).await?;
        self.events.publish(EngineEvent::TaskCancelled {
            task_id: task.id.clone(),
        });
        info!(task_id = %task.id, "Task cancelled");
        Ok(task)
    }

    /// Cascading delete: edges, nodes, graph, then the task.
    pub async fn delete_task(&self, task_id: &TaskId) -> Result<()> {
        self.tasks.delete_task(task_id).await?;
        info!(task_id = %task_id, "Task deleted");
        Ok(())
    }

    /// Discard a FAILED task's graph and reset it to PLANNING.
    pub async fn retry_task(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.tasks.retry_task(task_id).await?;
        info!(
            task_id = %task.id,
            previous_failures = task.metadata.previous_failures,
            "Task reset for retry"
        );
        Ok(task)
    }

    /// Progress summary for a task. With no graph attached the summary is
    /// zeroed; otherwise it reflects the graph snapshot, and the progress
    /// value is persisted back into the task's metadata.
    pub async fn task_progress(&self, task_id: &TaskId) -> Result<TaskProgress> {
        let task = self.tasks.get_task(task_id).await?;

        let graph_id = match &task.graph_id {
            Some(id) => id.clone(),
            None => return Ok(TaskProgress::zeroed(task.id)),
        };

        let snapshot = self.graphs.graph_status(&graph_id).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("progress".to_string(), serde_json::json!(snapshot.progress));
        self.tasks
            .update_task(
                task_id,
                TaskPatch {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;

        Ok(TaskProgress {
            task_id: task.id,
            progress: snapshot.progress,
            total: snapshot.total,
            completed: snapshot.completed,
            failed: snapshot.failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::types::{NodeSpec, NodeStatus, TaskStatus};
    use gantry_store::SqliteStore;

    async fn manager() -> (Arc<SqliteStore>, TaskManager) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.register_user("user-1").await.unwrap();
        let manager = TaskManager::new(
            store.clone(),
            store.clone(),
            Arc::new(EventBus::default()),
        );
        (store, manager)
    }

    fn new_task() -> NewTask {
        NewTask {
            title: "summarize q3".into(),
            description: "collect and summarize".into(),
            created_by: "user-1".into(),
            chat_id: "chat-1".into(),
            priority: 3,
        }
    }

    #[tokio::test]
    async fn test_progress_without_graph_is_zeroed() {
        let (_store, manager) = manager().await;
        let task = manager.create_task(new_task()).await.unwrap();

        let progress = manager.task_progress(&task.id).await.unwrap();
        assert_eq!(progress.progress, 0);
        assert_eq!(progress.total, 0);
    }

    #[tokio::test]
    async fn test_progress_persisted_into_task_metadata() {
        let (store, manager) = manager().await;
        let task = manager.create_task(new_task()).await.unwrap();

        let graph = store.create_graph().await.unwrap();
        let a = store
            .create_node(&graph.id, NodeSpec::new("research", "a"))
            .await
            .unwrap();
        store
            .create_node(&graph.id, NodeSpec::new("research", "b"))
            .await
            .unwrap();
        manager
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

        store
            .update_node_status(&a.id, NodeStatus::Completed, None)
            .await
            .unwrap();

        let progress = manager.task_progress(&task.id).await.unwrap();
        assert_eq!(progress.progress, 50);
        assert_eq!(progress.completed, 1);

        let task = manager.get_task(&task.id).await.unwrap();
        assert_eq!(task.metadata.progress, 50);
    }

    #[tokio::test]
    async fn test_cancel_publishes_event() {
        let (_store, manager) = manager().await;
        let task = manager.create_task(new_task()).await.unwrap();

        let mut rx = manager.events.subscribe();
        manager.cancel_task(&task.id).await.unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::TaskCancelled { task_id } => assert_eq!(task_id, task.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
