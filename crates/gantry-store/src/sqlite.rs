use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use gantry_core::error::{GantryError, Result};
use gantry_core::traits::{GraphStore, NoopCodec, PayloadCodec, TaskStore};
use gantry_core::types::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS graphs (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        graph_id TEXT NOT NULL REFERENCES graphs(id),
        type TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        metadata TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_nodes_graph_status
        ON nodes(graph_id, status);

    CREATE TABLE IF NOT EXISTS edges (
        id TEXT PRIMARY KEY,
        graph_id TEXT NOT NULL REFERENCES graphs(id),
        type TEXT NOT NULL,
        source_id TEXT NOT NULL REFERENCES nodes(id),
        target_id TEXT NOT NULL REFERENCES nodes(id),
        metadata TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id, type);
    CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id, type);

    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        created_by TEXT NOT NULL REFERENCES users(id),
        chat_id TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        deadline TEXT,
        graph_id TEXT REFERENCES graphs(id),
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(created_by, status);
";

fn db<E: std::fmt::Display>(e: E) -> GantryError {
    GantryError::Database(e.to_string())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite-backed implementation of the graph and task persistence ports.
///
/// All multi-record mutations run inside a single rusqlite transaction; the
/// connection mutex serializes writers, which satisfies the scheduling
/// contract that concurrent node completions must not lose aggregate
/// updates.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    codec: Arc<dyn PayloadCodec>,
}

#[derive(Debug, Default, Clone, Copy)]
struct StatusCounts {
    total: usize,
    completed: usize,
    failed: usize,
    pending: usize,
    blocked: usize,
    in_progress: usize,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_codec(path, Arc::new(NoopCodec))
    }

    /// Open with a payload codec applied at the storage boundary.
    pub fn open_with_codec(path: &Path, codec: Arc<dyn PayloadCodec>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GantryError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db)?;

        // WAL for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            codec,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_codec(Arc::new(NoopCodec))
    }

    /// In-memory database with a payload codec (for testing codecs).
    pub fn in_memory_with_codec(codec: Arc<dyn PayloadCodec>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
            codec,
        })
    }

    // ── row mapping ─────────────────────────────────────────────

    fn decode_json(&self, stored: Option<String>) -> Result<Option<serde_json::Value>> {
        match stored {
            Some(s) => {
                let decoded = self.codec.decode(&s)?;
                Ok(Some(serde_json::from_str(&decoded)?))
            }
            None => Ok(None),
        }
    }

    fn read_node(&self, conn: &Connection, node_id: &str) -> Result<Node> {
        let row = conn
            .query_row(
                "SELECT id, graph_id, type, payload, status, metadata, created_at, updated_at
                 FROM nodes WHERE id = ?1",
                params![node_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(db)?
            .ok_or_else(|| GantryError::NodeNotFound(node_id.to_string()))?;

        let (id, graph_id, node_type, payload, status, metadata, created_at, updated_at) = row;
        Ok(Node {
            id: NodeId::from_string(id),
            graph_id: GraphId::from_string(graph_id),
            node_type,
            payload: self.codec.decode(&payload)?,
            status: NodeStatus::parse(&status)?,
            metadata: self.decode_json(metadata)?,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }

    fn read_graph(&self, conn: &Connection, graph_id: &str) -> Result<Graph> {
        let row = conn
            .query_row(
                "SELECT id, status, metadata, created_at, updated_at FROM graphs WHERE id = ?1",
                params![graph_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db)?
            .ok_or_else(|| GantryError::GraphNotFound(graph_id.to_string()))?;

        let (id, status, metadata, created_at, updated_at) = row;
        let created = parse_ts(&created_at);
        let metadata = self
            .codec
            .decode(&metadata)
            .ok()
            .and_then(|s| serde_json::from_str::<GraphMeta>(&s).ok())
            // Unreadable metadata is rebuilt by the next snapshot; start from zero here.
            .unwrap_or_else(|| GraphMeta::empty(created));

        Ok(Graph {
            id: GraphId::from_string(id),
            status: GraphStatus::parse(&status)?,
            metadata,
            created_at: created,
            updated_at: parse_ts(&updated_at),
        })
    }

    fn read_task(&self, conn: &Connection, task_id: &str) -> Result<Task> {
        let row = conn
            .query_row(
                "SELECT id, title, description, created_by, chat_id, status, priority,
                        deadline, graph_id, metadata, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, String>(11)?,
                    ))
                },
            )
            .optional()
            .map_err(db)?
            .ok_or_else(|| GantryError::TaskNotFound(task_id.to_string()))?;

        self.task_from_row(row)
    }

    #[allow(clippy::type_complexity)]
    fn task_from_row(
        &self,
        row: (
            String,
            String,
            String,
            String,
            String,
            String,
            i64,
            Option<String>,
            Option<String>,
            String,
            String,
            String,
        ),
    ) -> Result<Task> {
        let (
            id,
            title,
            description,
            created_by,
            chat_id,
            status,
            priority,
            deadline,
            graph_id,
            metadata,
            created_at,
            updated_at,
        ) = row;

        let created = parse_ts(&created_at);
        let metadata = self
            .codec
            .decode(&metadata)
            .ok()
            .and_then(|s| serde_json::from_str::<TaskMeta>(&s).ok())
            .unwrap_or_else(|| TaskMeta::empty(created));

        Ok(Task {
            id: TaskId::from_string(id),
            title: self.codec.decode(&title)?,
            description: self.codec.decode(&description)?,
            created_by,
            chat_id,
            status: TaskStatus::parse(&status)?,
            priority,
            deadline: deadline.as_deref().map(parse_ts),
            graph_id: graph_id.map(GraphId::from_string),
            metadata,
            created_at: created,
            updated_at: parse_ts(&updated_at),
        })
    }

    // ── aggregate maintenance ───────────────────────────────────

    fn count_statuses(conn: &Connection, graph_id: &str) -> Result<StatusCounts> {
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM nodes WHERE graph_id = ?1 GROUP BY status")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![graph_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row.map_err(db)?;
            let n = n as usize;
            counts.total += n;
            match NodeStatus::parse(&status)? {
                NodeStatus::Pending => counts.pending += n,
                NodeStatus::Blocked => counts.blocked += n,
                NodeStatus::InProgress => counts.in_progress += n,
                NodeStatus::Completed => counts.completed += n,
                NodeStatus::Failed => counts.failed += n,
            }
        }
        Ok(counts)
    }

    fn write_graph_meta(&self, conn: &Connection, graph_id: &str, meta: &GraphMeta) -> Result<()> {
        let encoded = self.codec.encode(&serde_json::to_string(meta)?)?;
        conn.execute(
            "UPDATE graphs SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![encoded, Utc::now().to_rfc3339(), graph_id],
        )
        .map_err(db)?;
        Ok(())
    }

    /// Recompute aggregates from node statuses and persist them when the
    /// stored metadata disagrees. Returns the healed metadata and counts.
    fn heal_graph_meta(
        &self,
        conn: &Connection,
        graph_id: &str,
    ) -> Result<(GraphMeta, StatusCounts)> {
        let graph = self.read_graph(conn, graph_id)?;
        let counts = Self::count_statuses(conn, graph_id)?;
        let progress = progress_pct(counts.completed, counts.failed, counts.total);

        let stored = &graph.metadata;
        let consistent = stored.total_nodes == counts.total
            && stored.completed_nodes == counts.completed
            && stored.failed_nodes == counts.failed
            && stored.progress == progress;

        if consistent {
            return Ok((graph.metadata, counts));
        }

        let meta = GraphMeta {
            progress,
            completed_nodes: counts.completed,
            failed_nodes: counts.failed,
            total_nodes: counts.total,
            created_at: stored.created_at,
            last_updated: Utc::now(),
        };
        self.write_graph_meta(conn, graph_id, &meta)?;
        debug!(graph_id = %graph_id, "Graph metadata recomputed from node statuses");
        Ok((meta, counts))
    }

    /// Graph status derived from node statuses. Only an ACTIVE graph moves;
    /// terminal graphs never change again.
    fn apply_graph_status(
        conn: &Connection,
        graph_id: &str,
        current: GraphStatus,
        counts: &StatusCounts,
    ) -> Result<GraphStatus> {
        if current != GraphStatus::Active {
            return Ok(current);
        }

        let next = if counts.failed > 0 {
            GraphStatus::Failed
        } else if counts.total > 0 && counts.completed == counts.total {
            GraphStatus::Completed
        } else {
            GraphStatus::Active
        };

        if next != current {
            conn.execute(
                "UPDATE graphs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![next.as_str(), Utc::now().to_rfc3339(), graph_id],
            )
            .map_err(db)?;
        }
        Ok(next)
    }

    fn require_active_graph(&self, conn: &Connection, graph_id: &str) -> Result<Graph> {
        let graph = self.read_graph(conn, graph_id)?;
        if graph.status != GraphStatus::Active {
            return Err(GantryError::GraphNotActive {
                graph_id: graph_id.to_string(),
                status: graph.status.as_str().to_string(),
            });
        }
        Ok(graph)
    }

    fn node_exists(conn: &Connection, graph_id: &str, node_id: &str) -> Result<bool> {
        conn.query_row(
            "SELECT 1 FROM nodes WHERE id = ?1 AND graph_id = ?2",
            params![node_id, graph_id],
            |_| Ok(()),
        )
        .optional()
        .map_err(db)
        .map(|found| found.is_some())
    }

    /// True when adding a dependency edge source -> target would close a
    /// cycle, i.e. source is already reachable from target.
    fn would_cycle(conn: &Connection, graph_id: &str, source: &str, target: &str) -> Result<bool> {
        if source == target {
            return Ok(true);
        }

        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT source_id, target_id FROM edges WHERE graph_id = ?1 AND type = ?2")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![graph_id, DEPENDS_ON], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db)?;
        for row in rows {
            let (s, t) = row.map_err(db)?;
            adjacency.entry(s).or_default().push(t);
        }

        let mut queue = VecDeque::from([target.to_string()]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current == source {
                return Ok(true);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(nexts) = adjacency.get(&current) {
                queue.extend(nexts.iter().cloned());
            }
        }
        Ok(false)
    }

    fn insert_edge(
        &self,
        conn: &Connection,
        graph_id: &str,
        edge_type: &str,
        source_id: &str,
        target_id: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Edge> {
        let id = EdgeId::new();
        let now = Utc::now();
        let encoded = match metadata {
            Some(v) => Some(self.codec.encode(&serde_json::to_string(v)?)?),
            None => None,
        };
        conn.execute(
            "INSERT INTO edges (id, graph_id, type, source_id, target_id, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.as_str(),
                graph_id,
                edge_type,
                source_id,
                target_id,
                encoded,
                now.to_rfc3339()
            ],
        )
        .map_err(db)?;

        Ok(Edge {
            id,
            graph_id: GraphId::from_string(graph_id),
            edge_type: edge_type.to_string(),
            source_id: NodeId::from_string(source_id),
            target_id: NodeId::from_string(target_id),
            metadata: metadata.cloned(),
            created_at: now,
        })
    }

    /// Terminal-status cascade: flip every dependent of `node_id` from
    /// BLOCKED to PENDING once all of its dependency sources are COMPLETED.
    /// Re-evaluating an already-PENDING dependent is a no-op.
    fn unblock_dependents(conn: &Connection, node_id: &str) -> Result<()> {
        let mut stmt = conn
            .prepare("SELECT DISTINCT target_id FROM edges WHERE source_id = ?1 AND type = ?2")
            .map_err(db)?;
        let targets: Vec<String> = stmt
            .query_map(params![node_id, DEPENDS_ON], |row| row.get(0))
            .map_err(db)?
            .collect::<std::result::Result<_, _>>()
            .map_err(db)?;

        for target in targets {
            let unresolved: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM edges e
                     JOIN nodes s ON s.id = e.source_id
                     WHERE e.target_id = ?1 AND e.type = ?2 AND s.status != ?3",
                    params![target, DEPENDS_ON, NodeStatus::Completed.as_str()],
                    |row| row.get(0),
                )
                .map_err(db)?;

            if unresolved == 0 {
                let flipped = conn
                    .execute(
                        "UPDATE nodes SET status = ?1, updated_at = ?2
                         WHERE id = ?3 AND status = ?4",
                        params![
                            NodeStatus::Pending.as_str(),
                            Utc::now().to_rfc3339(),
                            target,
                            NodeStatus::Blocked.as_str()
                        ],
                    )
                    .map_err(db)?;
                if flipped > 0 {
                    debug!(node_id = %target, "Dependencies resolved, node unblocked");
                }
            }
        }
        Ok(())
    }

    /// Stamp terminal timestamps and bookkeeping into a result payload.
    fn stamp_result(result: serde_json::Value, status: NodeStatus) -> serde_json::Value {
        let mut map = match result {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("output".to_string(), other);
                map
            }
        };
        let now = serde_json::json!(Utc::now());
        match status {
            NodeStatus::Completed => {
                map.insert("completed_at".to_string(), now.clone());
            }
            NodeStatus::Failed => {
                map.insert("failed_at".to_string(), now.clone());
            }
            _ => {}
        }
        map.insert("last_updated".to_string(), now);
        serde_json::Value::Object(map)
    }
}

impl GraphStore for SqliteStore {
    fn create_graph(&self) -> BoxFuture<'_, Result<Graph>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;

            let id = GraphId::new();
            let now = Utc::now();
            let meta = GraphMeta::empty(now);
            let encoded = self.codec.encode(&serde_json::to_string(&meta)?)?;

            conn.execute(
                "INSERT INTO graphs (id, status, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.as_str(),
                    GraphStatus::Active.as_str(),
                    encoded,
                    now.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )
            .map_err(db)?;

            debug!(graph_id = %id, "Graph created");
            Ok(Graph {
                id,
                status: GraphStatus::Active,
                metadata: meta,
                created_at: now,
                updated_at: now,
            })
        })
    }

    fn create_node(&self, graph_id: &GraphId, spec: NodeSpec) -> BoxFuture<'_, Result<Node>> {
        let graph_id = graph_id.0.clone();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db)?;
            let tx = conn.transaction().map_err(db)?;

            self.require_active_graph(&tx, &graph_id)?;
            for dep in &spec.dependencies {
                if !Self::node_exists(&tx, &graph_id, dep.as_str())? {
                    return Err(GantryError::NodeNotFound(dep.to_string()));
                }
            }

            let id = NodeId::new();
            let now = Utc::now();
            let status = spec.initial_status();
            let payload = self.codec.encode(&spec.payload)?;
            let metadata = match &spec.metadata {
                Some(v) => Some(self.codec.encode(&serde_json::to_string(v)?)?),
                None => None,
            };

            tx.execute(
                "INSERT INTO nodes (id, graph_id, type, payload, status, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.as_str(),
                    graph_id,
                    spec.node_type,
                    payload,
                    status.as_str(),
                    metadata,
                    now.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )
            .map_err(db)?;

            // Dependency edges point dependency -> new node. The new node
            // cannot be an ancestor of anything yet, so no cycle check.
            for dep in &spec.dependencies {
                self.insert_edge(&tx, &graph_id, DEPENDS_ON, dep.as_str(), id.as_str(), None)?;
            }

            self.heal_graph_meta(&tx, &graph_id)?;
            let node = self.read_node(&tx, id.as_str())?;
            tx.commit().map_err(db)?;

            debug!(node_id = %node.id, node_type = %node.node_type, status = %node.status, "Node created");
            Ok(node)
        })
    }

    fn create_edge(
        &self,
        graph_id: &GraphId,
        edge_type: &str,
        source_id: &NodeId,
        target_id: &NodeId,
        metadata: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<Edge>> {
        let graph_id = graph_id.0.clone();
        let edge_type = edge_type.to_string();
        let source_id = source_id.0.clone();
        let target_id = target_id.0.clone();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db)?;
            let tx = conn.transaction().map_err(db)?;

            self.require_active_graph(&tx, &graph_id)?;
            if !Self::node_exists(&tx, &graph_id, &source_id)? {
                return Err(GantryError::NodeNotFound(source_id));
            }
            if !Self::node_exists(&tx, &graph_id, &target_id)? {
                return Err(GantryError::NodeNotFound(target_id));
            }

            if edge_type == DEPENDS_ON
                && Self::would_cycle(&tx, &graph_id, &source_id, &target_id)?
            {
                return Err(GantryError::DependencyCycle {
                    origin: source_id,
                    target: target_id,
                });
            }

            let edge = self.insert_edge(
                &tx,
                &graph_id,
                &edge_type,
                &source_id,
                &target_id,
                metadata.as_ref(),
            )?;
            tx.commit().map_err(db)?;
            Ok(edge)
        })
    }

    fn update_node_status(
        &self,
        node_id: &NodeId,
        status: NodeStatus,
        result: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<Node>> {
        let node_id = node_id.0.clone();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db)?;
            let tx = conn.transaction().map_err(db)?;

            let current = self.read_node(&tx, &node_id)?;
            if current.status.is_terminal() && status != current.status {
                return Err(GantryError::InvalidTransition {
                    entity: "node",
                    id: node_id,
                    detail: format!("{} -> {}", current.status, status),
                });
            }

            let metadata = match (result, status.is_terminal()) {
                (Some(v), _) => Some(Self::stamp_result(v, status)),
                (None, true) => Some(Self::stamp_result(serde_json::json!({}), status)),
                (None, false) => None,
            };

            match &metadata {
                Some(v) => {
                    let encoded = self.codec.encode(&serde_json::to_string(v)?)?;
                    tx.execute(
                        "UPDATE nodes SET status = ?1, metadata = ?2, updated_at = ?3 WHERE id = ?4",
                        params![status.as_str(), encoded, Utc::now().to_rfc3339(), node_id],
                    )
                    .map_err(db)?;
                }
                None => {
                    tx.execute(
                        "UPDATE nodes SET status = ?1, updated_at = ?2 WHERE id = ?3",
                        params![status.as_str(), Utc::now().to_rfc3339(), node_id],
                    )
                    .map_err(db)?;
                }
            }

            if status.is_terminal() {
                Self::unblock_dependents(&tx, &node_id)?;

                let graph_id = current.graph_id.as_str();
                let (_, counts) = self.heal_graph_meta(&tx, graph_id)?;
                let graph = self.read_graph(&tx, graph_id)?;
                let next = Self::apply_graph_status(&tx, graph_id, graph.status, &counts)?;
                if next != graph.status {
                    debug!(graph_id = %graph_id, status = %next, "Graph reached terminal status");
                }
            }

            let node = self.read_node(&tx, &node_id)?;
            tx.commit().map_err(db)?;
            Ok(node)
        })
    }

    fn graph_status(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<GraphSnapshot>> {
        let graph_id = graph_id.0.clone();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db)?;
            let tx = conn.transaction().map_err(db)?;

            let (meta, counts) = self.heal_graph_meta(&tx, &graph_id)?;
            let graph = self.read_graph(&tx, &graph_id)?;
            tx.commit().map_err(db)?;

            Ok(GraphSnapshot {
                graph_id: GraphId::from_string(graph_id),
                status: graph.status,
                progress: meta.progress,
                total: counts.total,
                completed: counts.completed,
                failed: counts.failed,
                pending: counts.pending,
                blocked: counts.blocked,
                last_updated: meta.last_updated,
            })
        })
    }

    fn executable_nodes(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<Vec<Node>>> {
        let graph_id = graph_id.0.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;

            // Exists to guarantee a typed error for unknown graphs
            self.read_graph(&conn, &graph_id)?;

            let mut stmt = conn
                .prepare(
                    "SELECT n.id FROM nodes n
                     WHERE n.graph_id = ?1 AND n.status = ?2
                       AND NOT EXISTS (
                           SELECT 1 FROM edges e
                           JOIN nodes s ON s.id = e.source_id
                           WHERE e.target_id = n.id AND e.type = ?3 AND s.status != ?4
                       )
                     ORDER BY n.created_at ASC",
                )
                .map_err(db)?;
            let ids: Vec<String> = stmt
                .query_map(
                    params![
                        graph_id,
                        NodeStatus::Pending.as_str(),
                        DEPENDS_ON,
                        NodeStatus::Completed.as_str()
                    ],
                    |row| row.get(0),
                )
                .map_err(db)?
                .collect::<std::result::Result<_, _>>()
                .map_err(db)?;

            let mut nodes = Vec::with_capacity(ids.len());
            for id in ids {
                nodes.push(self.read_node(&conn, &id)?);
            }
            Ok(nodes)
        })
    }

    fn get_graph(&self, graph_id: &GraphId) -> BoxFuture<'_, Result<GraphDetail>> {
        let graph_id = graph_id.0.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;

            let graph = self.read_graph(&conn, &graph_id)?;

            let mut stmt = conn
                .prepare("SELECT id FROM nodes WHERE graph_id = ?1 ORDER BY created_at ASC")
                .map_err(db)?;
            let node_ids: Vec<String> = stmt
                .query_map(params![graph_id], |row| row.get(0))
                .map_err(db)?
                .collect::<std::result::Result<_, _>>()
                .map_err(db)?;
            let mut nodes = Vec::with_capacity(node_ids.len());
            for id in node_ids {
                nodes.push(self.read_node(&conn, &id)?);
            }

            let mut stmt = conn
                .prepare(
                    "SELECT id, type, source_id, target_id, metadata, created_at
                     FROM edges WHERE graph_id = ?1 ORDER BY created_at ASC",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![graph_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(db)?;

            let mut edges = Vec::new();
            for row in rows {
                let (id, edge_type, source_id, target_id, metadata, created_at) =
                    row.map_err(db)?;
                edges.push(Edge {
                    id: EdgeId::from_string(id),
                    graph_id: GraphId::from_string(graph_id.clone()),
                    edge_type,
                    source_id: NodeId::from_string(source_id),
                    target_id: NodeId::from_string(target_id),
                    metadata: self.decode_json(metadata)?,
                    created_at: parse_ts(&created_at),
                });
            }

            Ok(GraphDetail {
                graph,
                nodes,
                edges,
            })
        })
    }
}

impl TaskStore for SqliteStore {
    fn create_task(&self, new: NewTask) -> BoxFuture<'_, Result<Task>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;

            let known_user = conn
                .query_row(
                    "SELECT 1 FROM users WHERE id = ?1",
                    params![new.created_by],
                    |_| Ok(()),
                )
                .optional()
                .map_err(db)?
                .is_some();
            if !known_user {
                return Err(GantryError::UserNotFound(new.created_by));
            }

            let id = TaskId::new();
            let now = Utc::now();
            let meta = TaskMeta::empty(now);

            conn.execute(
                "INSERT INTO tasks (id, title, description, created_by, chat_id, status,
                                    priority, deadline, graph_id, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, ?8, ?9, ?10)",
                params![
                    id.as_str(),
                    self.codec.encode(&new.title)?,
                    self.codec.encode(&new.description)?,
                    new.created_by,
                    new.chat_id,
                    TaskStatus::Planning.as_str(),
                    new.priority,
                    self.codec.encode(&serde_json::to_string(&meta)?)?,
                    now.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )
            .map_err(db)?;

            debug!(task_id = %id, "Task created");
            self.read_task(&conn, id.as_str())
        })
    }

    fn update_task(&self, task_id: &TaskId, patch: TaskPatch) -> BoxFuture<'_, Result<Task>> {
        let task_id = task_id.0.clone();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db)?;
            let tx = conn.transaction().map_err(db)?;

            let mut task = self.read_task(&tx, &task_id)?;

            if let Some(title) = patch.title {
                task.title = title;
            }
            if let Some(description) = patch.description {
                task.description = description;
            }
            if let Some(status) = patch.status {
                task.status = status;
            }
            if let Some(priority) = patch.priority {
                task.priority = priority;
            }
            if let Some(deadline) = patch.deadline {
                task.deadline = Some(deadline);
            }
            if let Some(graph_id) = patch.graph_id {
                task.graph_id = Some(graph_id);
            }
            if let Some(metadata) = patch.metadata {
                task.metadata.merge(metadata);
            }
            task.updated_at = Utc::now();

            tx.execute(
                "UPDATE tasks SET title = ?1, description = ?2, status = ?3, priority = ?4,
                        deadline = ?5, graph_id = ?6, metadata = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    self.codec.encode(&task.title)?,
                    self.codec.encode(&task.description)?,
                    task.status.as_str(),
                    task.priority,
                    task.deadline.map(|d| d.to_rfc3339()),
                    task.graph_id.as_ref().map(|g| g.as_str()),
                    self.codec.encode(&serde_json::to_string(&task.metadata)?)?,
                    task.updated_at.to_rfc3339(),
                    task_id
                ],
            )
            .map_err(db)?;
            tx.commit().map_err(db)?;

            Ok(task)
        })
    }

    fn get_task(&self, task_id: &TaskId) -> BoxFuture<'_, Result<Task>> {
        let task_id = task_id.0.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;
            self.read_task(&conn, &task_id)
        })
    }

    fn list_tasks(&self, user_id: &str) -> BoxFuture<'_, Result<Vec<Task>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;

            let mut stmt = conn
                .prepare(
                    "SELECT id FROM tasks WHERE created_by = ?1
                     ORDER BY status ASC, priority DESC, created_at DESC",
                )
                .map_err(db)?;
            let ids: Vec<String> = stmt
                .query_map(params![user_id], |row| row.get(0))
                .map_err(db)?
                .collect::<std::result::Result<_, _>>()
                .map_err(db)?;

            let mut tasks = Vec::with_capacity(ids.len());
            for id in ids {
                tasks.push(self.read_task(&conn, &id)?);
            }
            Ok(tasks)
        })
    }

    fn cancel_task(&self, task_id: &TaskId) -> BoxFuture<'_, Result<Task>> {
        let task_id = task_id.0.clone();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db)?;
            let tx = conn.transaction().map_err(db)?;

            let task = self.read_task(&tx, &task_id)?;
            if task.status.is_terminal() {
                return Err(GantryError::InvalidTransition {
                    entity: "task",
                    id: task_id,
                    detail: format!("cannot cancel {} task", task.status),
                });
            }

            let now = Utc::now();
            if let Some(graph_id) = &task.graph_id {
                tx.execute(
                    "UPDATE graphs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![
                        GraphStatus::Cancelled.as_str(),
                        now.to_rfc3339(),
                        graph_id.as_str()
                    ],
                )
                .map_err(db)?;
            }

            let mut meta = task.metadata.clone();
            let mut patch = serde_json::Map::new();
            patch.insert("cancelled_at".to_string(), serde_json::json!(now));
            meta.merge(patch);

            tx.execute(
                "UPDATE tasks SET status = ?1, metadata = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    TaskStatus::Cancelled.as_str(),
                    self.codec.encode(&serde_json::to_string(&meta)?)?,
                    now.to_rfc3339(),
                    task_id
                ],
            )
            .map_err(db)?;

            let task = self.read_task(&tx, &task_id)?;
            tx.commit().map_err(db)?;

            debug!(task_id = %task_id, "Task cancelled");
            Ok(task)
        })
    }

    fn delete_task(&self, task_id: &TaskId) -> BoxFuture<'_, Result<()>> {
        let task_id = task_id.0.clone();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db)?;
            let tx = conn.transaction().map_err(db)?;

            let task = self.read_task(&tx, &task_id)?;

            // Cascade in dependency order: edges, nodes, graph, task.
            if let Some(graph_id) = &task.graph_id {
                tx.execute("DELETE FROM edges WHERE graph_id = ?1", params![graph_id.as_str()])
                    .map_err(db)?;
                tx.execute("DELETE FROM nodes WHERE graph_id = ?1", params![graph_id.as_str()])
                    .map_err(db)?;
                tx.execute("DELETE FROM graphs WHERE id = ?1", params![graph_id.as_str()])
                    .map_err(db)?;
            }
            tx.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])
                .map_err(db)?;
            tx.commit().map_err(db)?;

            debug!(task_id = %task_id, "Task deleted");
            Ok(())
        })
    }

    fn retry_task(&self, task_id: &TaskId) -> BoxFuture<'_, Result<Task>> {
        let task_id = task_id.0.clone();
        Box::pin(async move {
            let mut conn = self.conn.lock().map_err(db)?;
            let tx = conn.transaction().map_err(db)?;

            let task = self.read_task(&tx, &task_id)?;
            if task.status != TaskStatus::Failed {
                return Err(GantryError::InvalidTransition {
                    entity: "task",
                    id: task_id,
                    detail: format!("cannot retry {} task", task.status),
                });
            }

            let now = Utc::now();
            if let Some(graph_id) = &task.graph_id {
                tx.execute("DELETE FROM edges WHERE graph_id = ?1", params![graph_id.as_str()])
                    .map_err(db)?;
                tx.execute("DELETE FROM nodes WHERE graph_id = ?1", params![graph_id.as_str()])
                    .map_err(db)?;
                tx.execute("DELETE FROM graphs WHERE id = ?1", params![graph_id.as_str()])
                    .map_err(db)?;
            }

            let mut meta = task.metadata.clone();
            meta.previous_failures += 1;
            let mut patch = serde_json::Map::new();
            patch.insert("retried_at".to_string(), serde_json::json!(now));
            meta.merge(patch);

            tx.execute(
                "UPDATE tasks SET status = ?1, graph_id = NULL, metadata = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    TaskStatus::Planning.as_str(),
                    self.codec.encode(&serde_json::to_string(&meta)?)?,
                    now.to_rfc3339(),
                    task_id
                ],
            )
            .map_err(db)?;

            let task = self.read_task(&tx, &task_id)?;
            tx.commit().map_err(db)?;

            debug!(task_id = %task_id, failures = task.metadata.previous_failures, "Task reset for retry");
            Ok(task)
        })
    }

    fn register_user(&self, user_id: &str) -> BoxFuture<'_, Result<()>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db)?;
            conn.execute(
                "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
                params![user_id, Utc::now().to_rfc3339()],
            )
            .map_err(db)?;
            Ok(())
        })
    }
}
