use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use gantry_core::error::Result;
use gantry_core::traits::NodeHandler;
use gantry_core::types::{Node, TaskContext};

/// Registry of node handlers, keyed by node type tag.
///
/// New node types are added by registering a handler, never by branching in
/// the executor. The registry ships empty; domain handlers live with the
/// host.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. A later registration for the same type wins.
    pub fn register(&mut self, handler: impl NodeHandler) {
        let node_type = handler.node_type().to_string();
        self.handlers.insert(node_type, Arc::new(handler));
    }

    /// Unregister a handler by node type.
    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.handlers.remove(node_type).is_some()
    }

    /// Get the handler for a node type.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    /// List all registered node types.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter turning an async closure into a `NodeHandler`.
pub struct FnHandler {
    node_type: String,
    #[allow(clippy::type_complexity)]
    f: Box<
        dyn Fn(Node, TaskContext) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync,
    >,
}

impl FnHandler {
    pub fn new<F, Fut>(node_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(Node, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            node_type: node_type.into(),
            f: Box::new(move |node, ctx| Box::pin(f(node, ctx))),
        }
    }
}

impl NodeHandler for FnHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn execute(&self, node: Node, ctx: TaskContext) -> BoxFuture<'_, Result<serde_json::Value>> {
        (self.f)(node, ctx)
    }
}
