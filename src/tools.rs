//! Tool definition, registration and execution.
//!
//! A [`Tool`] couples metadata (name, description, JSON-Schema input) with
//! an async handler. The [`ToolRegistry`] owns the configured tools,
//! produces the provider-facing [`ToolDefinition`] list, and runs handlers
//! with optional per-resource locking.
//!
//! # Handler shape
//!
//! Handlers are `Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output =
//! Result<Value>> + Send>> + Send + Sync>`: type-erased so tools of any
//! concrete handler type live in one registry, pinned and boxed so the
//! futures can be driven concurrently, `Send + Sync` so a registry shared
//! behind an `Arc` can execute calls from any task.
//!
//! # Ordering contract
//!
//! [`ToolRegistry::definitions`] returns tools in registration order and
//! never sorts or re-hashes them. Prompt caching marks the last tool
//! definition as cacheable, so a stable, bit-identical tool list across
//! turns is what makes those cache hits possible.
//!
//! # Locking
//!
//! A tool whose [`Tool::file_param`] names an input field is serialized
//! per resource: before the handler runs, the registry acquires a lock
//! keyed by that argument's value from the configured [`LockProvider`].
//! The guard is RAII, so the lock releases on every exit path, panics
//! included. Tools without `file_param` run unserialized.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

/// Type alias for tool handler functions.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Provenance of a registered tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    /// Built into the application.
    Native,
    /// Contributed by a skill.
    Skill,
    /// Bridged from an MCP server.
    Mcp,
}

/// A tool the model may call.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    input_schema: Value,
    handler: ToolHandler,
    file_param: Option<String>,
    source: ToolSource,
}

impl Tool {
    /// Creates a new tool from metadata and an async handler.
    ///
    /// The handler is wrapped into the type-erased [`ToolHandler`] form;
    /// `input_schema` must already be a JSON-Schema object.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(move |args| Box::pin(handler(args))),
            file_param: None,
            source: ToolSource::Native,
        }
    }

    /// Names the input field identifying the shared resource to lock.
    pub fn with_file_param(mut self, param: impl Into<String>) -> Self {
        self.file_param = Some(param.into());
        self
    }

    /// Overrides the provenance marker.
    pub fn with_source(mut self, source: ToolSource) -> Self {
        self.source = source;
        self
    }

    /// Returns the tool's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tool's description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the tool's input schema.
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Returns the lock-key field name, if any.
    pub fn file_param(&self) -> Option<&str> {
        self.file_param.as_deref()
    }

    /// Returns the tool's provenance.
    pub fn source(&self) -> ToolSource {
        self.source
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("file_param", &self.file_param)
            .field("source", &self.source)
            .finish()
    }
}

/// Provider-facing tool descriptor, serialized into the request's `tools`
/// array.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

// ============================================================================
// LOCKING
// ============================================================================

/// A held lock. Dropping the guard releases the lock, so handler panics
/// and early returns release too.
pub struct LockGuard {
    _held: Box<dyn std::any::Any + Send>,
}

impl LockGuard {
    /// Wraps any droppable token whose `Drop` releases the lock.
    pub fn new(held: impl std::any::Any + Send) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

/// Source of per-key mutual exclusion for shared resources.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Acquires the lock for `key`, waiting until it is free.
    async fn acquire(&self, key: &str) -> LockGuard;
}

/// In-process lock provider: one `tokio::sync::Mutex` per key.
///
/// Keys are never removed; the map grows with the set of distinct
/// resources touched, which for a sandboxed workspace is bounded.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }
}

#[async_trait]
impl LockProvider for KeyedLocks {
    async fn acquire(&self, key: &str) -> LockGuard {
        let mutex = self.lock_for(key);
        let guard = mutex.lock_owned().await;
        LockGuard::new(guard)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Registry of the tools available to the agent.
#[derive(Default)]
pub struct ToolRegistry {
    // Vec keeps registration order; definitions() depends on it.
    tools: Vec<Tool>,
    lock_provider: Option<Arc<dyn LockProvider>>,
}

impl ToolRegistry {
    /// Creates an empty registry without a lock provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry serializing file tools through the given
    /// lock provider.
    pub fn with_lock_provider(lock_provider: Arc<dyn LockProvider>) -> Self {
        Self {
            tools: Vec::new(),
            lock_provider: Some(lock_provider),
        }
    }

    /// Registers a tool.
    ///
    /// # Errors
    ///
    /// A duplicate name is a configuration error.
    pub fn register(&mut self, tool: Tool) -> Result<()> {
        if self.tools.iter().any(|t| t.name == tool.name) {
            return Err(Error::config(format!(
                "tool '{}' is already registered",
                tool.name
            )));
        }
        log::info!(
            "tool registered: {} (file_param={:?})",
            tool.name,
            tool.file_param
        );
        self.tools.push(tool);
        Ok(())
    }

    /// Annotates a tool's provenance.
    ///
    /// # Errors
    ///
    /// Fails when the tool is not registered.
    pub fn set_source(&mut self, name: &str, source: ToolSource) -> Result<()> {
        let tool = self
            .tools
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::tool(format!("tool '{name}' is not registered")))?;
        tool.source = source;
        Ok(())
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Registered tool names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Looks up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Provider-facing descriptors in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    /// Executes a tool by name.
    ///
    /// When the tool declares a `file_param` and a lock provider is
    /// configured, the lock keyed by `arguments[file_param]` is held for
    /// the duration of the handler call.
    ///
    /// # Errors
    ///
    /// Unknown names fail with a tool error; handler failures propagate
    /// unchanged.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<Value> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::tool(format!("tool '{name}' is not registered")))?;

        log::debug!("executing tool: {name}");

        let lock_key = match (&tool.file_param, &self.lock_provider) {
            (Some(param), Some(_)) => arguments
                .get(param)
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };

        let _guard = match (&lock_key, &self.lock_provider) {
            (Some(key), Some(provider)) => {
                let guard = provider.acquire(key).await;
                log::debug!("file lock acquired: {key}");
                Some(guard)
            }
            _ => None,
        };

        (tool.handler)(arguments).await
    }
}

/// Renders a tool handler's output into tool-result content: plain
/// strings pass through, everything else is JSON-encoded.
pub fn render_tool_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn echo_tool(name: &str) -> Tool {
        Tool::new(
            name,
            format!("{name} echoes its input"),
            json!({"type": "object", "properties": {"value": {"type": "string"}}}),
            |args| async move { Ok(json!({"echo": args["value"]})) },
        )
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("echo")).unwrap();
        assert!(matches!(
            registry.register(echo_tool("echo")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_set_source_unknown_fails() {
        let mut registry = ToolRegistry::new();
        assert!(registry.set_source("ghost", ToolSource::Mcp).is_err());

        registry.register(echo_tool("echo")).unwrap();
        registry.set_source("echo", ToolSource::Skill).unwrap();
        assert_eq!(registry.get("echo").unwrap().source(), ToolSource::Skill);
    }

    #[test]
    fn test_definitions_preserve_registration_order() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(echo_tool(name)).unwrap();
        }

        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[tokio::test]
    async fn test_execute_returns_handler_output() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("echo")).unwrap();

        let result = registry
            .execute("echo", json!({"value": "hi"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"echo": "hi"}));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool_fails() {
        let registry = ToolRegistry::new();
        let result = registry.execute("ghost", json!({})).await;
        assert!(matches!(result, Err(Error::Tool(_))));
    }

    #[tokio::test]
    async fn test_file_lock_serializes_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let mut registry = ToolRegistry::with_lock_provider(locks);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlap_seen = Arc::new(AtomicUsize::new(0));

        let in_flight_clone = in_flight.clone();
        let overlap_clone = overlap_seen.clone();
        registry
            .register(
                Tool::new(
                    "write_file",
                    "writes a file",
                    json!({"type": "object"}),
                    move |args| {
                        let in_flight = in_flight_clone.clone();
                        let overlap = overlap_clone.clone();
                        async move {
                            if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlap.fetch_add(1, Ordering::SeqCst);
                            }
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(args)
                        }
                    },
                )
                .with_file_param("path"),
            )
            .unwrap();

        let registry = Arc::new(registry);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .execute("write_file", json!({"path": "shared.txt"}))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(overlap_seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let locks = Arc::new(KeyedLocks::new());
        let a = locks.acquire("a").await;
        // A second key must not block behind the first.
        let acquired =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire("b")).await;
        assert!(acquired.is_ok());
        drop(a);
    }

    #[test]
    fn test_render_tool_output() {
        assert_eq!(render_tool_output(&json!("plain")), "plain");
        assert_eq!(render_tool_output(&json!({"k": 1})), r#"{"k":1}"#);
        assert_eq!(render_tool_output(&json!(42)), "42");
    }
}
