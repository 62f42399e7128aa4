//! Tool registry implementation.
//!
//! Holds every tool the gateway may call: its declared [`ToolSpec`] (parameter
//! schema, risk tier, side effects, timeout) and the [`ToolHandler`] that runs
//! it. Tools can be registered and unregistered at runtime; lookups take a
//! read lock only.
//!
//! The registry knows nothing about callers. Authorization, approval and
//! timeouts are enforced by the sandbox.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use warden_types::actions::ToolSpec;
use warden_types::errors::WardenError;
use warden_types::traits::ToolHandler;

/// A registered tool: declaration plus invocation function.
#[derive(Clone)]
pub struct RegisteredTool {
    /// Declared schema, risk tier and timeout.
    pub spec: ToolSpec,
    /// Invocation function.
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Central registry of tool backends.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique; a zero timeout is rejected.
    pub async fn register(
        &self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), WardenError> {
        if spec.name.trim().is_empty() {
            return Err(WardenError::Tool("tool name must not be empty".to_string()));
        }
        if spec.timeout_ms == 0 {
            return Err(WardenError::Tool(format!(
                "tool '{}' must declare a non-zero timeout",
                spec.name
            )));
        }

        let mut tools = self.tools.write().await;
        if tools.contains_key(&spec.name) {
            return Err(WardenError::Tool(format!(
                "tool already registered: {}",
                spec.name
            )));
        }
        info!(
            tool = %spec.name,
            risk_tier = ?spec.risk_tier,
            side_effecting = spec.side_effecting,
            "registered tool"
        );
        tools.insert(spec.name.clone(), RegisteredTool { spec, handler });
        Ok(())
    }

    /// Remove a tool by name.
    pub async fn unregister(&self, tool_name: &str) -> Result<(), WardenError> {
        match self.tools.write().await.remove(tool_name) {
            Some(_) => {
                info!(tool = %tool_name, "unregistered tool");
                Ok(())
            }
            None => Err(WardenError::Tool(format!("tool not found: {tool_name}"))),
        }
    }

    /// Look up a tool by name.
    pub async fn get(&self, tool_name: &str) -> Option<RegisteredTool> {
        self.tools.read().await.get(tool_name).cloned()
    }

    /// All tool declarations, sorted by name.
    pub async fn list(&self) -> Vec<ToolSpec> {
        let tools = self.tools.read().await;
        let mut specs: Vec<ToolSpec> = tools.values().map(|t| t.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Declarations keyed by name, as consumed by the plan validator.
    pub async fn catalog(&self) -> BTreeMap<String, ToolSpec> {
        self.tools
            .read()
            .await
            .iter()
            .map(|(name, tool)| (name.clone(), tool.spec.clone()))
            .collect()
    }

    /// Number of registered tools.
    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Whether no tools are registered.
    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }
}
