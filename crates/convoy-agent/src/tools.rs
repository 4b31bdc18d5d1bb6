use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::Tool;

/// Registry of tools agents can bind by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Resolve an agent's tool bindings. Unknown names are a config error.
    pub fn resolve(&self, agent: &str, names: &[String]) -> Result<Vec<Arc<dyn Tool>>> {
        names
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| {
                    ConvoyError::Config(format!(
                        "agent '{}' binds unknown tool '{}'",
                        agent, name
                    ))
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list())
            .finish()
    }
}

/// A bound tool as turns see it: calls are cut off after the tool's
/// `timeout_secs` with [`ConvoyError::ToolTimeout`].
pub struct TimedTool {
    inner: Arc<dyn Tool>,
}

impl TimedTool {
    pub fn wrap(tool: Arc<dyn Tool>) -> Arc<dyn Tool> {
        Arc::new(Self { inner: tool })
    }
}

impl Tool for TimedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn timeout_secs(&self) -> u64 {
        self.inner.timeout_secs()
    }

    fn call(&self, input: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let secs = self.inner.timeout_secs();
            match tokio::time::timeout(Duration::from_secs(secs), self.inner.call(input)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(tool = %self.inner.name(), timeout_secs = secs, "Tool call timed out");
                    Err(ConvoyError::ToolTimeout {
                        tool: self.inner.name().to_string(),
                        timeout_secs: secs,
                    })
                }
            }
        })
    }
}
