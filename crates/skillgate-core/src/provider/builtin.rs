//! In-process builtin tools.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Handler, Provider, ProviderCall, ProviderError, ProviderResult};
use crate::manifest::ProviderKind;

/// A synchronous, side-effect-free tool compiled into the substrate.
pub trait BuiltinTool: Send + Sync {
    fn id(&self) -> &'static str;

    /// Returns a reason string when the arguments are unusable.
    fn call(&self, args: &Value) -> Result<Value, String>;
}

/// Returns its arguments unchanged under `echo`.
pub struct Echo;

impl BuiltinTool for Echo {
    fn id(&self) -> &'static str {
        "echo"
    }

    fn call(&self, args: &Value) -> Result<Value, String> {
        Ok(json!({ "echo": args }))
    }
}

/// Character, word and line counts of `args.text`.
pub struct TextStats;

impl BuiltinTool for TextStats {
    fn id(&self) -> &'static str {
        "text.stats"
    }

    fn call(&self, args: &Value) -> Result<Value, String> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| "'text' must be a string".to_string())?;
        Ok(json!({
            "chars": text.chars().count(),
            "words": text.split_whitespace().count(),
            "lines": text.lines().count(),
        }))
    }
}

#[derive(Default)]
pub struct BuiltinProvider {
    tools: HashMap<&'static str, Arc<dyn BuiltinTool>>,
}

impl BuiltinProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider with every shipped tool.
    pub fn standard() -> Self {
        Self::new().with_tool(Arc::new(Echo)).with_tool(Arc::new(TextStats))
    }

    pub fn with_tool(mut self, tool: Arc<dyn BuiltinTool>) -> Self {
        self.tools.insert(tool.id(), tool);
        self
    }
}

impl Provider for BuiltinProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Builtin
    }

    fn resolve(&self, tool_id: &str) -> Option<Arc<dyn Handler>> {
        self.tools
            .get(tool_id)
            .map(|t| Arc::new(BuiltinHandler(t.clone())) as Arc<dyn Handler>)
    }
}

struct BuiltinHandler(Arc<dyn BuiltinTool>);

#[async_trait]
impl Handler for BuiltinHandler {
    async fn invoke(&self, call: &ProviderCall) -> ProviderResult<Value> {
        self.0
            .call(&call.args)
            .map_err(|reason| ProviderError::InvalidArguments {
                tool_id: self.0.id().to_string(),
                reason,
            })
    }
}
