use super::Tool;
use crate::error::ToolError;
use crate::memory::MemoryRetriever;
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_LIMIT: usize = 5;
const MAX_LIMIT: usize = 20;

/// Searches long-term memory on the model's behalf.
pub struct MemoryQuery {
    retriever: MemoryRetriever,
    min_score: f32,
}

impl MemoryQuery {
    pub fn new(retriever: MemoryRetriever, min_score: f32) -> Self {
        Self {
            retriever,
            min_score,
        }
    }
}

#[async_trait]
impl Tool for MemoryQuery {
    fn name(&self) -> &str {
        "memory_query"
    }

    fn description(&self) -> &str {
        "Search long-term memory for facts from earlier conversations."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to look for"},
                "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIMIT}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("missing \"query\"".into()))?;
        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| (l as usize).clamp(1, MAX_LIMIT))
            .unwrap_or(DEFAULT_LIMIT);

        let results = self
            .retriever
            .search(query, limit, self.min_score)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        Ok(Value::Array(
            results
                .into_iter()
                .map(|r| json!({"id": r.memory_id, "content": r.content, "score": r.score}))
                .collect(),
        ))
    }
}

/// Stores a fact in long-term memory.
pub struct Remember {
    retriever: MemoryRetriever,
}

impl Remember {
    pub fn new(retriever: MemoryRetriever) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for Remember {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Save a short fact about the user for future conversations."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The fact to remember"}
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let content = arguments
            .get("content")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("missing \"content\"".into()))?;

        match self.retriever.remember(content).await {
            Ok(Some(id)) => Ok(json!({"stored": true, "id": id})),
            Ok(None) => Err(ToolError::Execution("memory is not enabled".into())),
            Err(e) => Err(ToolError::Execution(e.to_string())),
        }
    }
}
