use serde::{Deserialize, Serialize};

/// A long-term memory returned by similarity search. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySearchResult {
    pub memory_id: String,
    /// Cosine similarity in `[-1.0, 1.0]`; higher is more relevant.
    pub score: f32,
    pub content: String,
}
