use crate::config::AgentConfig;
use crate::memory::MemoryRetriever;
use crate::ports::{LlmPort, Repositories};
use crate::tools::ToolRegistry;
use cadence_voice::{AsrPort, TtsPort};
use std::sync::Arc;

/// Collaborators shared by every session of the process.
#[derive(Clone)]
pub struct AgentServices {
    pub config: Arc<AgentConfig>,
    pub llm: Arc<dyn LlmPort>,
    pub tools: Arc<ToolRegistry>,
    pub memory: MemoryRetriever,
    pub repos: Repositories,
    /// Speech recognition. Without it inbound audio is ignored.
    pub asr: Option<Arc<dyn AsrPort>>,
    /// Speech synthesis. Without it answers are text only.
    pub tts: Option<Arc<dyn TtsPort>>,
}
