//! HTTP and WebSocket surface of the cadence voice agent.
//!
//! Wires configuration into the agent's collaborators (SQLite store,
//! OpenAI-compatible model, local speech binaries, LiveKit rooms) and
//! exposes the session manager over axum.

pub mod api;
pub mod api_ws;
pub mod config;
pub mod llm;
pub mod sse;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use cadence_agent::{
    AgentServices, Calculator, EmbeddingPort, LlmError, LlmPort, MemoryQuery, MemoryRetriever,
    Remember, Repositories, SessionManager, ToolRegistry,
};
use cadence_db::{DbRuntimeSettings, OpenError, SqliteStore};
use cadence_voice::{AsrPort, LiveKitRooms, PiperTts, RoomPort, TtsPort, WhisperAsr};
use config::Config;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Maximum request body size (64 KiB). Lifecycle routes carry tiny bodies.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// Returned with join tokens so clients know where to connect.
    pub livekit_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to open database: {0}")]
    Database(#[from] OpenError),

    #[error("failed to configure model client: {0}")]
    Llm(#[from] LlmError),
}

/// Builds the process-wide agent collaborators from configuration.
///
/// Speech recognition needs `speech.whisper_model`; synthesis needs
/// `speech.voices_dir`. Either missing leaves that direction disabled.
pub fn agent_services(
    config: &Config,
    repos: Repositories,
    llm: Arc<dyn LlmPort>,
    embedder: Option<Arc<dyn EmbeddingPort>>,
) -> AgentServices {
    let agent = config.agent.clone();
    let memory = MemoryRetriever::new(embedder, repos.memories.clone());

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(Calculator));
    tools.register(Arc::new(MemoryQuery::new(
        memory.clone(),
        agent.memory_min_score,
    )));
    tools.register(Arc::new(Remember::new(memory.clone())));

    let mut asr: Option<Arc<dyn AsrPort>> = None;
    let mut tts: Option<Arc<dyn TtsPort>> = None;
    if let Some(speech) = &config.speech {
        if let Some(model) = &speech.whisper_model {
            let mut whisper = WhisperAsr::new(model, &speech.whisper_binary)
                .with_timeout(agent.asr_timeout());
            if let Some(language) = &speech.language {
                whisper = whisper.with_language(language);
            }
            asr = Some(Arc::new(whisper));
        }
        if let Some(voices_dir) = &speech.voices_dir {
            tts = Some(Arc::new(
                PiperTts::new(
                    voices_dir,
                    &speech.piper_binary,
                    &speech.default_voice,
                    speech.tts_sample_rate,
                )
                .with_timeout(agent.tts_timeout()),
            ));
        }
    }
    tracing::info!(
        tools = tools.len(),
        memory = memory.is_enabled(),
        asr = asr.is_some(),
        tts = tts.is_some(),
        "agent services configured"
    );

    AgentServices {
        config: Arc::new(agent),
        llm,
        tools: Arc::new(tools),
        memory,
        repos,
        asr,
        tts,
    }
}

/// Opens the database and wires every collaborator named in `config`.
pub fn build_state(config: &Config) -> Result<AppState, StartupError> {
    let store = SqliteStore::open(
        &config.database.path,
        DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )?;
    let repos = Repositories::from_store(Arc::new(store));

    let llm: Arc<dyn LlmPort> = Arc::new(llm::OpenAiChat::new(&config.llm)?);
    let embedder: Option<Arc<dyn EmbeddingPort>> = match &config.embedding {
        Some(embedding) => Some(Arc::new(llm::OpenAiEmbeddings::new(
            embedding,
            Duration::from_secs(config.llm.request_timeout_secs),
        )?)),
        None => None,
    };

    let livekit = config.livekit.clone().filter(|lk| lk.is_enabled());
    let livekit_url = livekit.as_ref().map(|lk| lk.url.clone());
    let rooms: Option<Arc<dyn RoomPort>> =
        livekit.map(|lk| Arc::new(LiveKitRooms::new(lk)) as Arc<dyn RoomPort>);

    let services = agent_services(config, repos, llm, embedder);
    Ok(AppState {
        manager: Arc::new(SessionManager::new(services, rooms)),
        livekit_url,
    })
}

async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.manager.active_count().await,
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/{conversationId}", get(api_ws::ws_handler))
        .route(
            "/api/conversations/{conversationId}",
            delete(api::delete_handler),
        )
        .route(
            "/api/conversations/{conversationId}/archive",
            post(api::archive_handler),
        )
        .route(
            "/api/conversations/{conversationId}/unarchive",
            post(api::unarchive_handler),
        )
        .route(
            "/api/conversations/{conversationId}/token",
            post(api::token_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
