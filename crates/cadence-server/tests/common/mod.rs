#![allow(dead_code)]

use async_trait::async_trait;
use cadence_agent::{
    ChatMessage, CompletionOptions, LlmError, LlmPort, Repositories, SessionManager, StreamDelta,
    ToolDefinition,
};
use cadence_db::{DbRuntimeSettings, SqliteStore};
use cadence_server::config::Config;
use cadence_server::{agent_services, app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Answers every prompt with the same tokens.
pub struct EchoLlm {
    pub tokens: Vec<&'static str>,
}

#[async_trait]
impl LlmPort for EchoLlm {
    async fn stream_completion(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _options: &CompletionOptions,
    ) -> Result<mpsc::Receiver<StreamDelta>, LlmError> {
        let (tx, rx) = mpsc::channel(16);
        let tokens = self.tokens.clone();
        tokio::spawn(async move {
            for token in tokens {
                if tx.send(StreamDelta::Token(token.to_string())).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamDelta::Done).await;
        });
        Ok(rx)
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub store: SqliteStore,
    _dir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.db");
        let store = SqliteStore::open(path.to_str().unwrap(), DbRuntimeSettings::default())
            .expect("store should open");

        let mut config = Config::default();
        config.agent.session_grace_ms = 100;
        let llm = Arc::new(EchoLlm {
            tokens: vec!["Hello ", "there. ", "How can I help?"],
        });
        let services = agent_services(
            &config,
            Repositories::from_store(Arc::new(store.clone())),
            llm,
            None,
        );
        let state = AppState {
            manager: Arc::new(SessionManager::new(services, None)),
            livekit_url: None,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            addr,
            state,
            store,
            _dir: dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, conversation_id: &str) -> String {
        format!("ws://{}/ws/{}", self.addr, conversation_id)
    }
}
