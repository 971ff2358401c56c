//! Process-wide registry of live sessions and conversation lifecycle.

use crate::error::AgentError;
use crate::services::AgentServices;
use crate::session::AgentSession;
use cadence_protocol::{SwitchableTransport, Transport};
use cadence_types::Conversation;
use cadence_voice::{RoomPort, VoiceError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

struct SessionEntry {
    session: Arc<AgentSession>,
    /// Bumped on every client (re)attach.
    epoch: u64,
}

/// A client connection bound to a session.
#[derive(Clone)]
pub struct Attachment {
    pub session: Arc<AgentSession>,
    pub epoch: u64,
}

pub struct SessionManager {
    services: AgentServices,
    rooms: Option<Arc<dyn RoomPort>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn new(services: AgentServices, rooms: Option<Arc<dyn RoomPort>>) -> Self {
        Self {
            services,
            rooms,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    /// Binds a client connection to the conversation's session, starting the
    /// session (and creating the conversation) when needed. A session that
    /// is still alive after a disconnect is reused.
    pub async fn connect(
        &self,
        conversation_id: &str,
        client: Arc<dyn Transport>,
    ) -> Result<Attachment, AgentError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(conversation_id) {
            entry.epoch += 1;
            entry.session.transport().attach(client);
            tracing::info!(conversation_id, epoch = entry.epoch, "client reattached");
            return Ok(Attachment {
                session: entry.session.clone(),
                epoch: entry.epoch,
            });
        }

        let conversation = self.load_or_create(conversation_id).await?;
        if !conversation.is_active() {
            return Err(AgentError::InvalidState {
                id: conversation.id,
                status: conversation.status.as_str(),
            });
        }

        let transport = Arc::new(SwitchableTransport::new());
        transport.attach(client);
        let session = Arc::new(AgentSession::start(&conversation, self.services.clone(), transport).await?);
        sessions.insert(
            conversation_id.to_string(),
            SessionEntry {
                session: session.clone(),
                epoch: 0,
            },
        );
        Ok(Attachment { session, epoch: 0 })
    }

    /// Detaches the client that connected with `epoch`. The session keeps
    /// buffering output and is stopped after the grace period unless a client
    /// reattaches first.
    pub async fn disconnect(self: &Arc<Self>, conversation_id: &str, epoch: u64) {
        {
            let sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get(conversation_id) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            entry.session.transport().detach();
        }
        tracing::info!(conversation_id, "client detached");

        let grace = self.services.config.session_grace();
        let manager = self.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.expire(&conversation_id, epoch).await;
        });
    }

    async fn expire(&self, conversation_id: &str, epoch: u64) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(conversation_id) {
                Some(entry) if entry.epoch == epoch && !entry.session.transport().is_attached() => {
                    sessions.remove(conversation_id).map(|e| e.session)
                }
                _ => None,
            }
        };
        if let Some(session) = session {
            tracing::info!(conversation_id, "no client returned; stopping session");
            session.stop().await;
        }
    }

    /// Stops the conversation's session. Returns whether one was running.
    pub async fn stop_session(&self, conversation_id: &str) -> bool {
        let session = self
            .sessions
            .lock()
            .await
            .remove(conversation_id)
            .map(|e| e.session);
        match session {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn session(&self, conversation_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions
            .lock()
            .await
            .get(conversation_id)
            .map(|e| e.session.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Archives the conversation, stopping its session and releasing its
    /// room.
    pub async fn archive(&self, conversation_id: &str) -> Result<Conversation, AgentError> {
        let mut conversation = self.load(conversation_id).await?;
        if conversation.archive()? {
            self.services
                .repos
                .conversations
                .update_conversation(&conversation)
                .await?;
        }
        self.stop_session(conversation_id).await;
        self.delete_room(&conversation).await;
        tracing::info!(conversation_id, "conversation archived");
        Ok(conversation)
    }

    /// Reactivates an archived conversation. Its session starts on the next
    /// client connect.
    pub async fn unarchive(&self, conversation_id: &str) -> Result<Conversation, AgentError> {
        let mut conversation = self.load(conversation_id).await?;
        if conversation.unarchive()? {
            self.services
                .repos
                .conversations
                .update_conversation(&conversation)
                .await?;
            self.create_room(&conversation).await;
        }
        tracing::info!(conversation_id, "conversation unarchived");
        Ok(conversation)
    }

    /// Marks the conversation deleted. Deletion is permanent.
    pub async fn delete(&self, conversation_id: &str) -> Result<Conversation, AgentError> {
        let mut conversation = self.load(conversation_id).await?;
        conversation.delete()?;
        self.services
            .repos
            .conversations
            .update_conversation(&conversation)
            .await?;
        self.stop_session(conversation_id).await;
        self.delete_room(&conversation).await;
        tracing::info!(conversation_id, "conversation deleted");
        Ok(conversation)
    }

    /// Issues a room join token for an active conversation.
    pub async fn join_token(
        &self,
        conversation_id: &str,
        identity: &str,
        name: &str,
    ) -> Result<String, AgentError> {
        let rooms = self
            .rooms
            .as_ref()
            .ok_or_else(|| VoiceError::Config("rooms are not configured".to_string()))?;
        let conversation = self.load_or_create(conversation_id).await?;
        if !conversation.is_active() {
            return Err(AgentError::InvalidState {
                id: conversation.id,
                status: conversation.status.as_str(),
            });
        }
        Ok(rooms.join_token(&conversation.room_name, identity, name)?)
    }

    /// Stops every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, e)| e.session)
            .collect();
        for session in sessions {
            session.stop().await;
        }
    }

    async fn load(&self, conversation_id: &str) -> Result<Conversation, AgentError> {
        self.services
            .repos
            .conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AgentError::ConversationNotFound(conversation_id.to_string()))
    }

    async fn load_or_create(&self, conversation_id: &str) -> Result<Conversation, AgentError> {
        if let Some(conversation) = self
            .services
            .repos
            .conversations
            .get_conversation(conversation_id)
            .await?
        {
            return Ok(conversation);
        }
        let conversation = Conversation::new(conversation_id);
        self.services
            .repos
            .conversations
            .create_conversation(&conversation)
            .await?;
        self.create_room(&conversation).await;
        tracing::info!(conversation_id, "conversation created");
        Ok(conversation)
    }

    async fn create_room(&self, conversation: &Conversation) {
        if let Some(rooms) = &self.rooms {
            if let Err(e) = rooms.create_room(&conversation.room_name).await {
                tracing::warn!(room = %conversation.room_name, "failed to create room: {}", e);
            }
        }
    }

    async fn delete_room(&self, conversation: &Conversation) {
        if let Some(rooms) = &self.rooms {
            if let Err(e) = rooms.delete_room(&conversation.room_name).await {
                tracing::warn!(room = %conversation.room_name, "failed to delete room: {}", e);
            }
        }
    }
}
