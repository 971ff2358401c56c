//! Transport rooms. One conversation maps to at most one live room.

use crate::config::LiveKitConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use livekit_api::access_token::{AccessToken, VideoGrants};
use livekit_api::services::room::{CreateRoomOptions, RoomClient};
use std::time::Duration;

#[async_trait]
pub trait RoomPort: Send + Sync {
    async fn create_room(&self, name: &str) -> Result<(), VoiceError>;
    async fn delete_room(&self, name: &str) -> Result<(), VoiceError>;
    /// Issues a client join token for `room_name`.
    fn join_token(
        &self,
        room_name: &str,
        participant_identity: &str,
        participant_name: &str,
    ) -> Result<String, VoiceError>;
}

/// [`RoomPort`] backed by the LiveKit room service.
#[derive(Debug)]
pub struct LiveKitRooms {
    config: LiveKitConfig,
    room_client: RoomClient,
}

impl LiveKitRooms {
    pub fn new(config: LiveKitConfig) -> Self {
        let room_client =
            RoomClient::with_api_key(&config.url, &config.api_key, &config.api_secret);
        Self {
            config,
            room_client,
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl RoomPort for LiveKitRooms {
    async fn create_room(&self, name: &str) -> Result<(), VoiceError> {
        self.room_client
            .create_room(name, CreateRoomOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| VoiceError::RoomService(e.to_string()))
    }

    async fn delete_room(&self, name: &str) -> Result<(), VoiceError> {
        self.room_client
            .delete_room(name)
            .await
            .map_err(|e| VoiceError::RoomService(e.to_string()))
    }

    fn join_token(
        &self,
        room_name: &str,
        participant_identity: &str,
        participant_name: &str,
    ) -> Result<String, VoiceError> {
        let token = AccessToken::with_api_key(&self.config.api_key, &self.config.api_secret)
            .with_identity(participant_identity)
            .with_name(participant_name)
            .with_grants(VideoGrants {
                room_join: true,
                room: room_name.to_string(),
                can_publish: true,
                can_subscribe: true,
                can_publish_data: true,
                ..Default::default()
            })
            .with_ttl(Duration::from_secs(self.config.token_ttl_seconds));

        token.to_jwt().map_err(VoiceError::LiveKit)
    }
}
