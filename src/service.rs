//! Operations exposed to the HTTP layer and the CLI.
//!
//! Every operation except [`ChatService::create_session`] and
//! [`ChatService::get_or_create_session`] uses strict lookup and fails with
//! `SessionNotFound` for unknown ids.

use crate::conversation::{CompressionPolicy, Conversation, DigestSummarizer, Summarizer};
use crate::error::{Result, SessionError};
use crate::inference::FragmentStream;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionInfo};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Models known to the inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelListing {
    pub downloaded: Vec<String>,
    pub loaded: Vec<String>,
}

#[derive(Clone)]
pub struct ChatService {
    registry: Arc<SessionRegistry>,
    compression: CompressionPolicy,
    summarizer: Arc<dyn Summarizer>,
}

impl ChatService {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            compression: CompressionPolicy::default(),
            summarizer: Arc::new(DigestSummarizer::default()),
        }
    }

    pub fn with_compression(mut self, policy: CompressionPolicy, summarizer: Arc<dyn Summarizer>) -> Self {
        self.compression = policy;
        self.summarizer = summarizer;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn create_session(&self) -> String {
        self.registry.create_new().await.id().to_string()
    }

    pub async fn get_or_create_session(&self, session_id: &str) -> Arc<Session> {
        self.registry.get_or_create(session_id).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.registry.get(session_id).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list().await
    }

    pub async fn transcript(&self, session_id: &str) -> Result<Conversation> {
        Ok(self.session(session_id).await?.conversation())
    }

    /// Select a model after checking the server knows it.
    pub async fn set_model(&self, session_id: &str, model_key: &str) -> Result<()> {
        let session = self.session(session_id).await?;
        let models = self.list_models().await?;
        if !models.downloaded.iter().any(|m| m == model_key) {
            return Err(SessionError::ModelNotFound(model_key.to_string()));
        }
        session.set_model(model_key);
        Ok(())
    }

    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<String> {
        self.session(session_id).await?.send_message(text).await
    }

    pub async fn stream_message(&self, session_id: &str, text: &str) -> Result<FragmentStream> {
        self.session(session_id).await?.stream_message(text).await
    }

    /// Returns whether a generation was interrupted.
    pub async fn cancel(&self, session_id: &str) -> Result<bool> {
        Ok(self.session(session_id).await?.cancel())
    }

    pub async fn unload_session(&self, session_id: &str) -> Result<()> {
        self.registry.unload(session_id).await
    }

    pub async fn new_chat(&self, session_id: &str) -> Result<Option<String>> {
        self.session(session_id).await?.new_chat()
    }

    pub async fn load_chat(&self, session_id: &str, chat_key: &str) -> Result<()> {
        self.session(session_id).await?.load_chat(chat_key)
    }

    pub async fn compress(&self, session_id: &str) -> Result<bool> {
        self.session(session_id)
            .await?
            .compress(&self.compression, self.summarizer.as_ref())
    }

    pub async fn list_models(&self) -> Result<ModelListing> {
        let context = self.registry.context();
        let client = context
            .connector
            .connect(&context.connection.api_url())
            .await?;
        let listing = ModelListing {
            downloaded: client.list_downloaded_models().await?,
            loaded: client.list_loaded_models().await?,
        };
        info!(
            downloaded = listing.downloaded.len(),
            loaded = listing.loaded.len(),
            "Listed models"
        );
        Ok(listing)
    }
}
