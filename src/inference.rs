//! Contract consumed from the inference server client.
//!
//! Sessions only talk to these traits; `lmstudio` provides the HTTP
//! implementation and `testing` a scripted one.

use crate::conversation::Turn;
use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Lazy, finite sequence of generated text fragments.
///
/// Dropping the stream abandons the underlying call.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Opens clients against an inference server address.
#[async_trait]
pub trait InferenceConnector: Send + Sync {
    /// Fails with `SessionError::Connection` when the server is unreachable.
    async fn connect(&self, api_url: &str) -> Result<Arc<dyn InferenceClient>>;
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn list_downloaded_models(&self) -> Result<Vec<String>>;

    async fn list_loaded_models(&self) -> Result<Vec<String>>;

    /// Fails with `SessionError::ModelNotFound` for unknown keys.
    async fn model(&self, model_key: &str) -> Result<Box<dyn InferenceModel>>;
}

#[async_trait]
pub trait InferenceModel: Send + Sync {
    fn key(&self) -> &str;

    /// Start a streaming completion over `prompt`.
    async fn respond_stream(&self, prompt: Vec<Turn>) -> Result<FragmentStream>;
}
