//! Scripted in-process inference backend.
//!
//! Replays a fixed list of fragments for every completion and can be told
//! to refuse connections, fail mid-stream, or park before a given fragment
//! until released. Compiled for unit tests and behind the `testing`
//! feature for integration tests.

use crate::conversation::Turn;
use crate::error::{Result, SessionError};
use crate::inference::{FragmentStream, InferenceClient, InferenceConnector, InferenceModel};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Default)]
struct Script {
    downloaded: Vec<String>,
    loaded: Vec<String>,
    fragments: Vec<String>,
    fail_connect: bool,
    fail_after: Option<usize>,
    gate: Option<(usize, Arc<Notify>)>,
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<RwLock<Script>>,
    prompts: Arc<Mutex<Vec<Vec<Turn>>>>,
    streams_opened: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    /// Backend serving `models`, all of them loaded.
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let downloaded: Vec<String> = models.into_iter().map(Into::into).collect();
        let script = Script {
            loaded: downloaded.clone(),
            downloaded,
            ..Script::default()
        };
        Self {
            script: Arc::new(RwLock::new(script)),
            ..Self::default()
        }
    }

    pub fn with_fragments<I, S>(self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_fragments(fragments);
        self
    }

    pub fn set_fragments<I, S>(&self, fragments: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script.write().fragments = fragments.into_iter().map(Into::into).collect();
    }

    pub fn set_loaded<I, S>(&self, models: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script.write().loaded = models.into_iter().map(Into::into).collect();
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.script.write().fail_connect = fail;
    }

    /// Fail the stream in place of fragment `index`.
    pub fn set_fail_after(&self, index: Option<usize>) {
        self.script.write().fail_after = index;
    }

    /// Park streams opened from now on before fragment `index` until
    /// `gate` is notified.
    pub fn set_gate(&self, index: usize, gate: Arc<Notify>) {
        self.script.write().gate = Some((index, gate));
    }

    pub fn clear_gate(&self) {
        self.script.write().gate = None;
    }

    /// Prompts received so far, one entry per opened stream.
    pub fn prompts(&self) -> Vec<Vec<Turn>> {
        self.prompts.lock().clone()
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceConnector for ScriptedConnector {
    async fn connect(&self, api_url: &str) -> Result<Arc<dyn InferenceClient>> {
        if self.script.read().fail_connect {
            return Err(SessionError::connection(api_url, "connection refused"));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl InferenceClient for ScriptedConnector {
    async fn list_downloaded_models(&self) -> Result<Vec<String>> {
        Ok(self.script.read().downloaded.clone())
    }

    async fn list_loaded_models(&self) -> Result<Vec<String>> {
        Ok(self.script.read().loaded.clone())
    }

    async fn model(&self, model_key: &str) -> Result<Box<dyn InferenceModel>> {
        if !self.script.read().downloaded.iter().any(|m| m == model_key) {
            return Err(SessionError::ModelNotFound(model_key.to_string()));
        }
        Ok(Box::new(ScriptedModel {
            key: model_key.to_string(),
            connector: self.clone(),
        }))
    }
}

struct ScriptedModel {
    key: String,
    connector: ScriptedConnector,
}

#[async_trait]
impl InferenceModel for ScriptedModel {
    fn key(&self) -> &str {
        &self.key
    }

    async fn respond_stream(&self, prompt: Vec<Turn>) -> Result<FragmentStream> {
        self.connector.prompts.lock().push(prompt);
        self.connector.streams_opened.fetch_add(1, Ordering::SeqCst);
        let script = self.connector.script.read().clone();

        let stream = async_stream::stream! {
            let mut index = 0;
            loop {
                if let Some((at, gate)) = &script.gate {
                    if *at == index {
                        gate.notified().await;
                    }
                }
                if script.fail_after == Some(index) {
                    yield Err(SessionError::Stream("scripted failure".into()));
                    break;
                }
                match script.fragments.get(index) {
                    Some(fragment) => yield Ok(fragment.clone()),
                    None => break,
                }
                index += 1;
            }
        };
        Ok(Box::pin(stream))
    }
}
