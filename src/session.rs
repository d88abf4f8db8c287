//! A single chat session: conversation, model choice, and the one
//! generation allowed to run against them at a time.

use crate::archive::ChatArchive;
use crate::connection::ConnectionInfo;
use crate::conversation::{CompressionPolicy, Conversation, Role, Summarizer, Turn};
use crate::error::{Result, SessionError};
use crate::inference::{FragmentStream, InferenceConnector};
use crate::lock::{SessionLock, DEFAULT_STALE_AFTER};
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Collaborators shared by every session of one registry.
#[derive(Clone)]
pub struct SessionContext {
    pub connector: Arc<dyn InferenceConnector>,
    pub connection: ConnectionInfo,
    pub archive: Arc<ChatArchive>,
    pub stale_after: Duration,
}

impl SessionContext {
    pub fn new(connector: Arc<dyn InferenceConnector>, connection: ConnectionInfo) -> Self {
        Self {
            connector,
            connection,
            archive: Arc::new(ChatArchive::new()),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub model_key: Option<String>,
    pub turns: usize,
    pub generating: bool,
    pub age_secs: u64,
    pub idle_secs: u64,
}

pub struct Session {
    id: String,
    context: Arc<SessionContext>,
    lock: Arc<SessionLock>,
    conversation: Mutex<Conversation>,
    model_key: RwLock<Option<String>>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
}

enum Step {
    Cancelled,
    Next(Option<Result<String>>),
}

impl Session {
    pub fn new(id: impl Into<String>, context: Arc<SessionContext>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            model_key: RwLock::new(context.connection.model_key().map(str::to_string)),
            lock: Arc::new(SessionLock::new(context.stale_after)),
            context,
            conversation: Mutex::new(Conversation::new()),
            created_at: now,
            last_activity: Mutex::new(now),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model_key(&self) -> Option<String> {
        self.model_key.read().clone()
    }

    /// Takes effect on the next generation; a running one keeps its model.
    pub fn set_model(&self, model_key: impl Into<String>) {
        let model_key = model_key.into();
        info!(session = %self.id, model = %model_key, "Model selected");
        *self.model_key.write() = Some(model_key);
        self.touch();
    }

    /// Copy of the current conversation.
    pub fn conversation(&self) -> Conversation {
        self.conversation.lock().clone()
    }

    pub fn turn_count(&self) -> usize {
        self.conversation.lock().len()
    }

    /// Fails with `SessionBusy` while a generation is running, so the
    /// log never interleaves with a pending user/assistant pair.
    pub fn append_turn(&self, role: Role, text: impl Into<String>) -> Result<()> {
        let guard = self
            .lock
            .try_acquire()
            .ok_or_else(|| SessionError::SessionBusy(self.id.clone()))?;
        self.conversation.lock().append(role, text);
        guard.release();
        self.touch();
        Ok(())
    }

    pub fn is_generating(&self) -> bool {
        self.lock.is_held()
    }

    pub fn lock(&self) -> &Arc<SessionLock> {
        &self.lock
    }

    /// Archive the current conversation (if any) and start an empty one.
    /// Returns the chat key of the archived conversation.
    pub fn new_chat(&self) -> Result<Option<String>> {
        let guard = self
            .lock
            .try_acquire()
            .ok_or_else(|| SessionError::SessionBusy(self.id.clone()))?;
        let previous = std::mem::take(&mut *self.conversation.lock());
        guard.release();
        self.touch();

        if previous.is_empty() {
            return Ok(None);
        }
        let chat_key = self.context.archive.save(&self.id, previous);
        info!(session = %self.id, chat_key = %chat_key, "Chat archived");
        Ok(Some(chat_key))
    }

    /// Replace the conversation with a copy of an archived one.
    pub fn load_chat(&self, chat_key: &str) -> Result<()> {
        let loaded = self.context.archive.load(&self.id, chat_key)?;
        let guard = self
            .lock
            .try_acquire()
            .ok_or_else(|| SessionError::SessionBusy(self.id.clone()))?;
        *self.conversation.lock() = loaded;
        guard.release();
        self.touch();
        info!(session = %self.id, chat_key = %chat_key, "Chat loaded");
        Ok(())
    }

    /// Fold old turns into a summary when `policy` thresholds are exceeded.
    pub fn compress(&self, policy: &CompressionPolicy, summarizer: &dyn Summarizer) -> Result<bool> {
        let guard = self
            .lock
            .try_acquire()
            .ok_or_else(|| SessionError::SessionBusy(self.id.clone()))?;
        let compressed = self.conversation.lock().compress(policy, summarizer);
        guard.release();
        if compressed {
            info!(session = %self.id, turns = self.turn_count(), "Conversation compressed");
        }
        Ok(compressed)
    }

    /// Generate a reply to the conversation as it stands and append it.
    /// Adds one turn (the reply); [`Session::send_message`] adds two.
    pub async fn generate(self: &Arc<Self>) -> Result<String> {
        let stream = self.open_generation(None).await?;
        collect(stream).await
    }

    /// Blocking variant of [`Session::stream_message`].
    pub async fn send_message(self: &Arc<Self>, text: impl Into<String>) -> Result<String> {
        let stream = self.stream_message(text).await?;
        collect(stream).await
    }

    /// Start a generation for a new user message and return its fragments.
    ///
    /// Setup failures (no model, busy, unreachable server, unknown model)
    /// are returned directly. After that the stream yields fragments and
    /// ends either normally or with one terminal error. The user turn and
    /// the assembled assistant turn are appended together, only on success.
    pub async fn stream_message(self: &Arc<Self>, text: impl Into<String>) -> Result<FragmentStream> {
        self.open_generation(Some(Turn::user(text))).await
    }

    /// Interrupt the running generation, if any, and free the lock.
    /// Returns whether a generation was running.
    pub fn cancel(&self) -> bool {
        let cancelled = self.lock.force_release();
        if cancelled {
            info!(session = %self.id, "Generation cancelled");
        }
        cancelled
    }

    pub fn info(&self) -> SessionInfo {
        let now = Instant::now();
        SessionInfo {
            id: self.id.clone(),
            model_key: self.model_key(),
            turns: self.turn_count(),
            generating: self.is_generating(),
            age_secs: now.saturating_duration_since(self.created_at).as_secs(),
            idle_secs: self.idle_for().as_secs(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(*self.last_activity.lock())
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    async fn open_generation(self: &Arc<Self>, pending: Option<Turn>) -> Result<FragmentStream> {
        let model_key = self
            .model_key()
            .ok_or_else(|| SessionError::ModelNotSelected(self.id.clone()))?;
        let guard = self
            .lock
            .try_acquire()
            .ok_or_else(|| SessionError::SessionBusy(self.id.clone()))?;
        let token = CancellationToken::new();
        guard.attach_stream(token.clone());
        self.touch();

        let mut prompt = self.conversation.lock().as_prompt().to_vec();
        prompt.extend(pending.iter().cloned());
        info!(session = %self.id, model = %model_key, turns = prompt.len(), "Generation started");

        let api_url = self.context.connection.api_url();
        let client = self
            .until_cancelled(&token, self.context.connector.connect(&api_url))
            .await?;
        let model = self.until_cancelled(&token, client.model(&model_key)).await?;
        let mut fragments = self
            .until_cancelled(&token, model.respond_stream(prompt))
            .await?;

        let session = Arc::clone(self);
        let stream = async_stream::stream! {
            let mut text = String::new();
            let mut failed = false;
            loop {
                let step = tokio::select! {
                    biased;
                    _ = token.cancelled() => Step::Cancelled,
                    next = fragments.next() => Step::Next(next),
                };
                match step {
                    Step::Cancelled => {
                        info!(session = %session.id, "Generation interrupted");
                        failed = true;
                        yield Err(SessionError::Cancelled(session.id.clone()));
                        break;
                    }
                    Step::Next(Some(Ok(fragment))) => {
                        debug!(session = %session.id, len = fragment.len(), "Fragment");
                        text.push_str(&fragment);
                        yield Ok(fragment);
                    }
                    Step::Next(Some(Err(e))) => {
                        error!(session = %session.id, error = %e, "Generation failed");
                        failed = true;
                        yield Err(e);
                        break;
                    }
                    Step::Next(None) => break,
                }
            }

            if !failed {
                let committed = guard.commit(|| {
                    let mut conversation = session.conversation.lock();
                    if let Some(turn) = pending {
                        conversation.push(turn);
                    }
                    conversation.push(Turn::assistant(text));
                });
                guard.release();
                session.touch();
                match committed {
                    Some(()) => info!(session = %session.id, "Generation finished"),
                    None => {
                        // Lock was stolen or force-released; output is superseded
                        info!(session = %session.id, "Discarding superseded generation");
                        yield Err(SessionError::Cancelled(session.id.clone()));
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn until_cancelled<T>(
        &self,
        token: &CancellationToken,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Cancelled(self.id.clone())),
            result = fut => result,
        }
    }
}

/// Concatenate a fragment stream, failing on its terminal error.
pub async fn collect(stream: FragmentStream) -> Result<String> {
    stream
        .try_fold(String::new(), |mut text, fragment| async move {
            text.push_str(&fragment);
            Ok::<_, SessionError>(text)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::DigestSummarizer;
    use crate::testing::ScriptedConnector;
    use tokio::sync::Notify;

    fn session_with(backend: &ScriptedConnector, model: Option<&str>) -> Arc<Session> {
        let connection =
            ConnectionInfo::new("localhost", "1234", model.map(str::to_string)).unwrap();
        let context = SessionContext::new(Arc::new(backend.clone()), connection);
        Arc::new(Session::new("s1", Arc::new(context)))
    }

    async fn wait_until_generating(session: &Session) {
        while !session.is_generating() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn send_message_appends_user_and_assistant() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["He", "llo"]);
        let session = session_with(&backend, None);
        session.set_model("m1");

        let reply = session.send_message("hi").await.unwrap();
        assert_eq!(reply, "Hello");
        assert_eq!(
            session.conversation().as_prompt(),
            &[Turn::user("hi"), Turn::assistant("Hello")]
        );
        assert!(!session.is_generating());
        assert_eq!(backend.prompts(), vec![vec![Turn::user("hi")]]);
    }

    #[tokio::test]
    async fn stream_message_forwards_fragments_in_order() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["a", "b", "c"]);
        let session = session_with(&backend, Some("m1"));

        let stream = session.stream_message("go").await.unwrap();
        let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(fragments, vec!["a", "b", "c"]);
        assert_eq!(session.turn_count(), 2);
    }

    #[tokio::test]
    async fn generate_replies_to_existing_conversation() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["ok"]);
        let session = session_with(&backend, Some("m1"));
        session.append_turn(Role::System, "be brief").unwrap();
        session.append_turn(Role::User, "ping").unwrap();

        assert_eq!(session.generate().await.unwrap(), "ok");
        assert_eq!(session.turn_count(), 3);
        assert_eq!(session.conversation().as_prompt()[2], Turn::assistant("ok"));
    }

    #[tokio::test]
    async fn missing_model_fails_before_streaming() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["x"]);
        let session = session_with(&backend, None);

        let err = session.send_message("hi").await.unwrap_err();
        assert_eq!(err, SessionError::ModelNotSelected("s1".into()));
        assert_eq!(session.turn_count(), 0);
        assert_eq!(backend.streams_opened(), 0);
    }

    #[tokio::test]
    async fn unknown_model_releases_lock() {
        let backend = ScriptedConnector::new(["m1"]);
        let session = session_with(&backend, Some("nope"));

        let err = session.send_message("hi").await.unwrap_err();
        assert_eq!(err, SessionError::ModelNotFound("nope".into()));
        assert!(!session.is_generating());
        assert_eq!(session.turn_count(), 0);
    }

    #[tokio::test]
    async fn connection_failure_leaves_conversation_unchanged() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["x"]);
        backend.set_fail_connect(true);
        let session = session_with(&backend, Some("m1"));

        let err = session.send_message("hi").await.unwrap_err();
        assert!(matches!(err, SessionError::Connection { .. }));
        assert!(!session.is_generating());
        assert_eq!(session.turn_count(), 0);
    }

    #[tokio::test]
    async fn mid_stream_failure_discards_partial_reply() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["par", "tial", "!"]);
        backend.set_fail_after(Some(2));
        let session = session_with(&backend, Some("m1"));

        let err = session.send_message("hi").await.unwrap_err();
        assert!(matches!(err, SessionError::Stream(_)));
        assert_eq!(session.turn_count(), 0);
        assert!(!session.is_generating());
    }

    #[tokio::test]
    async fn concurrent_send_is_rejected_as_busy() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["first"]);
        let gate = Arc::new(Notify::new());
        backend.set_gate(0, gate.clone());
        let session = session_with(&backend, Some("m1"));

        let running = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("one").await }
        });
        wait_until_generating(&session).await;

        let err = session.send_message("two").await.unwrap_err();
        assert_eq!(err, SessionError::SessionBusy("s1".into()));
        assert_eq!(session.turn_count(), 0);

        gate.notify_one();
        assert_eq!(running.await.unwrap().unwrap(), "first");
        assert_eq!(
            session.conversation().as_prompt(),
            &[Turn::user("one"), Turn::assistant("first")]
        );
    }

    #[tokio::test]
    async fn append_turn_is_refused_during_generation() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["first"]);
        let gate = Arc::new(Notify::new());
        backend.set_gate(0, gate.clone());
        let session = session_with(&backend, Some("m1"));

        let running = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("one").await }
        });
        wait_until_generating(&session).await;

        assert_eq!(
            session.append_turn(Role::User, "interleaved"),
            Err(SessionError::SessionBusy("s1".into()))
        );

        gate.notify_one();
        assert_eq!(running.await.unwrap().unwrap(), "first");
        assert_eq!(
            session.conversation().as_prompt(),
            &[Turn::user("one"), Turn::assistant("first")]
        );
        session.append_turn(Role::User, "after").unwrap();
        assert_eq!(session.turn_count(), 3);
    }

    #[tokio::test]
    async fn cancel_interrupts_parked_generation() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["never"]);
        backend.set_gate(0, Arc::new(Notify::new()));
        let session = session_with(&backend, Some("m1"));

        let running = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("hi").await }
        });
        wait_until_generating(&session).await;

        assert!(session.cancel());
        assert!(!session.is_generating());
        let err = running.await.unwrap().unwrap_err();
        assert_eq!(err, SessionError::Cancelled("s1".into()));
        assert_eq!(session.turn_count(), 0);
    }

    #[tokio::test]
    async fn cancel_without_generation_is_noop() {
        let backend = ScriptedConnector::new(["m1"]);
        let session = session_with(&backend, Some("m1"));
        session.append_turn(Role::User, "kept").unwrap();

        assert!(!session.cancel());
        assert!(!session.is_generating());
        assert_eq!(session.turn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_superseded() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["late"]);
        backend.set_gate(0, Arc::new(Notify::new()));
        let session = session_with(&backend, Some("m1"));

        let stuck = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("first").await }
        });
        wait_until_generating(&session).await;

        backend.clear_gate();
        backend.set_fragments(["fresh"]);
        tokio::time::advance(Duration::from_secs(121)).await;

        assert_eq!(session.send_message("second").await.unwrap(), "fresh");
        assert_eq!(session.lock().steal_count(), 1);
        assert_eq!(
            stuck.await.unwrap().unwrap_err(),
            SessionError::Cancelled("s1".into())
        );
        assert_eq!(
            session.conversation().as_prompt(),
            &[Turn::user("second"), Turn::assistant("fresh")]
        );
    }

    #[tokio::test]
    async fn dropped_stream_releases_lock_without_commit() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["a", "b"]);
        let session = session_with(&backend, Some("m1"));

        let mut stream = session.stream_message("hi").await.unwrap();
        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        drop(stream);

        assert!(!session.is_generating());
        assert_eq!(session.turn_count(), 0);
    }

    #[tokio::test]
    async fn new_chat_archives_and_load_restores() {
        let backend = ScriptedConnector::new(["m1"]).with_fragments(["Hello"]);
        let session = session_with(&backend, Some("m1"));
        assert_eq!(session.new_chat().unwrap(), None);

        session.send_message("hi").await.unwrap();
        let chat_key = session.new_chat().unwrap().expect("archived");
        assert_eq!(session.turn_count(), 0);

        session.load_chat(&chat_key).unwrap();
        assert_eq!(session.turn_count(), 2);
        assert_eq!(
            session.load_chat("missing"),
            Err(SessionError::ChatNotFound("missing".into()))
        );
        assert_eq!(session.turn_count(), 2);
    }

    #[tokio::test]
    async fn compress_uses_policy() {
        let backend = ScriptedConnector::new(["m1"]);
        let session = session_with(&backend, Some("m1"));
        for i in 0..6 {
            session.append_turn(Role::User, format!("q{}", i)).unwrap();
        }
        let policy = CompressionPolicy {
            max_turns: 4,
            max_tokens: usize::MAX,
            keep_recent: 2,
        };
        assert!(session.compress(&policy, &DigestSummarizer::default()).unwrap());
        assert_eq!(session.turn_count(), 3);
    }

    #[tokio::test]
    async fn set_model_applies_to_next_generation() {
        let backend = ScriptedConnector::new(["m1", "m2"]).with_fragments(["x"]);
        let session = session_with(&backend, Some("m1"));
        assert_eq!(session.model_key().as_deref(), Some("m1"));
        session.set_model("m2");
        assert_eq!(session.info().model_key.as_deref(), Some("m2"));
        session.send_message("hi").await.unwrap();
    }
}
