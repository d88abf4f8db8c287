//! Process-wide table of live sessions.

use crate::error::{Result, SessionError};
use crate::session::{Session, SessionContext, SessionInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::info;

/// Maps session ids to sessions. Built once at startup and shared with
/// request handlers; tests build their own.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    context: Arc<SessionContext>,
}

impl SessionRegistry {
    pub fn new(context: SessionContext) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Existing session for `session_id`, or a new one registered under it.
    /// Concurrent callers with the same id all get the same session.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return session.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!("Created session: {}", session_id);
                Arc::new(Session::new(session_id, self.context.clone()))
            })
            .clone()
    }

    /// Register a session under a fresh random id.
    pub async fn create_new(&self) -> Arc<Session> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(session_id.clone(), self.context.clone()));
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        info!("Created session: {}", session_id);
        session
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    /// Cancel any running generation, then drop the session.
    pub async fn unload(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        session.cancel();
        sessions.remove(session_id);
        let chats = self.context.archive.remove_owned_by(session_id);
        info!("Unloaded session: {} ({} archived chats dropped)", session_id, chats);
        Ok(())
    }

    /// Unload sessions idle for longer than `older_than`. A session whose
    /// lock is held is skipped unless the lock itself has gone stale.
    pub async fn reap_idle(&self, older_than: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.idle_for() > older_than)
            .filter(|(_, s)| match s.lock().acquired_at() {
                Some(at) => now.saturating_duration_since(at) > s.lock().stale_after(),
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.cancel();
                self.context.archive.remove_owned_by(id);
                info!("Cleaning up idle session: {}", id);
            }
        }
        expired
    }

    /// Run [`SessionRegistry::reap_idle`] every `every` until aborted.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration, ttl: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.reap_idle(ttl).await;
            }
        })
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
