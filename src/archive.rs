//! In-memory store of saved conversations, keyed by chat key.
//!
//! Each chat belongs to the session that archived it. Other sessions cannot
//! load it, and it is dropped when its owner is unloaded.

use crate::conversation::Conversation;
use crate::error::{Result, SessionError};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug)]
struct ArchivedChat {
    owner: String,
    conversation: Conversation,
}

#[derive(Debug, Default)]
pub struct ChatArchive {
    chats: RwLock<HashMap<String, ArchivedChat>>,
}

impl ChatArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `conversation` for session `owner` and return its fresh chat key.
    pub fn save(&self, owner: &str, conversation: Conversation) -> String {
        let chat_key = uuid::Uuid::new_v4().to_string();
        self.chats.write().insert(
            chat_key.clone(),
            ArchivedChat {
                owner: owner.to_string(),
                conversation,
            },
        );
        chat_key
    }

    /// Copy of a chat archived by `owner`. Keys of other sessions are
    /// reported as `ChatNotFound`.
    pub fn load(&self, owner: &str, chat_key: &str) -> Result<Conversation> {
        self.chats
            .read()
            .get(chat_key)
            .filter(|chat| chat.owner == owner)
            .map(|chat| chat.conversation.clone())
            .ok_or_else(|| SessionError::ChatNotFound(chat_key.to_string()))
    }

    /// Drop every chat archived by `owner`; returns how many were removed.
    pub fn remove_owned_by(&self, owner: &str) -> usize {
        let mut chats = self.chats.write();
        let before = chats.len();
        chats.retain(|_, chat| chat.owner != owner);
        before - chats.len()
    }

    pub fn len(&self) -> usize {
        self.chats.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.read().is_empty()
    }
}
