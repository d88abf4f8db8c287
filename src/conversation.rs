//! Append-only conversation log used as the generation prompt.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role-tagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// Rough token estimate, four characters per token.
    pub fn estimated_tokens(&self) -> usize {
        self.text.chars().count().div_ceil(4)
    }
}

/// Thresholds that trigger [`Conversation::compress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    /// Compress once the log holds more turns than this.
    pub max_turns: usize,
    /// Compress once the estimated token count exceeds this.
    pub max_tokens: usize,
    /// Number of most recent turns always kept verbatim.
    pub keep_recent: usize,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            max_turns: 40,
            max_tokens: 6000,
            keep_recent: 8,
        }
    }
}

/// Produces the synthetic system text that replaces a compressed prefix.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, turns: &[Turn]) -> String;
}

/// Summarizer that does not call a model: one truncated line per turn.
#[derive(Debug, Clone)]
pub struct DigestSummarizer {
    pub max_chars_per_turn: usize,
}

impl Default for DigestSummarizer {
    fn default() -> Self {
        Self {
            max_chars_per_turn: 80,
        }
    }
}

impl Summarizer for DigestSummarizer {
    fn summarize(&self, turns: &[Turn]) -> String {
        let mut digest = format!("Summary of {} earlier turns:", turns.len());
        for turn in turns {
            let line: String = turn.text.chars().take(self.max_chars_per_turn).collect();
            let ellipsis = if turn.text.chars().count() > self.max_chars_per_turn {
                "..."
            } else {
                ""
            };
            digest.push_str(&format!("\n{}: {}{}", turn.role, line.trim(), ellipsis));
        }
        digest
    }
}

/// Ordered log of turns. Insertion order is prompt order; appended turns
/// are never edited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: Role, text: impl Into<String>) {
        self.turns.push(Turn::new(role, text));
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Drop every turn ("new chat").
    pub fn reset(&mut self) {
        self.turns.clear();
    }

    /// Turns in the order they are submitted to the model.
    pub fn as_prompt(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.turns.iter().map(Turn::estimated_tokens).sum()
    }

    pub fn needs_compression(&self, policy: &CompressionPolicy) -> bool {
        self.turns.len() > policy.keep_recent
            && (self.turns.len() > policy.max_turns
                || self.estimated_tokens() > policy.max_tokens)
    }

    /// Replace everything but the last `keep_recent` turns with one system
    /// turn from `summarizer`. Returns whether anything was replaced.
    pub fn compress(&mut self, policy: &CompressionPolicy, summarizer: &dyn Summarizer) -> bool {
        if !self.needs_compression(policy) {
            return false;
        }
        let split = self.turns.len() - policy.keep_recent;
        let recent = self.turns.split_off(split);
        let summary = summarizer.summarize(&self.turns);
        self.turns = Vec::with_capacity(recent.len() + 1);
        self.turns.push(Turn::system(summary));
        self.turns.extend(recent);
        true
    }
}
